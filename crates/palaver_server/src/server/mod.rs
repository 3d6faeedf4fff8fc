#![forbid(unsafe_code)]

pub mod connection;
pub mod engine;
pub mod fanout;
pub mod matchmaker;
pub mod reply;
pub mod state;
pub mod store;

#[cfg(test)]
mod engine_tests;
