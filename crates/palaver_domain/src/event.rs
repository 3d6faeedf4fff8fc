#![forbid(unsafe_code)]

//! Event vocabulary at the transport boundary.
//!
//! Inbound events arrive one at a time per connection; outbound events are
//! fanned out to room members and observers. The transport itself (framing,
//! delivery) is out of scope here and assumed reliable, ordered, and FIFO
//! per connection.

use serde::{Deserialize, Serialize};

use crate::{ChatLine, Gender, RoomId};

/// Events a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
	Join {
		nick: String,
		gender: Gender,
		interest: Gender,
	},
	Message {
		room_id: RoomId,
		text: String,
	},
	Leave {
		room_id: RoomId,
	},
	SpyRequest,
	SpyLeave {
		room_id: RoomId,
	},
	Like {
		room_id: RoomId,
	},
}

/// Events the server sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
	/// A human partner was found.
	Matched {
		room_id: RoomId,
		partner_nick: String,
		partner_gender: Gender,
		spy_count: u64,
		like_count: u64,
	},
	/// No human partner was available; a substitute chat was started.
	SubstituteStarted {
		room_id: RoomId,
		substitute_nick: String,
		substitute_gender: Gender,
		spy_count: u64,
		like_count: u64,
	},
	/// A message delivered to the room's participants.
	Message {
		room_id: RoomId,
		nick: String,
		text: String,
	},
	/// The same message, delivered to observers of the room.
	SpyMessage {
		room_id: RoomId,
		nick: String,
		text: String,
	},
	/// The room was torn down.
	Closed {
		room_id: RoomId,
		reason: String,
	},
	/// Counter snapshot, emitted by every counter-affecting operation.
	CountersUpdated {
		room_id: RoomId,
		spy_count: u64,
		like_count: u64,
	},
	/// A spy subscription was established.
	SpyFound {
		room_id: RoomId,
		messages: Vec<ChatLine>,
		spy_count: u64,
		like_count: u64,
	},
	/// No eligible conversation to observe.
	SpyUnavailable,
}
