#![forbid(unsafe_code)]

pub mod event;

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Gender of a participant. The same domain is used for a participant's
/// stated interest, where `Any` means "no preference".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
	Male,
	Female,
	Any,
}

impl Gender {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Gender::Male => "male",
			Gender::Female => "female",
			Gender::Any => "any",
		}
	}
}

impl fmt::Display for Gender {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown gender: {0}")]
	UnknownGender(String),
}

impl FromStr for Gender {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"male" | "m" => Ok(Gender::Male),
			"female" | "f" => Ok(Gender::Female),
			"any" => Ok(Gender::Any),
			other => Err(ParseIdError::UnknownGender(other.to_string())),
		}
	}
}

/// Server-assigned connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Random, effectively-unique room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
	/// Create a non-empty `RoomId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	/// Generate a fresh random room id.
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4().simple().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

/// One line of conversation, append-only within a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatLine {
	pub nick: String,
	pub text: String,
	pub sent_at: DateTime<Utc>,
}

impl ChatLine {
	/// Create a line stamped with the current time.
	pub fn now(nick: impl Into<String>, text: impl Into<String>) -> Self {
		Self {
			nick: nick.into(),
			text: text.into(),
			sent_at: Utc::now(),
		}
	}
}

/// A conversation participant, owned by exactly one room while present.
///
/// Substitute participants are synthesized server-side and have no
/// connection of their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
	pub conn: Option<ConnId>,
	pub nick: String,
	pub gender: Gender,
	pub interest: Gender,
	pub is_substitute: bool,
}

impl Participant {
	/// A human participant bound to a connection.
	pub fn human(conn: ConnId, nick: impl Into<String>, gender: Gender, interest: Gender) -> Self {
		Self {
			conn: Some(conn),
			nick: nick.into(),
			gender,
			interest,
			is_substitute: false,
		}
	}

	/// A synthesized substitute participant.
	pub fn substitute(nick: impl Into<String>, gender: Gender) -> Self {
		Self {
			conn: None,
			nick: nick.into(),
			gender,
			interest: Gender::Any,
			is_substitute: true,
		}
	}
}

/// String wrapper that never renders its contents in logs or debug output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}
