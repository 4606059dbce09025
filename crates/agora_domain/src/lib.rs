#![forbid(unsafe_code)]

use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a chat message is refused before it reaches storage.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
	#[error("message body cannot be empty")]
	EmptyBody,
	#[error("author name cannot be empty")]
	EmptyAuthorName,
	#[error("author subject id must be positive (got {0})")]
	InvalidAuthorId(i64),
}

impl ValidationError {
	/// Stable machine-readable code, used in HTTP error bodies and metrics labels.
	pub const fn code(self) -> &'static str {
		match self {
			ValidationError::EmptyBody => "empty_body",
			ValidationError::EmptyAuthorName => "empty_author_name",
			ValidationError::InvalidAuthorId(_) => "invalid_author_id",
		}
	}
}

/// Server-assigned identifier of a live client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
	pub const fn new(raw: u64) -> Self {
		Self(raw)
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// An unpersisted chat message as submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageDraft {
	pub author_subject_id: i64,
	pub author_name: String,
	pub body: String,
}

impl MessageDraft {
	pub fn new(author_subject_id: i64, author_name: impl Into<String>, body: impl Into<String>) -> Self {
		Self {
			author_subject_id,
			author_name: author_name.into(),
			body: body.into(),
		}
	}

	/// Checks body, then author name, then author id.
	pub fn validate(&self) -> Result<(), ValidationError> {
		if self.body.is_empty() {
			return Err(ValidationError::EmptyBody);
		}
		if self.author_name.is_empty() {
			return Err(ValidationError::EmptyAuthorName);
		}
		if self.author_subject_id <= 0 {
			return Err(ValidationError::InvalidAuthorId(self.author_subject_id));
		}
		Ok(())
	}

	/// True when both text fields are present. Stream frames failing this are dropped without a reply.
	pub fn has_text(&self) -> bool {
		!self.body.is_empty() && !self.author_name.is_empty()
	}
}

/// A persisted chat message. Never mutated after the store returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub id: i64,
	pub author_subject_id: i64,
	pub author_name: String,
	pub body: String,
	pub created_at: DateTime<Utc>,
}

impl ChatMessage {
	pub fn created_at_unix_ms(&self) -> i64 {
		self.created_at.timestamp_millis()
	}
}

/// String wrapper that keeps secrets out of logs.
#[derive(Clone, PartialEq, Eq)]
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
