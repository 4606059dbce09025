#![forbid(unsafe_code)]

//! JSON payloads for the HTTP endpoints and WebSocket text frames.

use agora_domain::{ChatMessage, MessageDraft};
use serde::{Deserialize, Serialize};

/// Inbound submission. The legacy field names from the first web client are still accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubmitRequest {
	#[serde(default, alias = "user_id")]
	pub author_subject_id: i64,
	#[serde(default, alias = "username")]
	pub author_name: String,
	#[serde(default, alias = "content")]
	pub body: String,
}

impl From<SubmitRequest> for MessageDraft {
	fn from(r: SubmitRequest) -> Self {
		MessageDraft {
			author_subject_id: r.author_subject_id,
			author_name: r.author_name,
			body: r.body,
		}
	}
}

/// Body of every non-2xx JSON response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
	pub error: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub detail: Option<String>,
}

impl ErrorBody {
	pub fn new(error: impl Into<String>) -> Self {
		Self {
			error: error.into(),
			detail: None,
		}
	}

	pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
		self.detail = Some(detail.into());
		self
	}
}

/// Parse a submission from a JSON document (HTTP body or WebSocket text frame).
pub fn decode_submit(raw: &[u8]) -> Result<MessageDraft, serde_json::Error> {
	serde_json::from_slice::<SubmitRequest>(raw).map(MessageDraft::from)
}

/// Render one chat message as its JSON wire payload.
pub fn encode_message(msg: &ChatMessage) -> Result<String, serde_json::Error> {
	serde_json::to_string(msg)
}
