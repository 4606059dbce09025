#![forbid(unsafe_code)]

//! Protobuf messages carried on the QUIC chat stream.

use agora_domain::{ChatMessage, MessageDraft};

/// Client -> server: a chat message to publish.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatSubmit {
	#[prost(int64, tag = "1")]
	pub author_subject_id: i64,
	#[prost(string, tag = "2")]
	pub author_name: String,
	#[prost(string, tag = "3")]
	pub body: String,
}

/// Server -> client: a persisted chat message, from the history snapshot or live delivery.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatEvent {
	#[prost(int64, tag = "1")]
	pub id: i64,
	#[prost(int64, tag = "2")]
	pub author_subject_id: i64,
	#[prost(string, tag = "3")]
	pub author_name: String,
	#[prost(string, tag = "4")]
	pub body: String,
	#[prost(int64, tag = "5")]
	pub created_at_unix_ms: i64,
}

impl From<ChatSubmit> for MessageDraft {
	fn from(s: ChatSubmit) -> Self {
		MessageDraft {
			author_subject_id: s.author_subject_id,
			author_name: s.author_name,
			body: s.body,
		}
	}
}

impl From<&ChatMessage> for ChatEvent {
	fn from(m: &ChatMessage) -> Self {
		ChatEvent {
			id: m.id,
			author_subject_id: m.author_subject_id,
			author_name: m.author_name.clone(),
			body: m.body.clone(),
			created_at_unix_ms: m.created_at_unix_ms(),
		}
	}
}
