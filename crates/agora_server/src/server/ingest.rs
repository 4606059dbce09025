#![forbid(unsafe_code)]

use agora_domain::{ChatMessage, MessageDraft, ValidationError};
use thiserror::Error;
use tracing::{debug, warn};

use crate::server::fanout::FanOutHandle;
use crate::server::store::{MessageStore, StoreError};

/// Where a message entered the system. Used as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestSource {
	Http,
	WebSocket,
	Quic,
}

impl IngestSource {
	pub const fn as_str(self) -> &'static str {
		match self {
			IngestSource::Http => "http",
			IngestSource::WebSocket => "websocket",
			IngestSource::Quic => "quic",
		}
	}
}

#[derive(Debug, Error)]
pub enum IngestError {
	#[error(transparent)]
	Validation(#[from] ValidationError),

	#[error("store failure: {0}")]
	Store(#[source] StoreError),
}

impl From<StoreError> for IngestError {
	fn from(e: StoreError) -> Self {
		match e {
			StoreError::Validation(v) => IngestError::Validation(v),
			other => IngestError::Store(other),
		}
	}
}

/// Validate, persist, then queue for broadcast. Shared by every front door.
#[derive(Clone)]
pub struct IngestGateway {
	store: MessageStore,
	fan_out: FanOutHandle,
}

impl IngestGateway {
	pub fn new(store: MessageStore, fan_out: FanOutHandle) -> Self {
		Self { store, fan_out }
	}

	pub fn store(&self) -> &MessageStore {
		&self.store
	}

	/// Accept a message from a request/response caller. Validation and storage errors are returned.
	///
	/// The message is persisted before it is queued; if the fan-out loop is gone the message is
	/// still stored and returned.
	pub async fn submit(&self, draft: MessageDraft, source: IngestSource) -> Result<ChatMessage, IngestError> {
		if let Err(e) = draft.validate() {
			metrics::counter!("agora_server_ingest_rejected_total", "source" => source.as_str(), "reason" => e.code())
				.increment(1);
			return Err(e.into());
		}

		let msg = self.store.insert(&draft).await?;
		metrics::counter!("agora_server_messages_ingested_total", "source" => source.as_str()).increment(1);

		if let Err(e) = self.fan_out.enqueue(msg.clone()) {
			warn!(error = %e, "message stored but not broadcast");
		}

		debug!(id = msg.id, source = source.as_str(), "message accepted");
		Ok(msg)
	}

	/// Accept a message read off a live connection.
	///
	/// Drafts without both text fields are dropped silently. Anything else that fails is logged and
	/// swallowed so the caller's read loop keeps going.
	pub async fn ingest_stream(&self, draft: MessageDraft, source: IngestSource) -> Option<ChatMessage> {
		if !draft.has_text() {
			metrics::counter!("agora_server_ingest_rejected_total", "source" => source.as_str(), "reason" => "missing_text")
				.increment(1);
			return None;
		}

		match self.submit(draft, source).await {
			Ok(msg) => Some(msg),
			Err(IngestError::Validation(e)) => {
				debug!(reason = e.code(), source = source.as_str(), "stream message dropped");
				None
			}
			Err(IngestError::Store(e)) => {
				warn!(error = %e, source = source.as_str(), "failed to persist stream message");
				None
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use agora_domain::MessageDraft;
	use tokio::time::timeout;

	use super::*;
	use crate::server::fanout::{FanOutConfig, spawn_fan_out};
	use crate::server::registry::ConnectionRegistry;
	use crate::server::test_support::{RecordingSink, draft};

	async fn setup() -> (IngestGateway, ConnectionRegistry) {
		let store = MessageStore::connect("sqlite::memory:").await.expect("store");
		let registry = ConnectionRegistry::new();
		let fan_out = spawn_fan_out(registry.clone(), FanOutConfig::default());
		(IngestGateway::new(store, fan_out), registry)
	}

	#[tokio::test]
	async fn submit_persists_then_broadcasts() {
		let (gw, registry) = setup().await;
		let (sink, mut rx) = RecordingSink::new();
		registry.add(registry.next_id(), sink);

		let msg = gw.submit(draft("hello"), IngestSource::Http).await.expect("submit");

		let live = timeout(Duration::from_millis(500), rx.recv())
			.await
			.expect("broadcast within timeout")
			.expect("sink open");
		assert_eq!(live, msg);
		assert_eq!(gw.store().history(1).await.expect("history"), vec![msg]);
	}

	#[tokio::test]
	async fn submit_rejects_invalid_input_without_storing() {
		let (gw, _registry) = setup().await;

		match gw.submit(MessageDraft::new(-1, "alice", "hi"), IngestSource::Http).await {
			Err(IngestError::Validation(ValidationError::InvalidAuthorId(-1))) => {}
			other => panic!("expected InvalidAuthorId, got: {other:?}"),
		}
		match gw.submit(MessageDraft::new(1, "alice", ""), IngestSource::Http).await {
			Err(IngestError::Validation(ValidationError::EmptyBody)) => {}
			other => panic!("expected EmptyBody, got: {other:?}"),
		}

		assert!(gw.store().history(10).await.expect("history").is_empty());
	}

	#[tokio::test]
	async fn stream_drops_missing_text_silently() {
		let (gw, _registry) = setup().await;

		assert!(gw.ingest_stream(MessageDraft::new(1, "", "hi"), IngestSource::WebSocket).await.is_none());
		assert!(gw.ingest_stream(MessageDraft::new(1, "alice", ""), IngestSource::WebSocket).await.is_none());
		assert!(gw.ingest_stream(draft("kept"), IngestSource::WebSocket).await.is_some());

		assert_eq!(gw.store().history(10).await.expect("history").len(), 1);
	}

	#[tokio::test]
	async fn stream_swallows_store_failures() {
		let (gw, _registry) = setup().await;
		gw.store().close().await;

		assert!(gw.ingest_stream(draft("lost"), IngestSource::Quic).await.is_none());

		match gw.submit(draft("lost"), IngestSource::Http).await {
			Err(IngestError::Store(_)) => {}
			other => panic!("expected Store error, got: {other:?}"),
		}
	}
}
