#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use agora_domain::{ChatMessage, MessageDraft};
use anyhow::anyhow;
use chrono::Utc;
use tokio::sync::mpsc;

use crate::server::registry::{ChatSink, CloseSignal};

/// In-memory sink that forwards every delivered message to a channel.
pub struct RecordingSink {
	tx: mpsc::UnboundedSender<ChatMessage>,
	failing: AtomicBool,
	close_calls: AtomicUsize,
	signal: CloseSignal,
	write_delay: Option<Duration>,
}

impl RecordingSink {
	pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ChatMessage>) {
		Self::build(None)
	}

	/// Every write takes `delay`, like a client on a slow link.
	pub fn slow(delay: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<ChatMessage>) {
		Self::build(Some(delay))
	}

	fn build(write_delay: Option<Duration>) -> (Arc<Self>, mpsc::UnboundedReceiver<ChatMessage>) {
		let (tx, rx) = mpsc::unbounded_channel();
		let sink = Arc::new(Self {
			tx,
			failing: AtomicBool::new(false),
			close_calls: AtomicUsize::new(0),
			signal: CloseSignal::default(),
			write_delay,
		});
		(sink, rx)
	}

	/// Make every later `deliver` fail, like a peer that vanished.
	pub fn break_writes(&self) {
		self.failing.store(true, Ordering::SeqCst);
	}

	pub fn close_calls(&self) -> usize {
		self.close_calls.load(Ordering::SeqCst)
	}

	pub fn is_closed(&self) -> bool {
		self.signal.is_fired()
	}
}

#[async_trait::async_trait]
impl ChatSink for RecordingSink {
	async fn deliver(&self, msg: &ChatMessage) -> anyhow::Result<()> {
		if let Some(delay) = self.write_delay {
			tokio::time::sleep(delay).await;
		}
		if self.failing.load(Ordering::SeqCst) || self.signal.is_fired() {
			return Err(anyhow!("sink is broken"));
		}
		self.tx.send(msg.clone()).map_err(|_| anyhow!("receiver dropped"))
	}

	async fn close(&self) {
		self.close_calls.fetch_add(1, Ordering::SeqCst);
		self.signal.fire();
	}

	async fn closed(&self) {
		self.signal.wait().await;
	}
}

pub fn message(id: i64, body: &str) -> ChatMessage {
	ChatMessage {
		id,
		author_subject_id: 1,
		author_name: "alice".to_string(),
		body: body.to_string(),
		created_at: Utc::now(),
	}
}

pub fn draft(body: &str) -> MessageDraft {
	MessageDraft::new(1, "alice", body)
}
