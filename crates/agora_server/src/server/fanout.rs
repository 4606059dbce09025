#![forbid(unsafe_code)]

use agora_domain::ChatMessage;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::registry::{ConnectionHandle, ConnectionRegistry};

/// Settings for the fan-out loop.
#[derive(Debug, Clone, Default)]
pub struct FanOutConfig {
	pub debug_log_events: bool,
}

#[derive(Debug, Error)]
#[error("fan-out loop is gone; message {0} was not broadcast")]
pub struct FanOutClosed(pub i64);

/// Producer side of the broadcast queue. Cheap to clone; the loop runs while any clone is alive.
#[derive(Debug, Clone)]
pub struct FanOutHandle {
	tx: mpsc::UnboundedSender<ChatMessage>,
}

impl FanOutHandle {
	/// Queue a persisted message for delivery to every connection. Never blocks.
	pub fn enqueue(&self, msg: ChatMessage) -> Result<(), FanOutClosed> {
		self.tx.send(msg).map_err(|e| FanOutClosed(e.0.id))
	}
}

/// Single consumer of the broadcast queue.
#[derive(Debug)]
pub struct FanOutLoop {
	cfg: FanOutConfig,
	registry: ConnectionRegistry,
	rx: mpsc::UnboundedReceiver<ChatMessage>,
}

impl FanOutLoop {
	pub fn new(registry: ConnectionRegistry, cfg: FanOutConfig) -> (Self, FanOutHandle) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Self { cfg, registry, rx }, FanOutHandle { tx })
	}

	/// Drain the queue until every `FanOutHandle` has been dropped.
	pub async fn run(mut self) {
		info!("fan-out loop started");

		while let Some(msg) = self.rx.recv().await {
			self.broadcast(&msg).await;
		}

		info!("fan-out loop exiting (all producers dropped)");
	}

	/// Deliver one message to every registered connection, in registry order.
	pub async fn broadcast(&self, msg: &ChatMessage) {
		let mut attempted = 0usize;
		let failed = self
			.registry
			.for_each(|_, handle: ConnectionHandle| {
				attempted += 1;
				async move { handle.deliver(msg).await }
			})
			.await;

		let delivered = attempted - failed.len();
		metrics::counter!("agora_server_fanout_messages_total").increment(1);
		metrics::counter!("agora_server_fanout_deliveries_total").increment(delivered as u64);

		for (id, err) in failed {
			metrics::counter!("agora_server_fanout_failures_total").increment(1);
			if let Some(handle) = self.registry.remove(id) {
				warn!(conn = %id, message_id = msg.id, error = %err, "fan-out write failed; dropping connection");
				handle.close().await;
			}
		}

		if self.cfg.debug_log_events {
			debug!(message_id = msg.id, recipients = delivered, "fan-out delivered");
		}
	}
}

/// Spawn the fan-out loop on the runtime and return its producer handle.
pub fn spawn_fan_out(registry: ConnectionRegistry, cfg: FanOutConfig) -> FanOutHandle {
	let (fan_out, handle) = FanOutLoop::new(registry, cfg);

	tokio::spawn(async move {
		fan_out.run().await;
	});

	handle
}
