#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use agora_domain::{ChatMessage, ConnectionId, MessageDraft};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::server::ingest::{IngestGateway, IngestSource};
use crate::server::registry::{ChatSink, ConnectionHandle, ConnectionRegistry};

/// One unit read from a connection's inbound side.
#[derive(Debug)]
pub enum Inbound {
	Draft(MessageDraft),
	/// A frame that was read but carries nothing usable.
	Discard(&'static str),
	/// The peer closed cleanly.
	Closed,
}

/// Inbound half of a live connection.
#[async_trait::async_trait]
pub trait InboundFrames: Send {
	/// Read the next frame. An error is terminal for the connection.
	async fn next_inbound(&mut self) -> anyhow::Result<Inbound>;
}

/// Everything a session needs from the rest of the server.
#[derive(Clone)]
pub struct SessionContext {
	pub registry: ConnectionRegistry,
	pub gateway: IngestGateway,
	pub history_limit: i64,
}

struct ActiveConnectionGuard;

impl ActiveConnectionGuard {
	fn new() -> Self {
		metrics::counter!("agora_server_connections_total").increment(1);
		metrics::gauge!("agora_server_active_connections").increment(1.0);
		Self
	}
}

impl Drop for ActiveConnectionGuard {
	fn drop(&mut self) {
		metrics::gauge!("agora_server_active_connections").decrement(1.0);
	}
}

/// Registry entry for a session. Live deliveries wait until the history snapshot has been
/// written, and messages already sent in the snapshot are not sent again.
struct SnapshotGatedSink {
	inner: ConnectionHandle,
	snapshot_ids: Mutex<HashSet<i64>>,
}

#[async_trait::async_trait]
impl ChatSink for SnapshotGatedSink {
	async fn deliver(&self, msg: &ChatMessage) -> anyhow::Result<()> {
		if self.snapshot_ids.lock().await.contains(&msg.id) {
			return Ok(());
		}
		self.inner.deliver(msg).await
	}

	async fn close(&self) {
		self.inner.close().await;
	}

	async fn closed(&self) {
		self.inner.closed().await;
	}
}

/// Drive a connection from registration to close.
///
/// Registers `sink`, pushes the history snapshot, then ingests inbound frames until the peer goes
/// away, a read fails, or the fan-out loop closes the sink. Live broadcasts that arrive while the
/// snapshot is being written are held back until it is done. The connection is closed and out of
/// the registry when this returns.
pub async fn run_session<R>(
	ctx: SessionContext,
	sink: ConnectionHandle,
	mut inbound: R,
	source: IngestSource,
) -> ConnectionId
where
	R: InboundFrames,
{
	let _guard = ActiveConnectionGuard::new();
	let id = ctx.registry.next_id();
	let gated = Arc::new(SnapshotGatedSink {
		inner: sink.clone(),
		snapshot_ids: Mutex::new(HashSet::new()),
	});
	let pending = gated.snapshot_ids.lock().await;
	ctx.registry.add(id, gated.clone());
	info!(conn = %id, source = source.as_str(), "connection registered");

	if push_history(&ctx, id, &sink, pending).await {
		loop {
			tokio::select! {
				biased;

				_ = sink.closed() => {
					debug!(conn = %id, "sink closed; ending session");
					break;
				}
				next = inbound.next_inbound() => match next {
					Ok(Inbound::Draft(draft)) => {
						ctx.gateway.ingest_stream(draft, source).await;
					}
					Ok(Inbound::Discard(reason)) => {
						metrics::counter!("agora_server_frames_discarded_total", "source" => source.as_str()).increment(1);
						debug!(conn = %id, reason, "inbound frame discarded");
					}
					Ok(Inbound::Closed) => {
						debug!(conn = %id, "peer closed");
						break;
					}
					Err(e) => {
						debug!(conn = %id, error = %e, "inbound read failed");
						break;
					}
				}
			}
		}
	}

	sink.close().await;
	ctx.registry.remove(id);
	info!(conn = %id, "connection closed");
	id
}

/// Send the recent-history window. Returns false when the connection is already dead.
///
/// `pending` gates live delivery for this connection and is released on return.
async fn push_history(
	ctx: &SessionContext,
	id: ConnectionId,
	sink: &ConnectionHandle,
	mut pending: MutexGuard<'_, HashSet<i64>>,
) -> bool {
	let history = match ctx.gateway.store().history(ctx.history_limit).await {
		Ok(h) => h,
		Err(e) => {
			warn!(conn = %id, error = %e, "history snapshot unavailable; continuing without it");
			return true;
		}
	};

	for msg in &history {
		if let Err(e) = sink.deliver(msg).await {
			debug!(conn = %id, error = %e, "history push failed");
			return false;
		}
		pending.insert(msg.id);
	}

	debug!(conn = %id, count = history.len(), "history snapshot sent");
	true
}
