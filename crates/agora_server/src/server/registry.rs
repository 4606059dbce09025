#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use agora_domain::{ChatMessage, ConnectionId};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

/// Outbound half of a live client connection, as seen by the fan-out loop.
#[async_trait::async_trait]
pub trait ChatSink: Send + Sync {
	/// Write one message to the client. An error marks the connection dead.
	async fn deliver(&self, msg: &ChatMessage) -> anyhow::Result<()>;

	/// Shut the connection down. Safe to call more than once.
	async fn close(&self);

	/// Resolves once `close` has been called.
	async fn closed(&self);
}

pub type ConnectionHandle = Arc<dyn ChatSink>;

/// One-shot latch used by sinks to implement `close`/`closed`.
#[derive(Debug)]
pub struct CloseSignal {
	tx: watch::Sender<bool>,
}

impl Default for CloseSignal {
	fn default() -> Self {
		let (tx, _rx) = watch::channel(false);
		Self { tx }
	}
}

impl CloseSignal {
	/// Returns true only for the call that flipped the latch.
	pub fn fire(&self) -> bool {
		self.tx.send_if_modified(|closed| {
			if *closed {
				false
			} else {
				*closed = true;
				true
			}
		})
	}

	pub fn is_fired(&self) -> bool {
		*self.tx.borrow()
	}

	pub async fn wait(&self) {
		let mut rx = self.tx.subscribe();
		let _ = rx.wait_for(|closed| *closed).await;
	}
}

/// Set of currently open connections, shared by every session task and the fan-out loop.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
	inner: Arc<Mutex<BTreeMap<ConnectionId, ConnectionHandle>>>,
	next_id: Arc<AtomicU64>,
}

impl ConnectionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Allocate a fresh connection id. Ids start at 1 and are never handed out twice.
	pub fn next_id(&self) -> ConnectionId {
		ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
	}

	/// Register a connection. Returns false (and keeps the existing entry) if the id is taken.
	pub fn add(&self, id: ConnectionId, handle: ConnectionHandle) -> bool {
		let mut inner = self.inner.lock();
		if inner.contains_key(&id) {
			return false;
		}
		inner.insert(id, handle);
		debug!(conn = %id, live = inner.len(), "registry: added");
		true
	}

	/// Remove a connection. Only the first caller for a given id gets the handle back.
	pub fn remove(&self, id: ConnectionId) -> Option<ConnectionHandle> {
		let mut inner = self.inner.lock();
		let handle = inner.remove(&id);
		if handle.is_some() {
			debug!(conn = %id, live = inner.len(), "registry: removed");
		}
		handle
	}

	pub fn contains(&self, id: ConnectionId) -> bool {
		self.inner.lock().contains_key(&id)
	}

	pub fn len(&self) -> usize {
		self.inner.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.lock().is_empty()
	}

	/// Copy of the current membership, in connection id order.
	pub fn snapshot(&self) -> Vec<(ConnectionId, ConnectionHandle)> {
		self.inner.lock().iter().map(|(id, h)| (*id, Arc::clone(h))).collect()
	}

	/// Run `f` for every connection present at call time, one at a time.
	///
	/// The lock is only held while taking the snapshot. Failures do not stop the walk; they are
	/// collected and returned so the caller can evict those connections.
	pub async fn for_each<F, Fut>(&self, mut f: F) -> Vec<(ConnectionId, anyhow::Error)>
	where
		F: FnMut(ConnectionId, ConnectionHandle) -> Fut,
		Fut: Future<Output = anyhow::Result<()>>,
	{
		let mut failed = Vec::new();
		for (id, handle) in self.snapshot() {
			if let Err(e) = f(id, handle).await {
				failed.push((id, e));
			}
		}
		failed
	}
}

impl std::fmt::Debug for ConnectionRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ConnectionRegistry").field("live", &self.len()).finish()
	}
}
