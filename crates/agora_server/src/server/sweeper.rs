#![forbid(unsafe_code)]

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::server::store::{MessageStore, StoreError};

/// Settings for the retention sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
	/// Also the delay before the first sweep; nothing is purged at startup.
	pub interval: Duration,
	/// A zero horizon deletes everything created before the sweep runs.
	pub horizon: Duration,
}

impl Default for SweeperConfig {
	fn default() -> Self {
		Self {
			interval: Duration::from_secs(5 * 60),
			horizon: Duration::from_secs(24 * 60 * 60),
		}
	}
}

/// Run one sweep and record it.
pub async fn sweep_once(store: &MessageStore, horizon: Duration) -> Result<u64, StoreError> {
	let removed = store.delete_older_than(horizon).await?;
	metrics::counter!("agora_server_sweeps_total").increment(1);
	metrics::counter!("agora_server_swept_messages_total").increment(removed);
	Ok(removed)
}

/// Periodically purge old messages until the task is aborted.
///
/// The first sweep happens one full interval after start. A failed sweep is logged and the
/// schedule continues.
pub async fn run_sweeper(store: MessageStore, cfg: SweeperConfig) {
	info!(
		interval_secs = cfg.interval.as_secs(),
		horizon_secs = cfg.horizon.as_secs(),
		"retention sweeper started"
	);

	let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + cfg.interval, cfg.interval);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		ticker.tick().await;

		match sweep_once(&store, cfg.horizon).await {
			Ok(0) => debug!("retention sweep: nothing to delete"),
			Ok(n) => info!(deleted = n, "retention sweep removed old messages"),
			Err(e) => {
				metrics::counter!("agora_server_sweep_errors_total").increment(1);
				warn!(error = %e, "retention sweep failed");
			}
		}
	}
}

pub fn spawn_sweeper(store: MessageStore, cfg: SweeperConfig) -> JoinHandle<()> {
	tokio::spawn(run_sweeper(store, cfg))
}
