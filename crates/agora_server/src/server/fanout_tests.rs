#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use agora_domain::{ChatMessage, ConnectionId};
use tokio::time::timeout;

use crate::server::fanout::{FanOutConfig, FanOutLoop, spawn_fan_out};
use crate::server::registry::{ChatSink, ConnectionRegistry};
use crate::server::test_support::{RecordingSink, message};

/// On its first delivery, runs another connection's teardown: close, then leave the registry.
struct TeardownOnDeliver {
	registry: ConnectionRegistry,
	victim_id: ConnectionId,
	victim: Arc<RecordingSink>,
}

#[async_trait::async_trait]
impl ChatSink for TeardownOnDeliver {
	async fn deliver(&self, _msg: &ChatMessage) -> anyhow::Result<()> {
		self.victim.close().await;
		self.registry.remove(self.victim_id);
		Ok(())
	}

	async fn close(&self) {}

	async fn closed(&self) {
		std::future::pending::<()>().await;
	}
}

#[tokio::test]
async fn every_connection_sees_enqueue_order() {
	let registry = ConnectionRegistry::new();
	let (a, mut rx_a) = RecordingSink::new();
	let (b, mut rx_b) = RecordingSink::new();
	registry.add(registry.next_id(), a);
	registry.add(registry.next_id(), b);

	let fan_out = spawn_fan_out(registry.clone(), FanOutConfig::default());
	for i in 1..=20 {
		fan_out.enqueue(message(i, &format!("m{i}"))).expect("loop alive");
	}

	for rx in [&mut rx_a, &mut rx_b] {
		for want in 1..=20 {
			let got = timeout(Duration::from_millis(500), rx.recv())
				.await
				.expect("delivery within timeout")
				.expect("sink open");
			assert_eq!(got.id, want);
		}
	}
}

#[tokio::test]
async fn failed_write_evicts_and_closes_only_that_connection() {
	let registry = ConnectionRegistry::new();
	let (good, mut rx_good) = RecordingSink::new();
	let (bad, _rx_bad) = RecordingSink::new();
	let good_id = registry.next_id();
	let bad_id = registry.next_id();
	registry.add(good_id, good.clone());
	registry.add(bad_id, bad.clone());
	bad.break_writes();

	let (fan_out, _handle) = FanOutLoop::new(registry.clone(), FanOutConfig::default());
	fan_out.broadcast(&message(1, "first")).await;

	assert!(!registry.contains(bad_id));
	assert!(registry.contains(good_id));
	assert!(bad.is_closed());
	assert_eq!(bad.close_calls(), 1);
	assert!(!good.is_closed());
	assert_eq!(rx_good.try_recv().expect("good got first").id, 1);

	fan_out.broadcast(&message(2, "second")).await;
	assert_eq!(bad.close_calls(), 1, "evicted connection must not be touched again");
	assert_eq!(rx_good.try_recv().expect("good got second").id, 2);
}

#[tokio::test]
async fn connection_torn_down_mid_broadcast_is_not_written() {
	let registry = ConnectionRegistry::new();
	let (victim, mut rx_victim) = RecordingSink::new();
	let trigger_id = registry.next_id();
	let victim_id = registry.next_id();
	registry.add(
		trigger_id,
		Arc::new(TeardownOnDeliver {
			registry: registry.clone(),
			victim_id,
			victim: victim.clone(),
		}),
	);
	registry.add(victim_id, victim.clone());

	let (fan_out, _handle) = FanOutLoop::new(registry.clone(), FanOutConfig::default());
	fan_out.broadcast(&message(1, "racing")).await;

	assert!(!registry.contains(victim_id));
	assert!(rx_victim.try_recv().is_err(), "removed connection was written to");
	assert_eq!(victim.close_calls(), 1);
}

#[tokio::test]
async fn late_joiners_only_see_later_messages() {
	let registry = ConnectionRegistry::new();
	let (early, mut rx_early) = RecordingSink::new();
	registry.add(registry.next_id(), early);

	let (fan_out, _handle) = FanOutLoop::new(registry.clone(), FanOutConfig::default());
	fan_out.broadcast(&message(1, "before")).await;

	let (late, mut rx_late) = RecordingSink::new();
	registry.add(registry.next_id(), late);
	fan_out.broadcast(&message(2, "after")).await;

	assert_eq!(rx_early.try_recv().expect("early 1").id, 1);
	assert_eq!(rx_early.try_recv().expect("early 2").id, 2);
	assert_eq!(rx_late.try_recv().expect("late 2").id, 2);
	assert!(rx_late.try_recv().is_err());
}

#[tokio::test]
async fn broadcast_with_no_connections_is_a_no_op() {
	let (fan_out, _handle) = FanOutLoop::new(ConnectionRegistry::new(), FanOutConfig::default());
	fan_out.broadcast(&message(1, "nobody home")).await;
}

#[tokio::test]
async fn loop_exits_once_all_handles_drop() {
	let (fan_out, handle) = FanOutLoop::new(ConnectionRegistry::new(), FanOutConfig::default());
	let task = tokio::spawn(fan_out.run());

	let extra = handle.clone();
	drop(handle);
	tokio::time::sleep(Duration::from_millis(20)).await;
	assert!(!task.is_finished(), "a live producer keeps the loop running");

	drop(extra);
	timeout(Duration::from_millis(500), task)
		.await
		.expect("loop exits")
		.expect("join");
}

#[tokio::test]
async fn enqueue_fails_after_loop_is_gone() {
	let (fan_out, handle) = FanOutLoop::new(ConnectionRegistry::new(), FanOutConfig::default());
	drop(fan_out);

	let err = handle.enqueue(message(7, "lost")).unwrap_err();
	assert_eq!(err.0, 7);
}
