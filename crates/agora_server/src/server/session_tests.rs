#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use agora_domain::{ChatMessage, MessageDraft};
use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::fanout::{FanOutConfig, spawn_fan_out};
use crate::server::ingest::{IngestGateway, IngestSource};
use crate::server::registry::{ChatSink, CloseSignal, ConnectionRegistry};
use crate::server::session::{Inbound, InboundFrames, SessionContext, run_session};
use crate::server::store::MessageStore;
use crate::server::test_support::{RecordingSink, draft};

/// Inbound side fed by the test. Dropping the sender reads as a transport error.
struct ScriptedInbound {
	rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait::async_trait]
impl InboundFrames for ScriptedInbound {
	async fn next_inbound(&mut self) -> anyhow::Result<Inbound> {
		self.rx.recv().await.ok_or_else(|| anyhow!("transport reset"))
	}
}

fn scripted() -> (mpsc::UnboundedSender<Inbound>, ScriptedInbound) {
	let (tx, rx) = mpsc::unbounded_channel();
	(tx, ScriptedInbound { rx })
}

async fn context(history_limit: i64) -> SessionContext {
	let store = MessageStore::connect("sqlite::memory:").await.expect("store");
	let registry = ConnectionRegistry::new();
	let fan_out = spawn_fan_out(registry.clone(), FanOutConfig::default());
	SessionContext {
		registry,
		gateway: IngestGateway::new(store, fan_out),
		history_limit,
	}
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<ChatMessage>) -> ChatMessage {
	timeout(Duration::from_millis(500), rx.recv())
		.await
		.expect("message within timeout")
		.expect("sink open")
}

async fn wait_registered(registry: &ConnectionRegistry) {
	for _ in 0..100 {
		if !registry.is_empty() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	panic!("session never registered");
}

/// Records whether its connection was still registered when `close` ran.
struct CloseOrderSink {
	registry: ConnectionRegistry,
	registered_at_close: AtomicBool,
	signal: CloseSignal,
}

#[async_trait::async_trait]
impl ChatSink for CloseOrderSink {
	async fn deliver(&self, _msg: &ChatMessage) -> anyhow::Result<()> {
		Ok(())
	}

	async fn close(&self) {
		if self.signal.fire() {
			self.registered_at_close.store(!self.registry.is_empty(), Ordering::SeqCst);
		}
	}

	async fn closed(&self) {
		self.signal.wait().await;
	}
}

#[tokio::test]
async fn new_session_gets_bounded_history_first() {
	let ctx = context(2).await;
	for body in ["one", "two", "three"] {
		ctx.gateway.store().insert(&draft(body)).await.expect("seed");
	}

	let (sink, mut rx) = RecordingSink::new();
	let (tx, inbound) = scripted();
	let task = tokio::spawn(run_session(ctx.clone(), sink.clone(), inbound, IngestSource::WebSocket));

	assert_eq!(recv(&mut rx).await.body, "two");
	assert_eq!(recv(&mut rx).await.body, "three");

	tx.send(Inbound::Closed).expect("session alive");
	timeout(Duration::from_millis(500), task).await.expect("ends").expect("join");
	assert!(ctx.registry.is_empty());
	assert!(sink.is_closed());
}

#[tokio::test]
async fn drafts_are_persisted_and_broadcast_back() {
	let ctx = context(50).await;
	let (sink, mut rx) = RecordingSink::new();
	let (tx, inbound) = scripted();
	let task = tokio::spawn(run_session(ctx.clone(), sink, inbound, IngestSource::Quic));

	tx.send(Inbound::Discard("binary frame")).expect("alive");
	tx.send(Inbound::Draft(MessageDraft::new(1, "", "no name"))).expect("alive");
	tx.send(Inbound::Draft(draft("hello"))).expect("alive");

	let live = recv(&mut rx).await;
	assert_eq!(live.body, "hello");
	assert!(live.id > 0);
	assert_eq!(ctx.gateway.store().history(10).await.expect("history"), vec![live]);

	drop(tx);
	timeout(Duration::from_millis(500), task).await.expect("ends").expect("join");
	assert!(ctx.registry.is_empty());
}

#[tokio::test]
async fn closing_the_sink_ends_the_session() {
	let ctx = context(50).await;
	let (sink, _rx) = RecordingSink::new();
	let (_tx, inbound) = scripted();
	let task = tokio::spawn(run_session(ctx.clone(), sink.clone(), inbound, IngestSource::WebSocket));

	wait_registered(&ctx.registry).await;
	assert_eq!(ctx.registry.len(), 1);

	sink.close().await;
	let id = timeout(Duration::from_millis(500), task).await.expect("ends").expect("join");
	assert!(!ctx.registry.contains(id));
}

#[tokio::test]
async fn live_broadcast_waits_for_the_history_snapshot() {
	let ctx = context(50).await;
	for i in 1..=20 {
		ctx.gateway.store().insert(&draft(&format!("old {i}"))).await.expect("seed");
	}

	let (sink, mut rx) = RecordingSink::slow(Duration::from_millis(2));
	let (tx, inbound) = scripted();
	let task = tokio::spawn(run_session(ctx.clone(), sink, inbound, IngestSource::WebSocket));
	wait_registered(&ctx.registry).await;

	let live = ctx
		.gateway
		.submit(draft("live"), IngestSource::Http)
		.await
		.expect("submit");

	let mut seen = Vec::new();
	for _ in 0..21 {
		seen.push(recv(&mut rx).await.id);
	}
	assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order: {seen:?}");
	assert_eq!(seen.last(), Some(&live.id));

	tokio::time::sleep(Duration::from_millis(50)).await;
	assert!(rx.try_recv().is_err(), "message delivered twice");

	tx.send(Inbound::Closed).expect("alive");
	timeout(Duration::from_millis(500), task).await.expect("ends").expect("join");
}

#[tokio::test]
async fn session_closes_the_sink_before_leaving_the_registry() {
	let ctx = context(50).await;
	let sink = Arc::new(CloseOrderSink {
		registry: ctx.registry.clone(),
		registered_at_close: AtomicBool::new(false),
		signal: CloseSignal::default(),
	});
	let (tx, inbound) = scripted();
	let task = tokio::spawn(run_session(ctx.clone(), sink.clone(), inbound, IngestSource::Quic));
	wait_registered(&ctx.registry).await;

	tx.send(Inbound::Closed).expect("alive");
	timeout(Duration::from_millis(500), task).await.expect("ends").expect("join");

	assert!(sink.registered_at_close.load(Ordering::SeqCst));
	assert!(ctx.registry.is_empty());
}

#[tokio::test]
async fn dead_sink_during_history_is_dropped() {
	let ctx = context(50).await;
	ctx.gateway.store().insert(&draft("seed")).await.expect("seed");

	let (sink, _rx) = RecordingSink::new();
	sink.break_writes();
	let (_tx, inbound) = scripted();

	let id = timeout(
		Duration::from_millis(500),
		run_session(ctx.clone(), sink.clone(), inbound, IngestSource::WebSocket),
	)
	.await
	.expect("session gives up");

	assert!(!ctx.registry.contains(id));
	assert!(sink.is_closed());
}

#[tokio::test]
async fn history_failure_does_not_refuse_the_connection() {
	let ctx = context(50).await;
	ctx.gateway.store().close().await;

	let (sink, _rx) = RecordingSink::new();
	let (tx, inbound) = scripted();
	let task = tokio::spawn(run_session(ctx.clone(), sink, inbound, IngestSource::WebSocket));

	tokio::time::sleep(Duration::from_millis(30)).await;
	assert_eq!(ctx.registry.len(), 1);
	assert!(!task.is_finished());

	tx.send(Inbound::Closed).expect("alive");
	timeout(Duration::from_millis(500), task).await.expect("ends").expect("join");
}
