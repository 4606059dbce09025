#![forbid(unsafe_code)]

use std::net::SocketAddr;

use agora_protocol::FrameCodec;
use anyhow::Context as _;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ServerConfig;
use crate::quic::config::QuicServerConfig;
use crate::server::auth::ModerationGate;
use crate::server::fanout::{FanOutConfig, spawn_fan_out};
use crate::server::http::{HealthState, HttpState, spawn_http_server};
use crate::server::ingest::IngestGateway;
use crate::server::quic_conn;
use crate::server::registry::ConnectionRegistry;
use crate::server::session::SessionContext;
use crate::server::store::MessageStore;
use crate::server::sweeper::{SweeperConfig, spawn_sweeper};

/// A started server: every front door bound and every background task running.
pub struct RunningServer {
	pub http_addr: SocketAddr,
	pub quic_addr: Option<SocketAddr>,
	/// DER of the generated QUIC certificate when no PEM files were configured.
	pub self_signed_cert_der: Option<Vec<u8>>,
	pub registry: ConnectionRegistry,
	pub store: MessageStore,
	pub health: HealthState,
	quic_endpoint: Option<quinn::Endpoint>,
	tasks: Vec<JoinHandle<()>>,
}

/// Open the store, start fan-out and retention, then bind HTTP (and QUIC when configured).
pub async fn start(cfg: &ServerConfig) -> anyhow::Result<RunningServer> {
	let store = MessageStore::connect(&cfg.persistence.database_url)
		.await
		.context("open message store")?;

	let registry = ConnectionRegistry::new();
	let fan_out = spawn_fan_out(registry.clone(), FanOutConfig::default());

	let mut tasks = Vec::new();
	tasks.push(spawn_sweeper(
		store.clone(),
		SweeperConfig {
			interval: cfg.chat.sweep_interval,
			horizon: cfg.chat.retention,
		},
	));

	let session = SessionContext {
		registry: registry.clone(),
		gateway: IngestGateway::new(store.clone(), fan_out),
		history_limit: cfg.chat.history_limit,
	};

	let health = HealthState::new();

	let listener = TcpListener::bind(cfg.server.http_bind.as_str())
		.await
		.with_context(|| format!("bind http listener on {}", cfg.server.http_bind))?;
	let http_addr = listener.local_addr().context("http listener address")?;
	tasks.push(spawn_http_server(
		listener,
		HttpState {
			session: session.clone(),
			gate: ModerationGate::new(cfg.auth.signing_secret.clone(), cfg.auth.admin_role.clone()),
			health: health.clone(),
			max_body_bytes: cfg.server.max_frame_bytes,
		},
	));

	let mut quic_addr = None;
	let mut quic_endpoint = None;
	let mut self_signed_cert_der = None;

	if let Some(bind) = cfg.server.quic_bind.as_deref() {
		let addr: SocketAddr = bind
			.parse()
			.with_context(|| format!("invalid quic bind address {bind} (expected ip:port)"))?;

		let bound = QuicServerConfig::new(addr).bind(cfg.server.tls_cert_path.as_deref(), cfg.server.tls_key_path.as_deref())?;
		if let Some(der) = bound.self_signed_cert_der.as_ref() {
			info!(cert_der_len = der.len(), "quic endpoint using dev self-signed cert");
		}

		quic_addr = Some(bound.endpoint.local_addr().context("quic endpoint address")?);
		self_signed_cert_der = bound.self_signed_cert_der;

		let codec = FrameCodec::new(cfg.server.max_frame_bytes);
		tasks.push(tokio::spawn(quic_conn::serve(bound.endpoint.clone(), session.clone(), codec)));
		quic_endpoint = Some(bound.endpoint);
	}

	health.mark_ready();
	info!(http = %http_addr, quic = ?quic_addr, "agora_server ready");

	Ok(RunningServer {
		http_addr,
		quic_addr,
		self_signed_cert_der,
		registry,
		store,
		health,
		quic_endpoint,
		tasks,
	})
}

impl RunningServer {
	/// Stop accepting, close live connections, then close the store.
	pub async fn shutdown(self) {
		if let Some(endpoint) = self.quic_endpoint.as_ref() {
			endpoint.close(quinn::VarInt::from_u32(0), b"shutdown");
		}

		for task in &self.tasks {
			task.abort();
		}

		for (id, handle) in self.registry.snapshot() {
			handle.close().await;
			self.registry.remove(id);
		}

		self.store.close().await;
		info!("agora_server stopped");
	}
}
