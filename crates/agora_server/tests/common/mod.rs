#![forbid(unsafe_code)]
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use agora_domain::SecretString;
use agora_server::config::ServerConfig;
use agora_server::server::app::{self, RunningServer};
use agora_server::server::auth::{Claims, mint_token};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;

pub const SECRET: &str = "integration-secret";

static LOG_INIT: OnceLock<()> = OnceLock::new();

pub fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

		if std::env::var_os("AGORA_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

/// In-memory store, ephemeral ports, small frame cap.
pub fn test_config(with_quic: bool) -> ServerConfig {
	let mut cfg = ServerConfig::default();
	cfg.server.http_bind = "127.0.0.1:0".to_string();
	cfg.server.quic_bind = with_quic.then(|| "127.0.0.1:0".to_string());
	cfg.server.max_frame_bytes = 1024;
	cfg.auth.signing_secret = Some(SecretString::new(SECRET));
	cfg.persistence.database_url = "sqlite::memory:".to_string();
	cfg.chat.history_limit = 50;
	cfg
}

pub async fn start(with_quic: bool) -> RunningServer {
	init_test_logging();
	app::start(&test_config(with_quic)).await.expect("server starts")
}

pub fn token(role: &str) -> String {
	let claims = Claims {
		user_id: 1,
		username: format!("{role}-user"),
		role: role.to_string(),
		exp: None,
	};
	mint_token(&claims, SECRET.as_bytes()).expect("mint token")
}

pub struct HttpReply {
	pub status: u16,
	pub body: String,
}

impl HttpReply {
	pub fn json(&self) -> serde_json::Value {
		serde_json::from_str(&self.body).unwrap_or_else(|e| panic!("body is not json ({e}): {}", self.body))
	}
}

/// One HTTP/1.1 request over a fresh connection.
pub async fn http(addr: SocketAddr, method: &str, path: &str, headers: &[(&str, &str)], body: &[u8]) -> HttpReply {
	let mut req = format!("{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\nContent-Length: {}\r\n", body.len());
	for (k, v) in headers {
		req.push_str(&format!("{k}: {v}\r\n"));
	}
	req.push_str("\r\n");

	let mut raw = req.into_bytes();
	raw.extend_from_slice(body);

	let mut stream = TcpStream::connect(addr).await.expect("connect http");
	stream.write_all(&raw).await.expect("write request");

	let mut buf = Vec::new();
	tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
		.await
		.expect("response within timeout")
		.expect("read response");

	let text = String::from_utf8(buf).expect("utf8 response");
	let (head, body) = text.split_once("\r\n\r\n").expect("header terminator");
	let status = head
		.split_whitespace()
		.nth(1)
		.and_then(|s| s.parse().ok())
		.expect("status code");

	HttpReply {
		status,
		body: body.to_string(),
	}
}

pub async fn post_message(addr: SocketAddr, user_id: i64, name: &str, body: &str) -> HttpReply {
	let payload = serde_json::json!({
		"author_subject_id": user_id,
		"author_name": name,
		"body": body,
	});
	http(
		addr,
		"POST",
		"/messages",
		&[("Content-Type", "application/json")],
		payload.to_string().as_bytes(),
	)
	.await
}
