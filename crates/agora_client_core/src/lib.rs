#![forbid(unsafe_code)]

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use agora_protocol::pb::{ChatEvent, ChatSubmit};
use agora_protocol::{ALPN_PROTOCOL, DEFAULT_MAX_FRAME_SIZE, FrameCodec, FrameDecoder, FramingError};
use agora_util::endpoint::{Endpoint as ServerEndpoint, Scheme};
use anyhow::Context as _;
use quinn::{ClientConfig as QuinnClientConfig, Endpoint, TransportConfig, VarInt};
use tracing::{debug, info};

/// Local dev server endpoint.
pub const DEFAULT_SERVER_ENDPOINT_QUIC: &str = "quic://127.0.0.1:18203";

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Remote server host (DNS name or IP literal). Also used as TLS server name.
	pub server_host: String,

	/// Remote server UDP port.
	pub server_port: u16,

	/// Resolved remote server address override.
	pub server_addr: Option<SocketAddr>,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + stream open.
	pub connect_timeout: Duration,
}

impl ClientConfig {
	/// Parse a `quic://host:port` endpoint into `(host, port)`.
	pub fn parse_quic_endpoint(endpoint: &str) -> Result<(String, u16), ClientCoreError> {
		let e = ServerEndpoint::parse_as(endpoint, Scheme::Quic)
			.map_err(|msg| ClientCoreError::Protocol(format!("invalid endpoint (expected quic://host:port): {msg}")))?;
		Ok((e.bare_host().to_string(), e.port))
	}

	/// Convenience: create a config from `quic://host:port`.
	pub fn from_quic_endpoint(endpoint: &str) -> Result<Self, ClientCoreError> {
		let (host, port) = Self::parse_quic_endpoint(endpoint)?;
		Ok(Self {
			server_host: host,
			server_port: port,
			server_addr: None,
			..Self::default()
		})
	}

	/// Config for a server known by address, e.g. one bound on an ephemeral port.
	pub fn for_addr(addr: SocketAddr) -> Self {
		Self {
			server_host: "localhost".to_string(),
			server_port: addr.port(),
			server_addr: Some(addr),
			..Self::default()
		}
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			server_host: "localhost".to_string(),
			server_port: 18203,
			server_addr: None,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
		}
	}
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// QUIC endpoint setup failed.
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// Protocol framing error.
	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Protocol error.
	#[error("protocol error: {0}")]
	Protocol(String),

	/// IO error.
	#[error("io error: {0}")]
	Io(String),

	/// Other error.
	#[error("error: {0}")]
	Other(String),
}

impl From<anyhow::Error> for ClientCoreError {
	fn from(e: anyhow::Error) -> Self {
		ClientCoreError::Other(format!("{e:#}"))
	}
}

/// Sending half of a chat session.
pub struct ChatSession {
	conn: quinn::Connection,
	send: quinn::SendStream,
	codec: FrameCodec,
	// The endpoint drives the connection; keep it alive with the session.
	_endpoint: Endpoint,
}

/// Receiving half of a chat session: history snapshot first, then live messages.
pub struct ChatEvents {
	recv: quinn::RecvStream,
	decoder: FrameDecoder,
}

/// Connect, open the chat stream and announce it to the server.
pub async fn connect(cfg: ClientConfig) -> Result<(ChatSession, ChatEvents), ClientCoreError> {
	let endpoint = make_client_endpoint().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;
	let quinn_cfg = make_insecure_client_config().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;

	let connect_timeout = cfg.connect_timeout;
	let server_name = cfg.server_host.clone();

	let candidates: Vec<SocketAddr> = match cfg.server_addr {
		Some(addr) => vec![addr],
		None => {
			let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
			let addrs: Vec<SocketAddr> = hostport
				.to_socket_addrs()
				.map_err(|e| ClientCoreError::Connect(format!("failed to resolve {hostport}: {e}")))?
				.collect();
			if addrs.is_empty() {
				return Err(ClientCoreError::Connect(format!(
					"DNS resolution returned no addresses for {hostport}"
				)));
			}
			addrs
		}
	};

	let mut last_err: Option<String> = None;
	let mut conn: Option<quinn::Connection> = None;

	for server_addr in candidates {
		let connecting = endpoint
			.connect_with(quinn_cfg.clone(), server_addr, &server_name)
			.map_err(|e| ClientCoreError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

		match tokio::time::timeout(connect_timeout, connecting).await {
			Ok(Ok(c)) => {
				conn = Some(c);
				break;
			}
			Ok(Err(e)) => {
				last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}"));
			}
			Err(_) => {
				last_err = Some(format!(
					"connect timeout after {connect_timeout:?} (addr={server_addr}, sni={server_name})"
				));
			}
		}
	}

	let conn = conn.ok_or_else(|| {
		ClientCoreError::Connect(
			last_err.unwrap_or_else(|| format!("connect failed (no addresses attempted) (sni={server_name})")),
		)
	})?;

	info!(remote = %conn.remote_address(), "connected");

	let (send, recv) = tokio::time::timeout(connect_timeout, conn.open_bi())
		.await
		.map_err(|_| ClientCoreError::Io(format!("timeout opening chat stream after {connect_timeout:?}")))?
		.map_err(|e| ClientCoreError::Io(format!("open_bi(chat) failed: {e}")))?;

	let codec = FrameCodec::new(cfg.max_frame_bytes);
	let mut session = ChatSession {
		conn,
		send,
		codec,
		_endpoint: endpoint,
	};

	// The server only sees a stream once bytes arrive on it. An empty submit is ignored server-side.
	session.write_submit(&ChatSubmit::default()).await?;
	debug!("chat stream announced");

	let events = ChatEvents {
		recv,
		decoder: codec.decoder(),
	};

	Ok((session, events))
}

impl ChatSession {
	/// Publish a message. It comes back on the events half once persisted.
	pub async fn submit(
		&mut self,
		author_subject_id: i64,
		author_name: impl Into<String>,
		body: impl Into<String>,
	) -> Result<(), ClientCoreError> {
		let submit = ChatSubmit {
			author_subject_id,
			author_name: author_name.into(),
			body: body.into(),
		};
		self.write_submit(&submit).await
	}

	async fn write_submit(&mut self, submit: &ChatSubmit) -> Result<(), ClientCoreError> {
		let frame = self.codec.encode(submit)?;
		self.send
			.write_all(&frame)
			.await
			.map_err(|e| ClientCoreError::Io(e.to_string()))?;
		Ok(())
	}

	/// Finish the send side; the server treats this as a clean close.
	pub fn finish(&mut self) -> Result<(), ClientCoreError> {
		self.send.finish().map_err(|e| ClientCoreError::Io(e.to_string()))
	}

	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(VarInt::from_u32(code), reason.as_bytes());
	}
}

impl ChatEvents {
	/// Next message from the server, or `None` once the server finished the stream.
	pub async fn next_event(&mut self) -> Result<Option<ChatEvent>, ClientCoreError> {
		let mut tmp = [0u8; 8192];

		loop {
			if let Some(ev) = self.decoder.next_frame::<ChatEvent>()? {
				return Ok(Some(ev));
			}

			match self.recv.read(&mut tmp).await {
				Ok(Some(n)) => self.decoder.extend(&tmp[..n]),
				Ok(None) => return Ok(None),
				Err(e) => return Err(ClientCoreError::Io(e.to_string())),
			}
		}
	}

	/// Run the events loop until EOF or error.
	pub async fn run_events_loop<F>(&mut self, mut on_event: F) -> Result<(), ClientCoreError>
	where
		F: FnMut(ChatEvent),
	{
		while let Some(ev) = self.next_event().await? {
			debug!(id = ev.id, author = %ev.author_name, "chat event decoded");
			on_event(ev);
		}

		info!("chat stream closed by server");
		Ok(())
	}
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr = SocketAddr::from(([0, 0, 0, 0], 0));
	let endpoint = Endpoint::client(addr).context("create client endpoint")?;
	Ok(endpoint)
}

/// Dev-only TLS config that skips server cert validation.
fn make_insecure_client_config() -> anyhow::Result<QuinnClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	#[derive(Debug)]
	struct NoVerifier;

	impl rustls::client::danger::ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &rustls::pki_types::CertificateDer<'_>,
			_intermediates: &[rustls::pki_types::CertificateDer<'_>],
			_server_name: &rustls::pki_types::ServerName<'_>,
			_ocsp_response: &[u8],
			_now: rustls::pki_types::UnixTime,
		) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
			Ok(rustls::client::danger::ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Err(rustls::Error::General("TLS1.2 not supported".into()))
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			vec![
				rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
				rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA256,
				rustls::SignatureScheme::RSA_PSS_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA512,
				rustls::SignatureScheme::ED25519,
			]
		}
	}

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();

	tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
	tls.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;

	let mut cfg = QuinnClientConfig::new(Arc::new(quic_tls));

	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(1));
	transport.max_concurrent_uni_streams(VarInt::from_u32(0));
	transport.keep_alive_interval(Some(Duration::from_secs(10)));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_is_sane() {
		let cfg = ClientConfig::default();
		assert_eq!(cfg.server_host, "localhost");
		assert_eq!(cfg.max_frame_bytes, DEFAULT_MAX_FRAME_SIZE);
	}

	#[test]
	fn parses_quic_endpoint() {
		let cfg = ClientConfig::from_quic_endpoint("quic://[::1]:4433").unwrap();
		assert_eq!(cfg.server_host, "::1");
		assert_eq!(cfg.server_port, 4433);
		assert!(cfg.server_addr.is_none());
	}

	#[test]
	fn rejects_non_quic_scheme() {
		let err = ClientConfig::parse_quic_endpoint("http://127.0.0.1:3003").unwrap_err();
		assert!(matches!(err, ClientCoreError::Protocol(_)));
	}

	#[test]
	fn for_addr_pins_the_address() {
		let addr: SocketAddr = "127.0.0.1:5555".parse().unwrap();
		let cfg = ClientConfig::for_addr(addr);
		assert_eq!(cfg.server_addr, Some(addr));
		assert_eq!(cfg.server_port, 5555);
	}
}
