#![forbid(unsafe_code)]

use std::fs;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use agora_protocol::ALPN_PROTOCOL;
use anyhow::{Context as _, anyhow};
use quinn::{Endpoint, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};

/// QUIC front door settings.
#[derive(Debug, Clone)]
pub struct QuicServerConfig {
	pub bind_addr: SocketAddr,

	/// ALPN protocol identifiers accepted by the server.
	pub alpn_protocols: Vec<Vec<u8>>,

	/// Streams one client may hold open at once. Chat uses one.
	pub max_concurrent_bidi_streams: u32,
}

/// A bound endpoint plus the generated certificate, when one was generated.
pub struct BoundEndpoint {
	pub endpoint: Endpoint,
	pub self_signed_cert_der: Option<Vec<u8>>,
}

impl QuicServerConfig {
	pub fn new(bind_addr: SocketAddr) -> Self {
		Self {
			bind_addr,
			alpn_protocols: vec![ALPN_PROTOCOL.to_vec()],
			max_concurrent_bidi_streams: 4,
		}
	}

	/// Bind using PEM files when both paths are given, otherwise a fresh self-signed certificate.
	pub fn bind(&self, cert_path: Option<&Path>, key_path: Option<&Path>) -> anyhow::Result<BoundEndpoint> {
		let (cert_chain, key, self_signed_cert_der) = match (cert_path, key_path) {
			(Some(cert), Some(key)) => (load_cert_chain(cert)?, load_private_key(key)?, None),
			(None, None) => {
				let (chain, key) = self_signed()?;
				let der = chain[0].to_vec();
				(chain, key, Some(der))
			}
			_ => return Err(anyhow!("tls_cert_path and tls_key_path must be set together")),
		};

		let server_config = self.server_config(cert_chain, key)?;
		let endpoint = Endpoint::server(server_config, self.bind_addr).context("bind quinn endpoint")?;
		Ok(BoundEndpoint {
			endpoint,
			self_signed_cert_der,
		})
	}

	fn server_config(
		&self,
		cert_chain: Vec<CertificateDer<'static>>,
		key: PrivateKeyDer<'static>,
	) -> anyhow::Result<ServerConfig> {
		let mut tls_config = rustls::ServerConfig::builder()
			.with_no_client_auth()
			.with_single_cert(cert_chain, key)
			.context("build rustls server config")?;

		tls_config.alpn_protocols = self.alpn_protocols.clone();

		let quic_tls = quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
			.context("convert rustls ServerConfig -> quinn QuicServerConfig")?;

		let mut server_config = ServerConfig::with_crypto(Arc::new(quic_tls));

		let mut transport = quinn::TransportConfig::default();
		transport.max_concurrent_bidi_streams(quinn::VarInt::from_u32(self.max_concurrent_bidi_streams));
		transport.max_concurrent_uni_streams(quinn::VarInt::from_u32(0));
		server_config.transport_config(Arc::new(transport));

		Ok(server_config)
	}
}

fn self_signed() -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
	let ck = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).context("generate self-signed cert")?;

	let cert = CertificateDer::from(ck.cert.der().to_vec());
	let key = PrivateKeyDer::try_from(ck.signing_key.serialize_der()).map_err(|e| anyhow!("parse private key der: {e}"))?;
	Ok((vec![cert], key))
}

fn load_cert_chain(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
	let pem = fs::read(path).with_context(|| format!("read tls cert: {}", path.display()))?;
	let mut reader = BufReader::new(&pem[..]);
	let chain = certs(&mut reader).collect::<Result<Vec<_>, _>>().context("parse tls certs")?;

	if chain.is_empty() {
		return Err(anyhow!("no certificates found in {}", path.display()));
	}

	Ok(chain)
}

fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
	let pem = fs::read(path).with_context(|| format!("read tls key: {}", path.display()))?;
	let mut reader = BufReader::new(&pem[..]);
	let Some(key) = private_key(&mut reader).context("parse tls key")? else {
		return Err(anyhow!("no private key found in {}", path.display()));
	};
	Ok(key)
}
