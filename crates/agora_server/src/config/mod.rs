#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use agora_domain::SecretString;
use agora_protocol::DEFAULT_MAX_FRAME_SIZE;
use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:3003";
pub const DEFAULT_DATABASE_URL: &str = "sqlite:agora.db?mode=rwc";
pub const DEFAULT_ADMIN_ROLE: &str = "admin";
pub const DEFAULT_HISTORY_LIMIT: i64 = 50;

/// Default config path: `~/.agora/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".agora").join("config.toml"))
}

/// Load the server config from TOML at `path` (missing file means defaults) plus `AGORA_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	cfg.warn_on_gaps();

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub persistence: PersistenceSettings,
	pub chat: ChatSettings,
}

/// Listener and transport settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// HTTP + WebSocket listener (host:port).
	pub http_bind: String,
	/// QUIC listener (host:port). QUIC is off when unset.
	pub quic_bind: Option<String>,
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Largest accepted submission body, WebSocket message or QUIC frame.
	pub max_frame_bytes: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			http_bind: DEFAULT_HTTP_BIND.to_string(),
			quic_bind: None,
			tls_cert_path: None,
			tls_key_path: None,
			metrics_bind: None,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
	/// HS256 secret shared with the credential issuer. Without it no delete is ever allowed.
	pub signing_secret: Option<SecretString>,
	pub admin_role: String,
}

impl Default for AuthSettings {
	fn default() -> Self {
		Self {
			signing_secret: None,
			admin_role: DEFAULT_ADMIN_ROLE.to_string(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	/// `sqlite:`, `postgres:` or `mysql:` URL.
	pub database_url: String,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			database_url: DEFAULT_DATABASE_URL.to_string(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct ChatSettings {
	/// Messages pushed to a newly connected client, and the `/history` default.
	pub history_limit: i64,
	pub retention: Duration,
	pub sweep_interval: Duration,
}

impl Default for ChatSettings {
	fn default() -> Self {
		Self {
			history_limit: DEFAULT_HISTORY_LIMIT,
			retention: Duration::from_secs(24 * 60 * 60),
			sweep_interval: Duration::from_secs(5 * 60),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	chat: FileChatSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	http_bind: Option<String>,
	quic_bind: Option<String>,
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	max_frame_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	signing_secret: Option<String>,
	admin_role: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileChatSettings {
	history_limit: Option<i64>,
	retention_hours: Option<u64>,
	sweep_interval_secs: Option<u64>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerConfig::default();

		Self {
			server: ServerSettings {
				http_bind: non_empty(file.server.http_bind).unwrap_or(defaults.server.http_bind),
				quic_bind: non_empty(file.server.quic_bind),
				tls_cert_path: non_empty(file.server.tls_cert_path).map(PathBuf::from),
				tls_key_path: non_empty(file.server.tls_key_path).map(PathBuf::from),
				metrics_bind: non_empty(file.server.metrics_bind),
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(defaults.server.max_frame_bytes),
			},
			auth: AuthSettings {
				signing_secret: non_empty(file.auth.signing_secret).map(SecretString::new),
				admin_role: non_empty(file.auth.admin_role).unwrap_or(defaults.auth.admin_role),
			},
			persistence: PersistenceSettings {
				database_url: non_empty(file.persistence.database_url).unwrap_or(defaults.persistence.database_url),
			},
			chat: ChatSettings {
				history_limit: file.chat.history_limit.unwrap_or(defaults.chat.history_limit),
				retention: file
					.chat
					.retention_hours
					.map(|h| Duration::from_secs(h.saturating_mul(3600)))
					.unwrap_or(defaults.chat.retention),
				sweep_interval: file
					.chat
					.sweep_interval_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(defaults.chat.sweep_interval),
			},
		}
	}

	fn warn_on_gaps(&self) {
		if self.auth.signing_secret.is_none() {
			warn!("auth config: no signing_secret; every delete request will be refused");
		}
		if self.server.quic_bind.is_some() && self.server.tls_cert_path.is_none() {
			warn!("server config: quic enabled without tls_cert_path; a self-signed dev certificate will be used");
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig, var: impl Fn(&str) -> Option<String>) {
	let text = |key: &str| non_empty(var(key));

	if let Some(v) = text("AGORA_HTTP_BIND") {
		cfg.server.http_bind = v;
		info!("server config: http_bind overridden by env");
	}

	if let Some(v) = text("AGORA_QUIC_BIND") {
		cfg.server.quic_bind = Some(v);
		info!("server config: quic_bind overridden by env");
	}

	if let Some(v) = text("AGORA_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = text("AGORA_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = text("AGORA_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = text("AGORA_MAX_FRAME_BYTES")
		&& let Ok(bytes) = v.parse::<usize>()
		&& bytes > 0
	{
		cfg.server.max_frame_bytes = bytes;
		info!(bytes, "server config: max_frame_bytes overridden by env");
	}

	if let Some(v) = text("AGORA_SIGNING_SECRET") {
		cfg.auth.signing_secret = Some(SecretString::new(v));
		info!("auth config: signing_secret overridden by env");
	}

	if let Some(v) = text("AGORA_ADMIN_ROLE") {
		info!(role = %v, "auth config: admin_role overridden by env");
		cfg.auth.admin_role = v;
	}

	if let Some(v) = text("AGORA_DATABASE_URL") {
		cfg.persistence.database_url = v;
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = text("AGORA_HISTORY_LIMIT")
		&& let Ok(limit) = v.parse::<i64>()
	{
		cfg.chat.history_limit = limit;
		info!(limit, "chat config: history_limit overridden by env");
	}

	if let Some(v) = text("AGORA_RETENTION_HOURS")
		&& let Ok(hours) = v.parse::<u64>()
	{
		cfg.chat.retention = Duration::from_secs(hours.saturating_mul(3600));
		info!(hours, "chat config: retention overridden by env");
	}

	if let Some(v) = text("AGORA_SWEEP_INTERVAL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
		&& secs > 0
	{
		cfg.chat.sweep_interval = Duration::from_secs(secs);
		info!(secs, "chat config: sweep_interval overridden by env");
	}
}
