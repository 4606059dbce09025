#![forbid(unsafe_code)]

pub mod endpoint {
	use std::fmt;
	use std::net::SocketAddr;

	/// Transport named by an endpoint URL.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub enum Scheme {
		Quic,
		Http,
		Ws,
	}

	impl Scheme {
		pub const fn prefix(self) -> &'static str {
			match self {
				Scheme::Quic => "quic://",
				Scheme::Http => "http://",
				Scheme::Ws => "ws://",
			}
		}

		fn split(s: &str) -> Option<(Self, &str)> {
			[Scheme::Quic, Scheme::Http, Scheme::Ws]
				.into_iter()
				.find_map(|scheme| s.strip_prefix(scheme.prefix()).map(|rest| (scheme, rest)))
		}
	}

	/// Parsed `scheme://host:port` endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct Endpoint {
		pub scheme: Scheme,
		pub host: String,
		pub port: u16,
	}

	impl fmt::Display for Endpoint {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			write!(f, "{}{}", self.scheme.prefix(), self.hostport())
		}
	}

	impl Endpoint {
		/// Returns `host:port` with IPv6 hosts still bracketed.
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Host with IPv6 brackets removed, suitable as a TLS server name.
		pub fn bare_host(&self) -> &str {
			self.host
				.strip_prefix('[')
				.and_then(|h| h.strip_suffix(']'))
				.unwrap_or(&self.host)
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
		}

		/// Parse `quic://host:port`, `http://host:port` or `ws://host:port`.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected scheme://host:port)".to_string());
			}

			let (scheme, rest) =
				Scheme::split(s).ok_or_else(|| format!("invalid endpoint (expected quic://, http:// or ws://): {s}"))?;

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!("invalid endpoint (path/query/fragment not allowed): {s}"));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port): {s}"))?;

			let host = host.trim();
			if host.is_empty() || host == "[]" {
				return Err(format!("invalid endpoint host: {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!(
					"invalid endpoint host (IPv6 must be bracketed like {}[::1]:3003): {s}",
					scheme.prefix()
				));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.ok()
				.filter(|p| *p != 0)
				.ok_or_else(|| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

			Ok(Self {
				scheme,
				host: host.to_string(),
				port,
			})
		}

		/// Parse and require a specific scheme.
		pub fn parse_as(s: &str, expected: Scheme) -> Result<Self, String> {
			let e = Self::parse(s)?;
			if e.scheme != expected {
				return Err(format!("expected a {}host:port endpoint, got: {}", expected.prefix(), s.trim()));
			}
			Ok(e)
		}
	}

}
