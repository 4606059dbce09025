#![forbid(unsafe_code)]

use std::path::PathBuf;

use agora_protocol::version::{PROTOCOL_MAJOR, PROTOCOL_MINOR};
use agora_server::config::{default_config_path, load_server_config_from_path};
use agora_server::server::app;
use agora_util::endpoint::{Endpoint, Scheme};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: agora_server [--http http://host:port] [--quic quic://host:port] [--config path]\n\
\n\
Options:\n\
\t--http     HTTP + WebSocket bind (default: from config, http://127.0.0.1:3003)\n\
\t--quic     Enable the QUIC front door on this bind\n\
\t           Format: quic://host:port\n\
\t--config   Config file (default: ~/.agora/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

#[derive(Debug, Default)]
struct Args {
	http_bind: Option<String>,
	quic_bind: Option<String>,
	config_path: Option<PathBuf>,
}

fn parse_bind(flag: &str, value: &str, scheme: Scheme) -> String {
	let endpoint = Endpoint::parse_as(value, scheme).unwrap_or_else(|e| {
		eprintln!("{flag}: {e}");
		usage_and_exit();
	});

	let addr = endpoint.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{flag}: {e}");
		usage_and_exit();
	});

	addr.to_string()
}

fn parse_args() -> Args {
	let mut args = Args::default();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--http" | "--bind" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.http_bind = Some(parse_bind("--http", &v, Scheme::Http));
			}
			"--quic" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.quic_bind = Some(parse_bind("--quic", &v, Scheme::Quic));
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,agora_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("agora_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => default_config_path()?,
	};
	let mut server_cfg = load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	if let Some(bind) = args.http_bind {
		server_cfg.server.http_bind = bind;
	}
	if let Some(bind) = args.quic_bind {
		server_cfg.server.quic_bind = Some(bind);
	}

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	info!(major = PROTOCOL_MAJOR, minor = PROTOCOL_MINOR, "agora protocol");
	let running = app::start(&server_cfg).await?;

	tokio::signal::ctrl_c().await?;
	info!("ctrl-c received; shutting down");
	running.shutdown().await;

	Ok(())
}
