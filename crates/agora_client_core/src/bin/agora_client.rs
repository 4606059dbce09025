#![forbid(unsafe_code)]

use std::net::SocketAddr;

use agora_client_core::{ClientConfig, DEFAULT_SERVER_ENDPOINT_QUIC, connect};
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: agora_client [--connect quic://host:port] [--addr ip:port] --user-id N --name NAME\n\
\n\
Options:\n\
	--connect   Server endpoint (default: quic://127.0.0.1:18203)\n\
	--addr      Server SocketAddr (overrides DNS resolution from --connect)\n\
	--user-id   Author subject id sent with each line (positive integer)\n\
	--name      Author display name sent with each line\n\
	--help      Show this help\n\
\n\
Each line read from stdin is published as one message. Received messages are printed.\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,agora_client_core=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

struct Args {
	cfg: ClientConfig,
	user_id: i64,
	name: String,
}

fn parse_args() -> Args {
	let mut endpoint = DEFAULT_SERVER_ENDPOINT_QUIC.to_string();
	let mut addr_override: Option<SocketAddr> = None;
	let mut user_id: Option<i64> = None;
	let mut name: Option<String> = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => {
				endpoint = it.next().unwrap_or_else(|| usage_and_exit());
			}
			"--addr" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				addr_override = Some(v.parse().unwrap_or_else(|_| {
					eprintln!("Invalid --addr value: {v}");
					usage_and_exit()
				}));
			}
			"--user-id" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				user_id = Some(v.parse().ok().filter(|n: &i64| *n > 0).unwrap_or_else(|| {
					eprintln!("--user-id must be a positive integer");
					usage_and_exit()
				}));
			}
			"--name" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--name must be non-empty");
					usage_and_exit();
				}
				name = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let mut cfg = ClientConfig::from_quic_endpoint(&endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});
	if addr_override.is_some() {
		cfg.server_addr = addr_override;
	}

	let (Some(user_id), Some(name)) = (user_id, name) else {
		eprintln!("--user-id and --name are required");
		usage_and_exit();
	};

	Args { cfg, user_id, name }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let (mut session, mut events) = connect(args.cfg).await?;

	let printer = tokio::spawn(async move {
		let result = events
			.run_events_loop(|ev| println!("[{}] {}: {}", ev.id, ev.author_name, ev.body))
			.await;
		if let Err(e) = result {
			warn!(error = %e, "events loop ended with error");
		}
	});

	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	while let Some(line) = lines.next_line().await? {
		if line.is_empty() {
			continue;
		}
		session.submit(args.user_id, args.name.clone(), line).await?;
	}

	info!("stdin closed; finishing");
	session.finish()?;
	let _ = printer.await;
	session.close(0, "bye");
	Ok(())
}
