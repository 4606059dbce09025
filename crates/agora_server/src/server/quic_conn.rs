#![forbid(unsafe_code)]

use std::sync::Arc;

use agora_domain::ChatMessage;
use agora_protocol::pb::{ChatEvent, ChatSubmit};
use agora_protocol::{FrameCodec, FrameDecoder};
use anyhow::{Context as _, anyhow};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::server::ingest::IngestSource;
use crate::server::registry::{ChatSink, CloseSignal};
use crate::server::session::{Inbound, InboundFrames, SessionContext, run_session};

/// Outbound half of a QUIC chat stream: one length-prefixed `ChatEvent` per message.
pub struct QuicSink {
	send: Mutex<quinn::SendStream>,
	connection: quinn::Connection,
	codec: FrameCodec,
	signal: CloseSignal,
}

#[async_trait::async_trait]
impl ChatSink for QuicSink {
	async fn deliver(&self, msg: &ChatMessage) -> anyhow::Result<()> {
		let frame = self.codec.encode(&ChatEvent::from(msg)).context("encode chat event")?;
		let mut send = self.send.lock().await;
		if self.signal.is_fired() {
			return Err(anyhow!("quic stream already closed"));
		}
		send.write_all(&frame).await.context("quic stream write")
	}

	async fn close(&self) {
		if !self.signal.fire() {
			return;
		}
		let _ = self.send.lock().await.finish();
		self.connection.close(quinn::VarInt::from_u32(0), b"closed");
	}

	async fn closed(&self) {
		self.signal.wait().await;
	}
}

/// Inbound half of a QUIC chat stream.
pub struct QuicInbound {
	recv: quinn::RecvStream,
	decoder: FrameDecoder,
	scratch: Vec<u8>,
}

#[async_trait::async_trait]
impl InboundFrames for QuicInbound {
	async fn next_inbound(&mut self) -> anyhow::Result<Inbound> {
		loop {
			match self.decoder.next_frame::<ChatSubmit>() {
				Ok(Some(submit)) => return Ok(Inbound::Draft(submit.into())),
				Ok(None) => {}
				Err(e) if e.is_recoverable() => return Ok(Inbound::Discard("undecodable frame")),
				Err(e) => return Err(anyhow!(e).context("quic framing")),
			}

			match self.recv.read(&mut self.scratch).await.context("quic stream read")? {
				Some(n) => self.decoder.extend(&self.scratch[..n]),
				None => return Ok(Inbound::Closed),
			}
		}
	}
}

/// Run one accepted QUIC connection. The client opens a single bidirectional stream.
pub async fn handle_connection(
	connection: quinn::Connection,
	ctx: SessionContext,
	codec: FrameCodec,
) -> anyhow::Result<()> {
	let (send, recv) = connection.accept_bi().await.context("accept chat stream")?;

	let sink = Arc::new(QuicSink {
		send: Mutex::new(send),
		connection: connection.clone(),
		codec,
		signal: CloseSignal::default(),
	});
	let inbound = QuicInbound {
		recv,
		decoder: codec.decoder(),
		scratch: vec![0u8; 8192],
	};

	let id = run_session(ctx, sink, inbound, IngestSource::Quic).await;
	debug!(conn = %id, remote = %connection.remote_address(), "quic session finished");
	Ok(())
}

/// Accept QUIC connections until the endpoint is closed.
pub async fn serve(endpoint: quinn::Endpoint, ctx: SessionContext, codec: FrameCodec) {
	info!(addr = ?endpoint.local_addr().ok(), "quic front door accepting");

	while let Some(incoming) = endpoint.accept().await {
		let ctx = ctx.clone();
		tokio::spawn(async move {
			match incoming.await {
				Ok(connection) => {
					debug!(remote = %connection.remote_address(), "quic connection established");
					if let Err(e) = handle_connection(connection, ctx, codec).await {
						warn!(error = %e, "quic connection ended with error");
					}
				}
				Err(e) => warn!(error = %e, "failed to establish QUIC connection"),
			}
		});
	}

	info!("quic endpoint closed");
}
