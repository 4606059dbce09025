#![forbid(unsafe_code)]

use std::sync::Arc;

use agora_domain::ChatMessage;
use agora_protocol::wire;
use anyhow::{Context as _, anyhow};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use http_body_util::Full;
use hyper::header::{
	CONNECTION, HeaderMap, HeaderName, HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tracing::{debug, warn};

use crate::server::ingest::IngestSource;
use crate::server::registry::{ChatSink, CloseSignal};
use crate::server::session::{Inbound, InboundFrames, SessionContext, run_session};

/// Outbound half of a WebSocket: one JSON text frame per message.
pub struct WsSink<S> {
	write: Mutex<SplitSink<WebSocketStream<S>, Message>>,
	signal: CloseSignal,
}

/// Inbound half of a WebSocket.
pub struct WsInbound<S> {
	read: SplitStream<WebSocketStream<S>>,
}

/// Split an established WebSocket into the halves a session runs on.
pub fn split_socket<S>(ws: WebSocketStream<S>) -> (Arc<WsSink<S>>, WsInbound<S>)
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let (write, read) = ws.split();
	let sink = Arc::new(WsSink {
		write: Mutex::new(write),
		signal: CloseSignal::default(),
	});
	(sink, WsInbound { read })
}

#[async_trait::async_trait]
impl<S> ChatSink for WsSink<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	async fn deliver(&self, msg: &ChatMessage) -> anyhow::Result<()> {
		let json = wire::encode_message(msg).context("encode chat message")?;
		let mut write = self.write.lock().await;
		// `close` fires the latch before it takes the lock.
		if self.signal.is_fired() {
			return Err(anyhow!("websocket already closed"));
		}
		write.send(Message::Text(json.into())).await.context("websocket write")
	}

	async fn close(&self) {
		if !self.signal.fire() {
			return;
		}
		let mut write = self.write.lock().await;
		if let Err(e) = write.close().await {
			debug!(error = %e, "websocket close handshake failed");
		}
	}

	async fn closed(&self) {
		self.signal.wait().await;
	}
}

#[async_trait::async_trait]
impl<S> InboundFrames for WsInbound<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	async fn next_inbound(&mut self) -> anyhow::Result<Inbound> {
		loop {
			let Some(frame) = self.read.next().await else {
				return Ok(Inbound::Closed);
			};

			return match frame.context("websocket read")? {
				Message::Text(text) => Ok(match wire::decode_submit(text.as_bytes()) {
					Ok(draft) => Inbound::Draft(draft),
					Err(_) => Inbound::Discard("undecodable text frame"),
				}),
				Message::Binary(_) => Ok(Inbound::Discard("binary frame")),
				Message::Close(_) => Ok(Inbound::Closed),
				// Ping replies are queued by the protocol layer.
				Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
			};
		}
	}
}

fn header_has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
	headers
		.get_all(name)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Validate an upgrade request and compute `Sec-WebSocket-Accept`.
pub fn accept_key<B>(req: &Request<B>) -> Result<String, &'static str> {
	let headers = req.headers();
	if !header_has_token(headers, UPGRADE, "websocket") {
		return Err("missing_upgrade");
	}
	if !header_has_token(headers, CONNECTION, "upgrade") {
		return Err("missing_connection_upgrade");
	}
	let version_ok = headers
		.get(SEC_WEBSOCKET_VERSION)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.trim() == "13");
	if !version_ok {
		return Err("unsupported_websocket_version");
	}
	let key = headers
		.get(SEC_WEBSOCKET_KEY)
		.and_then(|v| v.to_str().ok())
		.map(str::trim)
		.filter(|k| !k.is_empty())
		.ok_or("missing_websocket_key")?;

	Ok(derive_accept_key(key.as_bytes()))
}

/// Answer a `/ws` request: 101 and a spawned session on success, otherwise an error code for the caller.
pub fn upgrade<B>(
	mut req: Request<B>,
	ctx: SessionContext,
	max_frame_bytes: usize,
) -> Result<Response<Full<Bytes>>, &'static str> {
	let accept = accept_key(&req)?;
	let accept = HeaderValue::from_str(&accept).map_err(|_| "bad_accept_key")?;
	let on_upgrade = hyper::upgrade::on(&mut req);

	tokio::spawn(async move {
		let upgraded = match on_upgrade.await {
			Ok(u) => u,
			Err(e) => {
				warn!(error = %e, "websocket upgrade failed");
				return;
			}
		};

		let cfg = WebSocketConfig::default()
			.max_message_size(Some(max_frame_bytes))
			.max_frame_size(Some(max_frame_bytes));
		let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, Some(cfg)).await;
		let (sink, inbound) = split_socket(ws);
		run_session(ctx, sink, inbound, IngestSource::WebSocket).await;
	});

	let mut resp = Response::new(Full::new(Bytes::new()));
	*resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
	let headers = resp.headers_mut();
	headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
	headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
	headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
	Ok(resp)
}
