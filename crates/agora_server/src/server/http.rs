#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use agora_protocol::wire::{self, ErrorBody};
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::auth::{ModerationGate, Rejection};
use crate::server::ingest::{IngestError, IngestSource};
use crate::server::session::SessionContext;
use crate::server::websocket;

type HttpResponse = Response<Full<Bytes>>;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Shared state for every HTTP request.
#[derive(Clone)]
pub struct HttpState {
	pub session: SessionContext,
	pub gate: ModerationGate,
	pub health: HealthState,
	/// Cap for submission bodies and WebSocket messages.
	pub max_body_bytes: usize,
}

/// Serve HTTP/1.1 (with WebSocket upgrades) on an already bound listener.
pub fn spawn_http_server(listener: TcpListener, state: HttpState) -> JoinHandle<()> {
	tokio::spawn(async move {
		if let Err(err) = run_http_server(listener, state).await {
			warn!(error = %err, "http server stopped");
		}
	})
}

async fn run_http_server(listener: TcpListener, state: HttpState) -> anyhow::Result<()> {
	info!(addr = ?listener.local_addr().ok(), "http front door listening");

	loop {
		let (stream, remote) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle(req, state.clone(), remote));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).with_upgrades().await {
				debug!(error = %err, %remote, "http connection error");
			}
		});
	}
}

async fn handle(req: Request<Incoming>, state: HttpState, remote: SocketAddr) -> Result<HttpResponse, Infallible> {
	let method = req.method().clone();
	let path = req.uri().path().to_string();

	let resp = match (path.as_str(), &method) {
		("/ws", &Method::GET) => match websocket::upgrade(req, state.session.clone(), state.max_body_bytes) {
			Ok(resp) => resp,
			Err(code) => error_response(StatusCode::BAD_REQUEST, code),
		},
		("/history", &Method::GET) => history(req.uri(), &state).await,
		("/messages", &Method::POST) => submit(req, &state).await,
		("/delete_message", &Method::DELETE) => delete_message(&req, &state).await,
		("/healthz", &Method::GET) => text_response(StatusCode::OK, "ok"),
		("/readyz", &Method::GET) => {
			if state.health.is_ready() {
				text_response(StatusCode::OK, "ready")
			} else {
				text_response(StatusCode::SERVICE_UNAVAILABLE, "not-ready")
			}
		}
		("/ws" | "/history" | "/messages" | "/delete_message" | "/healthz" | "/readyz", _) => {
			error_response(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed")
		}
		_ => error_response(StatusCode::NOT_FOUND, "not_found"),
	};

	metrics::counter!("agora_server_http_requests_total", "status" => resp.status().as_u16().to_string()).increment(1);
	debug!(%method, %path, %remote, status = resp.status().as_u16(), "http request");
	Ok(resp)
}

/// Requested history windows are capped at the larger of this and the configured default.
pub const HISTORY_LIMIT_CEILING: i64 = 500;

fn clamp_history_limit(requested: i64, configured: i64) -> i64 {
	requested.min(configured.max(HISTORY_LIMIT_CEILING))
}

async fn history(uri: &Uri, state: &HttpState) -> HttpResponse {
	let limit = match query_param(uri, "limit") {
		None => state.session.history_limit,
		Some(raw) => match raw.trim().parse::<i64>() {
			Ok(n) => clamp_history_limit(n, state.session.history_limit),
			Err(e) => {
				return json_response(
					StatusCode::BAD_REQUEST,
					&ErrorBody::new("invalid_limit").with_detail(e.to_string()),
				);
			}
		},
	};

	match state.session.gateway.store().history(limit).await {
		Ok(msgs) => json_response(StatusCode::OK, &msgs),
		Err(e) => {
			warn!(error = %e, "history query failed");
			error_response(StatusCode::INTERNAL_SERVER_ERROR, "store_unavailable")
		}
	}
}

async fn submit(req: Request<Incoming>, state: &HttpState) -> HttpResponse {
	let body = match Limited::new(req.into_body(), state.max_body_bytes).collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
			return error_response(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large");
		}
		Err(e) => {
			debug!(error = %e, "failed to read submission body");
			return error_response(StatusCode::BAD_REQUEST, "unreadable_body");
		}
	};

	let draft = match wire::decode_submit(&body) {
		Ok(d) => d,
		Err(e) => {
			return json_response(
				StatusCode::BAD_REQUEST,
				&ErrorBody::new("invalid_json").with_detail(e.to_string()),
			);
		}
	};

	match state.session.gateway.submit(draft, IngestSource::Http).await {
		Ok(msg) => json_response(StatusCode::CREATED, &msg),
		Err(IngestError::Validation(v)) => {
			json_response(StatusCode::BAD_REQUEST, &ErrorBody::new(v.code()).with_detail(v.to_string()))
		}
		Err(IngestError::Store(e)) => {
			warn!(error = %e, "failed to persist submission");
			error_response(StatusCode::INTERNAL_SERVER_ERROR, "store_unavailable")
		}
	}
}

async fn delete_message(req: &Request<Incoming>, state: &HttpState) -> HttpResponse {
	let authorization = req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok());
	match state.gate.authorize_delete(authorization) {
		Ok(_) => {}
		Err(Rejection::NotAuthenticated) => return error_response(StatusCode::UNAUTHORIZED, "not_authenticated"),
		Err(Rejection::Forbidden) => return error_response(StatusCode::FORBIDDEN, "forbidden"),
	}

	let Some(id) = query_param(req.uri(), "id")
		.and_then(|raw| raw.trim().parse::<i64>().ok())
		.filter(|id| *id > 0)
	else {
		return error_response(StatusCode::BAD_REQUEST, "invalid_id");
	};

	match state.session.gateway.store().delete_by_id(id).await {
		Ok(()) => {
			info!(id, "message deleted by moderator");
			empty_response(StatusCode::NO_CONTENT)
		}
		Err(e) => {
			warn!(id, error = %e, "delete failed");
			error_response(StatusCode::INTERNAL_SERVER_ERROR, "store_unavailable")
		}
	}
}

fn query_param(uri: &Uri, key: &str) -> Option<String> {
	let query = uri.query()?;
	url::form_urlencoded::parse(query.as_bytes())
		.find(|(k, _)| k == key)
		.map(|(_, v)| v.into_owned())
}

fn empty_response(status: StatusCode) -> HttpResponse {
	let mut resp = Response::new(Full::new(Bytes::new()));
	*resp.status_mut() = status;
	resp
}

fn text_response(status: StatusCode, body: &'static str) -> HttpResponse {
	let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
	*resp.status_mut() = status;
	resp
}

fn json_response<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> HttpResponse {
	match serde_json::to_vec(value) {
		Ok(body) => {
			let mut resp = Response::new(Full::new(Bytes::from(body)));
			*resp.status_mut() = status;
			resp.headers_mut()
				.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
			resp
		}
		Err(e) => {
			warn!(error = %e, "failed to serialize response body");
			text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
		}
	}
}

fn error_response(status: StatusCode, code: &str) -> HttpResponse {
	json_response(status, &ErrorBody::new(code))
}
