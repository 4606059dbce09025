#![forbid(unsafe_code)]

use agora_domain::SecretString;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::util::time::unix_secs_now;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
	#[error("token is not a three-part JWS")]
	Malformed,

	#[error("unsupported token algorithm: {0}")]
	UnsupportedAlgorithm(String),

	#[error("token signature mismatch")]
	BadSignature,

	#[error("token expired")]
	Expired,

	#[error("token claims unreadable: {0}")]
	Claims(String),
}

/// Identity carried by a verified bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
	pub user_id: i64,
	pub username: String,
	pub role: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub exp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Header {
	alg: String,
}

const HS256_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

/// Verify an HS256 compact JWS against `secret` and return its claims.
pub fn verify_token(token: &str, secret: &[u8]) -> Result<Claims, AuthError> {
	let mut parts = token.split('.');
	let (Some(header_b64), Some(payload_b64), Some(sig_b64), None) = (parts.next(), parts.next(), parts.next(), parts.next())
	else {
		return Err(AuthError::Malformed);
	};

	let header_raw = URL_SAFE_NO_PAD.decode(header_b64).map_err(|_| AuthError::Malformed)?;
	let header: Header = serde_json::from_slice(&header_raw).map_err(|_| AuthError::Malformed)?;
	if header.alg != "HS256" {
		return Err(AuthError::UnsupportedAlgorithm(header.alg));
	}

	let signing_input_len = header_b64.len() + 1 + payload_b64.len();
	let expected_sig = sign(&token.as_bytes()[..signing_input_len], secret)?;
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| AuthError::Malformed)?;
	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(AuthError::BadSignature);
	}

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| AuthError::Malformed)?;
	let claims: Claims = serde_json::from_slice(&payload).map_err(|e| AuthError::Claims(e.to_string()))?;

	if let Some(exp) = claims.exp
		&& exp <= unix_secs_now()
	{
		return Err(AuthError::Expired);
	}

	Ok(claims)
}

/// Produce an HS256 token for `claims`. Used by tests and operator tooling.
pub fn mint_token(claims: &Claims, secret: &[u8]) -> Result<String, AuthError> {
	let payload = serde_json::to_vec(claims).map_err(|e| AuthError::Claims(e.to_string()))?;
	let signing_input = format!(
		"{}.{}",
		URL_SAFE_NO_PAD.encode(HS256_HEADER),
		URL_SAFE_NO_PAD.encode(payload)
	);
	let sig = sign(signing_input.as_bytes(), secret)?;
	Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

fn sign(input: &[u8], secret: &[u8]) -> Result<Vec<u8>, AuthError> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|_| AuthError::BadSignature)?;
	mac.update(input);
	Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

/// Why a moderation request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
	/// No usable `Authorization: Bearer` header.
	NotAuthenticated,
	/// Token invalid, or valid but not an administrator.
	Forbidden,
}

/// Decides whether a caller may delete messages.
#[derive(Debug, Clone)]
pub struct ModerationGate {
	secret: Option<SecretString>,
	admin_role: String,
}

impl ModerationGate {
	pub fn new(secret: Option<SecretString>, admin_role: impl Into<String>) -> Self {
		Self {
			secret,
			admin_role: admin_role.into(),
		}
	}

	/// Verify a bare bearer token and return the role it carries.
	pub fn authorize(&self, bearer: &str) -> Result<String, AuthError> {
		let Some(secret) = &self.secret else {
			return Err(AuthError::BadSignature);
		};
		verify_token(bearer, secret.expose().as_bytes()).map(|c| c.role)
	}

	/// Check an `Authorization` header value for permission to delete.
	pub fn authorize_delete(&self, authorization: Option<&str>) -> Result<String, Rejection> {
		let Some(token) = authorization.and_then(|h| h.strip_prefix("Bearer ")) else {
			return Err(Rejection::NotAuthenticated);
		};

		let role = self.authorize(token.trim()).map_err(|e| {
			debug!(error = %e, "moderation token rejected");
			Rejection::Forbidden
		})?;

		if role != self.admin_role {
			debug!(role = %role, "moderation denied for non-admin role");
			return Err(Rejection::Forbidden);
		}

		Ok(role)
	}
}
