#![forbid(unsafe_code)]

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

const SEPARATOR: char = '_';

/// Length of a base64url (unpadded) HMAC-SHA256 signature.
const SIGNATURE_LEN: usize = 43;

/// What a bridged media token points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
	pub path: String,
	#[serde(default)]
	pub file_name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub mime_type: Option<String>,
}

impl MediaRef {
	pub fn mime_type(&self) -> Option<&str> {
		self.mime_type.as_deref().filter(|m| !m.is_empty())
	}
}

#[derive(Debug, Error)]
pub enum MediaIdError {
	/// Bad format, signature or payload. Deliberately carries no detail.
	#[error("invalid media id")]
	Invalid,
	#[error("encode media reference: {0}")]
	Encode(#[from] serde_json::Error),
}

/// Signs and verifies media tokens and state records with one shared secret.
#[derive(Clone)]
pub struct MediaIdCodec {
	secret: Arc<[u8]>,
}

impl std::fmt::Debug for MediaIdCodec {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MediaIdCodec").finish_non_exhaustive()
	}
}

impl MediaIdCodec {
	pub fn new(secret: &[u8]) -> Self {
		Self {
			secret: Arc::from(secret),
		}
	}

	pub fn encode(&self, media: &MediaRef) -> Result<String, MediaIdError> {
		encode_media_id(&self.secret, media)
	}

	pub fn decode(&self, media_id: &str) -> Result<MediaRef, MediaIdError> {
		decode_media_id(&self.secret, media_id)
	}

	pub fn sign_bytes(&self, payload: &[u8]) -> String {
		sign_bytes(&self.secret, payload)
	}

	pub fn verify_bytes(&self, payload: &[u8], signature: &str) -> bool {
		verify_bytes(&self.secret, payload, signature)
	}
}

/// `base64url(json)` + `_` + `base64url(hmac(base64url(json)))`.
pub fn encode_media_id(secret: &[u8], media: &MediaRef) -> Result<String, MediaIdError> {
	let payload = serde_json::to_vec(media)?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig_b64 = URL_SAFE_NO_PAD.encode(sign(payload_b64.as_bytes(), secret));
	Ok(format!("{payload_b64}{SEPARATOR}{sig_b64}"))
}

/// Verify and decode a token produced by [`encode_media_id`].
///
/// The signature is checked before the payload is parsed.
pub fn decode_media_id(secret: &[u8], media_id: &str) -> Result<MediaRef, MediaIdError> {
	let (payload_b64, sig_b64) = split_token(media_id).ok_or(MediaIdError::Invalid)?;

	if !verify_bytes(secret, payload_b64.as_bytes(), sig_b64) {
		return Err(MediaIdError::Invalid);
	}

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| MediaIdError::Invalid)?;
	let media: MediaRef = serde_json::from_slice(&payload).map_err(|_| MediaIdError::Invalid)?;
	if media.path.is_empty() {
		return Err(MediaIdError::Invalid);
	}

	Ok(media)
}

/// Split at the separator in front of the fixed-width signature.
///
/// base64url payloads may themselves contain `_`, so the first separator
/// is only the boundary when the payload has none.
fn split_token(media_id: &str) -> Option<(&str, &str)> {
	let split = media_id.len().checked_sub(SIGNATURE_LEN + 1)?;
	if !media_id.is_char_boundary(split) {
		return None;
	}
	let (payload, rest) = media_id.split_at(split);
	let signature = rest.strip_prefix(SEPARATOR)?;
	Some((payload, signature))
}

/// base64url HMAC-SHA256 of `payload`.
pub fn sign_bytes(secret: &[u8], payload: &[u8]) -> String {
	URL_SAFE_NO_PAD.encode(sign(payload, secret))
}

pub fn verify_bytes(secret: &[u8], payload: &[u8], signature: &str) -> bool {
	let Ok(provided) = URL_SAFE_NO_PAD.decode(signature) else {
		return false;
	};
	constant_time_eq(&sign(payload, secret), &provided)
}

fn sign(payload: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload);
	mac.finalize().into_bytes().to_vec()
}

/// Byte comparison whose timing does not depend on where the inputs differ.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}
