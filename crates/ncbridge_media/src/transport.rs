#![forbid(unsafe_code)]

//! Collaborators the media lifecycle talks to: the chat transport, the
//! optional end-to-end encryption layer and the optional source-media cleaner.

use async_trait::async_trait;
use bytes::Bytes;
use ncbridge_domain::{ContentUri, EncryptedFile, EventId, RoomEvent, RoomId, UserId};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
	#[error("transport request failed: {0}")]
	Http(#[from] reqwest::Error),
	#[error("transport returned status {status}: {message}")]
	Status {
		status: u16,
		errcode: Option<String>,
		message: String,
	},
	#[error("transport response could not be decoded: {0}")]
	Decode(String),
}

impl TransportError {
	/// Matrix `errcode` of an error response, if any.
	pub fn errcode(&self) -> Option<&str> {
		match self {
			TransportError::Status { errcode, .. } => errcode.as_deref(),
			_ => None,
		}
	}

	pub fn status(&self) -> Option<u16> {
		match self {
			TransportError::Status { status, .. } => Some(*status),
			_ => None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct DownloadedMedia {
	pub content_type: Option<String>,
	pub data: Bytes,
}

/// Room operations the bridge performs through the homeserver.
#[async_trait]
pub trait ChatTransport: Send + Sync {
	/// Identity the bridge acts as; its own events are ignored.
	fn bot_user_id(&self) -> &UserId;

	async fn download_media(&self, uri: &ContentUri) -> Result<DownloadedMedia, TransportError>;

	/// Send an `m.room.message` on behalf of `sender`.
	async fn send_message_as(&self, room: &RoomId, sender: &UserId, content: Value) -> Result<EventId, TransportError>;

	async fn put_room_state(
		&self,
		room: &RoomId,
		event_type: &str,
		state_key: &str,
		content: Value,
	) -> Result<(), TransportError>;

	/// `Ok(None)` when no such state exists.
	async fn room_state(&self, room: &RoomId, event_type: &str, state_key: &str) -> Result<Option<Value>, TransportError>;

	async fn join_room(&self, room: &RoomId) -> Result<(), TransportError>;

	async fn joined_rooms(&self) -> Result<Vec<RoomId>, TransportError>;
}

#[derive(Debug, Error)]
pub enum CryptoError {
	#[error("no session available: {0}")]
	NoSession(String),
	#[error("decryption failed: {0}")]
	Failed(String),
}

/// End-to-end encryption. Optional; without one encrypted media is skipped.
#[async_trait]
pub trait CryptoProvider: Send + Sync {
	/// Turn an `m.room.encrypted` event into its cleartext form.
	async fn decrypt_event(&self, event: &RoomEvent) -> Result<RoomEvent, CryptoError>;

	async fn decrypt_attachment(&self, file: &EncryptedFile, ciphertext: Bytes) -> Result<Bytes, CryptoError>;
}

/// Removes the homeserver's copy of media after it has been bridged.
#[async_trait]
pub trait SourceCleanup: Send + Sync {
	async fn delete_source_media(&self, uri: &ContentUri) -> Result<(), TransportError>;
}
