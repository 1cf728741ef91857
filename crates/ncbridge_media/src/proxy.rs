#![forbid(unsafe_code)]

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;
use tracing::debug;

use crate::media_id::{MediaIdCodec, MediaRef};
use crate::storage::{MediaStore, StorageError};

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum ProxyError {
	/// Malformed, foreign or tampered id. Kept apart from storage misses.
	#[error("invalid media id")]
	InvalidMediaId,
	#[error(transparent)]
	Storage(#[from] StorageError),
}

pub struct ProxiedMedia {
	pub reference: MediaRef,
	pub content_type: String,
	pub content_length: Option<u64>,
	pub body: BoxStream<'static, Result<Bytes, StorageError>>,
}

/// Resolves proxy media ids to a stream from storage.
#[derive(Clone)]
pub struct MediaProxyResolver {
	codec: MediaIdCodec,
	store: Arc<dyn MediaStore>,
}

impl MediaProxyResolver {
	pub fn new(codec: MediaIdCodec, store: Arc<dyn MediaStore>) -> Self {
		Self { codec, store }
	}

	pub async fn resolve(&self, media_id: &str) -> Result<ProxiedMedia, ProxyError> {
		let reference = self.codec.decode(media_id).map_err(|_| ProxyError::InvalidMediaId)?;
		debug!(path = %reference.path, "media proxy download");

		let stored = self.store.download(&reference.path).await?;
		let content_type = reference
			.mime_type()
			.map(str::to_string)
			.or(stored.content_type)
			.unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string());

		Ok(ProxiedMedia {
			reference,
			content_type,
			content_length: stored.content_length,
			body: stored.body,
		})
	}
}
