#![forbid(unsafe_code)]

//! Moves media attachments into storage and rewrites the room's pointer to them.
//!
//! A bridged attachment is replaced in the room by an edit whose `url` points
//! at the media proxy with a signed token. A signed state record keyed by the
//! original event id is what later authorizes deleting the file on redaction.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use ncbridge_domain::{ContentUri, EventId, MessageContent, ParseIdError, REL_REPLACE, RoomEvent, RoomId};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::media_id::{MediaIdCodec, MediaIdError, MediaRef};
use crate::path::{add_counter_suffix, render_path_template, sanitize_path_segment, web_link};
use crate::state::{BridgeRecord, MEDIA_STATE_EVENT_TYPE, MediaStateRecord, StateRecordError};
use crate::storage::{MediaStore, StorageError};
use crate::transport::{ChatTransport, CryptoError, CryptoProvider, SourceCleanup, TransportError};

pub const DEFAULT_COLLISION_LIMIT: u32 = 1000;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
	/// Server name the proxy answers for; rewritten pointers use it.
	pub proxy_server_name: String,
	/// Room id -> storage path template.
	pub room_path_templates: HashMap<String, String>,
	/// Storage web UI base, used for the link appended to rewritten messages.
	pub web_url: Option<String>,
	pub collision_limit: u32,
}

impl LifecycleConfig {
	pub fn template_for(&self, room: &RoomId) -> Option<&str> {
		self.room_path_templates.get(room.as_str()).map(String::as_str)
	}
}

#[derive(Debug, Error)]
pub enum LifecycleError {
	#[error(transparent)]
	Storage(#[from] StorageError),
	#[error(transparent)]
	Transport(#[from] TransportError),
	#[error(transparent)]
	Crypto(#[from] CryptoError),
	#[error(transparent)]
	MediaId(#[from] MediaIdError),
	#[error(transparent)]
	State(#[from] StateRecordError),
	#[error("invalid content uri: {0}")]
	ContentUri(#[from] ParseIdError),
	#[error("template {template:?} rendered an empty path")]
	EmptyPath { template: String },
	#[error("no free file name for {path} after {limit} attempts")]
	NoFreeName { path: String, limit: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
	OwnEvent,
	NoTemplate,
	NotMedia,
	Edit,
	MissingUrl,
	EncryptedWithoutCrypto,
	AlreadyBridged,
}

impl SkipReason {
	pub fn as_str(self) -> &'static str {
		match self {
			SkipReason::OwnEvent => "own_event",
			SkipReason::NoTemplate => "no_template",
			SkipReason::NotMedia => "not_media",
			SkipReason::Edit => "edit",
			SkipReason::MissingUrl => "missing_url",
			SkipReason::EncryptedWithoutCrypto => "encrypted_without_crypto",
			SkipReason::AlreadyBridged => "already_bridged",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgedMedia {
	pub path: String,
	pub file_name: String,
	pub content_uri: ContentUri,
	/// False when an identical file was already at the rendered path.
	pub uploaded: bool,
	pub replacement_event: EventId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaOutcome {
	Skipped(SkipReason),
	Bridged(BridgedMedia),
	/// Stored, but the room still shows the original pointer.
	RewriteFailed { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedactionOutcome {
	NoTarget,
	NoRecord,
	Rejected,
	Deleted { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
	Media(MediaOutcome),
	Redaction(RedactionOutcome),
	Ignored,
}

/// Where a file ends up after dedup and collision checks.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Placement {
	path: String,
	file_name: String,
	upload: bool,
}

struct AcquiredMedia {
	source: ContentUri,
	data: Bytes,
	mime_type: Option<String>,
}

pub struct MediaLifecycle {
	config: LifecycleConfig,
	codec: MediaIdCodec,
	store: Arc<dyn MediaStore>,
	transport: Arc<dyn ChatTransport>,
	crypto: Option<Arc<dyn CryptoProvider>>,
	source_cleanup: Option<Arc<dyn SourceCleanup>>,
}

impl MediaLifecycle {
	pub fn new(
		config: LifecycleConfig,
		codec: MediaIdCodec,
		store: Arc<dyn MediaStore>,
		transport: Arc<dyn ChatTransport>,
	) -> Self {
		Self {
			config,
			codec,
			store,
			transport,
			crypto: None,
			source_cleanup: None,
		}
	}

	/// Decrypts encrypted attachments here and, through [`MediaLifecycle::crypto`],
	/// encrypted events before they reach the lifecycle.
	pub fn with_crypto(mut self, crypto: Arc<dyn CryptoProvider>) -> Self {
		self.crypto = Some(crypto);
		self
	}

	pub fn crypto(&self) -> Option<&Arc<dyn CryptoProvider>> {
		self.crypto.as_ref()
	}

	pub fn with_source_cleanup(mut self, cleanup: Arc<dyn SourceCleanup>) -> Self {
		self.source_cleanup = Some(cleanup);
		self
	}

	pub fn config(&self) -> &LifecycleConfig {
		&self.config
	}

	pub async fn handle_event(&self, event: &RoomEvent) -> Result<EventOutcome, LifecycleError> {
		if event.is_redaction() {
			return self.handle_redaction(event).await.map(EventOutcome::Redaction);
		}
		if event.is_message() {
			let outcome = self.handle_media(event).await?;
			if let MediaOutcome::Skipped(reason) = &outcome {
				debug!(room = %event.room_id, event_id = %event.event_id, reason = reason.as_str(), "media skipped");
				metrics::counter!("ncbridge_media_skipped_total").increment(1);
			}
			return Ok(EventOutcome::Media(outcome));
		}
		Ok(EventOutcome::Ignored)
	}

	pub async fn handle_media(&self, event: &RoomEvent) -> Result<MediaOutcome, LifecycleError> {
		if &event.sender == self.transport.bot_user_id() {
			return Ok(MediaOutcome::Skipped(SkipReason::OwnEvent));
		}
		let Some(template) = self.config.template_for(&event.room_id) else {
			return Ok(MediaOutcome::Skipped(SkipReason::NoTemplate));
		};
		let Some(msg) = event.message_content().filter(MessageContent::is_media) else {
			return Ok(MediaOutcome::Skipped(SkipReason::NotMedia));
		};
		if msg.is_edit() {
			return Ok(MediaOutcome::Skipped(SkipReason::Edit));
		}

		let media = match self.acquire(&msg).await? {
			Ok(media) => media,
			Err(reason) => return Ok(MediaOutcome::Skipped(reason)),
		};

		let file_name = match msg.file_name() {
			"" => {
				let generated = format!("file_{}", Utc::now().timestamp());
				warn!(event_id = %event.event_id, file = %generated, "media has no file name, generated one");
				generated
			}
			name => name.to_string(),
		};

		let room_label = sanitize_path_segment(event.room_id.label());
		let user_label = sanitize_path_segment(event.sender.localpart());
		let file_label = sanitize_path_segment(&file_name);
		let rendered = render_path_template(template, &room_label, &user_label, &file_label, event.timestamp());
		if rendered.is_empty() {
			return Err(LifecycleError::EmptyPath {
				template: template.to_string(),
			});
		}
		debug!(room = %event.room_id, event_id = %event.event_id, path = %rendered, "rendered storage path");

		let placement = self.place(&rendered, &file_name, media.data.len() as u64).await?;
		if placement.upload {
			self.store.upload(&placement.path, media.data.clone()).await?;
		} else {
			metrics::counter!("ncbridge_media_dedup_reused_total").increment(1);
		}

		let token = self.codec.encode(&MediaRef {
			path: placement.path.clone(),
			file_name: placement.file_name.clone(),
			mime_type: media.mime_type.clone(),
		})?;
		let content_uri = ContentUri::new(self.config.proxy_server_name.clone(), token);

		let link = self.config.web_url.as_deref().and_then(|url| web_link(url, &placement.path));
		let content = replacement_content(
			&msg,
			&event.event_id,
			&content_uri,
			&file_name,
			&placement.file_name,
			media.mime_type.as_deref(),
			media.data.len() as u64,
			link.as_deref(),
		);

		let replacement_event = match self.transport.send_message_as(&event.room_id, &event.sender, content).await {
			Ok(id) => id,
			Err(e) => {
				warn!(room = %event.room_id, event_id = %event.event_id, path = %placement.path, error = %e, "failed to rewrite message as sender, leaving original");
				metrics::counter!("ncbridge_media_rewrite_failed_total").increment(1);
				return Ok(MediaOutcome::RewriteFailed { path: placement.path });
			}
		};

		self.store_state_record(&event.room_id, &event.event_id, &placement, &content_uri).await;

		if let Some(cleanup) = &self.source_cleanup
			&& let Err(e) = cleanup.delete_source_media(&media.source).await
		{
			warn!(source = %media.source, error = %e, "failed to delete source media from homeserver");
		}

		info!(
			room = %event.room_id,
			event_id = %event.event_id,
			path = %placement.path,
			uploaded = placement.upload,
			"bridged media"
		);
		metrics::counter!("ncbridge_media_bridged_total").increment(1);

		Ok(MediaOutcome::Bridged(BridgedMedia {
			path: placement.path,
			file_name: placement.file_name,
			content_uri,
			uploaded: placement.upload,
			replacement_event,
		}))
	}

	/// Fetch the attachment bytes, decrypting when needed.
	///
	/// The inner `Err` is a skip, not a failure.
	async fn acquire(&self, msg: &MessageContent) -> Result<Result<AcquiredMedia, SkipReason>, LifecycleError> {
		if let Some(file) = &msg.file {
			let Some(crypto) = &self.crypto else {
				return Ok(Err(SkipReason::EncryptedWithoutCrypto));
			};
			let source = ContentUri::parse(&file.url)?;
			let encrypted = self.transport.download_media(&source).await?;
			let data = crypto.decrypt_attachment(file, encrypted.data).await?;
			debug!(source = %source, bytes = data.len(), "decrypted attachment");
			return Ok(Ok(AcquiredMedia {
				source,
				data,
				mime_type: msg.mime_type().map(str::to_string),
			}));
		}

		let Some(url) = msg.url.as_deref().filter(|u| !u.is_empty()) else {
			return Ok(Err(SkipReason::MissingUrl));
		};
		let source = ContentUri::parse(url)?;

		if source.server_name == self.config.proxy_server_name {
			if self.codec.decode(&source.media_id).is_ok() {
				return Ok(Err(SkipReason::AlreadyBridged));
			}
			debug!(source = %source, "media uses the proxy server name but is not a bridge token");
		}

		let downloaded = self.transport.download_media(&source).await?;
		let mime_type = msg
			.mime_type()
			.map(str::to_string)
			.or(downloaded.content_type.filter(|c| !c.is_empty()));

		Ok(Ok(AcquiredMedia {
			source,
			data: downloaded.data,
			mime_type,
		}))
	}

	/// Reuse an identical file at `rendered`, or find the first free numbered name.
	async fn place(&self, rendered: &str, file_name: &str, content_length: u64) -> Result<Placement, LifecycleError> {
		self.store.ensure_directories(rendered).await?;

		let existing = self.store.stat(rendered).await?;
		if !existing.exists {
			return Ok(Placement {
				path: rendered.to_string(),
				file_name: file_name.to_string(),
				upload: true,
			});
		}

		if content_length > 0 && existing.size == Some(content_length) {
			debug!(path = %rendered, "identical file already stored, reusing");
			return Ok(Placement {
				path: rendered.to_string(),
				file_name: file_name.to_string(),
				upload: false,
			});
		}

		let limit = self.config.collision_limit;
		for counter in 1..=limit {
			let (candidate_path, candidate_name) = add_counter_suffix(rendered, counter);
			if !self.store.stat(&candidate_path).await?.exists {
				debug!(path = %rendered, candidate = %candidate_path, "name taken, using numbered path");
				metrics::counter!("ncbridge_media_collisions_total").increment(1);
				return Ok(Placement {
					path: candidate_path,
					file_name: candidate_name,
					upload: true,
				});
			}
		}

		Err(LifecycleError::NoFreeName {
			path: rendered.to_string(),
			limit,
		})
	}

	async fn store_state_record(&self, room: &RoomId, event_id: &EventId, placement: &Placement, content_uri: &ContentUri) {
		let content = MediaStateRecord::signed(
			&self.codec,
			placement.path.clone(),
			placement.file_name.clone(),
			content_uri.to_string(),
		)
		.map(BridgeRecord::from)
		.and_then(|record| record.to_content());

		let result = match content {
			Ok(content) => self
				.transport
				.put_room_state(room, MEDIA_STATE_EVENT_TYPE, event_id.as_str(), content)
				.await
				.map_err(LifecycleError::from),
			Err(e) => Err(e.into()),
		};

		if let Err(e) = result {
			warn!(room = %room, event_id = %event_id, error = %e, "failed to store media state record");
			metrics::counter!("ncbridge_media_state_write_failed_total").increment(1);
		}
	}

	/// Delete the stored file of a redacted event, if its state record verifies.
	pub async fn handle_redaction(&self, event: &RoomEvent) -> Result<RedactionOutcome, LifecycleError> {
		let Some(target) = event.redaction_target() else {
			debug!(event_id = %event.event_id, "redaction without target");
			return Ok(RedactionOutcome::NoTarget);
		};

		let content = match self
			.transport
			.room_state(&event.room_id, MEDIA_STATE_EVENT_TYPE, target.as_str())
			.await
		{
			Ok(Some(content)) => content,
			Ok(None) => {
				debug!(room = %event.room_id, target = %target, "no media state for redacted event");
				return Ok(RedactionOutcome::NoRecord);
			}
			Err(e) => {
				debug!(room = %event.room_id, target = %target, error = %e, "media state lookup failed");
				return Ok(RedactionOutcome::NoRecord);
			}
		};

		let record = match BridgeRecord::from_content(content) {
			Ok(record) => record.into_media(),
			Err(e) => {
				warn!(room = %event.room_id, target = %target, error = %e, "malformed media state");
				return Ok(RedactionOutcome::Rejected);
			}
		};
		if !record.verify(&self.codec) {
			warn!(room = %event.room_id, target = %target, "media state failed verification");
			metrics::counter!("ncbridge_media_state_rejected_total").increment(1);
			return Ok(RedactionOutcome::Rejected);
		}

		self.store.delete(&record.path).await?;
		info!(room = %event.room_id, target = %target, path = %record.path, "deleted stored media for redacted event");
		metrics::counter!("ncbridge_media_redaction_deleted_total").increment(1);

		Ok(RedactionOutcome::Deleted { path: record.path })
	}
}

/// Edit content pointing the original event at the proxied copy.
#[allow(clippy::too_many_arguments)]
fn replacement_content(
	msg: &MessageContent,
	original: &EventId,
	content_uri: &ContentUri,
	original_name: &str,
	stored_name: &str,
	mime_type: Option<&str>,
	size: u64,
	link: Option<&str>,
) -> Value {
	let mut body = if msg.body == original_name {
		String::new()
	} else {
		msg.body.clone()
	};
	if let Some(link) = link {
		body.push_str("\n\nView in Nextcloud: ");
		body.push_str(link);
	}

	let mut info = msg.info.clone().unwrap_or_default();
	if let Some(mime) = mime_type {
		info.mimetype = Some(mime.to_string());
	}
	if size > 0 {
		info.size = Some(size);
	}

	let url = content_uri.to_string();
	json!({
		"msgtype": msg.msgtype,
		"body": format!("* {body}"),
		"filename": stored_name,
		"url": url,
		"info": info,
		"m.new_content": {
			"msgtype": msg.msgtype,
			"body": body,
			"filename": stored_name,
			"url": url,
			"info": info,
		},
		"m.relates_to": {
			"rel_type": REL_REPLACE,
			"event_id": original,
		},
	})
}
