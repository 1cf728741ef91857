#![forbid(unsafe_code)]

//! In-memory fakes of the storage and transport collaborators.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use ncbridge_domain::{ContentUri, EncryptedFile, EventId, RoomEvent, RoomId, UserId};
use parking_lot::Mutex;
use serde_json::Value;

use crate::storage::{MediaStore, StatResult, StorageError, StoredMedia};
use crate::transport::{ChatTransport, CryptoError, CryptoProvider, DownloadedMedia, SourceCleanup, TransportError};

#[derive(Default)]
pub struct MemoryStore {
	pub files: Mutex<BTreeMap<String, Bytes>>,
	pub directories: Mutex<Vec<String>>,
	pub uploads: AtomicUsize,
	pub deletes: AtomicUsize,
	pub stats: AtomicUsize,
	pub fail_stat: AtomicBool,
	/// Content type reported by `download`.
	pub served_type: Option<&'static str>,
}

impl MemoryStore {
	pub fn with_file(self, path: &str, content: &'static [u8]) -> Self {
		self.files.lock().insert(path.to_string(), Bytes::from_static(content));
		self
	}

	pub fn with_served_type(mut self, content_type: &'static str) -> Self {
		self.served_type = Some(content_type);
		self
	}

	pub fn file(&self, path: &str) -> Option<Bytes> {
		self.files.lock().get(path).cloned()
	}

	pub fn paths(&self) -> Vec<String> {
		self.files.lock().keys().cloned().collect()
	}

	pub fn total_calls(&self) -> usize {
		self.uploads.load(Ordering::SeqCst) + self.deletes.load(Ordering::SeqCst) + self.stats.load(Ordering::SeqCst)
	}
}

fn failure(op: &'static str, path: &str) -> StorageError {
	StorageError::UnexpectedStatus {
		op,
		path: path.to_string(),
		status: 500,
	}
}

#[async_trait]
impl MediaStore for MemoryStore {
	async fn ensure_directories(&self, path: &str) -> Result<(), StorageError> {
		for dir in crate::storage::parent_directories(path) {
			let mut dirs = self.directories.lock();
			if !dirs.contains(&dir) {
				dirs.push(dir);
			}
		}
		Ok(())
	}

	async fn stat(&self, path: &str) -> Result<StatResult, StorageError> {
		self.stats.fetch_add(1, Ordering::SeqCst);
		if self.fail_stat.load(Ordering::SeqCst) {
			return Err(failure("HEAD", path));
		}
		Ok(match self.files.lock().get(path) {
			Some(content) => StatResult {
				exists: true,
				size: Some(content.len() as u64),
			},
			None => StatResult::ABSENT,
		})
	}

	async fn upload(&self, path: &str, content: Bytes) -> Result<(), StorageError> {
		self.uploads.fetch_add(1, Ordering::SeqCst);
		self.files.lock().insert(path.to_string(), content);
		Ok(())
	}

	async fn download(&self, path: &str) -> Result<StoredMedia, StorageError> {
		let Some(content) = self.file(path) else {
			return Err(StorageError::UnexpectedStatus {
				op: "GET",
				path: path.to_string(),
				status: 404,
			});
		};
		let len = content.len() as u64;
		Ok(StoredMedia {
			content_type: self.served_type.map(str::to_string),
			content_length: Some(len),
			body: futures::stream::iter([Ok(content)]).boxed(),
		})
	}

	async fn delete(&self, path: &str) -> Result<(), StorageError> {
		self.deletes.fetch_add(1, Ordering::SeqCst);
		self.files.lock().remove(path);
		Ok(())
	}
}

pub struct SentMessage {
	pub room: RoomId,
	pub sender: UserId,
	pub content: Value,
}

pub struct FakeTransport {
	pub bot: UserId,
	pub media: Mutex<HashMap<String, DownloadedMedia>>,
	pub sent: Mutex<Vec<SentMessage>>,
	pub state: Mutex<HashMap<(String, String, String), Value>>,
	pub joined: Mutex<Vec<RoomId>>,
	pub fail_send: AtomicBool,
	pub fail_state_read: AtomicBool,
}

impl FakeTransport {
	pub fn new() -> Self {
		Self {
			bot: UserId::new("@nextcloudbot:example.com").expect("valid user id"),
			media: Mutex::new(HashMap::new()),
			sent: Mutex::new(Vec::new()),
			state: Mutex::new(HashMap::new()),
			joined: Mutex::new(Vec::new()),
			fail_send: AtomicBool::new(false),
			fail_state_read: AtomicBool::new(false),
		}
	}

	pub fn with_media(self, uri: &str, content_type: Option<&str>, data: &'static [u8]) -> Self {
		self.media.lock().insert(
			uri.to_string(),
			DownloadedMedia {
				content_type: content_type.map(str::to_string),
				data: Bytes::from_static(data),
			},
		);
		self
	}

	pub fn state_for(&self, room: &str, event_type: &str, state_key: &str) -> Option<Value> {
		self.state
			.lock()
			.get(&(room.to_string(), event_type.to_string(), state_key.to_string()))
			.cloned()
	}

	pub fn set_state(&self, room: &str, event_type: &str, state_key: &str, content: Value) {
		self.state
			.lock()
			.insert((room.to_string(), event_type.to_string(), state_key.to_string()), content);
	}
}

fn status(status: u16, errcode: &str) -> TransportError {
	TransportError::Status {
		status,
		errcode: Some(errcode.to_string()),
		message: "fake".to_string(),
	}
}

#[async_trait]
impl ChatTransport for FakeTransport {
	fn bot_user_id(&self) -> &UserId {
		&self.bot
	}

	async fn download_media(&self, uri: &ContentUri) -> Result<DownloadedMedia, TransportError> {
		self.media
			.lock()
			.get(&uri.to_string())
			.cloned()
			.ok_or_else(|| status(404, "M_NOT_FOUND"))
	}

	async fn send_message_as(&self, room: &RoomId, sender: &UserId, content: Value) -> Result<EventId, TransportError> {
		if self.fail_send.load(Ordering::SeqCst) {
			return Err(status(403, "M_FORBIDDEN"));
		}
		let mut sent = self.sent.lock();
		sent.push(SentMessage {
			room: room.clone(),
			sender: sender.clone(),
			content,
		});
		Ok(EventId::new(format!("$replacement{}", sent.len())).expect("valid event id"))
	}

	async fn put_room_state(
		&self,
		room: &RoomId,
		event_type: &str,
		state_key: &str,
		content: Value,
	) -> Result<(), TransportError> {
		self.set_state(room.as_str(), event_type, state_key, content);
		Ok(())
	}

	async fn room_state(&self, room: &RoomId, event_type: &str, state_key: &str) -> Result<Option<Value>, TransportError> {
		if self.fail_state_read.load(Ordering::SeqCst) {
			return Err(status(500, "M_UNKNOWN"));
		}
		Ok(self.state_for(room.as_str(), event_type, state_key))
	}

	async fn join_room(&self, room: &RoomId) -> Result<(), TransportError> {
		let mut joined = self.joined.lock();
		if !joined.contains(room) {
			joined.push(room.clone());
		}
		Ok(())
	}

	async fn joined_rooms(&self) -> Result<Vec<RoomId>, TransportError> {
		Ok(self.joined.lock().clone())
	}
}

/// Reverses the ciphertext; encrypted events carry their cleartext under `content.cleartext`.
#[derive(Default)]
pub struct ReversingCrypto {
	pub attachments: AtomicUsize,
}

#[async_trait]
impl CryptoProvider for ReversingCrypto {
	async fn decrypt_event(&self, event: &RoomEvent) -> Result<RoomEvent, CryptoError> {
		let cleartext = event
			.content
			.get("cleartext")
			.cloned()
			.ok_or_else(|| CryptoError::NoSession("no cleartext".to_string()))?;
		let mut decrypted = event.clone();
		decrypted.kind = cleartext
			.get("type")
			.and_then(Value::as_str)
			.unwrap_or_default()
			.to_string();
		decrypted.content = cleartext.get("content").cloned().unwrap_or(Value::Null);
		Ok(decrypted)
	}

	async fn decrypt_attachment(&self, _file: &EncryptedFile, ciphertext: Bytes) -> Result<Bytes, CryptoError> {
		self.attachments.fetch_add(1, Ordering::SeqCst);
		let mut data = ciphertext.to_vec();
		data.reverse();
		Ok(Bytes::from(data))
	}
}

#[derive(Default)]
pub struct RecordingCleanup {
	pub deleted: Mutex<Vec<String>>,
	pub fail: AtomicBool,
}

#[async_trait]
impl SourceCleanup for RecordingCleanup {
	async fn delete_source_media(&self, uri: &ContentUri) -> Result<(), TransportError> {
		self.deleted.lock().push(uri.to_string());
		if self.fail.load(Ordering::SeqCst) {
			return Err(status(500, "M_UNKNOWN"));
		}
		Ok(())
	}
}
