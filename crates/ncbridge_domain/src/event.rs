#![forbid(unsafe_code)]

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{EventId, RoomId, UserId};

pub const EVENT_MESSAGE: &str = "m.room.message";
pub const EVENT_REDACTION: &str = "m.room.redaction";
pub const EVENT_ENCRYPTED: &str = "m.room.encrypted";
pub const EVENT_MEMBER: &str = "m.room.member";

/// Relation type marking an event as an edit of another.
pub const REL_REPLACE: &str = "m.replace";

const MEDIA_MSGTYPES: [&str; 4] = ["m.image", "m.file", "m.audio", "m.video"];

/// A room event as delivered by the homeserver.
///
/// Content is kept raw; typed views are produced on demand so unknown
/// event types pass through without a parse failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomEvent {
	#[serde(rename = "type")]
	pub kind: String,
	pub event_id: EventId,
	pub room_id: RoomId,
	pub sender: UserId,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub origin_server_ts: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub state_key: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub redacts: Option<EventId>,
	#[serde(default)]
	pub content: Value,
}

impl RoomEvent {
	pub fn is_message(&self) -> bool {
		self.kind == EVENT_MESSAGE
	}

	pub fn is_redaction(&self) -> bool {
		self.kind == EVENT_REDACTION
	}

	pub fn is_encrypted(&self) -> bool {
		self.kind == EVENT_ENCRYPTED
	}

	/// Typed message content, if the content parses as one.
	pub fn message_content(&self) -> Option<MessageContent> {
		if !self.is_message() {
			return None;
		}
		serde_json::from_value(self.content.clone()).ok()
	}

	/// Target of a redaction. Newer room versions carry it in the content.
	pub fn redaction_target(&self) -> Option<EventId> {
		let from_content = self
			.content
			.get("redacts")
			.and_then(Value::as_str)
			.and_then(|s| EventId::new(s).ok());
		from_content.or_else(|| self.redacts.clone())
	}

	/// Membership state for `m.room.member` events.
	pub fn membership(&self) -> Option<&str> {
		if self.kind != EVENT_MEMBER {
			return None;
		}
		self.content.get("membership").and_then(Value::as_str)
	}

	pub fn timestamp(&self) -> Option<DateTime<Utc>> {
		self.origin_server_ts
			.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
	}
}

/// `m.room.message` content, limited to the fields media handling touches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
	#[serde(default)]
	pub msgtype: String,
	#[serde(default)]
	pub body: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub filename: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub url: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub file: Option<EncryptedFile>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub info: Option<FileInfo>,
	#[serde(rename = "m.relates_to", default, skip_serializing_if = "Option::is_none")]
	pub relates_to: Option<RelatesTo>,
}

impl MessageContent {
	pub fn is_media(&self) -> bool {
		MEDIA_MSGTYPES.contains(&self.msgtype.as_str())
	}

	pub fn is_edit(&self) -> bool {
		self.relates_to
			.as_ref()
			.and_then(|r| r.rel_type.as_deref())
			.is_some_and(|t| t == REL_REPLACE)
	}

	/// `filename` when set, otherwise the body.
	pub fn file_name(&self) -> &str {
		match self.filename.as_deref() {
			Some(name) if !name.is_empty() => name,
			_ => &self.body,
		}
	}

	pub fn mime_type(&self) -> Option<&str> {
		self.info
			.as_ref()
			.and_then(|i| i.mimetype.as_deref())
			.filter(|m| !m.is_empty())
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub mimetype: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub size: Option<u64>,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

/// Encrypted attachment descriptor. Key material stays opaque in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedFile {
	pub url: String,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelatesTo {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rel_type: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub event_id: Option<EventId>,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}
