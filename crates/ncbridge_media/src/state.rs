#![forbid(unsafe_code)]

//! Room state written by the bridge.
//!
//! Records are stored as room state keyed by the original event id. The set
//! of record kinds is closed; the `kind` tag selects the variant.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::media_id::MediaIdCodec;

pub const MEDIA_STATE_EVENT_TYPE: &str = "com.nextcloud-media-bridge.media";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeRecord {
	Media(MediaStateRecord),
}

#[derive(Debug, Error)]
pub enum StateRecordError {
	#[error("malformed state record: {0}")]
	Malformed(#[from] serde_json::Error),
}

impl BridgeRecord {
	pub fn event_type(&self) -> &'static str {
		match self {
			BridgeRecord::Media(_) => MEDIA_STATE_EVENT_TYPE,
		}
	}

	pub fn to_content(&self) -> Result<Value, StateRecordError> {
		Ok(serde_json::to_value(self)?)
	}

	pub fn from_content(content: Value) -> Result<Self, StateRecordError> {
		Ok(serde_json::from_value(content)?)
	}

	pub fn into_media(self) -> MediaStateRecord {
		match self {
			BridgeRecord::Media(record) => record,
		}
	}
}

/// Authorizes deletion of a bridged file on redaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStateRecord {
	pub path: String,
	#[serde(default)]
	pub filename: String,
	#[serde(default)]
	pub mxc: String,
	#[serde(default)]
	pub signature: String,
}

/// Fields covered by the record signature, in a fixed order.
#[derive(Serialize)]
struct SignedFields<'a> {
	path: &'a str,
	filename: &'a str,
	mxc: &'a str,
}

impl MediaStateRecord {
	pub fn signed(
		codec: &MediaIdCodec,
		path: impl Into<String>,
		filename: impl Into<String>,
		mxc: impl Into<String>,
	) -> Result<Self, StateRecordError> {
		let mut record = Self {
			path: path.into(),
			filename: filename.into(),
			mxc: mxc.into(),
			signature: String::new(),
		};
		record.signature = codec.sign_bytes(&record.canonical_payload()?);
		Ok(record)
	}

	/// True only for a non-empty path with a signature that verifies.
	pub fn verify(&self, codec: &MediaIdCodec) -> bool {
		if self.path.is_empty() || self.signature.is_empty() {
			return false;
		}
		match self.canonical_payload() {
			Ok(payload) => codec.verify_bytes(&payload, &self.signature),
			Err(_) => false,
		}
	}

	fn canonical_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
		serde_json::to_vec(&SignedFields {
			path: &self.path,
			filename: &self.filename,
			mxc: &self.mxc,
		})
	}
}

impl From<MediaStateRecord> for BridgeRecord {
	fn from(record: MediaStateRecord) -> Self {
		BridgeRecord::Media(record)
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn codec() -> MediaIdCodec {
		MediaIdCodec::new(b"state-secret")
	}

	#[test]
	fn signed_record_verifies() {
		let record = MediaStateRecord::signed(&codec(), "media/a.jpg", "a.jpg", "mxc://proxy/x").unwrap();
		assert!(record.verify(&codec()));
		assert!(!record.verify(&MediaIdCodec::new(b"other")));
	}

	#[test]
	fn any_field_change_breaks_signature() {
		let record = MediaStateRecord::signed(&codec(), "media/a.jpg", "a.jpg", "mxc://proxy/x").unwrap();

		let mut tampered = record.clone();
		tampered.path = "media/b.jpg".into();
		assert!(!tampered.verify(&codec()));

		let mut tampered = record.clone();
		tampered.filename = "b.jpg".into();
		assert!(!tampered.verify(&codec()));

		let mut tampered = record;
		tampered.mxc = "mxc://proxy/y".into();
		assert!(!tampered.verify(&codec()));
	}

	#[test]
	fn content_is_tagged() {
		let record = MediaStateRecord::signed(&codec(), "p", "f", "m").unwrap();
		let content = BridgeRecord::from(record.clone()).to_content().unwrap();
		assert_eq!(content["kind"], json!("media"));
		assert_eq!(content["path"], json!("p"));

		let parsed = BridgeRecord::from_content(content).unwrap();
		assert_eq!(parsed.event_type(), MEDIA_STATE_EVENT_TYPE);
		assert_eq!(parsed.into_media(), record);
	}

	#[test]
	fn untagged_or_unknown_content_is_rejected() {
		assert!(BridgeRecord::from_content(json!({ "path": "p", "signature": "s" })).is_err());
		assert!(BridgeRecord::from_content(json!({ "kind": "other", "path": "p" })).is_err());
		assert!(BridgeRecord::from_content(json!("nope")).is_err());
	}

	#[test]
	fn empty_path_never_verifies() {
		let record = MediaStateRecord::signed(&codec(), "", "f", "m").unwrap();
		assert!(!record.verify(&codec()));
	}
}
