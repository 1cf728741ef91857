#![forbid(unsafe_code)]

pub mod event;

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use event::{
	EVENT_ENCRYPTED, EVENT_MEMBER, EVENT_MESSAGE, EVENT_REDACTION, EncryptedFile, FileInfo, MessageContent, REL_REPLACE,
	RelatesTo, RoomEvent,
};

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Matrix room identifier (`!opaque:server`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
	/// Create a non-empty `RoomId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Room id without the `!` sigil, used as the unsanitized room label.
	pub fn label(&self) -> &str {
		self.0.strip_prefix('!').unwrap_or(&self.0)
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.trim().to_string())
	}
}

/// Matrix user identifier (`@localpart:server`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	/// Build `@localpart:server`.
	pub fn from_parts(localpart: &str, server_name: &str) -> Result<Self, ParseIdError> {
		if localpart.trim().is_empty() || server_name.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(format!("@{}:{}", localpart.trim(), server_name.trim())))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Part before the server separator, without the `@` sigil.
	pub fn localpart(&self) -> &str {
		let trimmed = self.0.trim();
		let trimmed = trimmed.strip_prefix('@').unwrap_or(trimmed);
		match trimmed.split_once(':') {
			Some((local, _)) if !local.is_empty() => local,
			_ => trimmed,
		}
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Matrix event identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
	/// Create a non-empty `EventId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for EventId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// `mxc://server/media_id` content pointer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentUri {
	pub server_name: String,
	pub media_id: String,
}

impl ContentUri {
	pub const SCHEME: &'static str = "mxc://";

	pub fn new(server_name: impl Into<String>, media_id: impl Into<String>) -> Self {
		Self {
			server_name: server_name.into(),
			media_id: media_id.into(),
		}
	}

	/// Parse an `mxc://server/media_id` string.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let rest = s
			.strip_prefix(Self::SCHEME)
			.ok_or_else(|| ParseIdError::InvalidFormat(format!("expected mxc://server/media_id: {s}")))?;

		let (server_name, media_id) = rest
			.split_once('/')
			.ok_or_else(|| ParseIdError::InvalidFormat(format!("missing media id: {s}")))?;

		if server_name.is_empty() || media_id.is_empty() || media_id.contains('/') {
			return Err(ParseIdError::InvalidFormat(format!("expected mxc://server/media_id: {s}")));
		}

		Ok(Self::new(server_name, media_id))
	}
}

impl fmt::Display for ContentUri {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}{}/{}", Self::SCHEME, self.server_name, self.media_id)
	}
}

impl FromStr for ContentUri {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ContentUri::parse(s)
	}
}

/// Wrapper that redacts in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn as_bytes(&self) -> &[u8] {
		self.0.as_bytes()
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl<'de> Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn user_localpart_strips_sigil_and_server() {
		assert_eq!(UserId::new("@alice:example.com").unwrap().localpart(), "alice");
		assert_eq!(UserId::new("  @bob:example.com ").unwrap().localpart(), "bob");
		assert_eq!(UserId::new("carol").unwrap().localpart(), "carol");
		assert_eq!(UserId::new("@:example.com").unwrap().localpart(), ":example.com");
	}

	#[test]
	fn room_label_drops_sigil() {
		let room = RoomId::new("!abc:example.com").unwrap();
		assert_eq!(room.label(), "abc:example.com");
	}

	#[test]
	fn content_uri_parse_roundtrip() {
		let uri = ContentUri::parse("mxc://example.com/abc123").unwrap();
		assert_eq!(uri.server_name, "example.com");
		assert_eq!(uri.media_id, "abc123");
		assert_eq!(uri.to_string(), "mxc://example.com/abc123");
	}

	#[test]
	fn content_uri_rejects_malformed() {
		assert!(ContentUri::parse("").is_err());
		assert!(ContentUri::parse("https://example.com/abc").is_err());
		assert!(ContentUri::parse("mxc://example.com").is_err());
		assert!(ContentUri::parse("mxc:///abc").is_err());
		assert!(ContentUri::parse("mxc://example.com/a/b").is_err());
	}

	#[test]
	fn secret_string_redacts() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s}"), "<redacted>");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
		assert_eq!(s.expose(), "hunter2");
	}

	#[test]
	fn rejects_empty_ids() {
		assert!(RoomId::new("").is_err());
		assert!(EventId::new("   ").is_err());
		assert!(UserId::from_parts("", "example.com").is_err());
	}
}
