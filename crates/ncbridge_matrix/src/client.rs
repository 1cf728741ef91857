#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use ncbridge_domain::{ContentUri, EventId, RoomId, SecretString, UserId};
use ncbridge_media::{ChatTransport, DownloadedMedia, TransportError};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

const USER_IN_USE: &str = "M_USER_IN_USE";

/// Client-server API access as the application service.
///
/// Every request carries the appservice token. Requests on behalf of a
/// bridged user add the `user_id` query parameter.
#[derive(Debug, Clone)]
pub struct AppserviceClient {
	homeserver_url: String,
	as_token: SecretString,
	bot: UserId,
	client: reqwest::Client,
}

impl AppserviceClient {
	pub fn new(
		homeserver_url: impl Into<String>,
		as_token: SecretString,
		bot: UserId,
		request_timeout: Duration,
	) -> Result<Self, TransportError> {
		let client = reqwest::Client::builder().timeout(request_timeout).build()?;
		Ok(Self {
			homeserver_url: homeserver_url.into(),
			as_token,
			bot,
			client,
		})
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.homeserver_url.trim_end_matches('/'), path)
	}

	fn auth_header(&self) -> String {
		format!("Bearer {}", self.as_token.expose().trim())
	}

	fn state_path(room: &RoomId, event_type: &str, state_key: &str) -> String {
		format!(
			"/_matrix/client/v3/rooms/{}/state/{}/{}",
			urlencoding::encode(room.as_str()),
			urlencoding::encode(event_type),
			urlencoding::encode(state_key)
		)
	}

	/// Register the bot user in the appservice namespace. An existing user is fine.
	pub async fn ensure_registered(&self) -> Result<(), TransportError> {
		let body = json!({
			"type": "m.login.application_service",
			"username": self.bot.localpart(),
			"inhibit_login": true,
		});
		let resp = self
			.client
			.post(self.url("/_matrix/client/v3/register"))
			.header("Authorization", self.auth_header())
			.json(&body)
			.send()
			.await?;

		match check(resp).await {
			Ok(_) => {
				info!(user = %self.bot, "registered bridge bot");
				Ok(())
			}
			Err(e) if e.errcode() == Some(USER_IN_USE) => {
				debug!(user = %self.bot, "bridge bot already registered");
				Ok(())
			}
			Err(e) => Err(e),
		}
	}
}

#[derive(Debug, Deserialize)]
struct MatrixErrorBody {
	#[serde(default)]
	errcode: Option<String>,
	#[serde(default)]
	error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
	event_id: EventId,
}

#[derive(Debug, Deserialize)]
struct JoinedRoomsResponse {
	#[serde(default)]
	joined_rooms: Vec<RoomId>,
}

/// Pass successful responses through; turn error responses into
/// [`TransportError::Status`] carrying the Matrix `errcode`.
async fn check(resp: reqwest::Response) -> Result<reqwest::Response, TransportError> {
	let status = resp.status();
	if status.is_success() {
		return Ok(resp);
	}
	let body = resp.bytes().await.unwrap_or_default();
	let (errcode, message) = match serde_json::from_slice::<MatrixErrorBody>(&body) {
		Ok(err) => (err.errcode, err.error.unwrap_or_default()),
		Err(_) => (None, String::from_utf8_lossy(&body).into_owned()),
	};
	Err(TransportError::Status {
		status: status.as_u16(),
		errcode,
		message,
	})
}

#[async_trait]
impl ChatTransport for AppserviceClient {
	fn bot_user_id(&self) -> &UserId {
		&self.bot
	}

	async fn download_media(&self, uri: &ContentUri) -> Result<DownloadedMedia, TransportError> {
		let url = self.url(&format!(
			"/_matrix/client/v1/media/download/{}/{}",
			urlencoding::encode(&uri.server_name),
			urlencoding::encode(&uri.media_id)
		));
		let resp = self
			.client
			.get(url)
			.header("Authorization", self.auth_header())
			.send()
			.await?;
		let resp = check(resp).await?;

		let content_type = resp
			.headers()
			.get(reqwest::header::CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string);
		let data = resp.bytes().await?;
		debug!(%uri, len = data.len(), "downloaded source media");
		Ok(DownloadedMedia { content_type, data })
	}

	async fn send_message_as(&self, room: &RoomId, sender: &UserId, content: Value) -> Result<EventId, TransportError> {
		let url = self.url(&format!(
			"/_matrix/client/v3/rooms/{}/send/m.room.message/{}?user_id={}",
			urlencoding::encode(room.as_str()),
			uuid::Uuid::new_v4(),
			urlencoding::encode(sender.as_str())
		));
		let resp = self
			.client
			.put(url)
			.header("Authorization", self.auth_header())
			.json(&content)
			.send()
			.await?;
		let body: SendResponse = check(resp)
			.await?
			.json()
			.await
			.map_err(|e| TransportError::Decode(e.to_string()))?;
		Ok(body.event_id)
	}

	async fn put_room_state(
		&self,
		room: &RoomId,
		event_type: &str,
		state_key: &str,
		content: Value,
	) -> Result<(), TransportError> {
		let resp = self
			.client
			.put(self.url(&Self::state_path(room, event_type, state_key)))
			.header("Authorization", self.auth_header())
			.json(&content)
			.send()
			.await?;
		check(resp).await?;
		Ok(())
	}

	async fn room_state(&self, room: &RoomId, event_type: &str, state_key: &str) -> Result<Option<Value>, TransportError> {
		let resp = self
			.client
			.get(self.url(&Self::state_path(room, event_type, state_key)))
			.header("Authorization", self.auth_header())
			.send()
			.await?;
		if resp.status() == StatusCode::NOT_FOUND {
			return Ok(None);
		}
		let value = check(resp)
			.await?
			.json()
			.await
			.map_err(|e| TransportError::Decode(e.to_string()))?;
		Ok(Some(value))
	}

	async fn join_room(&self, room: &RoomId) -> Result<(), TransportError> {
		let url = self.url(&format!("/_matrix/client/v3/join/{}", urlencoding::encode(room.as_str())));
		let resp = self
			.client
			.post(url)
			.header("Authorization", self.auth_header())
			.json(&json!({}))
			.send()
			.await?;
		check(resp).await?;
		Ok(())
	}

	async fn joined_rooms(&self) -> Result<Vec<RoomId>, TransportError> {
		let resp = self
			.client
			.get(self.url("/_matrix/client/v3/joined_rooms"))
			.header("Authorization", self.auth_header())
			.send()
			.await?;
		let body: JoinedRoomsResponse = check(resp)
			.await?
			.json()
			.await
			.map_err(|e| TransportError::Decode(e.to_string()))?;
		Ok(body.joined_rooms)
	}
}
