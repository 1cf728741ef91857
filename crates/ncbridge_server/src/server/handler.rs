#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use ncbridge_domain::{EVENT_MEMBER, RoomEvent};
use ncbridge_media::{EventHandler, MediaLifecycle};
use tracing::{debug, warn};

use crate::server::room_manager::RoomManager;

/// Routes dispatcher events: invites to the room manager, everything else
/// (decrypted with the lifecycle's crypto provider when possible) to the media lifecycle.
pub struct BridgeEventHandler {
	lifecycle: Arc<MediaLifecycle>,
	rooms: Arc<RoomManager>,
	bot: String,
}

impl BridgeEventHandler {
	pub fn new(lifecycle: Arc<MediaLifecycle>, rooms: Arc<RoomManager>, bot: impl Into<String>) -> Self {
		Self {
			lifecycle,
			rooms,
			bot: bot.into(),
		}
	}

	fn is_bot_invite(&self, event: &RoomEvent) -> bool {
		event.kind == EVENT_MEMBER
			&& event.state_key.as_deref() == Some(self.bot.as_str())
			&& event.membership() == Some("invite")
	}

	/// Cleartext form of `event`, or `None` when it has to be dropped.
	async fn decrypted(&self, event: RoomEvent) -> Option<RoomEvent> {
		if !event.is_encrypted() {
			return Some(event);
		}
		let Some(crypto) = self.lifecycle.crypto() else {
			debug!(room = %event.room_id, event_id = %event.event_id, "dropping encrypted event; no crypto provider");
			metrics::counter!("ncbridge_encrypted_events_dropped_total").increment(1);
			return None;
		};
		match crypto.decrypt_event(&event).await {
			Ok(clear) => Some(clear),
			Err(e) => {
				warn!(room = %event.room_id, event_id = %event.event_id, error = %e, "event decryption failed");
				metrics::counter!("ncbridge_decryption_failures_total").increment(1);
				None
			}
		}
	}
}

#[async_trait]
impl EventHandler for BridgeEventHandler {
	async fn handle(&self, event: RoomEvent) -> anyhow::Result<()> {
		if self.is_bot_invite(&event) {
			self.rooms.handle_invite(&event.room_id).await;
			return Ok(());
		}

		let Some(event) = self.decrypted(event).await else {
			return Ok(());
		};

		let outcome = self.lifecycle.handle_event(&event).await?;
		debug!(room = %event.room_id, event_id = %event.event_id, ?outcome, "event processed");
		Ok(())
	}
}
