#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use ncbridge_domain::RoomId;
use ncbridge_media::{ChatTransport, TransportError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RoomManagerConfig {
	/// Delay before the first join pass, giving the homeserver time to register the bot.
	pub initial_join_delay: Duration,
	pub monitor_interval: Duration,
}

impl Default for RoomManagerConfig {
	fn default() -> Self {
		Self {
			initial_join_delay: Duration::from_secs(2),
			monitor_interval: Duration::from_secs(300),
		}
	}
}

/// Keeps the bridge bot in every room that has a path template.
pub struct RoomManager {
	transport: Arc<dyn ChatTransport>,
	rooms: Vec<RoomId>,
}

fn needs_invite(e: &TransportError) -> bool {
	matches!(e.errcode(), Some("M_FORBIDDEN") | Some("M_NOT_FOUND"))
}

impl RoomManager {
	pub fn new(transport: Arc<dyn ChatTransport>, rooms: Vec<RoomId>) -> Self {
		Self { transport, rooms }
	}

	pub fn configured_rooms(&self) -> &[RoomId] {
		&self.rooms
	}

	async fn join(&self, room: &RoomId) -> bool {
		match self.transport.join_room(room).await {
			Ok(()) => {
				info!(%room, "joined room");
				metrics::counter!("ncbridge_room_joins_total").increment(1);
				true
			}
			Err(e) if needs_invite(&e) => {
				warn!(%room, bot = %self.transport.bot_user_id(), error = %e, "cannot join room; invite the bridge bot");
				metrics::counter!("ncbridge_room_join_failures_total").increment(1);
				false
			}
			Err(e) => {
				warn!(%room, error = %e, "room join failed");
				metrics::counter!("ncbridge_room_join_failures_total").increment(1);
				false
			}
		}
	}

	/// Join every configured room. Returns how many joins succeeded.
	pub async fn join_configured_rooms(&self) -> usize {
		let mut joined = 0;
		for room in &self.rooms {
			if self.join(room).await {
				joined += 1;
			}
		}
		info!(joined, configured = self.rooms.len(), "initial room join pass finished");
		joined
	}

	/// Compare membership against the configured rooms and retry missing ones.
	///
	/// Returns the rooms the bot is still not in.
	pub async fn check_membership(&self) -> Result<Vec<RoomId>, TransportError> {
		let joined: HashSet<RoomId> = self.transport.joined_rooms().await?.into_iter().collect();

		let mut missing = Vec::new();
		for room in self.rooms.iter().filter(|room| !joined.contains(*room)) {
			warn!(%room, "bridge bot is not in configured room");
			if !self.join(room).await {
				missing.push(room.clone());
			}
		}
		debug!(joined = joined.len(), missing = missing.len(), "room membership checked");
		metrics::gauge!("ncbridge_rooms_missing").set(missing.len() as f64);
		Ok(missing)
	}

	/// Accept an invite addressed to the bot.
	pub async fn handle_invite(&self, room: &RoomId) -> bool {
		info!(%room, "bridge bot invited");
		self.join(room).await
	}

	/// Initial join pass after the configured delay, then periodic membership checks.
	pub fn spawn(self: Arc<Self>, cfg: RoomManagerConfig) -> JoinHandle<()> {
		tokio::spawn(async move {
			tokio::time::sleep(cfg.initial_join_delay).await;
			self.join_configured_rooms().await;

			if cfg.monitor_interval.is_zero() {
				return;
			}
			let mut ticker = tokio::time::interval(cfg.monitor_interval);
			ticker.tick().await;
			loop {
				ticker.tick().await;
				if let Err(e) = self.check_membership().await {
					warn!(error = %e, "room membership check failed");
				}
			}
		})
	}
}
