#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use ncbridge_domain::RoomEvent;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Default number of events processed at once.
pub const DEFAULT_MAX_CONCURRENT_EVENTS: usize = 10;

/// Processes one inbound room event.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
	async fn handle(&self, event: RoomEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
	pub max_concurrent_events: usize,
	pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
	fn default() -> Self {
		Self {
			max_concurrent_events: DEFAULT_MAX_CONCURRENT_EVENTS,
			queue_capacity: 1_024,
		}
	}
}

/// Fans inbound events out to worker tasks, at most `max_concurrent_events` at a time.
///
/// Events beyond the limit wait in the queue; senders block once it is full.
/// Nothing is dropped.
#[derive(Debug)]
pub struct EventDispatcher {
	tx: mpsc::Sender<RoomEvent>,
	task: JoinHandle<()>,
}

impl EventDispatcher {
	pub fn start(handler: Arc<dyn EventHandler>, cfg: DispatcherConfig) -> Self {
		let (tx, rx) = mpsc::channel(cfg.queue_capacity.max(1));
		let permits = Arc::new(Semaphore::new(cfg.max_concurrent_events.max(1)));
		let task = tokio::spawn(run_dispatch_loop(rx, handler, permits));
		Self { tx, task }
	}

	/// Queue handle for event sources.
	pub fn sender(&self) -> mpsc::Sender<RoomEvent> {
		self.tx.clone()
	}

	/// Queue one event, waiting while the queue is full.
	pub async fn dispatch(&self, event: RoomEvent) -> anyhow::Result<()> {
		self.tx
			.send(event)
			.await
			.map_err(|_| anyhow::anyhow!("event dispatcher stopped"))
	}

	/// Stop intake, then wait for queued and in-flight events to finish.
	///
	/// Sender clones handed out by [`EventDispatcher::sender`] keep intake open until dropped.
	pub async fn shutdown(self) {
		drop(self.tx);
		if let Err(e) = self.task.await {
			warn!(error = %e, "event dispatcher task failed");
		}
	}
}

async fn run_dispatch_loop(mut rx: mpsc::Receiver<RoomEvent>, handler: Arc<dyn EventHandler>, permits: Arc<Semaphore>) {
	let mut workers = JoinSet::new();

	while let Some(event) = rx.recv().await {
		let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
			break;
		};

		while let Some(done) = workers.try_join_next() {
			if let Err(e) = done {
				warn!(error = %e, "event worker panicked");
			}
		}

		let handler = Arc::clone(&handler);
		metrics::gauge!("ncbridge_dispatcher_in_flight").increment(1.0);
		workers.spawn(async move {
			let _permit = permit;
			let room = event.room_id.clone();
			let event_id = event.event_id.clone();
			let kind = event.kind.clone();

			match handler.handle(event).await {
				Ok(()) => {
					debug!(%room, %event_id, %kind, "event handled");
					metrics::counter!("ncbridge_dispatcher_events_handled_total").increment(1);
				}
				Err(e) => {
					warn!(%room, %event_id, %kind, error = %e, "event handling failed");
					metrics::counter!("ncbridge_dispatcher_events_failed_total").increment(1);
				}
			}
			metrics::gauge!("ncbridge_dispatcher_in_flight").decrement(1.0);
		});
	}

	while let Some(done) = workers.join_next().await {
		if let Err(e) = done {
			warn!(error = %e, "event worker panicked");
		}
	}
	info!("event dispatcher stopped");
}
