#![forbid(unsafe_code)]

//! Media lifecycle for the Nextcloud media bridge: storage paths, signed
//! media tokens, the WebDAV store, the bridging orchestrator, the proxy
//! resolver and the bounded event dispatcher.

pub mod dispatcher;
pub mod lifecycle;
pub mod media_id;
pub mod path;
pub mod proxy;
pub mod state;
pub mod storage;
pub mod transport;

pub use dispatcher::{DispatcherConfig, EventDispatcher, EventHandler};
pub use lifecycle::{
	BridgedMedia, DEFAULT_COLLISION_LIMIT, EventOutcome, LifecycleConfig, LifecycleError, MediaLifecycle, MediaOutcome,
	RedactionOutcome, SkipReason,
};
pub use media_id::{MediaIdCodec, MediaIdError, MediaRef, constant_time_eq, decode_media_id, encode_media_id};
pub use proxy::{MediaProxyResolver, ProxiedMedia, ProxyError};
pub use state::{BridgeRecord, MEDIA_STATE_EVENT_TYPE, MediaStateRecord};
pub use storage::{MediaStore, StatResult, StorageError, StoredMedia, WebDavClient, WebDavConfig};
pub use transport::{ChatTransport, CryptoError, CryptoProvider, DownloadedMedia, SourceCleanup, TransportError};

#[cfg(test)]
mod test_support;
