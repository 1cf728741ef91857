#![forbid(unsafe_code)]

//! WebDAV storage backend.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use ncbridge_domain::SecretString;
use parking_lot::RwLock;
use reqwest::{Method, StatusCode, header};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StorageError {
	#[error("invalid storage configuration: {0}")]
	Config(String),
	#[error("storage {op} {path}: {source}")]
	Http {
		op: &'static str,
		path: String,
		#[source]
		source: reqwest::Error,
	},
	#[error("storage {op} {path}: unexpected status {status}")]
	UnexpectedStatus { op: &'static str, path: String, status: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatResult {
	pub exists: bool,
	/// Size reported by the backend, when it reported one.
	pub size: Option<u64>,
}

impl StatResult {
	pub const ABSENT: StatResult = StatResult {
		exists: false,
		size: None,
	};
}

/// A file being streamed out of storage. Dropping `body` closes the response.
pub struct StoredMedia {
	pub content_type: Option<String>,
	pub content_length: Option<u64>,
	pub body: BoxStream<'static, Result<Bytes, StorageError>>,
}

impl std::fmt::Debug for StoredMedia {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StoredMedia")
			.field("content_type", &self.content_type)
			.field("content_length", &self.content_length)
			.finish_non_exhaustive()
	}
}

/// The storage operations the bridge needs. Paths are relative to the storage root.
#[async_trait]
pub trait MediaStore: Send + Sync {
	/// Create every parent collection of `path`, outermost first.
	async fn ensure_directories(&self, path: &str) -> Result<(), StorageError>;

	async fn stat(&self, path: &str) -> Result<StatResult, StorageError>;

	async fn upload(&self, path: &str, content: Bytes) -> Result<(), StorageError>;

	async fn download(&self, path: &str) -> Result<StoredMedia, StorageError>;

	/// Missing files count as deleted.
	async fn delete(&self, path: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
pub struct WebDavConfig {
	pub base_url: String,
	pub username: String,
	pub password: SecretString,
	pub request_timeout: Duration,
	pub connect_timeout: Duration,
	pub pool_max_idle_per_host: usize,
	pub pool_idle_timeout: Duration,
}

impl WebDavConfig {
	pub fn new(base_url: impl Into<String>, username: impl Into<String>, password: SecretString) -> Self {
		Self {
			base_url: base_url.into(),
			username: username.into(),
			password,
			request_timeout: Duration::from_secs(600),
			connect_timeout: Duration::from_secs(30),
			pool_max_idle_per_host: 10,
			pool_idle_timeout: Duration::from_secs(90),
		}
	}
}

/// Collections known to exist. Entries are only added after the backend confirmed them.
#[derive(Debug, Default)]
pub struct DirectoryCache {
	known: RwLock<HashSet<String>>,
}

impl DirectoryCache {
	pub fn contains(&self, path: &str) -> bool {
		self.known.read().contains(path)
	}

	pub fn insert(&self, path: &str) {
		self.known.write().insert(path.to_string());
	}

	pub fn len(&self) -> usize {
		self.known.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

pub struct WebDavClient {
	base_url: String,
	username: String,
	password: SecretString,
	client: reqwest::Client,
	mkcol: Method,
	directories: DirectoryCache,
}

impl std::fmt::Debug for WebDavClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("WebDavClient")
			.field("base_url", &self.base_url)
			.field("username", &self.username)
			.finish_non_exhaustive()
	}
}

impl WebDavClient {
	pub fn new(config: WebDavConfig) -> Result<Self, StorageError> {
		let base_url = config.base_url.trim().trim_end_matches('/').to_string();
		if base_url.is_empty() {
			return Err(StorageError::Config("missing base url".to_string()));
		}

		let client = reqwest::Client::builder()
			.timeout(config.request_timeout)
			.connect_timeout(config.connect_timeout)
			.pool_max_idle_per_host(config.pool_max_idle_per_host)
			.pool_idle_timeout(config.pool_idle_timeout)
			.build()
			.map_err(|e| StorageError::Config(format!("http client: {e}")))?;

		let mkcol = Method::from_bytes(b"MKCOL").map_err(|e| StorageError::Config(format!("MKCOL method: {e}")))?;

		Ok(Self {
			base_url,
			username: config.username,
			password: config.password,
			client,
			mkcol,
			directories: DirectoryCache::default(),
		})
	}

	pub fn directory_cache(&self) -> &DirectoryCache {
		&self.directories
	}

	/// Base URL joined with `path`, each segment escaped on its own.
	pub fn build_url(&self, path: &str) -> String {
		let trimmed = path.trim_start_matches('/');
		if trimmed.is_empty() {
			return self.base_url.clone();
		}
		let escaped = trimmed
			.split('/')
			.map(|segment| urlencoding::encode(segment).into_owned())
			.collect::<Vec<_>>()
			.join("/");
		format!("{}/{}", self.base_url, escaped)
	}

	fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
		self.client
			.request(method, self.build_url(path))
			.basic_auth(&self.username, Some(self.password.expose()))
	}

	/// MKCOL one collection. Created, conflict and not-allowed all count as present.
	pub async fn create_directory(&self, path: &str) -> Result<(), StorageError> {
		if self.directories.contains(path) {
			return Ok(());
		}

		let start = Instant::now();
		let resp = self
			.request(self.mkcol.clone(), path)
			.send()
			.await
			.map_err(|source| StorageError::Http {
				op: "MKCOL",
				path: path.to_string(),
				source,
			})?;

		let status = resp.status();
		debug!(path, status = status.as_u16(), elapsed_ms = start.elapsed().as_millis() as u64, "webdav MKCOL");
		metrics::counter!("ncbridge_storage_mkcol_total").increment(1);

		match status {
			StatusCode::CREATED | StatusCode::CONFLICT | StatusCode::METHOD_NOT_ALLOWED => {
				self.directories.insert(path);
				Ok(())
			}
			status => Err(StorageError::UnexpectedStatus {
				op: "MKCOL",
				path: path.to_string(),
				status: status.as_u16(),
			}),
		}
	}
}

/// Cumulative parent directories of `path`: `a/b/c.txt` -> [`a`, `a/b`].
pub fn parent_directories(path: &str) -> Vec<String> {
	let trimmed = path.trim_start_matches('/');
	let Some((parent, _)) = trimmed.rsplit_once('/') else {
		return Vec::new();
	};

	let mut out = Vec::new();
	let mut current = String::new();
	for segment in parent.split('/').filter(|s| !s.is_empty() && *s != ".") {
		if !current.is_empty() {
			current.push('/');
		}
		current.push_str(segment);
		out.push(current.clone());
	}
	out
}

#[async_trait]
impl MediaStore for WebDavClient {
	async fn ensure_directories(&self, path: &str) -> Result<(), StorageError> {
		for dir in parent_directories(path) {
			self.create_directory(&dir).await?;
		}
		Ok(())
	}

	async fn stat(&self, path: &str) -> Result<StatResult, StorageError> {
		let resp = self
			.request(Method::HEAD, path)
			.send()
			.await
			.map_err(|source| StorageError::Http {
				op: "HEAD",
				path: path.to_string(),
				source,
			})?;

		match resp.status() {
			StatusCode::NOT_FOUND => Ok(StatResult::ABSENT),
			StatusCode::OK | StatusCode::NO_CONTENT => {
				let size = resp
					.headers()
					.get(header::CONTENT_LENGTH)
					.and_then(|v| v.to_str().ok())
					.and_then(|v| v.trim().parse::<u64>().ok());
				Ok(StatResult { exists: true, size })
			}
			status => Err(StorageError::UnexpectedStatus {
				op: "HEAD",
				path: path.to_string(),
				status: status.as_u16(),
			}),
		}
	}

	async fn upload(&self, path: &str, content: Bytes) -> Result<(), StorageError> {
		let start = Instant::now();
		let content_length = content.len() as u64;
		debug!(path, content_length, "webdav upload start");

		let resp = self
			.request(Method::PUT, path)
			.body(content)
			.send()
			.await
			.map_err(|source| StorageError::Http {
				op: "PUT",
				path: path.to_string(),
				source,
			})?;

		let status = resp.status();
		info!(path, status = status.as_u16(), content_length, elapsed_ms = start.elapsed().as_millis() as u64, "webdav upload finished");

		match status {
			StatusCode::CREATED | StatusCode::NO_CONTENT => {
				metrics::counter!("ncbridge_storage_upload_bytes_total").increment(content_length);
				Ok(())
			}
			status => Err(StorageError::UnexpectedStatus {
				op: "PUT",
				path: path.to_string(),
				status: status.as_u16(),
			}),
		}
	}

	async fn download(&self, path: &str) -> Result<StoredMedia, StorageError> {
		let resp = self
			.request(Method::GET, path)
			.send()
			.await
			.map_err(|source| StorageError::Http {
				op: "GET",
				path: path.to_string(),
				source,
			})?;

		if resp.status() != StatusCode::OK {
			return Err(StorageError::UnexpectedStatus {
				op: "GET",
				path: path.to_string(),
				status: resp.status().as_u16(),
			});
		}

		let content_type = resp
			.headers()
			.get(header::CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string);
		let content_length = resp.content_length();

		let owned_path = path.to_string();
		let body = resp
			.bytes_stream()
			.map(move |chunk| {
				chunk.map_err(|source| StorageError::Http {
					op: "GET",
					path: owned_path.clone(),
					source,
				})
			})
			.boxed();

		Ok(StoredMedia {
			content_type,
			content_length,
			body,
		})
	}

	async fn delete(&self, path: &str) -> Result<(), StorageError> {
		let resp = self
			.request(Method::DELETE, path)
			.send()
			.await
			.map_err(|source| StorageError::Http {
				op: "DELETE",
				path: path.to_string(),
				source,
			})?;

		match resp.status() {
			StatusCode::NOT_FOUND | StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
			status => Err(StorageError::UnexpectedStatus {
				op: "DELETE",
				path: path.to_string(),
				status: status.as_u16(),
			}),
		}
	}
}
