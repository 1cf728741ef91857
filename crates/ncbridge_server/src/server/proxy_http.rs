#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures::stream::{self, StreamExt as _};
use futures::TryStreamExt as _;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt as _, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use ncbridge_media::{MediaProxyResolver, ProxyError, StorageError};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, warn};

pub type ProxyBody = UnsyncBoxBody<Bytes, StorageError>;

const MEDIA_PREFIXES: [&str; 4] = [
	"/_matrix/client/v1/media/download/",
	"/_matrix/client/v1/media/thumbnail/",
	"/_matrix/media/v3/download/",
	"/_matrix/media/v3/thumbnail/",
];

/// Unauthenticated federation media paths. The server name is implied.
const FEDERATION_PREFIXES: [&str; 2] = [
	"/_matrix/federation/v1/media/download/",
	"/_matrix/federation/v1/media/thumbnail/",
];

const MULTIPART_BOUNDARY: &str = "ncbridge-media-boundary";

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

#[derive(Clone)]
pub struct ProxyState {
	pub resolver: MediaProxyResolver,
	/// Only ids under this server name are served.
	pub server_name: Arc<str>,
	pub health: HealthState,
}

/// `(server, media_id)` of a download or thumbnail path. A trailing file name is ignored.
fn parse_media_path(path: &str) -> Option<(String, String)> {
	let rest = MEDIA_PREFIXES.iter().find_map(|prefix| path.strip_prefix(prefix))?;
	let mut segments = rest.split('/');
	let server = segments.next().filter(|s| !s.is_empty())?;
	let media_id = segments.next().filter(|s| !s.is_empty())?;
	if segments.count() > 1 {
		return None;
	}
	let decode = |s: &str| urlencoding::decode(s).map(|v| v.into_owned()).unwrap_or_else(|_| s.to_string());
	Some((decode(server), decode(media_id)))
}

/// Media id of a federation download or thumbnail path.
fn parse_federation_path(path: &str) -> Option<String> {
	let media_id = FEDERATION_PREFIXES.iter().find_map(|prefix| path.strip_prefix(prefix))?;
	if media_id.is_empty() || media_id.contains('/') {
		return None;
	}
	Some(
		urlencoding::decode(media_id)
			.map(|v| v.into_owned())
			.unwrap_or_else(|_| media_id.to_string()),
	)
}

/// Federation media is `multipart/mixed`: an empty JSON metadata part, then the content part.
fn multipart_parts(content_type: &str, disposition: Option<&HeaderValue>) -> (Bytes, Bytes) {
	let mut head = format!(
		"--{MULTIPART_BOUNDARY}\r\nContent-Type: application/json\r\n\r\n{{}}\r\n--{MULTIPART_BOUNDARY}\r\nContent-Type: {content_type}\r\n"
	);
	if let Some(v) = disposition.and_then(|v| v.to_str().ok()) {
		head.push_str(&format!("Content-Disposition: {v}\r\n"));
	}
	head.push_str("\r\n");
	let tail = format!("\r\n--{MULTIPART_BOUNDARY}--\r\n");
	(Bytes::from(head), Bytes::from(tail))
}

fn full(status: StatusCode, body: Bytes) -> Response<ProxyBody> {
	let mut resp = Response::new(Full::new(body).map_err(|never: Infallible| match never {}).boxed_unsync());
	*resp.status_mut() = status;
	resp
}

fn matrix_error(status: StatusCode, errcode: &str, message: &str) -> Response<ProxyBody> {
	let body = json!({ "errcode": errcode, "error": message }).to_string();
	let mut resp = full(status, Bytes::from(body));
	resp.headers_mut()
		.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
	resp
}

fn content_disposition(file_name: &str) -> Option<HeaderValue> {
	if file_name.trim().is_empty() {
		return Some(HeaderValue::from_static("inline"));
	}
	HeaderValue::from_str(&format!("inline; filename*=UTF-8''{}", urlencoding::encode(file_name))).ok()
}

/// Serve the media proxy and health endpoints on `listener` until accepting fails.
pub async fn serve_media_proxy(listener: TcpListener, state: ProxyState) -> anyhow::Result<()> {
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_proxy_request(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "media proxy connection error");
			}
		});
	}
}

async fn handle_proxy_request(req: Request<Incoming>, state: ProxyState) -> Result<Response<ProxyBody>, Infallible> {
	if req.method() != Method::GET {
		return Ok(matrix_error(StatusCode::METHOD_NOT_ALLOWED, "M_UNRECOGNIZED", "method not allowed"));
	}

	let path = req.uri().path();
	match path {
		"/healthz" => return Ok(full(StatusCode::OK, Bytes::from_static(b"ok"))),
		"/readyz" if state.health.is_ready() => return Ok(full(StatusCode::OK, Bytes::from_static(b"ready"))),
		"/readyz" => return Ok(full(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready"))),
		_ => {}
	}

	let (media_id, federation) = if let Some(media_id) = parse_federation_path(path) {
		(media_id, true)
	} else {
		let Some((server, media_id)) = parse_media_path(path) else {
			return Ok(matrix_error(StatusCode::NOT_FOUND, "M_UNRECOGNIZED", "unrecognized request"));
		};
		if server != *state.server_name {
			metrics::counter!("ncbridge_proxy_foreign_server_total").increment(1);
			return Ok(matrix_error(StatusCode::NOT_FOUND, "M_NOT_FOUND", "media not found"));
		}
		(media_id, false)
	};

	metrics::counter!("ncbridge_proxy_requests_total").increment(1);

	let media = match state.resolver.resolve(&media_id).await {
		Ok(media) => media,
		Err(ProxyError::InvalidMediaId) => {
			metrics::counter!("ncbridge_proxy_invalid_id_total").increment(1);
			return Ok(matrix_error(StatusCode::BAD_REQUEST, "M_INVALID_PARAM", "invalid media id"));
		}
		Err(ProxyError::Storage(e)) => {
			warn!(error = %e, "media proxy storage fetch failed");
			metrics::counter!("ncbridge_proxy_storage_errors_total").increment(1);
			return Ok(matrix_error(StatusCode::BAD_GATEWAY, "M_UNKNOWN", "storage unavailable"));
		}
	};

	debug!(path = %media.reference.path, federation, "serving proxied media");
	metrics::counter!("ncbridge_proxy_served_total").increment(1);

	let disposition = content_disposition(&media.reference.file_name);

	if federation {
		let (head, tail) = multipart_parts(&media.content_type, disposition.as_ref());
		let length = media
			.content_length
			.map(|len| len + head.len() as u64 + tail.len() as u64);
		let parts = stream::once(async move { Ok::<_, StorageError>(head) })
			.chain(media.body)
			.chain(stream::once(async move { Ok(tail) }));
		let mut resp = Response::new(StreamBody::new(parts.map_ok(Frame::data)).boxed_unsync());
		let headers = resp.headers_mut();
		if let Ok(v) = HeaderValue::from_str(&format!("multipart/mixed; boundary={MULTIPART_BOUNDARY}")) {
			headers.insert(CONTENT_TYPE, v);
		}
		if let Some(len) = length {
			headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
		}
		return Ok(resp);
	}

	let body = StreamBody::new(media.body.map_ok(Frame::data)).boxed_unsync();
	let mut resp = Response::new(body);
	let headers = resp.headers_mut();
	if let Ok(v) = HeaderValue::from_str(&media.content_type) {
		headers.insert(CONTENT_TYPE, v);
	}
	if let Some(len) = media.content_length {
		headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
	}
	if let Some(v) = disposition {
		headers.insert(CONTENT_DISPOSITION, v);
	}
	Ok(resp)
}
