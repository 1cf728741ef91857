#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use ncbridge_domain::SecretString;
use ncbridge_media::{MediaStore, StorageError, WebDavClient, WebDavConfig};
use parking_lot::Mutex;
use tokio::net::TcpListener;

#[derive(Default)]
struct FakeDav {
	files: HashMap<String, Bytes>,
	collections: HashSet<String>,
	requests: Vec<(String, String)>,
	mkcol_statuses: Vec<u16>,
	/// Paths answering 500 to every request.
	broken: HashSet<String>,
}

type Shared = Arc<Mutex<FakeDav>>;

fn expected_auth() -> String {
	format!("Basic {}", STANDARD.encode("bot:s3cret"))
}

fn respond(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body));
	*resp.status_mut() = status;
	resp
}

async fn handle(req: Request<Incoming>, dav: Shared) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let method = req.method().as_str().to_string();
	let path = req.uri().path().trim_start_matches("/dav/").to_string();

	let authorized = req
		.headers()
		.get(hyper::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v == expected_auth());
	let body = req.into_body().collect().await?.to_bytes();

	let mut dav = dav.lock();
	dav.requests.push((method.clone(), path.clone()));
	if !authorized {
		return Ok(respond(StatusCode::UNAUTHORIZED, Bytes::new()));
	}
	if dav.broken.contains(&path) {
		return Ok(respond(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new()));
	}

	let parent = path.rsplit_once('/').map(|(p, _)| p.to_string());
	let parent_exists = parent.as_ref().is_none_or(|p| dav.collections.contains(p));

	let resp = match method.as_str() {
		"MKCOL" if dav.collections.contains(&path) => respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new()),
		"MKCOL" if !parent_exists => respond(StatusCode::CONFLICT, Bytes::new()),
		"MKCOL" => {
			dav.collections.insert(path);
			respond(StatusCode::CREATED, Bytes::new())
		}
		"PUT" if !parent_exists => respond(StatusCode::CONFLICT, Bytes::new()),
		"PUT" => match dav.files.insert(path, body) {
			Some(_) => respond(StatusCode::NO_CONTENT, Bytes::new()),
			None => respond(StatusCode::CREATED, Bytes::new()),
		},
		"HEAD" | "GET" => match dav.files.get(&path) {
			Some(content) => {
				let mut resp = respond(StatusCode::OK, content.clone());
				resp.headers_mut()
					.insert(hyper::header::CONTENT_TYPE, hyper::header::HeaderValue::from_static("image/jpeg"));
				resp
			}
			None => respond(StatusCode::NOT_FOUND, Bytes::new()),
		},
		"DELETE" => match dav.files.remove(&path) {
			Some(_) => respond(StatusCode::NO_CONTENT, Bytes::new()),
			None => respond(StatusCode::NOT_FOUND, Bytes::new()),
		},
		_ => respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new()),
	};
	if method == "MKCOL" {
		dav.mkcol_statuses.push(resp.status().as_u16());
	}
	Ok(resp)
}

async fn spawn_fake_dav() -> (SocketAddr, Shared) {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake dav");
	let addr = listener.local_addr().expect("local addr");
	let dav: Shared = Arc::new(Mutex::new(FakeDav::default()));

	let state = dav.clone();
	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				return;
			};
			let io = TokioIo::new(stream);
			let state = state.clone();
			tokio::spawn(async move {
				let service = service_fn(move |req| handle(req, state.clone()));
				let _ = http1::Builder::new().serve_connection(io, service).await;
			});
		}
	});

	(addr, dav)
}

fn client(addr: SocketAddr, password: &str) -> WebDavClient {
	WebDavClient::new(WebDavConfig::new(
		format!("http://{addr}/dav/"),
		"bot",
		SecretString::new(password),
	))
	.expect("client")
}

#[tokio::test]
async fn upload_stat_download_delete() {
	let (addr, dav) = spawn_fake_dav().await;
	let client = client(addr, "s3cret");
	let path = "media/2024/room/alice/image.jpg";

	assert!(!client.stat(path).await.unwrap().exists);

	client.ensure_directories(path).await.unwrap();
	client.upload(path, Bytes::from_static(b"jpeg-bytes")).await.unwrap();

	let stat = client.stat(path).await.unwrap();
	assert!(stat.exists);
	assert_eq!(stat.size, Some(10));

	let media = client.download(path).await.unwrap();
	assert_eq!(media.content_type.as_deref(), Some("image/jpeg"));
	assert_eq!(media.content_length, Some(10));
	let chunks: Vec<Bytes> = media.body.try_collect().await.unwrap();
	assert_eq!(chunks.concat(), b"jpeg-bytes");

	client.delete(path).await.unwrap();
	assert!(!client.stat(path).await.unwrap().exists);
	// Already gone still counts as deleted.
	client.delete(path).await.unwrap();

	assert!(dav.lock().files.is_empty());
}

#[tokio::test]
async fn directories_created_outer_to_inner_once() {
	let (addr, dav) = spawn_fake_dav().await;
	let client = client(addr, "s3cret");

	client.ensure_directories("a/b/c/one.txt").await.unwrap();
	client.ensure_directories("a/b/c/two.txt").await.unwrap();
	client.ensure_directories("a/b/other/three.txt").await.unwrap();

	let mkcols: Vec<String> = dav
		.lock()
		.requests
		.iter()
		.filter(|(m, _)| m == "MKCOL")
		.map(|(_, p)| p.clone())
		.collect();
	assert_eq!(mkcols, vec!["a", "a/b", "a/b/c", "a/b/other"]);
	assert_eq!(client.directory_cache().len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_touch_of_same_directories() {
	let (addr, dav) = spawn_fake_dav().await;
	let client = client(addr, "s3cret");

	let results = futures::future::join_all((0..8).map(|_| client.ensure_directories("a/b/c/x.bin"))).await;

	assert!(results.iter().all(Result::is_ok), "{results:?}");
	assert_eq!(client.directory_cache().len(), 3);
	for dir in ["a", "a/b", "a/b/c"] {
		assert!(client.directory_cache().contains(dir));
	}
	let statuses = dav.lock().mkcol_statuses.clone();
	assert!(!statuses.is_empty());
	assert!(
		statuses.iter().all(|s| *s == 201 || *s == 405),
		"unexpected MKCOL statuses: {statuses:?}"
	);
	assert_eq!(statuses.iter().filter(|s| **s == 201).count(), 3);
}

#[tokio::test]
async fn existing_collections_are_accepted_and_cached() {
	let (addr, dav) = spawn_fake_dav().await;
	dav.lock().collections.insert("media".to_string());
	let client = client(addr, "s3cret");

	client.create_directory("media").await.unwrap();

	assert!(client.directory_cache().contains("media"));
}

#[tokio::test]
async fn segments_are_escaped_individually() {
	let (addr, dav) = spawn_fake_dav().await;
	let client = client(addr, "s3cret");

	client.ensure_directories("my room/a#b.jpg").await.unwrap();
	client.upload("my room/a#b.jpg", Bytes::from_static(b"x")).await.unwrap();

	let requests = dav.lock().requests.clone();
	assert_eq!(
		requests,
		vec![
			("MKCOL".to_string(), "my%20room".to_string()),
			("PUT".to_string(), "my%20room/a%23b.jpg".to_string()),
		]
	);
}

#[tokio::test]
async fn bad_credentials_fail_hard() {
	let (addr, dav) = spawn_fake_dav().await;
	let client = client(addr, "wrong");

	let err = client.stat("x.jpg").await.unwrap_err();
	assert!(matches!(err, StorageError::UnexpectedStatus { status: 401, .. }));

	let err = client.create_directory("x").await.unwrap_err();
	assert!(matches!(err, StorageError::UnexpectedStatus { op: "MKCOL", status: 401, .. }));
	assert!(!client.directory_cache().contains("x"));
	assert_eq!(dav.lock().requests.len(), 2);
}

#[tokio::test]
async fn server_errors_surface_as_failures() {
	let (addr, dav) = spawn_fake_dav().await;
	dav.lock().broken.insert("broken.jpg".to_string());
	let client = client(addr, "s3cret");

	assert!(client.upload("broken.jpg", Bytes::from_static(b"x")).await.is_err());
	assert!(client.download("broken.jpg").await.is_err());
	assert!(client.delete("broken.jpg").await.is_err());
	assert!(client.download("missing.jpg").await.is_err());
}
