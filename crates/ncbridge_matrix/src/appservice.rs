#![forbid(unsafe_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use ncbridge_domain::{RoomEvent, SecretString};
use ncbridge_media::constant_time_eq;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Transaction ids remembered for replay detection.
pub const SEEN_TRANSACTION_WINDOW: usize = 256;

const TRANSACTIONS_PREFIX: &str = "/_matrix/app/v1/transactions/";
const LEGACY_TRANSACTIONS_PREFIX: &str = "/transactions/";
const USERS_PREFIX: &str = "/_matrix/app/v1/users/";
const ROOMS_PREFIX: &str = "/_matrix/app/v1/rooms/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reservation {
	Fresh,
	Seen,
	InFlight,
}

#[derive(Default)]
struct SeenTransactions {
	order: VecDeque<String>,
	ids: HashSet<String>,
	in_flight: HashSet<String>,
}

impl SeenTransactions {
	fn contains(&self, txn: &str) -> bool {
		self.ids.contains(txn)
	}

	/// Claim `txn` for forwarding. Only a `Fresh` claim may forward events.
	fn reserve(&mut self, txn: &str) -> Reservation {
		if self.ids.contains(txn) {
			return Reservation::Seen;
		}
		if !self.in_flight.insert(txn.to_string()) {
			return Reservation::InFlight;
		}
		Reservation::Fresh
	}

	/// Drop a claim without remembering the transaction, so a retry forwards again.
	fn release(&mut self, txn: &str) {
		self.in_flight.remove(txn);
	}

	fn insert(&mut self, txn: &str) {
		self.in_flight.remove(txn);
		if !self.ids.insert(txn.to_string()) {
			return;
		}
		self.order.push_back(txn.to_string());
		while self.order.len() > SEEN_TRANSACTION_WINDOW {
			if let Some(old) = self.order.pop_front() {
				self.ids.remove(&old);
			}
		}
	}
}

/// Stops the listener from admitting transactions.
#[derive(Clone)]
pub struct IntakeShutdown {
	tx: Arc<watch::Sender<bool>>,
}

impl IntakeShutdown {
	/// New transactions are refused with 503 and open connections are drained.
	pub fn trigger(&self) {
		self.tx.send_replace(true);
	}
}

/// Shared state of the homeserver-facing listener.
#[derive(Clone)]
pub struct AppserviceState {
	hs_token: SecretString,
	events_tx: mpsc::Sender<RoomEvent>,
	seen: Arc<Mutex<SeenTransactions>>,
	stopping: Arc<watch::Sender<bool>>,
}

impl AppserviceState {
	pub fn new(hs_token: SecretString, events_tx: mpsc::Sender<RoomEvent>) -> Self {
		Self {
			hs_token,
			events_tx,
			seen: Arc::new(Mutex::new(SeenTransactions::default())),
			stopping: Arc::new(watch::channel(false).0),
		}
	}

	/// Handle for stopping intake. Holding it does not keep the event queue open.
	pub fn shutdown_handle(&self) -> IntakeShutdown {
		IntakeShutdown {
			tx: Arc::clone(&self.stopping),
		}
	}

	fn is_stopping(&self) -> bool {
		*self.stopping.borrow()
	}
}

#[derive(Debug, Deserialize)]
struct TransactionBody {
	#[serde(default)]
	events: Vec<Value>,
}

/// Serve homeserver pushes on `listener`.
///
/// Returns once [`IntakeShutdown::trigger`] was called and every open connection
/// has finished its current request. The event queue sender is released by then.
pub async fn serve_appservice(listener: TcpListener, state: AppserviceState) -> anyhow::Result<()> {
	let stop = stop_requested(state.stopping.subscribe());
	tokio::pin!(stop);
	let mut connections = JoinSet::new();

	loop {
		tokio::select! {
			accepted = listener.accept() => {
				let (stream, _addr) = accepted?;
				connections.spawn(serve_connection(stream, state.clone()));
			}
			_ = &mut stop => break,
		}
		while connections.try_join_next().is_some() {}
	}

	drop(state);
	info!(open = connections.len(), "appservice listener draining connections");
	while connections.join_next().await.is_some() {}
	info!("appservice listener stopped");
	Ok(())
}

async fn stop_requested(mut rx: watch::Receiver<bool>) {
	let _ = rx.wait_for(|stop| *stop).await;
}

async fn serve_connection(stream: TcpStream, state: AppserviceState) {
	let stop = stop_requested(state.stopping.subscribe());
	let io = TokioIo::new(stream);
	let service = service_fn(move |req| handle_appservice_request(req, state.clone()));
	let conn = http1::Builder::new().serve_connection(io, service);
	tokio::pin!(conn);

	let result = tokio::select! {
		result = conn.as_mut() => result,
		_ = stop => {
			conn.as_mut().graceful_shutdown();
			conn.as_mut().await
		}
	};
	if let Err(err) = result {
		warn!(error = %err, "appservice connection error");
	}
}

fn json_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from(body.to_string())));
	*resp.status_mut() = status;
	resp.headers_mut()
		.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
	resp
}

fn matrix_error(status: StatusCode, errcode: &str, message: &str) -> Response<Full<Bytes>> {
	json_response(status, json!({ "errcode": errcode, "error": message }))
}

/// Token from `Authorization: Bearer` or the legacy `access_token` query parameter.
fn presented_token(req: &hyper::http::request::Parts) -> Option<String> {
	if let Some(token) = req
		.headers
		.get(AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "))
	{
		return Some(token.trim().to_string());
	}
	req.uri.query().and_then(|q| {
		url::form_urlencoded::parse(q.as_bytes())
			.find(|(k, _)| k == "access_token")
			.map(|(_, v)| v.into_owned())
	})
}

async fn handle_appservice_request(
	req: Request<Incoming>,
	state: AppserviceState,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let (parts, body) = req.into_parts();

	match presented_token(&parts) {
		None => {
			metrics::counter!("ncbridge_appservice_unauthorized_total").increment(1);
			return Ok(matrix_error(StatusCode::UNAUTHORIZED, "M_UNAUTHORIZED", "missing token"));
		}
		Some(token) if !constant_time_eq(token.as_bytes(), state.hs_token.expose().trim().as_bytes()) => {
			metrics::counter!("ncbridge_appservice_forbidden_total").increment(1);
			return Ok(matrix_error(StatusCode::FORBIDDEN, "M_FORBIDDEN", "invalid token"));
		}
		Some(_) => {}
	}

	let path = parts.uri.path().to_string();

	if let Some(txn) = path
		.strip_prefix(TRANSACTIONS_PREFIX)
		.or_else(|| path.strip_prefix(LEGACY_TRANSACTIONS_PREFIX))
	{
		if parts.method != Method::PUT {
			return Ok(matrix_error(StatusCode::METHOD_NOT_ALLOWED, "M_UNRECOGNIZED", "method not allowed"));
		}
		let body_bytes = match body.collect().await {
			Ok(collected) => collected.to_bytes(),
			Err(err) => {
				warn!(error = %err, "appservice transaction body read failed");
				return Ok(matrix_error(StatusCode::BAD_REQUEST, "M_BAD_JSON", "unreadable body"));
			}
		};
		return Ok(handle_transaction(txn, &body_bytes, &state).await);
	}

	if parts.method == Method::GET && path.starts_with(USERS_PREFIX) {
		return Ok(json_response(StatusCode::OK, json!({})));
	}

	if parts.method == Method::GET && path.starts_with(ROOMS_PREFIX) {
		return Ok(matrix_error(StatusCode::NOT_FOUND, "M_NOT_FOUND", "no such room alias"));
	}

	Ok(matrix_error(StatusCode::NOT_FOUND, "M_UNRECOGNIZED", "unrecognized request"))
}

async fn handle_transaction(txn: &str, body: &[u8], state: &AppserviceState) -> Response<Full<Bytes>> {
	metrics::counter!("ncbridge_appservice_transactions_total").increment(1);

	if txn.is_empty() {
		return matrix_error(StatusCode::BAD_REQUEST, "M_INVALID_PARAM", "missing transaction id");
	}
	if state.is_stopping() {
		debug!(txn, "refusing appservice transaction during shutdown");
		return matrix_error(StatusCode::SERVICE_UNAVAILABLE, "M_UNKNOWN", "bridge shutting down");
	}

	let reservation = state.seen.lock().reserve(txn);
	match reservation {
		Reservation::Fresh => {}
		Reservation::Seen => {
			debug!(txn, "duplicate appservice transaction");
			metrics::counter!("ncbridge_appservice_duplicate_transactions_total").increment(1);
			return json_response(StatusCode::OK, json!({}));
		}
		Reservation::InFlight => {
			debug!(txn, "appservice transaction already in progress");
			metrics::counter!("ncbridge_appservice_duplicate_transactions_total").increment(1);
			return matrix_error(StatusCode::SERVICE_UNAVAILABLE, "M_UNKNOWN", "transaction in progress");
		}
	}

	let payload: TransactionBody = match serde_json::from_slice(body) {
		Ok(v) => v,
		Err(err) => {
			state.seen.lock().release(txn);
			warn!(error = %err, "appservice transaction parse failed");
			metrics::counter!("ncbridge_appservice_parse_errors_total").increment(1);
			return matrix_error(StatusCode::BAD_REQUEST, "M_BAD_JSON", "invalid transaction body");
		}
	};

	let mut forwarded = 0usize;
	for raw in payload.events {
		let event: RoomEvent = match serde_json::from_value(raw) {
			Ok(event) => event,
			Err(err) => {
				debug!(txn, error = %err, "skipping undecodable event");
				metrics::counter!("ncbridge_appservice_events_skipped_total").increment(1);
				continue;
			}
		};
		if state.events_tx.send(event).await.is_err() {
			state.seen.lock().release(txn);
			warn!(txn, "event dispatcher stopped; rejecting transaction");
			return matrix_error(StatusCode::SERVICE_UNAVAILABLE, "M_UNKNOWN", "bridge shutting down");
		}
		forwarded += 1;
	}

	state.seen.lock().insert(txn);
	debug!(txn, forwarded, "appservice transaction accepted");
	metrics::counter!("ncbridge_appservice_events_total").increment(forwarded as u64);
	json_response(StatusCode::OK, json!({}))
}

#[cfg(test)]
mod tests {
	use std::net::SocketAddr;
	use std::time::Duration;

	use super::*;

	const HS_TOKEN: &str = "hs-secret";

	async fn spawn_listener() -> (SocketAddr, mpsc::Receiver<RoomEvent>) {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let (tx, rx) = mpsc::channel(16);
		tokio::spawn(serve_appservice(listener, AppserviceState::new(SecretString::new(HS_TOKEN), tx)));
		(addr, rx)
	}

	fn transaction() -> Value {
		json!({
			"events": [
				{
					"type": "m.room.message",
					"event_id": "$one",
					"room_id": "!room:example.com",
					"sender": "@alice:example.com",
					"content": { "msgtype": "m.text", "body": "hi" }
				},
				{ "type": "m.room.message", "content": {} },
				{
					"type": "m.room.redaction",
					"event_id": "$two",
					"room_id": "!room:example.com",
					"sender": "@alice:example.com",
					"redacts": "$one",
					"content": {}
				}
			]
		})
	}

	async fn recv(rx: &mut mpsc::Receiver<RoomEvent>) -> RoomEvent {
		tokio::time::timeout(Duration::from_secs(2), rx.recv())
			.await
			.expect("event forwarded")
			.expect("channel open")
	}

	#[test]
	fn seen_window_is_bounded() {
		let mut seen = SeenTransactions::default();
		for n in 0..(SEEN_TRANSACTION_WINDOW + 10) {
			seen.insert(&format!("txn{n}"));
		}
		assert_eq!(seen.ids.len(), SEEN_TRANSACTION_WINDOW);
		assert!(!seen.contains("txn0"));
		assert!(seen.contains(&format!("txn{}", SEEN_TRANSACTION_WINDOW + 9)));
	}

	#[test]
	fn in_flight_transactions_are_claimed_once() {
		let mut seen = SeenTransactions::default();

		assert_eq!(seen.reserve("t1"), Reservation::Fresh);
		assert_eq!(seen.reserve("t1"), Reservation::InFlight);

		seen.release("t1");
		assert_eq!(seen.reserve("t1"), Reservation::Fresh);

		seen.insert("t1");
		assert_eq!(seen.reserve("t1"), Reservation::Seen);
		assert!(seen.in_flight.is_empty());
	}

	#[tokio::test]
	async fn retry_while_forwarding_is_not_forwarded_twice() {
		let (tx, mut rx) = mpsc::channel(1);
		let state = AppserviceState::new(SecretString::new(HS_TOKEN), tx);
		let body = transaction().to_string();

		let first = {
			let state = state.clone();
			let body = body.clone();
			tokio::spawn(async move { handle_transaction("t1", body.as_bytes(), &state).await.status() })
		};
		// The queue holds one event, so the first request parks on the second one.
		while !state.seen.lock().in_flight.contains("t1") {
			tokio::task::yield_now().await;
		}

		let retry = handle_transaction("t1", body.as_bytes(), &state).await;
		assert_eq!(retry.status(), StatusCode::SERVICE_UNAVAILABLE);

		assert_eq!(recv(&mut rx).await.event_id.as_str(), "$one");
		assert_eq!(recv(&mut rx).await.event_id.as_str(), "$two");
		assert_eq!(first.await.unwrap(), StatusCode::OK);
		assert!(rx.try_recv().is_err());

		let replay = handle_transaction("t1", body.as_bytes(), &state).await;
		assert_eq!(replay.status(), StatusCode::OK);
		assert!(rx.try_recv().is_err(), "completed transaction must not be forwarded again");
	}

	#[tokio::test]
	async fn refuses_transactions_once_stopping() {
		let (tx, mut rx) = mpsc::channel(4);
		let state = AppserviceState::new(SecretString::new(HS_TOKEN), tx);
		state.shutdown_handle().trigger();

		let resp = handle_transaction("t2", transaction().to_string().as_bytes(), &state).await;

		assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
		assert!(rx.try_recv().is_err());
		assert!(!state.seen.lock().contains("t2"), "refused transaction stays retryable");
	}

	#[tokio::test]
	async fn shutdown_drains_connections_and_closes_the_queue() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let (tx, mut rx) = mpsc::channel(16);
		let state = AppserviceState::new(SecretString::new(HS_TOKEN), tx);
		let shutdown = state.shutdown_handle();
		let server = tokio::spawn(serve_appservice(listener, state));

		// One client, so the second request reuses the kept-alive connection when it can.
		let client = reqwest::Client::new();
		let first = client
			.put(format!("http://{addr}/_matrix/app/v1/transactions/t1"))
			.bearer_auth(HS_TOKEN)
			.json(&transaction())
			.send()
			.await
			.unwrap();
		assert_eq!(first.status(), 200);
		assert_eq!(recv(&mut rx).await.event_id.as_str(), "$one");
		assert_eq!(recv(&mut rx).await.event_id.as_str(), "$two");

		shutdown.trigger();

		let second = client
			.put(format!("http://{addr}/_matrix/app/v1/transactions/t2"))
			.bearer_auth(HS_TOKEN)
			.json(&transaction())
			.send()
			.await;
		if let Ok(resp) = second {
			assert_eq!(resp.status(), 503, "transactions after shutdown must not be acknowledged");
		}

		tokio::time::timeout(Duration::from_secs(2), server)
			.await
			.expect("listener drained")
			.expect("listener task did not panic")
			.expect("listener stopped cleanly");
		let closed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
			.await
			.expect("queue closed after drain");
		assert!(closed.is_none(), "no event may be queued after shutdown");
	}

	#[tokio::test]
	async fn forwards_decodable_events_once() {
		let (addr, mut rx) = spawn_listener().await;
		let client = reqwest::Client::new();
		let url = format!("http://{addr}/_matrix/app/v1/transactions/42");

		let resp = client.put(&url).bearer_auth(HS_TOKEN).json(&transaction()).send().await.unwrap();
		assert_eq!(resp.status(), 200);

		assert_eq!(recv(&mut rx).await.event_id.as_str(), "$one");
		assert_eq!(recv(&mut rx).await.event_id.as_str(), "$two");

		let replay = client.put(&url).bearer_auth(HS_TOKEN).json(&transaction()).send().await.unwrap();
		assert_eq!(replay.status(), 200);
		assert!(rx.try_recv().is_err(), "replayed transaction must not be forwarded");
	}

	#[tokio::test]
	async fn legacy_path_and_query_token_are_accepted() {
		let (addr, mut rx) = spawn_listener().await;
		let resp = reqwest::Client::new()
			.put(format!("http://{addr}/transactions/7?access_token={HS_TOKEN}"))
			.json(&transaction())
			.send()
			.await
			.unwrap();

		assert_eq!(resp.status(), 200);
		assert_eq!(recv(&mut rx).await.event_id.as_str(), "$one");
	}

	#[tokio::test]
	async fn rejects_missing_or_wrong_token() {
		let (addr, mut rx) = spawn_listener().await;
		let client = reqwest::Client::new();
		let url = format!("http://{addr}/_matrix/app/v1/transactions/1");

		let missing = client.put(&url).json(&transaction()).send().await.unwrap();
		assert_eq!(missing.status(), 401);

		let wrong = client.put(&url).bearer_auth("nope").json(&transaction()).send().await.unwrap();
		assert_eq!(wrong.status(), 403);
		let body: Value = wrong.json().await.unwrap();
		assert_eq!(body["errcode"], "M_FORBIDDEN");

		let same_length = client.put(&url).bearer_auth("hs-secreT").json(&transaction()).send().await.unwrap();
		assert_eq!(same_length.status(), 403);

		assert!(rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn malformed_body_is_bad_request() {
		let (addr, _rx) = spawn_listener().await;
		let resp = reqwest::Client::new()
			.put(format!("http://{addr}/_matrix/app/v1/transactions/9"))
			.bearer_auth(HS_TOKEN)
			.body("not json")
			.send()
			.await
			.unwrap();
		assert_eq!(resp.status(), 400);
	}

	#[tokio::test]
	async fn answers_user_and_alias_queries() {
		let (addr, _rx) = spawn_listener().await;
		let client = reqwest::Client::new();

		let user = client
			.get(format!("http://{addr}/_matrix/app/v1/users/%40nextcloudbot%3Aexample.com"))
			.bearer_auth(HS_TOKEN)
			.send()
			.await
			.unwrap();
		assert_eq!(user.status(), 200);

		let alias = client
			.get(format!("http://{addr}/_matrix/app/v1/rooms/%23media%3Aexample.com"))
			.bearer_auth(HS_TOKEN)
			.send()
			.await
			.unwrap();
		assert_eq!(alias.status(), 404);
	}

	#[tokio::test]
	async fn stopped_dispatcher_fails_the_transaction() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let (tx, rx) = mpsc::channel(1);
		drop(rx);
		tokio::spawn(serve_appservice(listener, AppserviceState::new(SecretString::new(HS_TOKEN), tx)));

		let resp = reqwest::Client::new()
			.put(format!("http://{addr}/_matrix/app/v1/transactions/5"))
			.bearer_auth(HS_TOKEN)
			.json(&transaction())
			.send()
			.await
			.unwrap();
		assert_eq!(resp.status(), 503);
	}
}
