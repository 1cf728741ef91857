#![forbid(unsafe_code)]

mod config;
mod server;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use ncbridge_domain::UserId;
use ncbridge_matrix::{AppserviceClient, AppserviceState, SynapseAdminCleaner, serve_appservice};
use ncbridge_media::{
	ChatTransport, DispatcherConfig, EventDispatcher, LifecycleConfig, MediaIdCodec, MediaLifecycle, MediaProxyResolver,
	MediaStore, WebDavClient, WebDavConfig,
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::BridgeConfig;
use crate::server::handler::BridgeEventHandler;
use crate::server::proxy_http::{HealthState, ProxyState, serve_media_proxy};
use crate::server::room_manager::{RoomManager, RoomManagerConfig};

/// Homeserver requests, media downloads included.
const HOMESERVER_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const ADMIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Limit for each drain step after Ctrl-C: open appservice requests, then in-flight events.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: ncbridge_server [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: $CONFIG_PATH or ~/.ncbridge/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,ncbridge_server=debug,ncbridge_media=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("ncbridge_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn webdav_config(cfg: &BridgeConfig) -> WebDavConfig {
	let nc = &cfg.nextcloud;
	WebDavConfig {
		request_timeout: nc.request_timeout,
		connect_timeout: nc.connect_timeout,
		pool_max_idle_per_host: nc.pool_max_idle_per_host,
		pool_idle_timeout: nc.pool_idle_timeout,
		..WebDavConfig::new(nc.base_url.clone(), nc.username.clone(), nc.password.clone())
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let config_path = crate::config::resolve_config_path(parse_args())?;
	let cfg = crate::config::load_bridge_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded bridge config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let codec = MediaIdCodec::new(cfg.media_proxy.hmac_secret.as_bytes());
	let store: Arc<dyn MediaStore> = Arc::new(WebDavClient::new(webdav_config(&cfg)).context("build webdav client")?);

	let bot = UserId::from_parts(&cfg.matrix.bot_localpart, &cfg.matrix.homeserver_domain).context("bridge bot user id")?;
	let client = AppserviceClient::new(
		cfg.matrix.homeserver_url.clone(),
		cfg.matrix.as_token.clone(),
		bot.clone(),
		HOMESERVER_REQUEST_TIMEOUT,
	)
	.context("build appservice client")?;
	client.ensure_registered().await.context("register bridge bot")?;
	let transport: Arc<dyn ChatTransport> = Arc::new(client);

	let lifecycle_cfg = LifecycleConfig {
		proxy_server_name: cfg.media_proxy.server_name.clone(),
		room_path_templates: cfg.matrix.room_path_templates.clone().into_iter().collect::<HashMap<_, _>>(),
		web_url: cfg.nextcloud.effective_web_url(),
		collision_limit: cfg.bridge.collision_limit,
	};
	let mut lifecycle = MediaLifecycle::new(lifecycle_cfg, codec.clone(), Arc::clone(&store), Arc::clone(&transport));
	if let Some(token) = cfg.matrix.admin.cleanup_token() {
		let cleaner = SynapseAdminCleaner::new(cfg.matrix.homeserver_url.clone(), token.clone(), ADMIN_REQUEST_TIMEOUT)
			.context("build synapse admin client")?;
		lifecycle = lifecycle.with_source_cleanup(Arc::new(cleaner));
		info!("source media cleanup via synapse admin api enabled");
	}

	let rooms = Arc::new(RoomManager::new(Arc::clone(&transport), cfg.matrix.configured_rooms()));
	info!(rooms = rooms.configured_rooms().len(), bot = %bot, "bridging configured rooms");

	let handler = Arc::new(BridgeEventHandler::new(Arc::new(lifecycle), Arc::clone(&rooms), bot.as_str()));
	let dispatcher = EventDispatcher::start(
		handler,
		DispatcherConfig {
			max_concurrent_events: cfg.bridge.max_concurrent_events,
			queue_capacity: cfg.bridge.event_queue_capacity,
		},
	);

	let health = HealthState::new();
	let proxy_listener = TcpListener::bind((cfg.media_proxy.listen_address.as_str(), cfg.media_proxy.listen_port))
		.await
		.context("bind media proxy listener")?;
	info!(addr = %proxy_listener.local_addr()?, "media proxy listening");
	let proxy_state = ProxyState {
		resolver: MediaProxyResolver::new(codec, Arc::clone(&store)),
		server_name: Arc::from(cfg.media_proxy.server_name.as_str()),
		health: health.clone(),
	};
	let proxy_task = tokio::spawn(async move {
		if let Err(e) = serve_media_proxy(proxy_listener, proxy_state).await {
			warn!(error = %e, "media proxy stopped");
		}
	});

	let appservice_listener = TcpListener::bind((cfg.matrix.appservice.hostname.as_str(), cfg.matrix.appservice.port))
		.await
		.context("bind appservice listener")?;
	info!(addr = %appservice_listener.local_addr()?, "appservice listener ready");
	let appservice_state = AppserviceState::new(cfg.matrix.hs_token.clone(), dispatcher.sender());
	let intake = appservice_state.shutdown_handle();
	let mut appservice_task = tokio::spawn(async move {
		if let Err(e) = serve_appservice(appservice_listener, appservice_state).await {
			warn!(error = %e, "appservice listener stopped");
		}
	});

	let room_task = Arc::clone(&rooms).spawn(RoomManagerConfig {
		initial_join_delay: cfg.matrix.initial_join_delay,
		monitor_interval: cfg.matrix.room_monitor_interval,
	});

	health.mark_ready();
	info!("bridge ready");

	tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
	info!("shutting down");

	// Unacknowledged transactions are redelivered by the homeserver after restart.
	intake.trigger();
	room_task.abort();
	proxy_task.abort();
	if tokio::time::timeout(SHUTDOWN_GRACE, &mut appservice_task).await.is_err() {
		warn!("appservice connections still open at shutdown");
		appservice_task.abort();
	}
	if tokio::time::timeout(SHUTDOWN_GRACE, dispatcher.shutdown()).await.is_err() {
		warn!("in-flight events abandoned at shutdown");
	}

	Ok(())
}
