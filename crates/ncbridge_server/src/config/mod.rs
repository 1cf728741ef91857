#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use ncbridge_domain::{RoomId, SecretString};
use ncbridge_media::DEFAULT_COLLISION_LIMIT;
use serde::Deserialize;
use tracing::info;

/// Env var naming the config file when `--config` is absent.
pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

/// Default config path: `~/.ncbridge/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".ncbridge").join("config.toml"))
}

/// `--config`, then `CONFIG_PATH`, then the default location.
pub fn resolve_config_path(cli: Option<PathBuf>) -> anyhow::Result<PathBuf> {
	if let Some(path) = cli {
		return Ok(path);
	}
	if let Ok(v) = std::env::var(CONFIG_PATH_ENV) {
		let v = v.trim();
		if !v.is_empty() {
			return Ok(PathBuf::from(v));
		}
	}
	default_config_path()
}

/// Load the bridge config from TOML and env overrides, then validate it.
pub fn load_bridge_config_from_path(path: &Path) -> anyhow::Result<BridgeConfig> {
	let env = |key: &str| std::env::var(key).ok();

	let file_cfg = read_toml_if_exists(path, &env)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = BridgeConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg, &env);
	cfg.validate()?;

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
	pub nextcloud: NextcloudSettings,
	pub matrix: MatrixSettings,
	pub media_proxy: MediaProxySettings,
	pub bridge: BridgeSettings,
	pub server: ServerSettings,
}

#[derive(Debug, Clone, Default)]
pub struct NextcloudSettings {
	/// WebDAV root files are stored under.
	pub base_url: String,
	/// Web UI base for deep links.
	pub web_url: Option<String>,
	pub disable_web_link: bool,
	pub username: String,
	pub password: SecretString,
	pub request_timeout: Duration,
	pub connect_timeout: Duration,
	pub pool_max_idle_per_host: usize,
	pub pool_idle_timeout: Duration,
}

impl NextcloudSettings {
	/// Web link base, unless links are disabled.
	pub fn effective_web_url(&self) -> Option<String> {
		if self.disable_web_link {
			return None;
		}
		self.web_url.clone()
	}
}

#[derive(Debug, Clone, Default)]
pub struct MatrixSettings {
	pub homeserver_url: String,
	pub homeserver_domain: String,
	pub as_token: SecretString,
	pub hs_token: SecretString,
	pub bot_localpart: String,
	/// Room id -> storage path template.
	pub room_path_templates: BTreeMap<String, String>,
	pub room_monitor_interval: Duration,
	pub initial_join_delay: Duration,
	pub appservice: AppserviceSettings,
	pub admin: AdminSettings,
}

impl MatrixSettings {
	/// Rooms with a configured template, in a stable order.
	pub fn configured_rooms(&self) -> Vec<RoomId> {
		self.room_path_templates
			.keys()
			.filter_map(|room| RoomId::new(room.as_str()).ok())
			.collect()
	}
}

#[derive(Debug, Clone, Default)]
pub struct AppserviceSettings {
	pub hostname: String,
	pub port: u16,
}

/// Synapse admin API access, used to delete the homeserver copy of bridged media.
#[derive(Debug, Clone, Default)]
pub struct AdminSettings {
	pub enabled: bool,
	pub access_token: Option<SecretString>,
}

impl AdminSettings {
	/// Token for source media cleanup. `None` while cleanup is disabled.
	///
	/// Enabling cleanup without a token fails [`BridgeConfig::validate`].
	pub fn cleanup_token(&self) -> Option<&SecretString> {
		self.access_token.as_ref().filter(|_| self.enabled)
	}
}

#[derive(Debug, Clone, Default)]
pub struct MediaProxySettings {
	pub server_name: String,
	pub hmac_secret: SecretString,
	pub listen_address: String,
	pub listen_port: u16,
}

#[derive(Debug, Clone, Default)]
pub struct BridgeSettings {
	pub max_concurrent_events: usize,
	pub collision_limit: u32,
	pub event_queue_capacity: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	nextcloud: FileNextcloudSettings,
	#[serde(default)]
	matrix: FileMatrixSettings,
	#[serde(default)]
	media_proxy: FileMediaProxySettings,
	#[serde(default)]
	bridge: FileBridgeSettings,
	#[serde(default)]
	server: FileServerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileNextcloudSettings {
	base_url: Option<String>,
	web_url: Option<String>,
	disable_web_link: Option<bool>,
	username: Option<String>,
	password: Option<String>,
	request_timeout_secs: Option<u64>,
	connect_timeout_secs: Option<u64>,
	pool_max_idle_per_host: Option<usize>,
	pool_idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileMatrixSettings {
	homeserver_url: Option<String>,
	homeserver_domain: Option<String>,
	as_token: Option<String>,
	hs_token: Option<String>,
	bot_localpart: Option<String>,
	#[serde(default)]
	room_path_template: BTreeMap<String, String>,
	room_monitor_interval_secs: Option<u64>,
	initial_join_delay_secs: Option<u64>,
	#[serde(default)]
	appservice: FileAppserviceSettings,
	#[serde(default)]
	admin: FileAdminSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAppserviceSettings {
	hostname: Option<String>,
	port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAdminSettings {
	enabled: Option<bool>,
	access_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileMediaProxySettings {
	server_name: Option<String>,
	hmac_secret: Option<String>,
	listen_address: Option<String>,
	listen_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBridgeSettings {
	max_concurrent_events: Option<usize>,
	collision_limit: Option<u32>,
	event_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl BridgeConfig {
	fn from_file(file: FileConfig) -> Self {
		let nextcloud = NextcloudSettings {
			base_url: non_empty(file.nextcloud.base_url).unwrap_or_default(),
			web_url: non_empty(file.nextcloud.web_url),
			disable_web_link: file.nextcloud.disable_web_link.unwrap_or(false),
			username: non_empty(file.nextcloud.username).unwrap_or_default(),
			password: SecretString::new(file.nextcloud.password.unwrap_or_default()),
			request_timeout: Duration::from_secs(file.nextcloud.request_timeout_secs.unwrap_or(600)),
			connect_timeout: Duration::from_secs(file.nextcloud.connect_timeout_secs.unwrap_or(30)),
			pool_max_idle_per_host: file.nextcloud.pool_max_idle_per_host.unwrap_or(10),
			pool_idle_timeout: Duration::from_secs(file.nextcloud.pool_idle_timeout_secs.unwrap_or(90)),
		};

		let matrix = MatrixSettings {
			homeserver_url: non_empty(file.matrix.homeserver_url).unwrap_or_default(),
			homeserver_domain: non_empty(file.matrix.homeserver_domain).unwrap_or_default(),
			as_token: SecretString::new(non_empty(file.matrix.as_token).unwrap_or_default()),
			hs_token: SecretString::new(non_empty(file.matrix.hs_token).unwrap_or_default()),
			bot_localpart: non_empty(file.matrix.bot_localpart).unwrap_or_else(|| "nextcloudbot".to_string()),
			room_path_templates: file
				.matrix
				.room_path_template
				.into_iter()
				.map(|(room, template)| (room.trim().to_string(), template))
				.collect(),
			room_monitor_interval: Duration::from_secs(file.matrix.room_monitor_interval_secs.unwrap_or(300)),
			initial_join_delay: Duration::from_secs(file.matrix.initial_join_delay_secs.unwrap_or(2)),
			appservice: AppserviceSettings {
				hostname: non_empty(file.matrix.appservice.hostname).unwrap_or_else(|| "0.0.0.0".to_string()),
				port: file.matrix.appservice.port.unwrap_or(29334),
			},
			admin: AdminSettings {
				enabled: file.matrix.admin.enabled.unwrap_or(false),
				access_token: non_empty(file.matrix.admin.access_token).map(SecretString::new),
			},
		};

		let media_proxy = MediaProxySettings {
			server_name: non_empty(file.media_proxy.server_name).unwrap_or_default(),
			hmac_secret: SecretString::new(non_empty(file.media_proxy.hmac_secret).unwrap_or_default()),
			listen_address: non_empty(file.media_proxy.listen_address).unwrap_or_else(|| "0.0.0.0".to_string()),
			listen_port: file.media_proxy.listen_port.unwrap_or(29336),
		};

		Self {
			nextcloud,
			matrix,
			media_proxy,
			bridge: BridgeSettings {
				max_concurrent_events: file.bridge.max_concurrent_events.unwrap_or(10),
				collision_limit: file.bridge.collision_limit.unwrap_or(DEFAULT_COLLISION_LIMIT),
				event_queue_capacity: file.bridge.event_queue_capacity.unwrap_or(1_024),
			},
			server: ServerSettings {
				metrics_bind: non_empty(file.server.metrics_bind),
			},
		}
	}

	/// Reject configs the bridge cannot start with.
	pub fn validate(&self) -> anyhow::Result<()> {
		let mut missing = Vec::new();
		if self.nextcloud.base_url.is_empty() {
			missing.push("nextcloud.base_url");
		}
		if self.matrix.homeserver_url.is_empty() {
			missing.push("matrix.homeserver_url");
		}
		if self.matrix.homeserver_domain.is_empty() {
			missing.push("matrix.homeserver_domain");
		}
		if self.matrix.as_token.is_empty() {
			missing.push("matrix.as_token");
		}
		if self.matrix.hs_token.is_empty() {
			missing.push("matrix.hs_token");
		}
		if self.media_proxy.server_name.is_empty() {
			missing.push("media_proxy.server_name");
		}
		if self.media_proxy.hmac_secret.is_empty() {
			missing.push("media_proxy.hmac_secret");
		}
		if self.matrix.admin.enabled && self.matrix.admin.access_token.is_none() {
			missing.push("matrix.admin.access_token");
		}
		if !missing.is_empty() {
			return Err(anyhow!("missing required config: {}", missing.join(", ")));
		}

		if self.bridge.max_concurrent_events == 0 {
			return Err(anyhow!("bridge.max_concurrent_events must be at least 1"));
		}
		if self.bridge.collision_limit == 0 {
			return Err(anyhow!("bridge.collision_limit must be at least 1"));
		}
		if let Some(room) = self.matrix.room_path_templates.keys().find(|room| RoomId::new(room.as_str()).is_err()) {
			return Err(anyhow!("matrix.room_path_template has an invalid room id {room:?}"));
		}
		Ok(())
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

/// Replace `${NAME}` with the env value when NAME looks like an env var and is set.
///
/// Anything else, including lower-case template placeholders such as `${year}`,
/// is kept verbatim.
fn expand_env(raw: &str, env: &dyn Fn(&str) -> Option<String>) -> String {
	let mut out = String::with_capacity(raw.len());
	let mut rest = raw;
	while let Some(start) = rest.find("${") {
		out.push_str(&rest[..start]);
		let after = &rest[start + 2..];
		let Some(end) = after.find('}') else {
			out.push_str(&rest[start..]);
			return out;
		};
		let name = &after[..end];
		match env_var_name(name).then(|| env(name)).flatten() {
			Some(value) => out.push_str(&value),
			None => out.push_str(&rest[start..start + 2 + end + 1]),
		}
		rest = &after[end + 1..];
	}
	out.push_str(rest);
	out
}

fn env_var_name(name: &str) -> bool {
	let mut chars = name.chars();
	matches!(chars.next(), Some(c) if c.is_ascii_uppercase() || c == '_')
		&& chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

fn read_toml_if_exists(path: &Path, env: &dyn Fn(&str) -> Option<String>) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&expand_env(&s, env)).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

/// `room=template,room2=template2`.
fn parse_room_templates(v: &str) -> BTreeMap<String, String> {
	v.split(',')
		.filter_map(|pair| pair.split_once('='))
		.map(|(room, template)| (room.trim().to_string(), template.trim().to_string()))
		.filter(|(room, template)| !room.is_empty() && !template.is_empty())
		.collect()
}

fn apply_env_overrides(cfg: &mut BridgeConfig, env: &dyn Fn(&str) -> Option<String>) {
	let text = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = text("NEXTCLOUD_BASE_URL") {
		cfg.nextcloud.base_url = v;
		info!("nextcloud config: base_url overridden by env");
	}

	if let Some(v) = text("NEXTCLOUD_WEB_URL") {
		cfg.nextcloud.web_url = Some(v);
		info!("nextcloud config: web_url overridden by env");
	}

	if let Some(disable) = text("NEXTCLOUD_DISABLE_WEB_LINK").as_deref().and_then(parse_env_bool) {
		cfg.nextcloud.disable_web_link = disable;
		info!(disable, "nextcloud config: disable_web_link overridden by env");
	}

	if let Some(v) = text("NEXTCLOUD_USERNAME") {
		cfg.nextcloud.username = v;
		info!("nextcloud config: username overridden by env");
	}

	if let Some(v) = text("NEXTCLOUD_PASSWORD") {
		cfg.nextcloud.password = SecretString::new(v);
		info!("nextcloud config: password overridden by env");
	}

	if let Some(v) = text("MATRIX_HOMESERVER_URL") {
		cfg.matrix.homeserver_url = v;
		info!("matrix config: homeserver_url overridden by env");
	}

	if let Some(v) = text("MATRIX_HOMESERVER_DOMAIN") {
		cfg.matrix.homeserver_domain = v;
		info!("matrix config: homeserver_domain overridden by env");
	}

	if let Some(v) = text("MATRIX_AS_TOKEN") {
		cfg.matrix.as_token = SecretString::new(v);
		info!("matrix config: as_token overridden by env");
	}

	if let Some(v) = text("MATRIX_HS_TOKEN") {
		cfg.matrix.hs_token = SecretString::new(v);
		info!("matrix config: hs_token overridden by env");
	}

	if let Some(v) = text("MATRIX_BOT_LOCALPART") {
		cfg.matrix.bot_localpart = v;
		info!("matrix config: bot_localpart overridden by env");
	}

	if let Some(v) = text("MATRIX_ROOM_PATH_TEMPLATE") {
		let templates = parse_room_templates(&v);
		info!(rooms = templates.len(), "matrix config: room_path_template overridden by env");
		cfg.matrix.room_path_templates = templates;
	}

	if let Some(v) = text("MATRIX_APP_HOST") {
		cfg.matrix.appservice.hostname = v;
		info!("matrix config: appservice hostname overridden by env");
	}

	if let Some(port) = text("MATRIX_APP_PORT").and_then(|v| v.parse::<u16>().ok()) {
		cfg.matrix.appservice.port = port;
		info!(port, "matrix config: appservice port overridden by env");
	}

	if let Some(enabled) = text("MATRIX_ADMIN_ENABLED").as_deref().and_then(parse_env_bool) {
		cfg.matrix.admin.enabled = enabled;
		info!(enabled, "matrix config: admin enabled overridden by env");
	}

	if let Some(v) = text("MATRIX_ADMIN_ACCESS_TOKEN") {
		cfg.matrix.admin.access_token = Some(SecretString::new(v));
		info!("matrix config: admin access_token overridden by env");
	}

	if let Some(v) = text("MEDIA_PROXY_SERVER_NAME") {
		cfg.media_proxy.server_name = v;
		info!("media proxy config: server_name overridden by env");
	}

	if let Some(v) = text("MEDIA_PROXY_HMAC_SECRET") {
		cfg.media_proxy.hmac_secret = SecretString::new(v);
		info!("media proxy config: hmac_secret overridden by env");
	}

	if let Some(v) = text("MEDIA_PROXY_LISTEN_ADDRESS") {
		cfg.media_proxy.listen_address = v;
		info!("media proxy config: listen_address overridden by env");
	}

	if let Some(port) = text("MEDIA_PROXY_LISTEN_PORT").and_then(|v| v.parse::<u16>().ok()) {
		cfg.media_proxy.listen_port = port;
		info!(port, "media proxy config: listen_port overridden by env");
	}

	if let Some(limit) = text("BRIDGE_MAX_CONCURRENT_EVENTS").and_then(|v| v.parse::<usize>().ok()) {
		cfg.bridge.max_concurrent_events = limit;
		info!(limit, "bridge config: max_concurrent_events overridden by env");
	}

	if let Some(limit) = text("BRIDGE_COLLISION_LIMIT").and_then(|v| v.parse::<u32>().ok()) {
		cfg.bridge.collision_limit = limit;
		info!(limit, "bridge config: collision_limit overridden by env");
	}

	if let Some(v) = text("BRIDGE_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}
}
