#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use palaver_domain::SecretString;
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.palaver/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".palaver").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
	pub reply: ReplySettings,
	pub spy: SpySettings,
}

/// Server settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Per-connection outbound queue capacity.
	pub outbound_queue_capacity: Option<usize>,
}

/// Persistence settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Enable the durable conversation mirror.
	pub enabled: bool,
	/// Database URL (sqlite:).
	pub database_url: Option<String>,
}

/// Substitute-reply provider settings.
#[derive(Debug, Clone, Default)]
pub struct ReplySettings {
	/// API base URL (optional override).
	pub api_url: Option<String>,
	/// Provider API key. Without one, canned replies are used.
	pub api_key: Option<SecretString>,
	/// Model name (optional override).
	pub model: Option<String>,
	/// Reply delay bounds (optional).
	pub min_delay: Option<Duration>,
	pub max_delay: Option<Duration>,
}

/// Spy-mode settings.
#[derive(Debug, Clone, Default)]
pub struct SpySettings {
	/// Minimum stored message count before a room can be observed.
	pub min_messages: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	reply: FileReplySettings,

	#[serde(default)]
	spy: FileSpySettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	outbound_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileReplySettings {
	api_url: Option<String>,
	api_key: Option<String>,
	model: Option<String>,
	min_delay_ms: Option<u64>,
	max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSpySettings {
	min_messages: Option<u32>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				outbound_queue_capacity: file.server.outbound_queue_capacity.filter(|v| *v > 0),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
			reply: ReplySettings {
				api_url: file.reply.api_url.filter(|s| !s.trim().is_empty()),
				api_key: file.reply.api_key.filter(|s| !s.trim().is_empty()).map(SecretString::new),
				model: file.reply.model.filter(|s| !s.trim().is_empty()),
				min_delay: file.reply.min_delay_ms.map(Duration::from_millis),
				max_delay: file.reply.max_delay_ms.map(Duration::from_millis),
			},
			spy: SpySettings {
				min_messages: file.spy.min_messages,
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("PALAVER_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PALAVER_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.server.outbound_queue_capacity = Some(capacity);
		info!(capacity, "server config: outbound_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("PALAVER_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("PALAVER_PERSISTENCE_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PALAVER_REPLY_API_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.reply.api_url = Some(v);
			info!("reply config: api_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PALAVER_REPLY_API_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.reply.api_key = Some(SecretString::new(v));
			info!("reply config: api_key overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PALAVER_REPLY_MODEL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.reply.model = Some(v);
			info!("reply config: model overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PALAVER_REPLY_MIN_DELAY_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.reply.min_delay = Some(Duration::from_millis(ms));
		info!(ms, "reply config: min_delay overridden by env");
	}

	if let Ok(v) = std::env::var("PALAVER_REPLY_MAX_DELAY_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.reply.max_delay = Some(Duration::from_millis(ms));
		info!(ms, "reply config: max_delay overridden by env");
	}

	if let Ok(v) = std::env::var("PALAVER_SPY_MIN_MESSAGES")
		&& let Ok(min) = v.trim().parse::<u32>()
	{
		cfg.spy.min_messages = Some(min);
		info!(min, "spy config: min_messages overridden by env");
	}
}
