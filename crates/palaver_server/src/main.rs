#![forbid(unsafe_code)]

mod config;
mod server;

use std::net::SocketAddr;
use std::sync::Arc;

use palaver_domain::ConnId;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::engine::{Engine, EngineConfig};
use crate::server::reply::{CannedReplyProvider, HttpReplyConfig, HttpReplyProvider, ReplyDelay, ReplyProvider};
use crate::server::store::{ConversationStore, InMemoryStore, SqliteStore, spawn_store_writer};

const DEFAULT_BIND: &str = "127.0.0.1:7600";
const DEFAULT_REPLY_API_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_REPLY_MODEL: &str = "gemini-2.0-flash";

/// Capacity of the serialized durable-write queue.
const STORE_QUEUE_CAPACITY: usize = 4096;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: palaver_server [--bind host:port]\n\
\n\
Options:\n\
\t--bind    Bind address (default: {DEFAULT_BIND})\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind = DEFAULT_BIND.to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				bind = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind.parse().unwrap_or_else(|e| {
		eprintln!("invalid bind address {bind:?}: {e}");
		usage_and_exit();
	})
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,palaver_server=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_addr = parse_args();

	let config_path = crate::config::default_config_path()?;
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let store: Arc<dyn ConversationStore> = if server_cfg.persistence.enabled {
		let Some(database_url) = server_cfg.persistence.database_url.as_deref() else {
			return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
		};
		info!("persistence: sqlite conversation mirror enabled");
		Arc::new(SqliteStore::connect(database_url).await?)
	} else {
		warn!("persistence disabled; conversations will not survive a restart");
		Arc::new(InMemoryStore::default())
	};

	let provider: Arc<dyn ReplyProvider> = match server_cfg.reply.api_key.clone() {
		Some(api_key) => {
			let cfg = HttpReplyConfig {
				api_url: server_cfg
					.reply
					.api_url
					.clone()
					.unwrap_or_else(|| DEFAULT_REPLY_API_URL.to_string()),
				api_key,
				model: server_cfg.reply.model.clone().unwrap_or_else(|| DEFAULT_REPLY_MODEL.to_string()),
			};
			info!(model = %cfg.model, "reply provider: http generateContent");
			Arc::new(HttpReplyProvider::new(cfg))
		}
		None => {
			warn!("reply config: no api_key; substitute chats use canned replies");
			Arc::new(CannedReplyProvider::default())
		}
	};

	let default_delay = ReplyDelay::default();
	let reply_delay = ReplyDelay::new(
		server_cfg.reply.min_delay.unwrap_or(default_delay.min),
		server_cfg.reply.max_delay.unwrap_or(default_delay.max),
	);

	let mut engine_cfg = EngineConfig {
		reply_delay,
		..EngineConfig::default()
	};
	if let Some(min) = server_cfg.spy.min_messages {
		engine_cfg.spy_min_messages = min;
	}

	let writer = spawn_store_writer(Arc::clone(&store), STORE_QUEUE_CAPACITY);
	let engine = Engine::new(store, writer, provider, engine_cfg);

	let conn_settings = ConnectionSettings {
		outbound_queue_capacity: server_cfg
			.server
			.outbound_queue_capacity
			.unwrap_or_else(|| ConnectionSettings::default().outbound_queue_capacity),
	};

	let listener = TcpListener::bind(bind_addr).await?;
	info!(bind = %bind_addr, "palaver_server: listening");

	let mut next_conn_id: u64 = 1;

	loop {
		let (stream, remote) = listener.accept().await?;

		let conn = ConnId(next_conn_id);
		next_conn_id += 1;
		metrics::counter!("palaver_server_connections_total").increment(1);
		info!(conn = conn.0, remote = %remote, "accepted connection");

		let engine = engine.clone();
		let conn_settings = conn_settings.clone();
		tokio::spawn(async move {
			handle_connection(engine, stream, conn, conn_settings).await;
		});
	}
}
