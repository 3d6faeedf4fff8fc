#![forbid(unsafe_code)]

use palaver_domain::ConnId;
use palaver_domain::event::{ClientEvent, ServerEvent};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::server::engine::Engine;

/// Per-connection transport settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	/// Capacity of the outbound event queue. Events beyond this are dropped
	/// for the slow connection only.
	pub outbound_queue_capacity: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			outbound_queue_capacity: 256,
		}
	}
}

/// Drive one client connection: newline-delimited JSON events in, fanned-out
/// events from the engine back out. Returns once the peer is gone and the
/// engine has cleaned up every piece of state the connection owned.
pub async fn handle_connection(
	engine: Engine,
	stream: TcpStream,
	conn: ConnId,
	settings: ConnectionSettings,
) {
	let (read_half, write_half) = stream.into_split();
	let (tx, rx) = mpsc::channel::<ServerEvent>(settings.outbound_queue_capacity);
	engine.register_conn(conn, tx).await;

	let writer = tokio::spawn(write_outbound(write_half, rx));

	let mut lines = BufReader::new(read_half).lines();
	loop {
		match lines.next_line().await {
			Ok(Some(line)) => {
				let line = line.trim();
				if line.is_empty() {
					continue;
				}
				match serde_json::from_str::<ClientEvent>(line) {
					Ok(event) => engine.handle_event(conn, event).await,
					Err(e) => {
						metrics::counter!("palaver_server_bad_events_total").increment(1);
						debug!(conn = conn.0, error = %e, "unparseable client event; ignoring");
					}
				}
			}
			Ok(None) => break,
			Err(e) => {
				debug!(conn = conn.0, error = %e, "read error; closing connection");
				break;
			}
		}
	}

	// Unregistering in the engine closes the outbound channel, so the writer
	// drains whatever was already queued (the Closed notice included) and
	// exits on its own.
	engine.handle_disconnect(conn).await;
	let _ = writer.await;
}

async fn write_outbound(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<ServerEvent>) {
	while let Some(event) = rx.recv().await {
		let mut frame = match serde_json::to_vec(&event) {
			Ok(bytes) => bytes,
			Err(e) => {
				warn!(error = %e, "failed to encode outbound event; skipping");
				continue;
			}
		};
		frame.push(b'\n');

		if write_half.write_all(&frame).await.is_err() {
			break;
		}
	}
}
