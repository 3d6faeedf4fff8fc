#![forbid(unsafe_code)]

use std::collections::HashMap;

use palaver_domain::ConnId;
use palaver_domain::event::ServerEvent;
use tokio::sync::mpsc;
use tracing::debug;

/// Registry of per-connection outbound channels.
///
/// Sends are non-blocking: a full subscriber queue drops the event for that
/// connection only, and closed channels are pruned on the next delivery.
#[derive(Debug, Default)]
pub struct Fanout {
	senders: HashMap<ConnId, mpsc::Sender<ServerEvent>>,
}

impl Fanout {
	pub fn register(&mut self, conn: ConnId, tx: mpsc::Sender<ServerEvent>) {
		self.senders.insert(conn, tx);
	}

	pub fn unregister(&mut self, conn: ConnId) {
		self.senders.remove(&conn);
	}

	/// Deliver an event to a single connection.
	pub fn send(&mut self, conn: ConnId, event: ServerEvent) {
		let Some(tx) = self.senders.get(&conn) else {
			return;
		};

		match tx.try_send(event) {
			Ok(()) => {}
			Err(mpsc::error::TrySendError::Full(_)) => {
				metrics::counter!("palaver_server_fanout_dropped_total").increment(1);
				debug!(conn = conn.0, "outbound queue full; dropping event");
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {
				self.senders.remove(&conn);
			}
		}
	}

	/// Deliver the same event to every listed connection.
	pub fn send_all<I>(&mut self, conns: I, event: &ServerEvent)
	where
		I: IntoIterator<Item = ConnId>,
	{
		for conn in conns {
			self.send(conn, event.clone());
		}
	}

	pub fn is_registered(&self, conn: ConnId) -> bool {
		self.senders.contains_key(&conn)
	}
}
