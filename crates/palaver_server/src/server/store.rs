#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use palaver_domain::{ChatLine, Participant, RoomId};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};

use crate::server::state::Room;

/// Creation payload for a conversation record.
#[derive(Debug, Clone)]
pub struct NewConversation {
	pub room_id: RoomId,
	pub participants: Vec<Participant>,
	pub is_substitute_chat: bool,
}

impl NewConversation {
	pub fn from_room(room: &Room) -> Self {
		Self {
			room_id: room.id.clone(),
			participants: room.participants.to_vec(),
			is_substitute_chat: room.is_substitute_chat,
		}
	}
}

/// Durable mirror of live rooms.
///
/// The live room is authoritative for reads during fan-out; the store is
/// authoritative for the spy eligibility query and survives restarts. Every
/// method is best-effort from the engine's point of view: failures are
/// logged by the caller and never block the in-memory path.
#[async_trait]
pub trait ConversationStore: Send + Sync {
	async fn create(&self, conversation: &NewConversation) -> anyhow::Result<()>;

	async fn append_message(&self, room_id: &RoomId, line: &ChatLine) -> anyhow::Result<()>;

	/// Adjust the like counter by `delta`.
	async fn add_likes(&self, room_id: &RoomId, delta: i64) -> anyhow::Result<()>;

	/// Adjust the spy counter by `delta`, floored at zero.
	async fn add_spies(&self, room_id: &RoomId, delta: i64) -> anyhow::Result<()>;

	async fn set_inactive(&self, room_id: &RoomId) -> anyhow::Result<()>;

	/// Room ids of active conversations with at least `min_messages` stored
	/// messages. Records whose room no longer lives in memory may appear
	/// here; the caller filters them out.
	async fn eligible_rooms(&self, min_messages: u32) -> anyhow::Result<Vec<RoomId>>;
}

/// Stored shape of one conversation, used by the in-memory backend.
#[derive(Debug, Clone, Default)]
pub struct StoredConversation {
	pub participants: Vec<Participant>,
	pub messages: Vec<ChatLine>,
	pub likes: i64,
	pub spy_count: i64,
	pub is_active: bool,
	pub is_substitute_chat: bool,
}

/// In-memory store backend, used in tests and when persistence is disabled.
#[derive(Debug, Default)]
pub struct InMemoryStore {
	inner: Mutex<HashMap<RoomId, StoredConversation>>,
}

impl InMemoryStore {
	/// Snapshot of one stored conversation.
	pub async fn conversation(&self, room_id: &RoomId) -> Option<StoredConversation> {
		self.inner.lock().await.get(room_id).cloned()
	}
}

#[async_trait]
impl ConversationStore for InMemoryStore {
	async fn create(&self, conversation: &NewConversation) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		guard.insert(
			conversation.room_id.clone(),
			StoredConversation {
				participants: conversation.participants.clone(),
				messages: Vec::new(),
				likes: 0,
				spy_count: 0,
				is_active: true,
				is_substitute_chat: conversation.is_substitute_chat,
			},
		);
		Ok(())
	}

	async fn append_message(&self, room_id: &RoomId, line: &ChatLine) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		if let Some(c) = guard.get_mut(room_id) {
			c.messages.push(line.clone());
		}
		Ok(())
	}

	async fn add_likes(&self, room_id: &RoomId, delta: i64) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		if let Some(c) = guard.get_mut(room_id) {
			c.likes = (c.likes + delta).max(0);
		}
		Ok(())
	}

	async fn add_spies(&self, room_id: &RoomId, delta: i64) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		if let Some(c) = guard.get_mut(room_id) {
			c.spy_count = (c.spy_count + delta).max(0);
		}
		Ok(())
	}

	async fn set_inactive(&self, room_id: &RoomId) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		if let Some(c) = guard.get_mut(room_id) {
			c.is_active = false;
		}
		Ok(())
	}

	async fn eligible_rooms(&self, min_messages: u32) -> anyhow::Result<Vec<RoomId>> {
		let guard = self.inner.lock().await;
		Ok(guard
			.iter()
			.filter(|(_, c)| c.is_active && c.messages.len() >= min_messages as usize)
			.map(|(id, _)| id.clone())
			.collect())
	}
}

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
	pool: sqlx::SqlitePool,
}

impl SqliteStore {
	/// Connect and run migrations.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let pool = SqlitePoolOptions::new()
			.max_connections(16)
			.connect(database_url)
			.await
			.context("connect sqlite")?;
		Self::from_pool(pool).await
	}

	/// Build a store from an existing pool, running migrations.
	pub async fn from_pool(pool: sqlx::SqlitePool) -> anyhow::Result<Self> {
		sqlx::migrate!("./migrations").run(&pool).await.context("run migrations")?;
		Ok(Self { pool })
	}

	#[cfg(test)]
	pub(crate) fn pool(&self) -> &sqlx::SqlitePool {
		&self.pool
	}
}

#[async_trait]
impl ConversationStore for SqliteStore {
	async fn create(&self, conversation: &NewConversation) -> anyhow::Result<()> {
		let mut tx = self.pool.begin().await.context("begin tx")?;

		sqlx::query(
			"INSERT INTO conversations (room_id, is_active, is_substitute_chat, likes, spy_count, created_at) \
			VALUES (?, 1, ?, 0, 0, strftime('%s','now'))",
		)
		.bind(conversation.room_id.as_str())
		.bind(conversation.is_substitute_chat)
		.execute(&mut *tx)
		.await
		.context("insert conversation")?;

		for p in &conversation.participants {
			sqlx::query(
				"INSERT INTO conversation_participants (room_id, nick, gender, is_substitute) VALUES (?, ?, ?, ?)",
			)
			.bind(conversation.room_id.as_str())
			.bind(&p.nick)
			.bind(p.gender.as_str())
			.bind(p.is_substitute)
			.execute(&mut *tx)
			.await
			.context("insert participant")?;
		}

		tx.commit().await.context("commit tx")?;
		Ok(())
	}

	async fn append_message(&self, room_id: &RoomId, line: &ChatLine) -> anyhow::Result<()> {
		sqlx::query("INSERT INTO conversation_messages (room_id, nick, text, sent_at) VALUES (?, ?, ?, ?)")
			.bind(room_id.as_str())
			.bind(&line.nick)
			.bind(&line.text)
			.bind(line.sent_at.to_rfc3339())
			.execute(&self.pool)
			.await
			.context("insert message")?;
		Ok(())
	}

	async fn add_likes(&self, room_id: &RoomId, delta: i64) -> anyhow::Result<()> {
		sqlx::query("UPDATE conversations SET likes = MAX(0, likes + ?) WHERE room_id = ?")
			.bind(delta)
			.bind(room_id.as_str())
			.execute(&self.pool)
			.await
			.context("update likes")?;
		Ok(())
	}

	async fn add_spies(&self, room_id: &RoomId, delta: i64) -> anyhow::Result<()> {
		sqlx::query("UPDATE conversations SET spy_count = MAX(0, spy_count + ?) WHERE room_id = ?")
			.bind(delta)
			.bind(room_id.as_str())
			.execute(&self.pool)
			.await
			.context("update spy_count")?;
		Ok(())
	}

	async fn set_inactive(&self, room_id: &RoomId) -> anyhow::Result<()> {
		sqlx::query("UPDATE conversations SET is_active = 0 WHERE room_id = ?")
			.bind(room_id.as_str())
			.execute(&self.pool)
			.await
			.context("set inactive")?;
		Ok(())
	}

	async fn eligible_rooms(&self, min_messages: u32) -> anyhow::Result<Vec<RoomId>> {
		let rows: Vec<(String,)> = sqlx::query_as(
			"SELECT c.room_id FROM conversations c \
			WHERE c.is_active = 1 \
			AND (SELECT COUNT(*) FROM conversation_messages m WHERE m.room_id = c.room_id) >= ?",
		)
		.bind(min_messages as i64)
		.fetch_all(&self.pool)
		.await
		.context("select eligible rooms")?;

		let mut ids = Vec::with_capacity(rows.len());
		for (id,) in rows {
			ids.push(RoomId::new(id).context("invalid stored room id")?);
		}
		Ok(ids)
	}
}

/// A queued durable write.
#[derive(Debug)]
pub enum StoreJob {
	Create(NewConversation),
	AppendMessage { room_id: RoomId, line: ChatLine },
	AddLikes { room_id: RoomId, delta: i64 },
	AddSpies { room_id: RoomId, delta: i64 },
	SetInactive { room_id: RoomId },
	Flush(oneshot::Sender<()>),
}

/// Handle to the serialized durable-write queue.
///
/// All mirror writes for all rooms flow through one FIFO queue, so writes
/// for any single room can never reorder even when near-simultaneous events
/// arrive from both participants. Failures are logged and absorbed; the
/// in-memory state stays authoritative.
#[derive(Debug, Clone)]
pub struct StoreWriter {
	tx: mpsc::Sender<StoreJob>,
}

impl StoreWriter {
	pub fn submit(&self, job: StoreJob) {
		if self.tx.try_send(job).is_err() {
			metrics::counter!("palaver_server_store_jobs_dropped_total").increment(1);
			warn!("store write queue full or closed; dropping durable write");
		}
	}

	/// Wait for every previously submitted job to complete. Used by tests
	/// and at shutdown.
	pub async fn flush(&self) {
		let (tx, rx) = oneshot::channel();
		if self.tx.send(StoreJob::Flush(tx)).await.is_ok() {
			let _ = rx.await;
		}
	}
}

/// Spawn the write-queue worker.
pub fn spawn_store_writer(store: Arc<dyn ConversationStore>, queue_capacity: usize) -> StoreWriter {
	let (tx, mut rx) = mpsc::channel::<StoreJob>(queue_capacity);

	tokio::spawn(async move {
		while let Some(job) = rx.recv().await {
			let result = match job {
				StoreJob::Create(conversation) => store.create(&conversation).await,
				StoreJob::AppendMessage { room_id, line } => store.append_message(&room_id, &line).await,
				StoreJob::AddLikes { room_id, delta } => store.add_likes(&room_id, delta).await,
				StoreJob::AddSpies { room_id, delta } => store.add_spies(&room_id, delta).await,
				StoreJob::SetInactive { room_id } => store.set_inactive(&room_id).await,
				StoreJob::Flush(done) => {
					let _ = done.send(());
					continue;
				}
			};

			if let Err(e) = result {
				metrics::counter!("palaver_server_store_errors_total").increment(1);
				warn!(error = %e, "durable mirror write failed; continuing with in-memory state");
			}
		}

		debug!("store writer exiting (queue closed)");
	});

	StoreWriter { tx }
}
