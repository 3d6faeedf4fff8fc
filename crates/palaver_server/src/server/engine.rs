#![forbid(unsafe_code)]

use std::sync::Arc;

use palaver_domain::event::{ClientEvent, ServerEvent};
use palaver_domain::{ChatLine, ConnId, Gender, Participant, RoomId};
use rand::seq::IndexedRandom;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::server::fanout::Fanout;
use crate::server::matchmaker;
use crate::server::reply::{FALLBACK_REPLY, HistoryEntry, ReplyDelay, ReplyProvider};
use crate::server::state::{Room, RoomStore, SpyRegistry, WaitingQueue};
use crate::server::store::{ConversationStore, NewConversation, StoreJob, StoreWriter};

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
	/// Minimum stored message count for a room to be offered to a spy.
	pub spy_min_messages: u32,
	pub reply_delay: ReplyDelay,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			spy_min_messages: 6,
			reply_delay: ReplyDelay::default(),
		}
	}
}

#[derive(Default)]
pub(crate) struct EngineState {
	pub(crate) rooms: RoomStore,
	pub(crate) queue: WaitingQueue,
	pub(crate) spies: SpyRegistry,
	pub(crate) fanout: Fanout,
}

/// Matchmaking, room lifecycle, and fan-out engine.
///
/// All shared state lives behind one mutex; every operation performs its
/// in-memory mutation and fan-out sends atomically and releases the lock
/// before any store or provider await, so an in-flight external call can
/// never observe or corrupt a half-applied transition. Durable writes flow
/// through the serialized [`StoreWriter`] queue.
#[derive(Clone)]
pub struct Engine {
	pub(crate) inner: Arc<Mutex<EngineState>>,
	store: Arc<dyn ConversationStore>,
	writer: StoreWriter,
	provider: Arc<dyn ReplyProvider>,
	cfg: EngineConfig,
}

impl Engine {
	pub fn new(
		store: Arc<dyn ConversationStore>,
		writer: StoreWriter,
		provider: Arc<dyn ReplyProvider>,
		cfg: EngineConfig,
	) -> Self {
		Self {
			inner: Arc::new(Mutex::new(EngineState::default())),
			store,
			writer,
			provider,
			cfg,
		}
	}

	/// Register a connection's outbound channel.
	pub async fn register_conn(&self, conn: ConnId, tx: mpsc::Sender<ServerEvent>) {
		let mut state = self.inner.lock().await;
		state.fanout.register(conn, tx);
	}

	/// Dispatch one inbound event.
	pub async fn handle_event(&self, conn: ConnId, event: ClientEvent) {
		match event {
			ClientEvent::Join { nick, gender, interest } => self.join(conn, nick, gender, interest).await,
			ClientEvent::Message { room_id, text } => self.post_message(conn, room_id, text).await,
			ClientEvent::Leave { room_id } => self.leave(conn, room_id).await,
			ClientEvent::SpyRequest => self.spy_request(conn).await,
			ClientEvent::SpyLeave { room_id } => self.spy_leave(conn, room_id).await,
			ClientEvent::Like { room_id } => self.like(room_id).await,
		}
	}

	/// Attempt a human pairing; fall back to a substitute chat.
	pub async fn join(&self, conn: ConnId, nick: String, gender: Gender, interest: Gender) {
		let user = Participant::human(conn, nick, gender, interest);

		{
			let mut state = self.inner.lock().await;
			if state.rooms.room_id_of_conn(conn).is_some() {
				debug!(conn = conn.0, "join ignored; connection already in a room");
				return;
			}
			state.queue.remove(conn);

			if let Some(partner) = state.queue.take_first_match(&user) {
				let room = Room::new_human_pair(RoomId::generate(), user.clone(), partner.clone());
				self.writer.submit(StoreJob::Create(NewConversation::from_room(&room)));

				let room_id = room.id.clone();
				let (spy_count, like_count) = (room.spy_count, room.likes);
				state.rooms.insert(room);

				state.fanout.send(
					conn,
					ServerEvent::Matched {
						room_id: room_id.clone(),
						partner_nick: partner.nick.clone(),
						partner_gender: partner.gender,
						spy_count,
						like_count,
					},
				);
				if let Some(partner_conn) = partner.conn {
					state.fanout.send(
						partner_conn,
						ServerEvent::Matched {
							room_id: room_id.clone(),
							partner_nick: user.nick.clone(),
							partner_gender: user.gender,
							spy_count,
							like_count,
						},
					);
				}

				metrics::counter!("palaver_server_rooms_created_total", "kind" => "human").increment(1);
				info!(room = %room_id, a = %user.nick, b = %partner.nick, "human pair matched");
				return;
			}

			state.queue.push(user.clone());
		}

		// The durable create below is a real suspension point: a compatible
		// join arriving meanwhile may claim this user from the queue.
		let substitute = {
			let mut rng = rand::rng();
			matchmaker::synthesize_partner(&mut rng, user.interest)
		};
		let room_id = RoomId::generate();
		let record = NewConversation {
			room_id: room_id.clone(),
			participants: vec![user.clone(), substitute.clone()],
			is_substitute_chat: true,
		};
		if let Err(e) = self.store.create(&record).await {
			metrics::counter!("palaver_server_store_errors_total").increment(1);
			warn!(error = %e, "durable create failed; substitute chat continues in memory");
		}

		let mut state = self.inner.lock().await;
		if state.queue.remove(conn).is_none() {
			// Claimed by a concurrent join (or disconnected); the prepared
			// record never went live, so retire it.
			self.writer.submit(StoreJob::SetInactive { room_id: room_id.clone() });
			debug!(conn = conn.0, "substitute chat aborted; user left the queue meanwhile");
			return;
		}

		let room = Room::new_substitute(room_id.clone(), user.clone(), substitute.clone());
		let (spy_count, like_count) = (room.spy_count, room.likes);
		state.rooms.insert(room);
		state.fanout.send(
			conn,
			ServerEvent::SubstituteStarted {
				room_id: room_id.clone(),
				substitute_nick: substitute.nick.clone(),
				substitute_gender: substitute.gender,
				spy_count,
				like_count,
			},
		);

		metrics::counter!("palaver_server_rooms_created_total", "kind" => "substitute").increment(1);
		info!(room = %room_id, human = %user.nick, substitute = %substitute.nick, "substitute chat started");
	}

	/// Append a message and fan it out to participants and observers.
	///
	/// A message for a room that already closed is dropped silently; that is
	/// the normal outcome of a benign race between close and an in-flight
	/// message, not an error.
	pub async fn post_message(&self, conn: ConnId, room_id: RoomId, text: String) {
		let mut state = self.inner.lock().await;
		let Some(room) = state.rooms.get(&room_id) else {
			debug!(room = %room_id, "message for unknown or closed room; dropping");
			return;
		};

		let nick = room.participant_nick(conn).unwrap_or("Unknown").to_string();

		let reply_job = if room.is_substitute_chat && room.has_conn(conn) {
			room.substitute().map(|sub| {
				let history: Vec<HistoryEntry> = room
					.messages
					.iter()
					.map(|l| HistoryEntry {
						from_substitute: l.nick == sub.nick,
						nick: l.nick.clone(),
						text: l.text.clone(),
					})
					.collect();
				(sub.nick.clone(), history)
			})
		} else {
			None
		};

		append_and_broadcast(&mut state, &self.writer, &room_id, &nick, &text);
		drop(state);

		if let Some((sub_nick, history)) = reply_job {
			let engine = self.clone();
			tokio::spawn(async move {
				engine.substitute_reply(room_id, sub_nick, history, text).await;
			});
		}
	}

	/// Produce the substitute's reply and feed it back through the normal
	/// message path.
	async fn substitute_reply(&self, room_id: RoomId, sub_nick: String, history: Vec<HistoryEntry>, message: String) {
		self.cfg.reply_delay.wait().await;

		let text = match self.provider.generate(&history, &message).await {
			Ok(t) if !t.trim().is_empty() => t,
			Ok(_) => FALLBACK_REPLY.to_string(),
			Err(e) => {
				metrics::counter!("palaver_server_provider_failures_total").increment(1);
				warn!(room = %room_id, error = %e, "reply provider failed; substituting fallback");
				FALLBACK_REPLY.to_string()
			}
		};

		// The room may have closed while the reply was in flight; dropping
		// the text is the correct outcome.
		let mut state = self.inner.lock().await;
		append_and_broadcast(&mut state, &self.writer, &room_id, &sub_nick, &text);
	}

	/// Close a room at a participant's request. Idempotent: unknown rooms
	/// and non-member callers are no-ops.
	pub async fn leave(&self, conn: ConnId, room_id: RoomId) {
		let mut state = self.inner.lock().await;
		let Some(room) = state.rooms.get(&room_id) else {
			return;
		};
		if !room.has_conn(conn) {
			return;
		}

		let nick = room.participant_nick(conn).unwrap_or("Unknown").to_string();
		close_room(&mut state, &self.writer, &room_id, format!("{nick} left the conversation."));
	}

	/// Select a random eligible room and subscribe the connection to it.
	pub async fn spy_request(&self, conn: ConnId) {
		// Fully retire any current subscription before selection begins.
		{
			let mut state = self.inner.lock().await;
			retire_spy(&mut state, &self.writer, conn);
		}

		let candidates = self.store.eligible_rooms(self.cfg.spy_min_messages).await;

		let mut state = self.inner.lock().await;
		let live: Vec<RoomId> = match candidates {
			// A durable record can outlive its room across a restart; such
			// candidates are excluded, not errored.
			Ok(ids) => ids
				.into_iter()
				.filter(|id| state.rooms.get(id).map(|r| r.is_active).unwrap_or(false))
				.collect(),
			Err(e) => {
				metrics::counter!("palaver_server_store_errors_total").increment(1);
				warn!(error = %e, "eligibility query failed; falling back to in-memory scan");
				state.rooms.live_eligible(self.cfg.spy_min_messages as usize)
			}
		};

		let Some(room_id) = live.choose(&mut rand::rng()).cloned() else {
			state.fanout.send(conn, ServerEvent::SpyUnavailable);
			debug!(conn = conn.0, "no conversations available to observe");
			return;
		};

		state.spies.observe(conn, room_id.clone());
		let Some(room) = state.rooms.get_mut(&room_id) else {
			return;
		};
		room.spy_count += 1;
		let messages = room.messages.clone();
		let (spy_count, like_count) = (room.spy_count, room.likes);

		self.writer.submit(StoreJob::AddSpies {
			room_id: room_id.clone(),
			delta: 1,
		});
		broadcast_counters(&mut state, &room_id);
		state.fanout.send(
			conn,
			ServerEvent::SpyFound {
				room_id: room_id.clone(),
				messages,
				spy_count,
				like_count,
			},
		);

		metrics::counter!("palaver_server_spy_sessions_total").increment(1);
		info!(conn = conn.0, room = %room_id, "spy subscription established");
	}

	/// Retire the connection's subscription, but only if it names the room
	/// currently observed; stale or duplicate leaves are no-ops.
	pub async fn spy_leave(&self, conn: ConnId, room_id: RoomId) {
		let mut state = self.inner.lock().await;
		if state.spies.observed_room(conn) != Some(&room_id) {
			return;
		}
		retire_spy(&mut state, &self.writer, conn);
	}

	/// Increment the like counter and broadcast the snapshot.
	pub async fn like(&self, room_id: RoomId) {
		let mut state = self.inner.lock().await;
		let Some(room) = state.rooms.get_mut(&room_id) else {
			return;
		};
		room.likes += 1;

		self.writer.submit(StoreJob::AddLikes {
			room_id: room_id.clone(),
			delta: 1,
		});
		broadcast_counters(&mut state, &room_id);
	}

	/// Tear down everything owned by a closing connection: queue entry,
	/// room membership, spy subscription, outbound channel.
	pub async fn handle_disconnect(&self, conn: ConnId) {
		let mut state = self.inner.lock().await;
		state.queue.remove(conn);

		if let Some(room_id) = state.rooms.room_id_of_conn(conn) {
			let nick = state
				.rooms
				.get(&room_id)
				.and_then(|r| r.participant_nick(conn))
				.unwrap_or("Unknown")
				.to_string();
			close_room(&mut state, &self.writer, &room_id, format!("{nick} disconnected."));
		}

		retire_spy(&mut state, &self.writer, conn);
		state.fanout.unregister(conn);
		debug!(conn = conn.0, "connection state cleaned up");
	}
}

/// Append a line to a live room, mirror it, and fan it out to both the
/// participant and observer audiences with the same payload.
fn append_and_broadcast(state: &mut EngineState, writer: &StoreWriter, room_id: &RoomId, nick: &str, text: &str) -> bool {
	let Some(room) = state.rooms.get_mut(room_id) else {
		return false;
	};

	let line = ChatLine::now(nick, text);
	room.messages.push(line.clone());
	let participants: Vec<ConnId> = room.human_conns().collect();

	writer.submit(StoreJob::AppendMessage {
		room_id: room_id.clone(),
		line,
	});

	let observers = state.spies.observers_of(room_id);
	state.fanout.send_all(
		participants,
		&ServerEvent::Message {
			room_id: room_id.clone(),
			nick: nick.to_string(),
			text: text.to_string(),
		},
	);
	state.fanout.send_all(
		observers,
		&ServerEvent::SpyMessage {
			room_id: room_id.clone(),
			nick: nick.to_string(),
			text: text.to_string(),
		},
	);

	metrics::counter!("palaver_server_messages_total").increment(1);
	true
}

/// Broadcast the `{spy_count, like_count}` snapshot to the room's full
/// audience. Every counter-affecting operation goes through here.
fn broadcast_counters(state: &mut EngineState, room_id: &RoomId) {
	let Some(room) = state.rooms.get(room_id) else {
		return;
	};
	let (spy_count, like_count) = (room.spy_count, room.likes);
	let audience: Vec<ConnId> = room.human_conns().chain(state.spies.observers_of(room_id)).collect();

	state.fanout.send_all(
		audience,
		&ServerEvent::CountersUpdated {
			room_id: room_id.clone(),
			spy_count,
			like_count,
		},
	);
}

/// Retire a connection's spy subscription, if any: decrement the observed
/// room's counter (floored at zero), mirror it, and broadcast the snapshot.
fn retire_spy(state: &mut EngineState, writer: &StoreWriter, conn: ConnId) -> Option<RoomId> {
	let room_id = state.spies.retire(conn)?;

	if let Some(room) = state.rooms.get_mut(&room_id) {
		room.spy_count = room.spy_count.saturating_sub(1);
		writer.submit(StoreJob::AddSpies {
			room_id: room_id.clone(),
			delta: -1,
		});
		broadcast_counters(state, &room_id);
	}

	Some(room_id)
}

/// Tear a room down: mark the durable record inactive, notify participants
/// and observers, force-retire every observer's subscription, and drop the
/// room from the store. Idempotent for unknown rooms.
fn close_room(state: &mut EngineState, writer: &StoreWriter, room_id: &RoomId, reason: String) {
	let Some(room) = state.rooms.remove(room_id) else {
		return;
	};

	writer.submit(StoreJob::SetInactive { room_id: room_id.clone() });

	let evicted = state.spies.retire_all_for_room(room_id);
	let audience: Vec<ConnId> = room.human_conns().chain(evicted).collect();
	state.fanout.send_all(
		audience,
		&ServerEvent::Closed {
			room_id: room_id.clone(),
			reason,
		},
	);

	metrics::counter!("palaver_server_rooms_closed_total").increment(1);
	info!(room = %room_id, "room closed");
}
