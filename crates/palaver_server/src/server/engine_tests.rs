#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use palaver_domain::event::ServerEvent;
use palaver_domain::{ChatLine, ConnId, Gender, Participant, RoomId};
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;

use crate::server::engine::{Engine, EngineConfig};
use crate::server::reply::{CannedReplyProvider, ReplyDelay};
use crate::server::state::Room;
use crate::server::store::{ConversationStore, InMemoryStore, NewConversation, StoreWriter, spawn_store_writer};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn test_engine() -> (Engine, Arc<InMemoryStore>, StoreWriter) {
	let store = Arc::new(InMemoryStore::default());
	let writer = spawn_store_writer(store.clone(), 256);
	let cfg = EngineConfig {
		spy_min_messages: 6,
		reply_delay: ReplyDelay::none(),
	};
	let engine = Engine::new(
		store.clone(),
		writer.clone(),
		Arc::new(CannedReplyProvider::default()),
		cfg,
	);
	(engine, store, writer)
}

async fn connect(engine: &Engine, id: u64) -> (ConnId, mpsc::Receiver<ServerEvent>) {
	let conn = ConnId(id);
	let (tx, rx) = mpsc::channel(64);
	engine.register_conn(conn, tx).await;
	(conn, rx)
}

async fn recv(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
	timeout(RECV_TIMEOUT, rx.recv())
		.await
		.expect("timed out waiting for event")
		.expect("event channel closed")
}

fn human(conn: ConnId, nick: &str, gender: Gender, interest: Gender) -> Participant {
	Participant::human(conn, nick.to_string(), gender, interest)
}

/// Insert a live human-pair room directly, bypassing matchmaking.
async fn seed_human_room(engine: &Engine, id: &str, a: Participant, b: Participant) -> RoomId {
	let room_id = RoomId::new(id).unwrap();
	let mut state = engine.inner.lock().await;
	state.rooms.insert(Room::new_human_pair(room_id.clone(), a, b));
	room_id
}

/// Mirror a seeded room into the store with `message_count` lines.
async fn seed_store_record(store: &InMemoryStore, room: &Room, message_count: usize) {
	store
		.create(&NewConversation::from_room(room))
		.await
		.unwrap();
	for i in 0..message_count {
		store
			.append_message(&room.id, &ChatLine::now("ana", &format!("line {i}")))
			.await
			.unwrap();
	}
}

/// Store that parks substitute-record creation until released, giving tests
/// a deterministic window in which a second join can claim the queued user.
struct GatedStore {
	inner: InMemoryStore,
	gate: Notify,
}

#[async_trait]
impl ConversationStore for GatedStore {
	async fn create(&self, conversation: &NewConversation) -> anyhow::Result<()> {
		if conversation.is_substitute_chat {
			self.gate.notified().await;
		}
		self.inner.create(conversation).await
	}

	async fn append_message(&self, room_id: &RoomId, line: &ChatLine) -> anyhow::Result<()> {
		self.inner.append_message(room_id, line).await
	}

	async fn add_likes(&self, room_id: &RoomId, delta: i64) -> anyhow::Result<()> {
		self.inner.add_likes(room_id, delta).await
	}

	async fn add_spies(&self, room_id: &RoomId, delta: i64) -> anyhow::Result<()> {
		self.inner.add_spies(room_id, delta).await
	}

	async fn set_inactive(&self, room_id: &RoomId) -> anyhow::Result<()> {
		self.inner.set_inactive(room_id).await
	}

	async fn eligible_rooms(&self, min_messages: u32) -> anyhow::Result<Vec<RoomId>> {
		self.inner.eligible_rooms(min_messages).await
	}
}

#[tokio::test]
async fn join_pairs_with_user_queued_during_substitute_setup() {
	let store = Arc::new(GatedStore {
		inner: InMemoryStore::default(),
		gate: Notify::new(),
	});
	let writer = spawn_store_writer(store.clone(), 256);
	let engine = Engine::new(
		store.clone(),
		writer,
		Arc::new(CannedReplyProvider::default()),
		EngineConfig {
			spy_min_messages: 6,
			reply_delay: ReplyDelay::none(),
		},
	);

	let (conn_a, mut rx_a) = connect(&engine, 1).await;
	let (conn_b, mut rx_b) = connect(&engine, 2).await;

	// First join parks inside the gated substitute-record create, with the
	// user still sitting in the waiting queue.
	let first = {
		let engine = engine.clone();
		tokio::spawn(async move { engine.join(conn_a, "ana".to_string(), Gender::Female, Gender::Any).await })
	};
	timeout(RECV_TIMEOUT, async {
		loop {
			if engine.inner.lock().await.queue.contains(conn_a) {
				break;
			}
			tokio::task::yield_now().await;
		}
	})
	.await
	.expect("first join never reached the queue");

	// Second join claims the queued user.
	engine.join(conn_b, "bruno".to_string(), Gender::Male, Gender::Female).await;

	match recv(&mut rx_b).await {
		ServerEvent::Matched { partner_nick, .. } => assert_eq!(partner_nick, "ana"),
		other => panic!("expected Matched, got {other:?}"),
	}
	match recv(&mut rx_a).await {
		ServerEvent::Matched { partner_nick, .. } => assert_eq!(partner_nick, "bruno"),
		other => panic!("expected Matched, got {other:?}"),
	}

	// Release the parked create; the first join must detect the claim and
	// abort its substitute chat instead of starting a second room.
	store.gate.notify_one();
	first.await.unwrap();

	let state = engine.inner.lock().await;
	assert_eq!(state.rooms.len(), 1);
	assert!(state.queue.is_empty());
}

#[tokio::test]
async fn lone_join_starts_substitute_chat() {
	let (engine, store, writer) = test_engine();
	let (conn, mut rx) = connect(&engine, 1).await;

	engine.join(conn, "ana".to_string(), Gender::Female, Gender::Male).await;

	let room_id = match recv(&mut rx).await {
		ServerEvent::SubstituteStarted {
			room_id,
			substitute_gender,
			spy_count,
			like_count,
			..
		} => {
			assert_eq!(substitute_gender, Gender::Male);
			assert_eq!(spy_count, 0);
			assert_eq!(like_count, 0);
			room_id
		}
		other => panic!("expected SubstituteStarted, got {other:?}"),
	};

	let state = engine.inner.lock().await;
	let room = state.rooms.get(&room_id).expect("room should be live");
	assert!(room.is_substitute_chat);
	assert!(state.queue.is_empty());
	drop(state);

	writer.flush().await;
	let stored = store.conversation(&room_id).await.expect("record should exist");
	assert!(stored.is_substitute_chat);
	assert!(stored.is_active);
}

#[tokio::test]
async fn matchmaking_skips_incompatible_waiters() {
	let (engine, _store, _writer) = test_engine();
	let (conn_a, _rx_a) = connect(&engine, 1).await;
	let (conn_b, mut rx_b) = connect(&engine, 2).await;
	let (conn_c, mut rx_c) = connect(&engine, 3).await;

	{
		let mut state = engine.inner.lock().await;
		// Older waiter wants a woman; newer waiter takes anyone.
		state.queue.push(human(conn_a, "ana", Gender::Female, Gender::Female));
		state.queue.push(human(conn_b, "bea", Gender::Female, Gender::Any));
	}

	engine.join(conn_c, "carlos".to_string(), Gender::Male, Gender::Any).await;

	match recv(&mut rx_c).await {
		ServerEvent::Matched { partner_nick, .. } => assert_eq!(partner_nick, "bea"),
		other => panic!("expected Matched, got {other:?}"),
	}
	match recv(&mut rx_b).await {
		ServerEvent::Matched { partner_nick, .. } => assert_eq!(partner_nick, "carlos"),
		other => panic!("expected Matched, got {other:?}"),
	}

	let state = engine.inner.lock().await;
	assert!(state.queue.contains(conn_a));
	assert_eq!(state.queue.len(), 1);
}

#[tokio::test]
async fn message_fans_out_mirrors_and_draws_substitute_reply() {
	let (engine, store, writer) = test_engine();
	let (conn, mut rx) = connect(&engine, 1).await;

	engine.join(conn, "ana".to_string(), Gender::Female, Gender::Any).await;
	let room_id = match recv(&mut rx).await {
		ServerEvent::SubstituteStarted { room_id, .. } => room_id,
		other => panic!("expected SubstituteStarted, got {other:?}"),
	};

	engine.post_message(conn, room_id.clone(), "hola".to_string()).await;

	match recv(&mut rx).await {
		ServerEvent::Message { nick, text, .. } => {
			assert_eq!(nick, "ana");
			assert_eq!(text, "hola");
		}
		other => panic!("expected Message, got {other:?}"),
	}

	// With a zero reply delay the canned reply lands shortly after.
	let substitute_nick = {
		let state = engine.inner.lock().await;
		state
			.rooms
			.get(&room_id)
			.and_then(|r| r.substitute())
			.map(|p| p.nick.clone())
			.expect("substitute participant")
	};
	match recv(&mut rx).await {
		ServerEvent::Message { nick, .. } => assert_eq!(nick, substitute_nick),
		other => panic!("expected substitute Message, got {other:?}"),
	}

	writer.flush().await;
	let stored = store.conversation(&room_id).await.unwrap();
	assert_eq!(stored.messages.len(), 2);
	assert_eq!(stored.messages[0].text, "hola");
}

#[tokio::test]
async fn message_to_unknown_room_is_dropped() {
	let (engine, _store, _writer) = test_engine();
	let (conn, mut rx) = connect(&engine, 1).await;

	engine
		.post_message(conn, RoomId::new("nope").unwrap(), "hola".to_string())
		.await;

	assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn leave_closes_room_for_both_sides() {
	let (engine, _store, _writer) = test_engine();
	let (conn_a, mut rx_a) = connect(&engine, 1).await;
	let (conn_b, mut rx_b) = connect(&engine, 2).await;

	let room_id = seed_human_room(
		&engine,
		"r1",
		human(conn_a, "ana", Gender::Female, Gender::Any),
		human(conn_b, "bruno", Gender::Male, Gender::Any),
	)
	.await;

	engine.leave(conn_a, room_id.clone()).await;

	for rx in [&mut rx_a, &mut rx_b] {
		match recv(rx).await {
			ServerEvent::Closed { reason, .. } => assert_eq!(reason, "ana left the conversation."),
			other => panic!("expected Closed, got {other:?}"),
		}
	}

	let state = engine.inner.lock().await;
	assert_eq!(state.rooms.len(), 0);
	drop(state);

	// Closing again, or leaving a room the caller is not in, is a no-op.
	engine.leave(conn_a, room_id).await;
	assert!(rx_a.try_recv().is_err());
}

#[tokio::test]
async fn spy_request_delivers_history_and_updates_counters() {
	let (engine, store, _writer) = test_engine();
	let (conn_a, mut rx_a) = connect(&engine, 1).await;
	let (conn_b, _rx_b) = connect(&engine, 2).await;
	let (spy, mut rx_spy) = connect(&engine, 3).await;

	let room_id = seed_human_room(
		&engine,
		"r1",
		human(conn_a, "ana", Gender::Female, Gender::Any),
		human(conn_b, "bruno", Gender::Male, Gender::Any),
	)
	.await;
	{
		let mut state = engine.inner.lock().await;
		let room = state.rooms.get_mut(&room_id).unwrap();
		for i in 0..6 {
			room.messages.push(ChatLine::now("ana", &format!("line {i}")));
		}
		seed_store_record(&store, room, 6).await;
	}

	engine.spy_request(spy).await;

	match recv(&mut rx_a).await {
		ServerEvent::CountersUpdated { spy_count, .. } => assert_eq!(spy_count, 1),
		other => panic!("expected CountersUpdated, got {other:?}"),
	}
	match recv(&mut rx_spy).await {
		ServerEvent::CountersUpdated { spy_count, .. } => assert_eq!(spy_count, 1),
		other => panic!("expected CountersUpdated, got {other:?}"),
	}
	match recv(&mut rx_spy).await {
		ServerEvent::SpyFound {
			room_id: found,
			messages,
			spy_count,
			..
		} => {
			assert_eq!(found, room_id);
			assert_eq!(messages.len(), 6);
			assert_eq!(spy_count, 1);
		}
		other => panic!("expected SpyFound, got {other:?}"),
	}

	let state = engine.inner.lock().await;
	assert_eq!(state.spies.observed_room(spy), Some(&room_id));
}

#[tokio::test]
async fn spy_request_ignores_conversations_below_threshold() {
	let (engine, store, _writer) = test_engine();
	let (conn_a, _rx_a) = connect(&engine, 1).await;
	let (conn_b, _rx_b) = connect(&engine, 2).await;
	let (spy, mut rx_spy) = connect(&engine, 3).await;

	let room_id = seed_human_room(
		&engine,
		"r1",
		human(conn_a, "ana", Gender::Female, Gender::Any),
		human(conn_b, "bruno", Gender::Male, Gender::Any),
	)
	.await;
	{
		let mut state = engine.inner.lock().await;
		let room = state.rooms.get_mut(&room_id).unwrap();
		for i in 0..5 {
			room.messages.push(ChatLine::now("ana", &format!("line {i}")));
		}
		seed_store_record(&store, room, 5).await;
	}

	engine.spy_request(spy).await;

	match recv(&mut rx_spy).await {
		ServerEvent::SpyUnavailable => {}
		other => panic!("expected SpyUnavailable, got {other:?}"),
	}
	let state = engine.inner.lock().await;
	assert!(state.spies.is_empty());
}

#[tokio::test]
async fn retargeting_retires_previous_subscription_first() {
	let (engine, store, _writer) = test_engine();
	let (conn_a, mut rx_a) = connect(&engine, 1).await;
	let (conn_b, _rx_b) = connect(&engine, 2).await;
	let (spy, _rx_spy) = connect(&engine, 3).await;

	let room_id = seed_human_room(
		&engine,
		"r1",
		human(conn_a, "ana", Gender::Female, Gender::Any),
		human(conn_b, "bruno", Gender::Male, Gender::Any),
	)
	.await;
	{
		let mut state = engine.inner.lock().await;
		let room = state.rooms.get_mut(&room_id).unwrap();
		for i in 0..6 {
			room.messages.push(ChatLine::now("ana", &format!("line {i}")));
		}
		seed_store_record(&store, room, 6).await;
	}

	engine.spy_request(spy).await;
	engine.spy_request(spy).await;

	// The participant sees the counter go up, down on retirement, and up
	// again on re-selection.
	let mut seen = Vec::new();
	for _ in 0..3 {
		match recv(&mut rx_a).await {
			ServerEvent::CountersUpdated { spy_count, .. } => seen.push(spy_count),
			other => panic!("expected CountersUpdated, got {other:?}"),
		}
	}
	assert_eq!(seen, vec![1, 0, 1]);

	let state = engine.inner.lock().await;
	assert_eq!(state.spies.len(), 1);
	assert_eq!(state.rooms.get(&room_id).unwrap().spy_count, 1);
}

#[tokio::test]
async fn spy_leave_requires_the_observed_room() {
	let (engine, store, _writer) = test_engine();
	let (conn_a, _rx_a) = connect(&engine, 1).await;
	let (conn_b, _rx_b) = connect(&engine, 2).await;
	let (spy, _rx_spy) = connect(&engine, 3).await;

	let room_id = seed_human_room(
		&engine,
		"r1",
		human(conn_a, "ana", Gender::Female, Gender::Any),
		human(conn_b, "bruno", Gender::Male, Gender::Any),
	)
	.await;
	{
		let mut state = engine.inner.lock().await;
		let room = state.rooms.get_mut(&room_id).unwrap();
		for i in 0..6 {
			room.messages.push(ChatLine::now("ana", &format!("line {i}")));
		}
		seed_store_record(&store, room, 6).await;
	}
	engine.spy_request(spy).await;

	// Naming a different room leaves the subscription intact.
	engine.spy_leave(spy, RoomId::new("other").unwrap()).await;
	{
		let state = engine.inner.lock().await;
		assert!(state.spies.is_spying(spy));
	}

	engine.spy_leave(spy, room_id.clone()).await;
	let state = engine.inner.lock().await;
	assert!(!state.spies.is_spying(spy));
	assert_eq!(state.rooms.get(&room_id).unwrap().spy_count, 0);
}

#[tokio::test]
async fn closing_a_room_evicts_its_spies() {
	let (engine, store, _writer) = test_engine();
	let (conn_a, _rx_a) = connect(&engine, 1).await;
	let (conn_b, _rx_b) = connect(&engine, 2).await;
	let (spy, mut rx_spy) = connect(&engine, 3).await;

	let room_id = seed_human_room(
		&engine,
		"r1",
		human(conn_a, "ana", Gender::Female, Gender::Any),
		human(conn_b, "bruno", Gender::Male, Gender::Any),
	)
	.await;
	{
		let mut state = engine.inner.lock().await;
		let room = state.rooms.get_mut(&room_id).unwrap();
		for i in 0..6 {
			room.messages.push(ChatLine::now("ana", &format!("line {i}")));
		}
		seed_store_record(&store, room, 6).await;
	}
	engine.spy_request(spy).await;
	// Drain the subscription handshake.
	let _ = recv(&mut rx_spy).await;
	let _ = recv(&mut rx_spy).await;

	engine.leave(conn_a, room_id.clone()).await;

	match recv(&mut rx_spy).await {
		ServerEvent::Closed { .. } => {}
		other => panic!("expected Closed, got {other:?}"),
	}
	let state = engine.inner.lock().await;
	assert!(state.spies.is_empty());
}

#[tokio::test]
async fn spy_counter_never_underflows() {
	let (engine, _store, _writer) = test_engine();
	let (conn_a, _rx_a) = connect(&engine, 1).await;
	let (conn_b, _rx_b) = connect(&engine, 2).await;
	let (spy, _rx_spy) = connect(&engine, 3).await;

	let room_id = seed_human_room(
		&engine,
		"r1",
		human(conn_a, "ana", Gender::Female, Gender::Any),
		human(conn_b, "bruno", Gender::Male, Gender::Any),
	)
	.await;
	// Subscription registered without the counter increment that normally
	// accompanies it.
	{
		let mut state = engine.inner.lock().await;
		state.spies.observe(spy, room_id.clone());
	}

	engine.spy_leave(spy, room_id.clone()).await;

	let state = engine.inner.lock().await;
	assert_eq!(state.rooms.get(&room_id).unwrap().spy_count, 0);
}

#[tokio::test]
async fn like_increments_and_broadcasts() {
	let (engine, store, writer) = test_engine();
	let (conn_a, mut rx_a) = connect(&engine, 1).await;
	let (conn_b, mut rx_b) = connect(&engine, 2).await;

	let room_id = seed_human_room(
		&engine,
		"r1",
		human(conn_a, "ana", Gender::Female, Gender::Any),
		human(conn_b, "bruno", Gender::Male, Gender::Any),
	)
	.await;
	{
		let state = engine.inner.lock().await;
		seed_store_record(&store, state.rooms.get(&room_id).unwrap(), 0).await;
	}

	engine.like(room_id.clone()).await;
	engine.like(room_id.clone()).await;

	for rx in [&mut rx_a, &mut rx_b] {
		match recv(rx).await {
			ServerEvent::CountersUpdated { like_count, .. } => assert_eq!(like_count, 1),
			other => panic!("expected CountersUpdated, got {other:?}"),
		}
		match recv(rx).await {
			ServerEvent::CountersUpdated { like_count, .. } => assert_eq!(like_count, 2),
			other => panic!("expected CountersUpdated, got {other:?}"),
		}
	}

	writer.flush().await;
	assert_eq!(store.conversation(&room_id).await.unwrap().likes, 2);
}

#[tokio::test]
async fn disconnect_closes_room_and_notifies_partner() {
	let (engine, _store, _writer) = test_engine();
	let (conn_a, _rx_a) = connect(&engine, 1).await;
	let (conn_b, mut rx_b) = connect(&engine, 2).await;

	seed_human_room(
		&engine,
		"r1",
		human(conn_a, "ana", Gender::Female, Gender::Any),
		human(conn_b, "bruno", Gender::Male, Gender::Any),
	)
	.await;

	engine.handle_disconnect(conn_a).await;

	match recv(&mut rx_b).await {
		ServerEvent::Closed { reason, .. } => assert_eq!(reason, "ana disconnected."),
		other => panic!("expected Closed, got {other:?}"),
	}

	let state = engine.inner.lock().await;
	assert_eq!(state.rooms.len(), 0);
	assert!(!state.fanout.is_registered(conn_a));
}

#[tokio::test]
async fn disconnect_clears_queue_entry_and_spy_subscription() {
	let (engine, _store, _writer) = test_engine();
	let (conn_a, _rx_a) = connect(&engine, 1).await;
	let (conn_b, _rx_b) = connect(&engine, 2).await;

	{
		let mut state = engine.inner.lock().await;
		state.queue.push(human(conn_a, "ana", Gender::Female, Gender::Any));
		state.spies.observe(conn_b, RoomId::new("gone").unwrap());
	}

	engine.handle_disconnect(conn_a).await;
	engine.handle_disconnect(conn_b).await;

	let state = engine.inner.lock().await;
	assert!(state.queue.is_empty());
	assert!(state.spies.is_empty());
}
