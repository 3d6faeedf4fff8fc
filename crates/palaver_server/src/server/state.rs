#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};

use palaver_domain::{ChatLine, ConnId, Participant, RoomId};

/// A live two-party conversation plus its counters.
///
/// Membership is fixed at creation; a room is only ever torn down whole.
#[derive(Debug, Clone)]
pub struct Room {
	pub id: RoomId,
	pub participants: [Participant; 2],
	pub messages: Vec<ChatLine>,
	pub likes: u64,
	pub spy_count: u64,
	pub is_substitute_chat: bool,
	pub is_active: bool,
}

impl Room {
	/// A room pairing two humans.
	pub fn new_human_pair(id: RoomId, a: Participant, b: Participant) -> Self {
		Self {
			id,
			participants: [a, b],
			messages: Vec::new(),
			likes: 0,
			spy_count: 0,
			is_substitute_chat: false,
			is_active: true,
		}
	}

	/// A room pairing a human with a synthesized substitute.
	pub fn new_substitute(id: RoomId, human: Participant, substitute: Participant) -> Self {
		Self {
			id,
			participants: [human, substitute],
			messages: Vec::new(),
			likes: 0,
			spy_count: 0,
			is_substitute_chat: true,
			is_active: true,
		}
	}

	/// Whether the given connection is one of the two participants.
	pub fn has_conn(&self, conn: ConnId) -> bool {
		self.participants.iter().any(|p| p.conn == Some(conn))
	}

	/// Nick of the participant bound to `conn`, if any.
	pub fn participant_nick(&self, conn: ConnId) -> Option<&str> {
		self.participants
			.iter()
			.find(|p| p.conn == Some(conn))
			.map(|p| p.nick.as_str())
	}

	/// The other participant relative to `conn`.
	pub fn partner_of(&self, conn: ConnId) -> Option<&Participant> {
		if !self.has_conn(conn) {
			return None;
		}
		self.participants.iter().find(|p| p.conn != Some(conn))
	}

	/// Connections of the human participants.
	pub fn human_conns(&self) -> impl Iterator<Item = ConnId> + '_ {
		self.participants.iter().filter_map(|p| p.conn)
	}

	/// The substitute participant, if this is a substitute chat.
	pub fn substitute(&self) -> Option<&Participant> {
		self.participants.iter().find(|p| p.is_substitute)
	}
}

/// Owns the mapping from room id to live room state.
#[derive(Debug, Default)]
pub struct RoomStore {
	rooms: HashMap<RoomId, Room>,
}

impl RoomStore {
	pub fn insert(&mut self, room: Room) {
		self.rooms.insert(room.id.clone(), room);
	}

	pub fn get(&self, id: &RoomId) -> Option<&Room> {
		self.rooms.get(id)
	}

	pub fn get_mut(&mut self, id: &RoomId) -> Option<&mut Room> {
		self.rooms.get_mut(id)
	}

	pub fn remove(&mut self, id: &RoomId) -> Option<Room> {
		self.rooms.remove(id)
	}

	pub fn contains(&self, id: &RoomId) -> bool {
		self.rooms.contains_key(id)
	}

	pub fn len(&self) -> usize {
		self.rooms.len()
	}

	/// The room a connection currently participates in, if any.
	///
	/// Linear scan; the live room population is small and bounded by the
	/// connection count.
	pub fn room_id_of_conn(&self, conn: ConnId) -> Option<RoomId> {
		self.rooms
			.values()
			.find(|room| room.has_conn(conn))
			.map(|room| room.id.clone())
	}

	/// In-memory fallback for the spy eligibility query.
	pub fn live_eligible(&self, min_messages: usize) -> Vec<RoomId> {
		self.rooms
			.values()
			.filter(|room| room.is_active && room.messages.len() >= min_messages)
			.map(|room| room.id.clone())
			.collect()
	}
}

/// Humans waiting for a human partner, in arrival order.
#[derive(Debug, Default)]
pub struct WaitingQueue {
	entries: VecDeque<Participant>,
}

impl WaitingQueue {
	/// Append a participant. Duplicate connection ids are rejected.
	pub fn push(&mut self, user: Participant) -> bool {
		let Some(conn) = user.conn else {
			return false;
		};
		if self.entries.iter().any(|e| e.conn == Some(conn)) {
			return false;
		}
		self.entries.push_back(user);
		true
	}

	/// Remove a participant by connection id.
	pub fn remove(&mut self, conn: ConnId) -> Option<Participant> {
		let idx = self.entries.iter().position(|e| e.conn == Some(conn))?;
		self.entries.remove(idx)
	}

	/// Remove and return the first waiting entry compatible with `user`,
	/// scanning in arrival order (FIFO, not best-fit).
	pub fn take_first_match(&mut self, user: &Participant) -> Option<Participant> {
		let idx = self
			.entries
			.iter()
			.position(|candidate| super::matchmaker::mutually_compatible(user, candidate))?;
		self.entries.remove(idx)
	}

	pub fn contains(&self, conn: ConnId) -> bool {
		self.entries.iter().any(|e| e.conn == Some(conn))
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

/// At most one observed room per connection.
#[derive(Debug, Default)]
pub struct SpyRegistry {
	observed: HashMap<ConnId, RoomId>,
}

impl SpyRegistry {
	pub fn observe(&mut self, conn: ConnId, room_id: RoomId) {
		self.observed.insert(conn, room_id);
	}

	/// Retire a connection's subscription, returning the room it observed.
	pub fn retire(&mut self, conn: ConnId) -> Option<RoomId> {
		self.observed.remove(&conn)
	}

	pub fn observed_room(&self, conn: ConnId) -> Option<&RoomId> {
		self.observed.get(&conn)
	}

	/// Connections currently observing the given room.
	pub fn observers_of(&self, room_id: &RoomId) -> Vec<ConnId> {
		self.observed
			.iter()
			.filter(|(_, r)| *r == room_id)
			.map(|(c, _)| *c)
			.collect()
	}

	/// Retire every subscription pointing at `room_id` (room teardown).
	pub fn retire_all_for_room(&mut self, room_id: &RoomId) -> Vec<ConnId> {
		let evicted = self.observers_of(room_id);
		for conn in &evicted {
			self.observed.remove(conn);
		}
		evicted
	}

	pub fn len(&self) -> usize {
		self.observed.len()
	}

	pub fn is_empty(&self) -> bool {
		self.observed.is_empty()
	}

	pub fn is_spying(&self, conn: ConnId) -> bool {
		self.observed.contains_key(&conn)
	}
}
