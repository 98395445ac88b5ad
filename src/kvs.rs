//! The transient session store: sessions, groups, slots, queues, parties,
//! and the token revocation set.
//!
//! [`SessionStore`] is the seam the matchmaker talks through. The shipped
//! implementation is [`InMemoryStore`]: one mutex over the whole state, never
//! held across an await, which serializes every matchmaking operation the way
//! the concurrency model requires. A remote store would implement the same
//! trait with per-key optimistic transactions.
//!
//! The packing policy lives here, in [`SessionStore::join_queue`]: slots are
//! tried strictly FIFO, the oldest partial slot first, and a slot that
//! reaches capacity is pulled out of the queue and reported to the caller
//! for launch.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::Rng;
use uuid::Uuid;

use crate::entity::{
    Game, GameId, Group, GroupId, GroupState, Party, PartyId, Slot, SlotId, TokenId, UserId,
    UserSession,
};
use crate::error::ApiError;

/// Attempts per port before giving up on the random sampling.
const PORT_SAMPLE_ATTEMPTS: u32 = 128;

/// Where launched game instances live, from the service configuration.
#[derive(Debug, Clone)]
pub struct GameHostConfig {
    pub host: String,
    /// Inclusive start of the external port range.
    pub port_range_start: u16,
    /// Exclusive end of the external port range.
    pub port_range_stop: u16,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    // Token revocation. Expired entries are pruned before each write.
    async fn revoke_token(&self, tokenid: TokenId, expiry: u64) -> Result<(), ApiError>;
    async fn is_token_revoked(&self, tokenid: TokenId) -> Result<bool, ApiError>;

    /// Session lookup; errors with `PlayerNotInGroup` when the user has none.
    async fn get_user(&self, userid: UserId) -> Result<UserSession, ApiError>;

    async fn create_group(&self, userid: UserId, game: &Game) -> Result<GroupId, ApiError>;
    async fn join_group(&self, groupid: GroupId, userid: UserId, game: &Game) -> Result<(), ApiError>;
    async fn leave_group(&self, userid: UserId) -> Result<(), ApiError>;
    async fn get_group(&self, groupid: GroupId) -> Result<Group, ApiError>;

    async fn mark_ready(&self, userid: UserId) -> Result<(), ApiError>;
    async fn mark_not_ready(&self, userid: UserId) -> Result<(), ApiError>;
    async fn is_user_ready(&self, userid: UserId) -> Result<bool, ApiError>;

    /// Queue the group and run the packing pass. Returns the slot to launch
    /// when the group's arrival filled it to capacity.
    async fn join_queue(&self, groupid: GroupId, game: &Game) -> Result<Option<SlotId>, ApiError>;
    async fn leave_queue(&self, groupid: GroupId) -> Result<(), ApiError>;

    /// Freeze a filled slot into a party: flip its groups to `PLAYING`, stamp
    /// sessions, and allocate host + external ports.
    async fn start_game(&self, game: &Game, slotid: SlotId) -> Result<Party, ApiError>;
    async fn get_party(&self, partyid: PartyId) -> Result<Party, ApiError>;
    /// Tear a party down and return its groups to `GROUP_CHECK`. Returns the
    /// group ids that were playing.
    async fn end_game(&self, partyid: PartyId) -> Result<Vec<GroupId>, ApiError>;

    async fn get_slot(&self, slotid: SlotId) -> Result<Slot, ApiError>;
}

#[derive(Default)]
struct SessionState {
    revoked: HashMap<TokenId, u64>,
    sessions: HashMap<UserId, UserSession>,
    groups: HashMap<GroupId, Group>,
    slots: HashMap<SlotId, Slot>,
    queues: HashMap<GameId, VecDeque<SlotId>>,
    parties: HashMap<PartyId, Party>,
    used_ports: HashSet<u16>,
}

/// Process-local session store. All state behind one mutex; no lock is ever
/// held across an await.
pub struct InMemoryStore {
    state: Mutex<SessionState>,
    hosting: GameHostConfig,
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

impl InMemoryStore {
    #[must_use]
    pub fn new(hosting: GameHostConfig) -> Self {
        InMemoryStore {
            state: Mutex::new(SessionState::default()),
            hosting,
        }
    }

    /// Remove the group's members from its slot, dropping the slot from the
    /// queue (and the world) when it empties. Reads `group.members`, so the
    /// caller must not have removed the leaving member yet.
    fn detach_from_slot(state: &mut SessionState, groupid: GroupId) -> Result<(), ApiError> {
        let group = state.groups.get(&groupid).ok_or(ApiError::GroupDoesntExist)?;
        if group.state != GroupState::InQueue {
            return Err(ApiError::wrong_state(group.state, &[GroupState::InQueue]));
        }
        let slotid = group.slotid.expect("queued group has a slot");
        let members = group.members.clone();
        let gameid = group.gameid;

        let mut slot_emptied = false;
        if let Some(slot) = state.slots.get_mut(&slotid) {
            slot.groups.retain(|g| *g != groupid);
            slot.players.retain(|p| !members.contains(p));
            slot_emptied = slot.players.is_empty();
        }
        if slot_emptied {
            state.slots.remove(&slotid);
            if let Some(queue) = state.queues.get_mut(&gameid) {
                queue.retain(|s| *s != slotid);
            }
        }

        let group = state.groups.get_mut(&groupid).expect("group vanished under the lock");
        group.slotid = None;
        group.state = GroupState::GroupCheck;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn revoke_token(&self, tokenid: TokenId, expiry: u64) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        let now = unix_now();
        state.revoked.retain(|_, exp| *exp >= now);
        state.revoked.insert(tokenid, expiry);
        Ok(())
    }

    async fn is_token_revoked(&self, tokenid: TokenId) -> Result<bool, ApiError> {
        Ok(self.state.lock().unwrap().revoked.contains_key(&tokenid))
    }

    async fn get_user(&self, userid: UserId) -> Result<UserSession, ApiError> {
        self
            .state
            .lock()
            .unwrap()
            .sessions
            .get(&userid)
            .cloned()
            .ok_or(ApiError::PlayerNotInGroup)
    }

    async fn create_group(&self, userid: UserId, game: &Game) -> Result<GroupId, ApiError> {
        let mut state = self.state.lock().unwrap();
        if state.sessions.contains_key(&userid) {
            return Err(ApiError::PlayerInGroupAlready);
        }

        let groupid = Uuid::new_v4();
        state.groups.insert(
            groupid,
            Group {
                groupid,
                state: GroupState::GroupCheck,
                members: vec![userid],
                gameid: game.gameid,
                slotid: None,
                partyid: None,
            },
        );
        state.sessions.insert(
            userid,
            UserSession {
                userid,
                groupid,
                partyid: None,
                ready: false,
            },
        );
        Ok(groupid)
    }

    async fn join_group(&self, groupid: GroupId, userid: UserId, game: &Game) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        if state.sessions.contains_key(&userid) {
            return Err(ApiError::PlayerInGroupAlready);
        }
        let group = state.groups.get_mut(&groupid).ok_or(ApiError::GroupDoesntExist)?;
        if group.state != GroupState::GroupCheck {
            return Err(ApiError::wrong_state(group.state, &[GroupState::GroupCheck]));
        }
        if group.members.len() + 1 > game.capacity as usize {
            return Err(ApiError::GroupIsFull);
        }

        group.members.push(userid);
        state.sessions.insert(
            userid,
            UserSession {
                userid,
                groupid,
                partyid: None,
                ready: false,
            },
        );
        Ok(())
    }

    async fn leave_group(&self, userid: UserId) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        let session = state.sessions.get(&userid).ok_or(ApiError::PlayerNotInGroup)?;
        let groupid = session.groupid;

        let group = state.groups.get(&groupid).ok_or(ApiError::GroupDoesntExist)?;
        match group.state {
            GroupState::Playing => {
                return Err(ApiError::wrong_state(
                    group.state,
                    &[GroupState::GroupCheck, GroupState::InQueue],
                ));
            }
            // Detach first: it reads the full member list, including the leaver.
            GroupState::InQueue => InMemoryStore::detach_from_slot(&mut state, groupid)?,
            GroupState::GroupCheck => {}
        }

        state.sessions.remove(&userid);
        let group = state.groups.get_mut(&groupid).expect("group vanished under the lock");
        group.members.retain(|m| *m != userid);
        if group.members.is_empty() {
            state.groups.remove(&groupid);
        }
        Ok(())
    }

    async fn get_group(&self, groupid: GroupId) -> Result<Group, ApiError> {
        self
            .state
            .lock()
            .unwrap()
            .groups
            .get(&groupid)
            .cloned()
            .ok_or(ApiError::GroupDoesntExist)
    }

    async fn mark_ready(&self, userid: UserId) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        let session = state.sessions.get(&userid).ok_or(ApiError::PlayerNotInGroup)?;
        let group = state.groups.get(&session.groupid).ok_or(ApiError::GroupDoesntExist)?;
        if group.state != GroupState::GroupCheck {
            return Err(ApiError::wrong_state(group.state, &[GroupState::GroupCheck]));
        }
        state.sessions.get_mut(&userid).expect("session vanished under the lock").ready = true;
        Ok(())
    }

    async fn mark_not_ready(&self, userid: UserId) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        let session = state.sessions.get(&userid).ok_or(ApiError::PlayerNotInGroup)?;
        let groupid = session.groupid;
        let group = state.groups.get(&groupid).ok_or(ApiError::GroupDoesntExist)?;
        match group.state {
            GroupState::Playing => {
                return Err(ApiError::wrong_state(
                    group.state,
                    &[GroupState::GroupCheck, GroupState::InQueue],
                ));
            }
            // Leaving the queue clears nobody's readiness but the caller's below.
            GroupState::InQueue => InMemoryStore::detach_from_slot(&mut state, groupid)?,
            GroupState::GroupCheck => {}
        }
        state.sessions.get_mut(&userid).expect("session vanished under the lock").ready = false;
        Ok(())
    }

    async fn is_user_ready(&self, userid: UserId) -> Result<bool, ApiError> {
        self
            .state
            .lock()
            .unwrap()
            .sessions
            .get(&userid)
            .map(|s| s.ready)
            .ok_or(ApiError::PlayerNotInGroup)
    }

    async fn join_queue(&self, groupid: GroupId, game: &Game) -> Result<Option<SlotId>, ApiError> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let group = state.groups.get(&groupid).ok_or(ApiError::GroupDoesntExist)?;
        if group.state != GroupState::GroupCheck {
            return Err(ApiError::wrong_state(group.state, &[GroupState::GroupCheck]));
        }
        if !group.members.iter().all(|m| state.sessions.get(m).is_some_and(|s| s.ready)) {
            return Err(ApiError::GroupNotReady);
        }

        let members = group.members.clone();
        let arriving = members.len();
        let capacity = game.capacity as usize;

        // Packing pass, strictly FIFO over the partial slots: never skip an old
        // slot in favor of a tighter fit.
        let queue = state.queues.entry(game.gameid).or_default();
        let mut chosen: Option<(SlotId, bool)> = None;
        for slotid in queue.iter().copied() {
            let occupied = state.slots.get(&slotid).map_or(0, |s| s.players.len());
            if occupied + arriving < capacity {
                chosen = Some((slotid, false));
                break;
            }
            if occupied + arriving == capacity {
                chosen = Some((slotid, true));
                break;
            }
        }

        let (slotid, filled) = match chosen {
            Some((slotid, filled)) => {
                let slot = state.slots.get_mut(&slotid).expect("queued slot vanished under the lock");
                slot.players.extend(members.iter().copied());
                slot.groups.push(groupid);
                (slotid, filled)
            }
            None => {
                // Overflow: nobody had room, open a fresh slot.
                let slotid = Uuid::new_v4();
                state.slots.insert(
                    slotid,
                    Slot {
                        slotid,
                        gameid: game.gameid,
                        players: members.clone(),
                        groups: vec![groupid],
                    },
                );
                state.queues.get_mut(&game.gameid).unwrap().push_back(slotid);
                (slotid, arriving == capacity)
            }
        };

        if filled {
            let queue = state.queues.get_mut(&game.gameid).unwrap();
            queue.retain(|s| *s != slotid);
        }

        let group = state.groups.get_mut(&groupid).expect("group vanished under the lock");
        group.state = GroupState::InQueue;
        group.slotid = Some(slotid);

        Ok(filled.then_some(slotid))
    }

    async fn leave_queue(&self, groupid: GroupId) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        InMemoryStore::detach_from_slot(&mut state, groupid)
    }

    async fn start_game(&self, game: &Game, slotid: SlotId) -> Result<Party, ApiError> {
        let mut state = self.state.lock().unwrap();
        let slot = state.slots.get(&slotid).ok_or(ApiError::NotFound("Slot".to_string()))?.clone();

        // Sample distinct external ports, rejecting collisions with every port
        // already bound by a live party.
        let mut rng = rand::thread_rng();
        let mut external_ports = Vec::with_capacity(game.internal_ports.len());
        for _ in &game.internal_ports {
            let mut picked = None;
            for _ in 0..PORT_SAMPLE_ATTEMPTS {
                let candidate = rng.gen_range(self.hosting.port_range_start..self.hosting.port_range_stop);
                if !state.used_ports.contains(&candidate) && !external_ports.contains(&candidate) {
                    picked = Some(candidate);
                    break;
                }
            }
            external_ports.push(picked.ok_or(ApiError::PortsExhausted)?);
        }

        let partyid = Uuid::new_v4();
        for groupid in &slot.groups {
            let group = state.groups.get_mut(groupid).ok_or(ApiError::GroupDoesntExist)?;
            group.state = GroupState::Playing;
            group.partyid = Some(partyid);
        }
        for userid in &slot.players {
            if let Some(session) = state.sessions.get_mut(userid) {
                session.partyid = Some(partyid);
            }
        }

        state.used_ports.extend(external_ports.iter().copied());
        let party = Party {
            partyid,
            gameid: game.gameid,
            slotid,
            host: self.hosting.host.clone(),
            external_ports,
        };
        state.parties.insert(partyid, party.clone());
        Ok(party)
    }

    async fn get_party(&self, partyid: PartyId) -> Result<Party, ApiError> {
        self
            .state
            .lock()
            .unwrap()
            .parties
            .get(&partyid)
            .cloned()
            .ok_or(ApiError::PartyDoesntExist)
    }

    async fn end_game(&self, partyid: PartyId) -> Result<Vec<GroupId>, ApiError> {
        let mut state = self.state.lock().unwrap();
        let party = state.parties.remove(&partyid).ok_or(ApiError::PartyDoesntExist)?;
        for port in &party.external_ports {
            state.used_ports.remove(port);
        }

        let slot = state.slots.remove(&party.slotid);
        let Some(slot) = slot else {
            return Ok(vec![]);
        };

        for groupid in &slot.groups {
            if let Some(group) = state.groups.get_mut(groupid) {
                group.state = GroupState::GroupCheck;
                group.partyid = None;
                group.slotid = None;
            }
        }
        for userid in &slot.players {
            if let Some(session) = state.sessions.get_mut(userid) {
                session.partyid = None;
            }
        }
        Ok(slot.groups)
    }

    async fn get_slot(&self, slotid: SlotId) -> Result<Slot, ApiError> {
        self
            .state
            .lock()
            .unwrap()
            .slots
            .get(&slotid)
            .cloned()
            .ok_or_else(|| ApiError::NotFound("Slot".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::GroupState;

    fn test_store() -> InMemoryStore {
        InMemoryStore::new(GameHostConfig {
            host: "games.test".to_string(),
            port_range_start: 42000,
            port_range_stop: 43000,
        })
    }

    fn test_game(capacity: u32) -> Game {
        Game {
            gameid: 1,
            name: "skirmish".to_string(),
            ownerid: Uuid::new_v4(),
            capacity,
            image: "games/skirmish:1".to_string(),
            internal_ports: vec![7777],
        }
    }

    /// Walk the whole store and assert every cross-entity invariant.
    fn assert_invariants(store: &InMemoryStore, game: &Game) {
        let state = store.state.lock().unwrap();
        for (userid, session) in &state.sessions {
            let group = state.groups.get(&session.groupid).expect("session points at a live group");
            assert!(group.members.contains(userid), "group contains its session holders");
        }
        for (groupid, group) in &state.groups {
            for member in &group.members {
                let session = state.sessions.get(member).expect("every member has a session");
                assert_eq!(session.groupid, *groupid);
            }
            if let Some(slotid) = group.slotid {
                let slot = state.slots.get(&slotid).expect("slotid points at a live slot");
                assert!(slot.groups.contains(groupid));
                assert!(group.members.iter().all(|m| slot.players.contains(m)));
            }
            if group.state == GroupState::Playing {
                let partyid = group.partyid.expect("playing groups have a party");
                for member in &group.members {
                    assert_eq!(state.sessions[member].partyid, Some(partyid));
                }
            }
        }
        for slot in state.slots.values() {
            assert!(!slot.players.is_empty(), "zero-member slots never exist");
            assert!(slot.players.len() <= game.capacity as usize);
            let queued = state.queues.get(&slot.gameid).is_some_and(|q| q.contains(&slot.slotid));
            if slot.players.len() == game.capacity as usize {
                assert!(!queued, "a full slot is never queued");
            }
        }
    }

    async fn ready_group(store: &InMemoryStore, game: &Game, size: usize) -> (GroupId, Vec<UserId>) {
        let users: Vec<UserId> = (0..size).map(|_| Uuid::new_v4()).collect();
        let groupid = store.create_group(users[0], game).await.unwrap();
        for user in &users[1..] {
            store.join_group(groupid, *user, game).await.unwrap();
        }
        for user in &users {
            store.mark_ready(*user).await.unwrap();
        }
        (groupid, users)
    }

    #[tokio::test]
    async fn test_create_group_rejects_second_group() {
        let store = test_store();
        let game = test_game(4);
        let user = Uuid::new_v4();
        store.create_group(user, &game).await.unwrap();
        assert_eq!(
            store.create_group(user, &game).await.unwrap_err(),
            ApiError::PlayerInGroupAlready
        );
    }

    #[tokio::test]
    async fn test_join_group_capacity_and_state_checks() {
        let store = test_store();
        let game = test_game(2);
        let (host, guest, late) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let groupid = store.create_group(host, &game).await.unwrap();

        assert_eq!(
            store.join_group(Uuid::new_v4(), guest, &game).await.unwrap_err(),
            ApiError::GroupDoesntExist
        );
        store.join_group(groupid, guest, &game).await.unwrap();
        assert_eq!(
            store.join_group(groupid, late, &game).await.unwrap_err(),
            ApiError::GroupIsFull
        );
        assert_eq!(
            store.join_group(groupid, guest, &game).await.unwrap_err(),
            ApiError::PlayerInGroupAlready
        );
    }

    #[tokio::test]
    async fn test_queued_group_is_immutable() {
        let store = test_store();
        let game = test_game(3);
        let (groupid, _) = ready_group(&store, &game, 2).await;
        store.join_queue(groupid, &game).await.unwrap();

        let err = store.join_group(groupid, Uuid::new_v4(), &game).await.unwrap_err();
        assert!(matches!(err, ApiError::WrongGroupState { current: GroupState::InQueue, .. }));
        let err = store.mark_ready(store.get_group(groupid).await.unwrap().members[0]).await.unwrap_err();
        assert!(matches!(err, ApiError::WrongGroupState { .. }));
    }

    #[tokio::test]
    async fn test_join_queue_requires_everyone_ready() {
        let store = test_store();
        let game = test_game(4);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let groupid = store.create_group(a, &game).await.unwrap();
        store.join_group(groupid, b, &game).await.unwrap();
        store.mark_ready(a).await.unwrap();

        assert_eq!(store.join_queue(groupid, &game).await.unwrap_err(), ApiError::GroupNotReady);
        // A failed gate keeps the state.
        assert_eq!(store.get_group(groupid).await.unwrap().state, GroupState::GroupCheck);

        store.mark_ready(b).await.unwrap();
        assert_eq!(store.join_queue(groupid, &game).await.unwrap(), None);
        assert_eq!(store.get_group(groupid).await.unwrap().state, GroupState::InQueue);
        assert_invariants(&store, &game);
    }

    /// Capacity 4, groups of 3, 2, 1. B cannot fit the partial slot and
    /// overflows; C tops the oldest slot off, which launches it.
    #[test_log::test(tokio::test)]
    async fn test_exact_fill_packing() {
        let store = test_store();
        let game = test_game(4);
        let (group_a, _) = ready_group(&store, &game, 3).await;
        let (group_b, _) = ready_group(&store, &game, 2).await;
        let (group_c, _) = ready_group(&store, &game, 1).await;

        assert_eq!(store.join_queue(group_a, &game).await.unwrap(), None);
        let slot_a = store.get_group(group_a).await.unwrap().slotid.unwrap();

        // B (2) does not fit A's slot (3+2 > 4): overflow to a fresh slot.
        assert_eq!(store.join_queue(group_b, &game).await.unwrap(), None);
        let slot_b = store.get_group(group_b).await.unwrap().slotid.unwrap();
        assert_ne!(slot_a, slot_b);

        // C (1) tops off A's slot and fills it.
        let filled = store.join_queue(group_c, &game).await.unwrap();
        assert_eq!(filled, Some(slot_a));
        let slot = store.get_slot(slot_a).await.unwrap();
        assert_eq!(slot.players.len(), 4);
        assert_eq!(slot.groups, vec![group_a, group_c]);

        let party = store.start_game(&game, slot_a).await.unwrap();
        assert_eq!(store.get_group(group_a).await.unwrap().state, GroupState::Playing);
        assert_eq!(store.get_group(group_c).await.unwrap().partyid, Some(party.partyid));
        // B is untouched, still queued on its own slot.
        let group_b_row = store.get_group(group_b).await.unwrap();
        assert_eq!(group_b_row.state, GroupState::InQueue);
        assert_eq!(group_b_row.slotid, Some(slot_b));
        assert_invariants(&store, &game);
    }

    #[tokio::test]
    async fn test_capacity_one_launches_immediately() {
        let store = test_store();
        let game = test_game(1);
        let (groupid, _) = ready_group(&store, &game, 1).await;
        let filled = store.join_queue(groupid, &game).await.unwrap();
        assert!(filled.is_some(), "solo game fills its slot on arrival");
        assert_invariants(&store, &game);
    }

    #[tokio::test]
    async fn test_join_then_leave_queue_round_trip() {
        let store = test_store();
        let game = test_game(4);
        let (groupid, _) = ready_group(&store, &game, 2).await;

        store.join_queue(groupid, &game).await.unwrap();
        store.leave_queue(groupid).await.unwrap();

        let group = store.get_group(groupid).await.unwrap();
        assert_eq!(group.state, GroupState::GroupCheck);
        assert_eq!(group.slotid, None);
        // The emptied slot is gone from the queue and the world.
        assert!(store.state.lock().unwrap().slots.is_empty());
        assert!(store.state.lock().unwrap().queues[&game.gameid].is_empty());
        assert_invariants(&store, &game);
    }

    #[tokio::test]
    async fn test_leave_queue_keeps_other_groups_slot() {
        let store = test_store();
        let game = test_game(4);
        let (group_a, _) = ready_group(&store, &game, 2).await;
        let (group_b, _) = ready_group(&store, &game, 1).await;

        store.join_queue(group_a, &game).await.unwrap();
        store.join_queue(group_b, &game).await.unwrap();
        let slotid = store.get_group(group_a).await.unwrap().slotid.unwrap();
        assert_eq!(store.get_group(group_b).await.unwrap().slotid, Some(slotid));

        store.leave_queue(group_a).await.unwrap();
        let slot = store.get_slot(slotid).await.unwrap();
        assert_eq!(slot.players.len(), 1);
        assert_eq!(slot.groups, vec![group_b]);
        assert_invariants(&store, &game);
    }

    /// Queue reversal: `mark_not_ready` while queued pulls the group out and
    /// clears only the caller's flag.
    #[tokio::test]
    async fn test_not_ready_in_queue_clears_caller_only() {
        let store = test_store();
        let game = test_game(4);
        let (groupid, users) = ready_group(&store, &game, 2).await;
        store.join_queue(groupid, &game).await.unwrap();

        store.mark_not_ready(users[0]).await.unwrap();
        let group = store.get_group(groupid).await.unwrap();
        assert_eq!(group.state, GroupState::GroupCheck);
        assert!(!store.is_user_ready(users[0]).await.unwrap());
        assert!(store.is_user_ready(users[1]).await.unwrap(), "other member keeps their flag");
        assert_invariants(&store, &game);
    }

    #[tokio::test]
    async fn test_ready_round_trip() {
        let store = test_store();
        let game = test_game(2);
        let user = Uuid::new_v4();
        store.create_group(user, &game).await.unwrap();
        assert!(!store.is_user_ready(user).await.unwrap());
        store.mark_ready(user).await.unwrap();
        assert!(store.is_user_ready(user).await.unwrap());
        store.mark_not_ready(user).await.unwrap();
        assert!(!store.is_user_ready(user).await.unwrap());
    }

    #[tokio::test]
    async fn test_leave_group_while_queued_detaches_first() {
        let store = test_store();
        let game = test_game(4);
        let (group_a, users_a) = ready_group(&store, &game, 2).await;
        let (group_b, _) = ready_group(&store, &game, 1).await;
        store.join_queue(group_a, &game).await.unwrap();
        store.join_queue(group_b, &game).await.unwrap();
        let slotid = store.get_group(group_a).await.unwrap().slotid.unwrap();

        // Leaving the group mid-queue removes BOTH of A's players from the slot.
        store.leave_group(users_a[0]).await.unwrap();
        let slot = store.get_slot(slotid).await.unwrap();
        assert_eq!(slot.players.len(), 1, "the whole group left the slot, not just the leaver");
        assert_eq!(slot.groups, vec![group_b]);

        // A itself is back to GROUP_CHECK with one member left.
        let group = store.get_group(group_a).await.unwrap();
        assert_eq!(group.state, GroupState::GroupCheck);
        assert_eq!(group.members, vec![users_a[1]]);
        assert_invariants(&store, &game);
    }

    #[tokio::test]
    async fn test_create_then_leave_deletes_group_and_session() {
        let store = test_store();
        let game = test_game(4);
        let user = Uuid::new_v4();
        let groupid = store.create_group(user, &game).await.unwrap();
        store.leave_group(user).await.unwrap();
        assert_eq!(store.get_group(groupid).await.unwrap_err(), ApiError::GroupDoesntExist);
        assert_eq!(store.get_user(user).await.unwrap_err(), ApiError::PlayerNotInGroup);
    }

    #[tokio::test]
    async fn test_playing_group_cannot_shed_members() {
        let store = test_store();
        let game = test_game(1);
        let (groupid, users) = ready_group(&store, &game, 1).await;
        let slotid = store.join_queue(groupid, &game).await.unwrap().unwrap();
        store.start_game(&game, slotid).await.unwrap();

        let err = store.leave_group(users[0]).await.unwrap_err();
        assert!(matches!(err, ApiError::WrongGroupState { current: GroupState::Playing, .. }));
    }

    #[test_log::test(tokio::test)]
    async fn test_end_game_restores_groups_and_frees_everything() {
        let store = test_store();
        let game = test_game(4);
        let (group_a, users_a) = ready_group(&store, &game, 3).await;
        let (group_c, users_c) = ready_group(&store, &game, 1).await;
        store.join_queue(group_a, &game).await.unwrap();
        let slotid = store.join_queue(group_c, &game).await.unwrap().unwrap();
        let party = store.start_game(&game, slotid).await.unwrap();

        let groups = store.end_game(party.partyid).await.unwrap();
        assert_eq!(groups.len(), 2);
        for groupid in [group_a, group_c] {
            let group = store.get_group(groupid).await.unwrap();
            assert_eq!(group.state, GroupState::GroupCheck);
            assert_eq!(group.partyid, None);
            assert_eq!(group.slotid, None);
        }
        for user in users_a.iter().chain(&users_c) {
            assert_eq!(store.get_user(*user).await.unwrap().partyid, None);
        }
        assert_eq!(store.get_party(party.partyid).await.unwrap_err(), ApiError::PartyDoesntExist);
        assert!(store.state.lock().unwrap().used_ports.is_empty(), "external ports are freed");
        assert_invariants(&store, &game);
    }

    #[tokio::test]
    async fn test_port_allocation_is_distinct_and_tracked() {
        let store = InMemoryStore::new(GameHostConfig {
            host: "games.test".to_string(),
            port_range_start: 42000,
            port_range_stop: 42002,
        });
        let mut game = test_game(1);
        game.internal_ports = vec![7777, 7778];
        let (groupid, _) = ready_group(&store, &game, 1).await;
        let slotid = store.join_queue(groupid, &game).await.unwrap().unwrap();
        let party = store.start_game(&game, slotid).await.unwrap();

        assert_eq!(party.external_ports.len(), 2);
        assert_ne!(party.external_ports[0], party.external_ports[1]);
        assert!(party.external_ports.iter().all(|p| (42000..42002).contains(p)));

        // Range is exhausted now: a second party cannot allocate.
        let (group_b, _) = ready_group(&store, &game, 1).await;
        let slot_b = store.join_queue(group_b, &game).await.unwrap().unwrap();
        assert_eq!(store.start_game(&game, slot_b).await.unwrap_err(), ApiError::PortsExhausted);
    }

    #[tokio::test]
    async fn test_revocation_prunes_expired_entries_on_write() {
        let store = test_store();
        let stale = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        let now = unix_now();

        store.revoke_token(stale, now - 10).await.unwrap();
        assert!(store.is_token_revoked(stale).await.unwrap());

        // The next write prunes the expired entry.
        store.revoke_token(fresh, now + 3600).await.unwrap();
        assert!(!store.is_token_revoked(stale).await.unwrap());
        assert!(store.is_token_revoked(fresh).await.unwrap());
    }
}
