//! Conversation history keyed by opaque session tokens.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::protocol::Turn;

/// Storage for per-session conversation history.
///
/// Unknown tokens are never an error: reads return an empty history and
/// writes create the session.
pub trait SessionStore: Send + Sync {
    /// Register a fresh session and return its token.
    fn create_session(&self) -> String;

    fn append_turn(&self, token: &str, turn: Turn) {
        self.append_turns(token, std::slice::from_ref(&turn));
    }

    /// Append `turns` in order as one step.
    fn append_turns(&self, token: &str, turns: &[Turn]);

    /// Snapshot of the history, oldest first.
    fn history(&self, token: &str) -> Vec<Turn>;

    /// Lock that serializes read-call-append sequences for one token.
    ///
    /// Taking a lane does not create the session, and a held lane outlives
    /// expiry or eviction of the session it guards.
    fn session_lane(&self, token: &str) -> Arc<tokio::sync::Mutex<()>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired sessions, returning how many were removed.
    fn purge_expired(&self) -> usize {
        0
    }
}

type Lane = Arc<tokio::sync::Mutex<()>>;

const MIN_LANE_PRUNE_AT: usize = 64;

struct SessionEntry {
    turns: Vec<Turn>,
    last_active: Instant,
}

impl SessionEntry {
    fn new(now: Instant) -> Self {
        Self {
            turns: Vec::new(),
            last_active: now,
        }
    }
}

#[derive(Default)]
struct LaneTable {
    lanes: FxHashMap<String, Lane>,
    prune_at: usize,
}

impl LaneTable {
    fn lane(&mut self, token: &str) -> Lane {
        if let Some(lane) = self.lanes.get(token) {
            return Arc::clone(lane);
        }
        if self.lanes.len() >= self.prune_at {
            self.prune_idle();
            self.prune_at = (self.lanes.len() * 2).max(MIN_LANE_PRUNE_AT);
        }
        let lane = Lane::default();
        self.lanes.insert(token.to_string(), Arc::clone(&lane));
        lane
    }

    /// Drop lanes that nobody holds or waits on.
    fn prune_idle(&mut self) -> usize {
        let before = self.lanes.len();
        self.lanes.retain(|_, lane| Arc::strong_count(lane) > 1);
        before - self.lanes.len()
    }
}

/// In-process [`SessionStore`] with idle expiry and a session cap.
pub struct MemorySessionStore {
    sessions: RwLock<FxHashMap<String, SessionEntry>>,
    lanes: Mutex<LaneTable>,
    ttl: Option<Duration>,
    max_sessions: usize,
}

impl MemorySessionStore {
    /// `ttl` of zero keeps sessions forever; `max_sessions` of zero is unbounded.
    #[must_use]
    pub fn new(ttl: Duration, max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(FxHashMap::default()),
            lanes: Mutex::new(LaneTable::default()),
            ttl: (!ttl.is_zero()).then_some(ttl),
            max_sessions,
        }
    }

    fn is_expired(&self, entry: &SessionEntry, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(entry.last_active) > ttl)
    }

    /// Get the live entry for `token`, creating (and evicting) as needed.
    fn entry_mut<'a>(
        &self,
        sessions: &'a mut FxHashMap<String, SessionEntry>,
        token: &str,
        now: Instant,
    ) -> &'a mut SessionEntry {
        let expired = sessions
            .get(token)
            .is_some_and(|entry| self.is_expired(entry, now));
        if expired {
            sessions.remove(token);
            tracing::debug!(session = token, "session expired");
        }
        if !sessions.contains_key(token) {
            self.make_room(sessions, now);
        }
        let entry = sessions
            .entry(token.to_string())
            .or_insert_with(|| SessionEntry::new(now));
        entry.last_active = now;
        entry
    }

    fn make_room(&self, sessions: &mut FxHashMap<String, SessionEntry>, now: Instant) {
        if self.max_sessions == 0 || sessions.len() < self.max_sessions {
            return;
        }
        if self.ttl.is_some() {
            sessions.retain(|_, entry| !self.is_expired(entry, now));
        }
        while sessions.len() >= self.max_sessions {
            let Some(oldest) = sessions
                .iter()
                .min_by_key(|(_, entry)| entry.last_active)
                .map(|(token, _)| token.clone())
            else {
                break;
            };
            sessions.remove(&oldest);
            tracing::debug!(session = %oldest, "session evicted at capacity");
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn create_session(&self) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        let now = Instant::now();
        let mut sessions = self.sessions.write();
        self.entry_mut(&mut sessions, &token, now);
        token
    }

    fn append_turns(&self, token: &str, turns: &[Turn]) {
        let now = Instant::now();
        let mut sessions = self.sessions.write();
        self.entry_mut(&mut sessions, token, now)
            .turns
            .extend_from_slice(turns);
    }

    fn history(&self, token: &str) -> Vec<Turn> {
        let now = Instant::now();
        let sessions = self.sessions.read();
        match sessions.get(token) {
            Some(entry) if !self.is_expired(entry, now) => entry.turns.clone(),
            _ => Vec::new(),
        }
    }

    fn session_lane(&self, token: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.lanes.lock().lane(token)
    }

    fn len(&self) -> usize {
        self.sessions.read().len()
    }

    fn purge_expired(&self) -> usize {
        self.lanes.lock().prune_idle();
        if self.ttl.is_none() {
            return 0;
        }
        let now = Instant::now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, entry| !self.is_expired(entry, now));
        before - sessions.len()
    }
}

/// Periodically purge expired sessions until the runtime shuts down.
pub fn spawn_purge_task(store: Arc<dyn SessionStore>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let removed = store.purge_expired();
            if removed > 0 {
                tracing::debug!(removed, remaining = store.len(), "purged expired sessions");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemorySessionStore {
        MemorySessionStore::new(Duration::ZERO, 0)
    }

    #[test]
    fn unknown_token_reads_empty() {
        let store = store();
        assert!(store.history("missing").is_empty());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn append_creates_session_implicitly() {
        let store = store();
        store.append_turn("ad-hoc", Turn::user("hello"));
        assert_eq!(store.history("ad-hoc"), vec![Turn::user("hello")]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn history_preserves_order() {
        let store = store();
        let token = store.create_session();
        assert!(uuid::Uuid::parse_str(&token).is_ok());
        store.append_turns(&token, &[Turn::user("q1"), Turn::assistant("a1")]);
        store.append_turns(&token, &[Turn::user("q2"), Turn::assistant("a2")]);
        assert_eq!(
            store.history(&token),
            vec![
                Turn::user("q1"),
                Turn::assistant("a1"),
                Turn::user("q2"),
                Turn::assistant("a2"),
            ]
        );
    }

    #[test]
    fn tokens_are_unique() {
        let store = store();
        let first = store.create_session();
        let second = store.create_session();
        assert_ne!(first, second);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn idle_sessions_expire() {
        let store = MemorySessionStore::new(Duration::from_millis(30), 0);
        let token = store.create_session();
        store.append_turn(&token, Turn::user("hi"));
        std::thread::sleep(Duration::from_millis(60));

        assert!(store.history(&token).is_empty());
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 0);

        store.append_turn(&token, Turn::user("again"));
        assert_eq!(store.history(&token), vec![Turn::user("again")]);
    }

    #[test]
    fn capacity_evicts_least_recently_active() {
        let store = MemorySessionStore::new(Duration::ZERO, 2);
        store.append_turn("a", Turn::user("1"));
        std::thread::sleep(Duration::from_millis(2));
        store.append_turn("b", Turn::user("2"));
        std::thread::sleep(Duration::from_millis(2));
        store.append_turn("a", Turn::user("3"));
        std::thread::sleep(Duration::from_millis(2));
        store.append_turn("c", Turn::user("4"));

        assert_eq!(store.len(), 2);
        assert!(store.history("b").is_empty());
        assert_eq!(store.history("a").len(), 2);
        assert_eq!(store.history("c").len(), 1);
    }

    #[test]
    fn lane_is_shared_per_token() {
        let store = store();
        let first = store.session_lane("t");
        let second = store.session_lane("t");
        let other = store.session_lane("u");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[tokio::test]
    async fn lane_serializes_holders() {
        let store = store();
        let lane = store.session_lane("t");
        let guard = lane.lock().await;
        assert!(store.session_lane("t").try_lock().is_err());
        drop(guard);
        assert!(store.session_lane("t").try_lock().is_ok());
    }

    #[tokio::test]
    async fn held_lane_survives_eviction() {
        let store = MemorySessionStore::new(Duration::ZERO, 1);
        store.append_turn("t", Turn::user("hi"));
        let lane = store.session_lane("t");
        let _guard = lane.lock().await;

        store.append_turn("u", Turn::user("evicts t"));
        assert!(store.history("t").is_empty());
        assert!(store.session_lane("t").try_lock().is_err());
    }

    #[tokio::test]
    async fn held_lane_survives_expiry_and_purge() {
        let store = MemorySessionStore::new(Duration::from_millis(20), 0);
        store.append_turn("t", Turn::user("hi"));
        let lane = store.session_lane("t");
        let guard = lane.lock().await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(store.purge_expired(), 1);
        assert!(store.session_lane("t").try_lock().is_err());
        drop(guard);
        drop(lane);
        store.purge_expired();
        assert!(store.session_lane("t").try_lock().is_ok());
    }

    #[test]
    fn lane_does_not_create_session() {
        let store = store();
        let _lane = store.session_lane("t");
        assert_eq!(store.len(), 0);
        assert!(store.history("t").is_empty());
    }

    #[test]
    fn idle_lanes_are_pruned() {
        let store = store();
        let held = store.session_lane("held");
        for i in 0..(MIN_LANE_PRUNE_AT * 3) {
            drop(store.session_lane(&format!("t{i}")));
        }
        assert!(store.lanes.lock().lanes.len() < MIN_LANE_PRUNE_AT * 3);
        assert!(Arc::ptr_eq(&held, &store.session_lane("held")));
    }
}
