use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cannot find session {0}; it might have expired")]
pub struct SessionNotFound(pub String);

/// How a session maps request frame indices onto its tracking state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingMode {
    /// Backed by a whole video; frame indices are absolute.
    Stateful,
    /// Holds one frame at a time; a new frame index resets all objects.
    Stateless,
}

impl TrackingMode {
    pub fn from_frame_count(frame_count: usize) -> Self {
        if frame_count > 1 {
            TrackingMode::Stateful
        } else {
            TrackingMode::Stateless
        }
    }
}

#[derive(Debug)]
pub struct Session<S> {
    pub state: S,
    pub mode: TrackingMode,
    pub last_frame_index: Option<u32>,
    /// Set once the session has been closed. Only the handle returned by
    /// [`SessionStore::close`] ever observes it.
    pub canceled: bool,
    last_used: Instant,
}

impl<S> Session<S> {
    pub fn new(state: S, mode: TrackingMode) -> Self {
        Self {
            state,
            mode,
            last_frame_index: None,
            canceled: false,
            last_used: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }
}

/// Session id to tracking state.
///
/// Carries no lock of its own: it lives next to the predictor behind the
/// orchestrator's mutex so that creating a session and initializing its
/// model state happen as one step. The open session count is mirrored into
/// an atomic that can be read without that mutex.
#[derive(Debug)]
pub struct SessionStore<S> {
    sessions: HashMap<String, Session<S>>,
    idle_ttl: Option<Duration>,
    open: Arc<AtomicUsize>,
}

impl<S> SessionStore<S> {
    pub fn new() -> Self {
        Self::with_idle_ttl(None)
    }

    pub fn with_idle_ttl(idle_ttl: Option<Duration>) -> Self {
        Self {
            sessions: HashMap::new(),
            idle_ttl,
            open: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared view of [`SessionStore::len`], kept current on every insert and removal.
    pub fn open_counter(&self) -> Arc<AtomicUsize> {
        self.open.clone()
    }

    fn sync_open_count(&self) {
        self.open.store(self.sessions.len(), Ordering::SeqCst);
    }

    /// Inserts a session, generating an id when none is given.
    /// An existing session under the same id is replaced.
    pub fn create(&mut self, id: Option<String>, state: S, mode: TrackingMode) -> String {
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.sessions.insert(id.clone(), Session::new(state, mode));
        self.sync_open_count();
        id
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Result<&Session<S>, SessionNotFound> {
        self.sessions
            .get(id)
            .ok_or_else(|| SessionNotFound(id.to_string()))
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut Session<S>, SessionNotFound> {
        self.sessions
            .get_mut(id)
            .ok_or_else(|| SessionNotFound(id.to_string()))
    }

    /// Removes the session and hands it back marked as canceled.
    pub fn close(&mut self, id: &str) -> Option<Session<S>> {
        match self.sessions.remove(id) {
            Some(mut session) => {
                session.canceled = true;
                self.sync_open_count();
                tracing::info!("removed session {}", id);
                Some(session)
            }
            None => {
                tracing::warn!("cannot close session {} as it does not exist", id);
                None
            }
        }
    }

    /// Drops sessions idle for longer than the configured TTL.
    pub fn evict_idle(&mut self, now: Instant) -> Vec<String> {
        let Some(ttl) = self.idle_ttl else {
            return Vec::new();
        };

        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.idle_for(now) > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.sessions.remove(id);
            tracing::info!("evicted idle session {}", id);
        }
        self.sync_open_count();
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl<S> Default for SessionStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_get_close() {
        let mut store = SessionStore::new();
        let id = store.create(None, 7u32, TrackingMode::Stateless);

        assert_eq!(uuid::Uuid::parse_str(&id).unwrap().get_version_num(), 4);
        assert_eq!(store.get(&id).unwrap().state, 7);
        assert_eq!(store.get(&id).unwrap().last_frame_index, None);
        let closed = store.close(&id).unwrap();
        assert!(closed.canceled);
        assert_eq!(closed.state, 7);
        assert!(store.close(&id).is_none());
        assert_eq!(store.get(&id).unwrap_err(), SessionNotFound(id.clone()));
    }

    #[test]
    fn test_create_with_explicit_id() {
        let mut store = SessionStore::new();
        let id = store.create(Some("abc".into()), (), TrackingMode::Stateful);

        assert_eq!(id, "abc");
        assert!(store.contains("abc"));
        assert_eq!(store.get_mut("abc").unwrap().mode, TrackingMode::Stateful);
    }

    #[test]
    fn test_mode_from_frame_count() {
        assert_eq!(TrackingMode::from_frame_count(0), TrackingMode::Stateless);
        assert_eq!(TrackingMode::from_frame_count(1), TrackingMode::Stateless);
        assert_eq!(TrackingMode::from_frame_count(2), TrackingMode::Stateful);
    }

    #[test]
    fn test_no_eviction_without_ttl() {
        let mut store = SessionStore::new();
        store.create(None, (), TrackingMode::Stateless);

        let later = Instant::now() + Duration::from_secs(365 * 24 * 3600);
        assert!(store.evict_idle(later).is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_idle_sessions_are_evicted() {
        let mut store = SessionStore::with_idle_ttl(Some(Duration::from_secs(10)));
        let stale = store.create(Some("stale".into()), (), TrackingMode::Stateless);
        let now = Instant::now();

        assert!(store.evict_idle(now).is_empty());
        assert_eq!(store.evict_idle(now + Duration::from_secs(11)), vec![stale]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_open_counter_follows_store() {
        let mut store = SessionStore::with_idle_ttl(Some(Duration::from_secs(10)));
        let open = store.open_counter();

        store.create(Some("a".into()), (), TrackingMode::Stateless);
        store.create(Some("b".into()), (), TrackingMode::Stateless);
        store.create(Some("b".into()), (), TrackingMode::Stateless);
        assert_eq!(open.load(Ordering::SeqCst), 2);

        store.close("a");
        assert_eq!(open.load(Ordering::SeqCst), 1);

        store.evict_idle(Instant::now() + Duration::from_secs(11));
        assert_eq!(open.load(Ordering::SeqCst), 0);
    }
}
