use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

/// Unique identifier for a UI session.
pub type SessionId = String;

/// Identifier of a content object (container) in the media library.
pub type ObjectId = i32;

/// Placeholder id that never names a real object.
pub const INVALID_OBJECT_ID: ObjectId = -333;

/// Number of pending container ids at which a session stops tracking
/// individual ids and asks the UI to refresh everything.
pub const MAX_UI_UPDATE_IDS: usize = 10;

/// Pending UI changes drained from a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiUpdates {
    Nothing,
    /// Too many containers changed; the UI should reload everything.
    All,
    /// Changed container ids, ascending.
    Ids(Vec<ObjectId>),
}

impl UiUpdates {
    pub fn is_nothing(&self) -> bool {
        matches!(self, UiUpdates::Nothing)
    }
}

impl fmt::Display for UiUpdates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UiUpdates::Nothing => Ok(()),
            UiUpdates::All => f.write_str("all"),
            UiUpdates::Ids(ids) => {
                for (i, id) in ids.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{id}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    values: HashMap<String, String>,
    update_ids: HashSet<ObjectId>,
}

/// Server-side state of one UI client.
///
/// `update_all` and `has_update_ids` mirror the aggregator so that
/// [`Session::has_pending_updates`] can be answered without the lock; they
/// are only written while the lock is held.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    timeout: Duration,
    last_access: Mutex<Instant>,
    logged_in: AtomicBool,
    state: Mutex<SessionState>,
    update_all: AtomicBool,
    has_update_ids: AtomicBool,
}

impl Session {
    pub fn new(id: SessionId, timeout: Duration) -> Self {
        Self {
            id,
            timeout,
            last_access: Mutex::new(Instant::now()),
            logged_in: AtomicBool::new(false),
            state: Mutex::new(SessionState::default()),
            update_all: AtomicBool::new(false),
            has_update_ids: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state().values.insert(key.into(), value.into());
    }

    /// Value stored under `key`, or an empty string.
    pub fn get(&self, key: &str) -> String {
        self.state().values.get(key).cloned().unwrap_or_default()
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::Acquire)
    }

    pub fn set_logged_in(&self, logged_in: bool) {
        self.logged_in.store(logged_in, Ordering::Release);
    }

    /// Record user activity.
    pub fn touch(&self) {
        *self.last_access_guard() = Instant::now();
    }

    pub fn last_access(&self) -> Instant {
        *self.last_access_guard()
    }

    /// Time since the last access, measured against `now`.
    pub fn idle_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access())
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.idle_time(now) > self.timeout
    }

    /// Note that container `id` changed.
    pub fn mark_container_changed(&self, id: ObjectId) {
        if id == INVALID_OBJECT_ID || self.update_all.load(Ordering::Acquire) {
            return;
        }

        let mut state = self.state();
        if self.update_all.load(Ordering::Acquire) || state.update_ids.contains(&id) {
            return;
        }
        if state.update_ids.len() + 1 >= MAX_UI_UPDATE_IDS {
            self.overflow(&mut state);
        } else {
            state.update_ids.insert(id);
            self.has_update_ids.store(true, Ordering::Release);
        }
    }

    /// Batch form of [`Session::mark_container_changed`]. Overflows as soon as
    /// the pending count plus the batch size reaches the cap.
    pub fn mark_containers_changed(&self, ids: &[ObjectId]) {
        if ids.is_empty() || self.update_all.load(Ordering::Acquire) {
            return;
        }

        let mut state = self.state();
        if self.update_all.load(Ordering::Acquire) {
            return;
        }
        if state.update_ids.len() + ids.len() >= MAX_UI_UPDATE_IDS {
            self.overflow(&mut state);
            return;
        }
        state
            .update_ids
            .extend(ids.iter().copied().filter(|id| *id != INVALID_OBJECT_ID));
        self.has_update_ids
            .store(!state.update_ids.is_empty(), Ordering::Release);
    }

    /// Take the pending updates, leaving the aggregator empty.
    pub fn drain_update_ids(&self) -> UiUpdates {
        if !self.has_pending_updates() {
            return UiUpdates::Nothing;
        }

        let mut state = self.state();
        if self.update_all.swap(false, Ordering::AcqRel) {
            return UiUpdates::All;
        }
        if state.update_ids.is_empty() {
            return UiUpdates::Nothing;
        }
        let mut ids: Vec<ObjectId> = state.update_ids.drain().collect();
        ids.sort_unstable();
        self.has_update_ids.store(false, Ordering::Release);
        UiUpdates::Ids(ids)
    }

    /// Lock-free check whether a drain would return something. May be stale.
    pub fn has_pending_updates(&self) -> bool {
        self.update_all.load(Ordering::Acquire) || self.has_update_ids.load(Ordering::Acquire)
    }

    pub fn clear_update_ids(&self) {
        debug!(session_id = %self.id, "clearing UI update ids");
        let mut state = self.state();
        state.update_ids.clear();
        self.has_update_ids.store(false, Ordering::Release);
        self.update_all.store(false, Ordering::Release);
    }

    fn overflow(&self, state: &mut SessionState) {
        state.update_ids.clear();
        self.has_update_ids.store(false, Ordering::Release);
        self.update_all.store(true, Ordering::Release);
        debug!(session_id = %self.id, "UI update ids overflowed");
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn last_access_guard(&self) -> MutexGuard<'_, Instant> {
        self.last_access.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
