use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::CairnError;
use crate::session::{ObjectId, Session, SessionId};
use crate::timer::{SubscriptionId, Timer, TimerCallback};

/// How often idle sessions are swept while any session exists.
pub const DEFAULT_SESSION_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Id allocation gives up after this many collisions in a row.
pub const MAX_SESSION_ID_ATTEMPTS: usize = 100;

pub type IdGenerator = Box<dyn Fn() -> SessionId + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub check_interval: Duration,
    pub max_id_attempts: usize,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_SESSION_CHECK_INTERVAL,
            max_id_attempts: MAX_SESSION_ID_ATTEMPTS,
        }
    }
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, Arc<Session>>,
    /// Present exactly while `sessions` is non-empty.
    subscription: Option<SubscriptionId>,
}

struct Inner {
    registry: Mutex<Registry>,
    accounts: HashMap<String, String>,
    timer: Arc<dyn Timer>,
    config: SessionManagerConfig,
}

/// Registry of UI sessions.
///
/// Subscribes to the shared [`Timer`] when the first session appears and
/// unsubscribes when the last one goes, so an idle server never sweeps.
pub struct SessionManager {
    inner: Arc<Inner>,
    generate_id: IdGenerator,
}

impl SessionManager {
    /// `accounts` maps UI user names to passwords and is never modified.
    ///
    /// A zero `check_interval` falls back to [`DEFAULT_SESSION_CHECK_INTERVAL`].
    pub fn new(
        accounts: HashMap<String, String>,
        timer: Arc<dyn Timer>,
        mut config: SessionManagerConfig,
    ) -> Self {
        if config.check_interval.is_zero() {
            warn!(
                default_secs = DEFAULT_SESSION_CHECK_INTERVAL.as_secs(),
                "session check interval is zero, using the default"
            );
            config.check_interval = DEFAULT_SESSION_CHECK_INTERVAL;
        }
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                accounts,
                timer,
                config,
            }),
            generate_id: Box::new(random_session_id),
        }
    }

    /// Replace the session id source.
    pub fn with_id_generator(
        mut self,
        generate_id: impl Fn() -> SessionId + Send + Sync + 'static,
    ) -> Self {
        self.generate_id = Box::new(generate_id);
        self
    }

    /// Register a new session with a fresh unique id.
    pub fn create_session(&self, timeout: Duration) -> Result<Arc<Session>, CairnError> {
        let mut registry = self.inner.lock();

        let max_attempts = self.inner.config.max_id_attempts.max(1);
        let mut attempts = 0;
        let session_id = loop {
            let candidate = (self.generate_id)();
            attempts += 1;
            if !registry.sessions.contains_key(&candidate) {
                break candidate;
            }
            if attempts >= max_attempts {
                error!(
                    attempts,
                    last_id = %candidate,
                    "could not allocate a unique session id; the random source looks broken"
                );
                return Err(CairnError::SessionIdExhausted {
                    attempts,
                    last_id: candidate,
                });
            }
        };

        let session = Arc::new(Session::new(session_id.clone(), timeout));
        registry.sessions.insert(session_id.clone(), Arc::clone(&session));
        self.inner.check_timer(&mut registry);

        info!(session_id = %session_id, timeout_secs = timeout.as_secs(), "session created");
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.lock().sessions.get(session_id).cloned()
    }

    /// Remove a session. Holders of the returned handle keep a readable but
    /// detached session.
    pub fn remove_session(&self, session_id: &str) -> Option<Arc<Session>> {
        let mut registry = self.inner.lock();
        let removed = registry.sessions.remove(session_id);
        if removed.is_some() {
            self.inner.check_timer(&mut registry);
            info!(session_id = %session_id, "session removed");
        }
        removed
    }

    /// Password for `user`, or an empty string when the user is unknown.
    pub fn get_user_password(&self, user: &str) -> String {
        self.inner.accounts.get(user).cloned().unwrap_or_default()
    }

    /// Tell every logged-in session that container `id` changed.
    pub fn container_changed_ui(&self, id: ObjectId) {
        let registry = self.inner.lock();
        for session in registry.sessions.values().filter(|s| s.is_logged_in()) {
            session.mark_container_changed(id);
        }
    }

    pub fn containers_changed_ui(&self, ids: &[ObjectId]) {
        let registry = self.inner.lock();
        for session in registry.sessions.values().filter(|s| s.is_logged_in()) {
            session.mark_containers_changed(ids);
        }
    }

    /// Evict sessions idle longer than their timeout. Normally driven by the
    /// timer subscription.
    pub fn on_timer_tick(&self) {
        self.inner.sweep();
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Whether the eviction sweep is currently subscribed to the timer.
    pub fn timer_active(&self) -> bool {
        self.inner.lock().subscription.is_some()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        let mut registry = self.inner.lock();
        if let Some(id) = registry.subscription.take() {
            self.inner.timer.unsubscribe(id);
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sweep(self: &Arc<Self>) {
        let mut registry = self.lock();
        debug!(sessions = registry.sessions.len(), "checking UI sessions for timeout");

        let now = Instant::now();
        registry.sessions.retain(|id, session| {
            if !session.is_expired(now) {
                return true;
            }
            info!(
                session_id = %id,
                idle_ms = session.idle_time(now).as_millis() as u64,
                "session timed out"
            );
            false
        });
        self.check_timer(&mut registry);
    }

    /// Keep the timer subscription in step with registry occupancy. Must be
    /// called with the registry lock held.
    fn check_timer(self: &Arc<Self>, registry: &mut Registry) {
        if !registry.sessions.is_empty() && registry.subscription.is_none() {
            let weak: Weak<Inner> = Arc::downgrade(self);
            let callback: TimerCallback = Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.sweep();
                }
            });
            let id = self
                .timer
                .subscribe(callback, self.config.check_interval, false);
            registry.subscription = Some(id);
            debug!(subscription = id.get(), "session sweep subscribed");
        } else if registry.sessions.is_empty() {
            if let Some(id) = registry.subscription.take() {
                self.timer.unsubscribe(id);
                debug!(subscription = id.get(), "session sweep unsubscribed");
            }
        }
    }
}

fn random_session_id() -> SessionId {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct ManualTimer {
        subscriptions: Mutex<HashMap<SubscriptionId, TimerCallback>>,
        next_id: AtomicU64,
        subscribe_calls: AtomicUsize,
        unsubscribe_calls: AtomicUsize,
        intervals: Mutex<Vec<Duration>>,
    }

    impl ManualTimer {
        fn fire(&self) {
            let callbacks: Vec<TimerCallback> =
                self.subscriptions.lock().unwrap().values().cloned().collect();
            for callback in callbacks {
                callback();
            }
        }

        fn active(&self) -> usize {
            self.subscriptions.lock().unwrap().len()
        }
    }

    impl Timer for ManualTimer {
        fn subscribe(
            &self,
            callback: TimerCallback,
            interval: Duration,
            _once: bool,
        ) -> SubscriptionId {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            self.intervals.lock().unwrap().push(interval);
            let id = SubscriptionId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
            self.subscriptions.lock().unwrap().insert(id, callback);
            id
        }

        fn unsubscribe(&self, id: SubscriptionId) {
            self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
            self.subscriptions.lock().unwrap().remove(&id);
        }
    }

    fn manager() -> (SessionManager, Arc<ManualTimer>) {
        let timer = Arc::new(ManualTimer::default());
        let accounts = HashMap::from([("admin".to_string(), "secret".to_string())]);
        let mgr = SessionManager::new(accounts, timer.clone(), SessionManagerConfig::default());
        (mgr, timer)
    }

    #[test]
    fn create_get_remove() {
        let (mgr, _timer) = manager();
        let session = mgr.create_session(Duration::from_secs(60)).unwrap();
        assert_eq!(session.id().len(), 32);

        let fetched = mgr.get_session(session.id()).unwrap();
        assert!(Arc::ptr_eq(&session, &fetched));

        assert!(mgr.remove_session(session.id()).is_some());
        assert!(mgr.get_session(session.id()).is_none());
        assert!(mgr.remove_session(session.id()).is_none());
    }

    #[test]
    fn unknown_session_is_none() {
        let (mgr, _timer) = manager();
        assert!(mgr.get_session("missing").is_none());
    }

    #[test]
    fn passwords_come_from_accounts() {
        let (mgr, _timer) = manager();
        assert_eq!(mgr.get_user_password("admin"), "secret");
        assert_eq!(mgr.get_user_password("nobody"), "");
    }

    #[test]
    fn timer_follows_occupancy() {
        let (mgr, timer) = manager();
        assert!(!mgr.timer_active());

        let a = mgr.create_session(Duration::from_secs(60)).unwrap();
        let b = mgr.create_session(Duration::from_secs(60)).unwrap();
        assert!(mgr.timer_active());
        assert_eq!(timer.subscribe_calls.load(Ordering::SeqCst), 1);

        mgr.remove_session(a.id());
        assert!(mgr.timer_active());
        mgr.remove_session(a.id());
        mgr.remove_session(b.id());
        assert!(!mgr.timer_active());
        assert_eq!(timer.unsubscribe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(timer.active(), 0);

        mgr.create_session(Duration::from_secs(60)).unwrap();
        assert_eq!(timer.subscribe_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn sweep_evicts_only_stale_sessions() {
        let (mgr, timer) = manager();
        let stale = mgr.create_session(Duration::from_millis(10)).unwrap();
        let fresh = mgr.create_session(Duration::from_secs(60)).unwrap();

        thread::sleep(Duration::from_millis(30));
        timer.fire();

        assert!(mgr.get_session(stale.id()).is_none());
        assert!(mgr.get_session(fresh.id()).is_some());
        assert!(mgr.timer_active());
    }

    #[test]
    fn sweep_of_last_session_unsubscribes() {
        let (mgr, timer) = manager();
        let session = mgr.create_session(Duration::from_millis(5)).unwrap();
        thread::sleep(Duration::from_millis(20));
        timer.fire();

        assert!(mgr.get_session(session.id()).is_none());
        assert!(!mgr.timer_active());
        assert_eq!(timer.active(), 0);
    }

    #[test]
    fn touched_session_survives_sweep() {
        let (mgr, timer) = manager();
        let session = mgr.create_session(Duration::from_millis(80)).unwrap();
        thread::sleep(Duration::from_millis(50));
        session.touch();
        thread::sleep(Duration::from_millis(50));
        mgr.on_timer_tick();
        assert!(mgr.get_session(session.id()).is_some());
        assert_eq!(timer.active(), 1);
    }

    #[test]
    fn collisions_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (mgr, _timer) = manager();
        let mgr = mgr.with_id_generator({
            let calls = calls.clone();
            move || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 3 { "dup".to_string() } else { format!("id-{n}") }
            }
        });

        let first = mgr.create_session(Duration::from_secs(1)).unwrap();
        let second = mgr.create_session(Duration::from_secs(1)).unwrap();
        assert_eq!(first.id(), "dup");
        assert_eq!(second.id(), "id-3");
    }

    #[test]
    fn exhausted_id_space_is_fatal() {
        let (mgr, _timer) = manager();
        let mgr = mgr.with_id_generator(|| "same".to_string());
        mgr.create_session(Duration::from_secs(1)).unwrap();

        let err = mgr.create_session(Duration::from_secs(1)).unwrap_err();
        assert!(err.is_fatal());
        match err {
            CairnError::SessionIdExhausted { attempts, last_id } => {
                assert_eq!(attempts, MAX_SESSION_ID_ATTEMPTS);
                assert_eq!(last_id, "same");
            }
            other => panic!("expected SessionIdExhausted, got {other:?}"),
        }
        assert_eq!(mgr.session_count(), 1);
    }

    #[test]
    fn broadcasts_reach_logged_in_sessions_only() {
        let (mgr, _timer) = manager();
        let visitor = mgr.create_session(Duration::from_secs(60)).unwrap();
        let user = mgr.create_session(Duration::from_secs(60)).unwrap();
        user.set_logged_in(true);

        mgr.container_changed_ui(5);
        mgr.containers_changed_ui(&[7]);

        assert!(!visitor.has_pending_updates());
        assert_eq!(user.drain_update_ids().to_string(), "5,7");
        assert_eq!(user.drain_update_ids().to_string(), "");
    }

    #[test]
    fn removed_session_stays_readable_but_detached() {
        let (mgr, _timer) = manager();
        let session = mgr.create_session(Duration::from_secs(60)).unwrap();
        session.set_logged_in(true);
        session.put("driver", "1");

        mgr.remove_session(session.id());
        mgr.container_changed_ui(3);

        assert_eq!(session.get("driver"), "1");
        assert!(!session.has_pending_updates());
    }

    #[test]
    fn concurrent_creation_yields_unique_ids() {
        let (mgr, _timer) = manager();
        let mgr = Arc::new(mgr);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mgr = mgr.clone();
                thread::spawn(move || {
                    (0..25)
                        .map(|_| mgr.create_session(Duration::from_secs(60)).unwrap().id().to_string())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 200);
        assert_eq!(mgr.session_count(), 200);
    }

    #[test]
    fn dropping_manager_unsubscribes() {
        let (mgr, timer) = manager();
        mgr.create_session(Duration::from_secs(60)).unwrap();
        assert_eq!(timer.active(), 1);
        drop(mgr);
        assert_eq!(timer.active(), 0);
    }

    #[test]
    fn zero_check_interval_uses_default() {
        let timer = Arc::new(ManualTimer::default());
        let mgr = SessionManager::new(
            HashMap::new(),
            timer.clone(),
            SessionManagerConfig {
                check_interval: Duration::ZERO,
                ..SessionManagerConfig::default()
            },
        );
        mgr.create_session(Duration::from_secs(60)).unwrap();
        assert_eq!(
            *timer.intervals.lock().unwrap(),
            vec![DEFAULT_SESSION_CHECK_INTERVAL]
        );
    }
}
