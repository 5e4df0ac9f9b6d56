use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::CairnError;

/// Shortest period a subscription may request.
pub const MIN_TIMER_INTERVAL: Duration = Duration::from_millis(1);

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by [`Timer::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Periodic notification source shared by the control plane.
///
/// Callbacks run on a context owned by the timer, never on the subscriber's
/// thread, and must not be invoked while the timer holds its own lock so
/// they can subscribe and unsubscribe freely.
pub trait Timer: Send + Sync {
    /// Fire `callback` roughly every `interval`; only once when `once` is set.
    /// Intervals shorter than [`MIN_TIMER_INTERVAL`] are raised to it.
    fn subscribe(&self, callback: TimerCallback, interval: Duration, once: bool)
    -> SubscriptionId;

    /// Stop notifications for `id`. A callback already being dispatched may
    /// still complete. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

type SubscriptionMap = HashMap<SubscriptionId, CancellationToken>;
type Subscriptions = Arc<Mutex<SubscriptionMap>>;

fn lock(subscriptions: &Subscriptions) -> MutexGuard<'_, SubscriptionMap> {
    subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`Timer`] driving each subscription from its own task on a tokio runtime.
///
/// Callbacks run on the runtime's worker threads and should return quickly.
pub struct TokioTimer {
    runtime: Handle,
    shutdown: CancellationToken,
    subscriptions: Subscriptions,
    next_id: AtomicU64,
}

impl TokioTimer {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            shutdown: CancellationToken::new(),
            subscriptions: Arc::default(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Timer bound to the runtime the caller is running on.
    pub fn current() -> Result<Self, CairnError> {
        Ok(Self::new(Handle::try_current()?))
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    /// Cancel every subscription. Later subscriptions never fire.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        lock(&self.subscriptions).clear();
    }
}

impl Timer for TokioTimer {
    fn subscribe(
        &self,
        callback: TimerCallback,
        interval: Duration,
        once: bool,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let interval = if interval < MIN_TIMER_INTERVAL {
            warn!(
                subscription = id.0,
                interval_ms = interval.as_millis() as u64,
                "timer interval too short, raising to minimum"
            );
            MIN_TIMER_INTERVAL
        } else {
            interval
        };

        if self.shutdown.is_cancelled() {
            debug!(subscription = id.0, "timer stopped, subscription ignored");
            return id;
        }

        let token = self.shutdown.child_token();
        lock(&self.subscriptions).insert(id, token.clone());
        let subscriptions = Arc::clone(&self.subscriptions);
        self.runtime.spawn(async move {
            let mut ticks = time::interval_at(time::Instant::now() + interval, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => {}
                }
                if once {
                    lock(&subscriptions).remove(&id);
                }
                if panic::catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                    error!(subscription = id.0, "timer callback panicked");
                }
                if once {
                    break;
                }
            }
        });

        debug!(
            subscription = id.0,
            interval_ms = interval.as_millis() as u64,
            once,
            "timer subscribed"
        );
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(token) = lock(&self.subscriptions).remove(&id) {
            token.cancel();
            debug!(subscription = id.0, "timer unsubscribed");
        }
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
