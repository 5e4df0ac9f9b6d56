//! Periodic refresh of content provided by online services.
//!
//! A refresh runs as a chain of [`FetchOnlineContent`] tasks: each instance
//! pulls one batch from the service and, while the service reports more
//! data, queues the next instance. Once the chain ends, the next periodic
//! refresh is armed on the shared timer.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::task::{Task, TaskContext, TaskPayload, TaskType};
use crate::task_processor::TaskProcessor;
use crate::timer::{Timer, TimerCallback};

/// Places objects fetched from an online service into the content tree.
pub trait Layout: Send + Sync {
    fn add_object(&self, service: &str, title: &str, location: &str) -> anyhow::Result<()>;
}

/// A remote content source.
pub trait OnlineService: Send + Sync {
    fn name(&self) -> &str;

    /// Delay between periodic refreshes. Zero disables them.
    fn refresh_interval(&self) -> Duration;

    /// Fetch the next batch of data into `layout`. Returns `true` while more
    /// data remains to be fetched. Long fetches should poll `ctx`.
    fn refresh_service_data(&self, layout: &dyn Layout, ctx: &TaskContext) -> anyhow::Result<bool>;
}

/// Entry point the timer uses to start the next scheduled refresh.
pub trait ContentManager: Send + Sync {
    fn fetch_online_content(&self, service: &str);
}

/// An [`OnlineService`] together with the number of refresh tasks pending
/// for it.
pub struct OnlineServiceHandle {
    service: Arc<dyn OnlineService>,
    task_count: AtomicUsize,
}

impl OnlineServiceHandle {
    pub fn new(service: Arc<dyn OnlineService>) -> Arc<Self> {
        Arc::new(Self {
            service,
            task_count: AtomicUsize::new(0),
        })
    }

    pub fn service(&self) -> &dyn OnlineService {
        self.service.as_ref()
    }

    pub fn name(&self) -> &str {
        self.service.name()
    }

    /// Refresh tasks created for this service that have not finished yet.
    pub fn task_count(&self) -> usize {
        self.task_count.load(Ordering::Acquire)
    }
}

/// Task payload refreshing one online service.
pub struct FetchOnlineContent {
    content: Arc<dyn ContentManager>,
    processor: Weak<TaskProcessor>,
    timer: Arc<dyn Timer>,
    service: Arc<OnlineServiceHandle>,
    layout: Arc<dyn Layout>,
    cancellable: bool,
    unscheduled_refresh: bool,
    released: AtomicBool,
}

impl FetchOnlineContent {
    /// `unscheduled_refresh` marks a manually requested refresh, which does
    /// not arm the periodic timer when it completes.
    pub fn new(
        content: Arc<dyn ContentManager>,
        processor: &Arc<TaskProcessor>,
        timer: Arc<dyn Timer>,
        service: Arc<OnlineServiceHandle>,
        layout: Arc<dyn Layout>,
        cancellable: bool,
        unscheduled_refresh: bool,
    ) -> Self {
        Self::with_processor(
            content,
            Arc::downgrade(processor),
            timer,
            service,
            layout,
            cancellable,
            unscheduled_refresh,
        )
    }

    fn with_processor(
        content: Arc<dyn ContentManager>,
        processor: Weak<TaskProcessor>,
        timer: Arc<dyn Timer>,
        service: Arc<OnlineServiceHandle>,
        layout: Arc<dyn Layout>,
        cancellable: bool,
        unscheduled_refresh: bool,
    ) -> Self {
        service.task_count.fetch_add(1, Ordering::AcqRel);
        Self {
            content,
            processor,
            timer,
            service,
            layout,
            cancellable,
            unscheduled_refresh,
            released: AtomicBool::new(false),
        }
    }

    fn next(&self) -> Self {
        Self::with_processor(
            Arc::clone(&self.content),
            self.processor.clone(),
            Arc::clone(&self.timer),
            Arc::clone(&self.service),
            Arc::clone(&self.layout),
            self.cancellable,
            self.unscheduled_refresh,
        )
    }

    /// Wrap the payload in a task ready for [`TaskProcessor::add_task`].
    pub fn into_task(self) -> Task {
        let description = format!("Updating content from {}", self.service.name());
        let cancellable = self.cancellable;
        Task::new(description, self)
            .with_type(TaskType::FetchOnlineContent)
            .with_cancellable(cancellable)
    }

    /// Drop this payload's claim on the service. Returns the remaining count.
    fn release(&self) -> usize {
        if self.released.swap(true, Ordering::AcqRel) {
            return self.service.task_count();
        }
        self.service.task_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    fn reschedule(&self, ctx: &TaskContext) -> bool {
        if ctx.is_cancelled() {
            return false;
        }
        let Some(processor) = self.processor.upgrade() else {
            return false;
        };
        if processor.is_shutting_down() {
            return false;
        }

        match processor.add_task(Arc::new(self.next().into_task())) {
            Ok(task_id) => {
                debug!(service = %self.service.name(), task_id, "queued next refresh batch");
                true
            }
            Err(err) => {
                warn!(service = %self.service.name(), error = %err, "could not queue next refresh batch");
                false
            }
        }
    }

    fn arm_timer(&self) {
        let interval = self.service.service().refresh_interval();
        if self.unscheduled_refresh || interval.is_zero() {
            return;
        }

        let content = Arc::clone(&self.content);
        let name = self.service.name().to_string();
        let callback: TimerCallback = Arc::new(move || content.fetch_online_content(&name));
        self.timer.subscribe(callback, interval, true);
        debug!(
            service = %self.service.name(),
            interval_secs = interval.as_secs(),
            "scheduled next online refresh"
        );
    }
}

impl TaskPayload for FetchOnlineContent {
    fn run(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let name = self.service.name();
        let result = self
            .service
            .service()
            .refresh_service_data(self.layout.as_ref(), ctx)
            .with_context(|| format!("refreshing online service {name}"));

        let more = matches!(result, Ok(true));
        if more && self.reschedule(ctx) {
            self.release();
            return Ok(());
        }

        if self.release() == 0 {
            info!(service = %name, "online refresh finished");
            self.arm_timer();
        }
        result.map(|_| ())
    }
}

impl Drop for FetchOnlineContent {
    fn drop(&mut self) {
        // Tasks skipped after invalidation never run; give back their claim.
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;
    use crate::timer::SubscriptionId;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU64;
    use std::thread;
    use std::time::Instant;

    #[derive(Default)]
    struct ManualTimer {
        subscriptions: Mutex<HashMap<SubscriptionId, (TimerCallback, Duration, bool)>>,
        next_id: AtomicU64,
    }

    impl ManualTimer {
        fn fire(&self) {
            let due: Vec<(SubscriptionId, TimerCallback, bool)> = self
                .subscriptions
                .lock()
                .unwrap()
                .iter()
                .map(|(id, (cb, _, once))| (*id, cb.clone(), *once))
                .collect();
            for (id, callback, once) in due {
                if once {
                    self.unsubscribe(id);
                }
                callback();
            }
        }

        fn intervals(&self) -> Vec<(Duration, bool)> {
            self.subscriptions
                .lock()
                .unwrap()
                .values()
                .map(|(_, interval, once)| (*interval, *once))
                .collect()
        }
    }

    impl Timer for ManualTimer {
        fn subscribe(&self, callback: TimerCallback, interval: Duration, once: bool) -> SubscriptionId {
            let id = SubscriptionId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
            self.subscriptions
                .lock()
                .unwrap()
                .insert(id, (callback, interval, once));
            id
        }

        fn unsubscribe(&self, id: SubscriptionId) {
            self.subscriptions.lock().unwrap().remove(&id);
        }
    }

    /// Serves `pages` batches, then reports completion.
    struct PagedService {
        pages: usize,
        served: AtomicUsize,
        interval: Duration,
        fail: bool,
    }

    impl OnlineService for PagedService {
        fn name(&self) -> &str {
            "paged"
        }

        fn refresh_interval(&self) -> Duration {
            self.interval
        }

        fn refresh_service_data(&self, layout: &dyn Layout, _ctx: &TaskContext) -> anyhow::Result<bool> {
            if self.fail {
                anyhow::bail!("service unreachable");
            }
            let page = self.served.fetch_add(1, Ordering::SeqCst) + 1;
            layout.add_object(self.name(), &format!("item {page}"), &format!("http://example/{page}"))?;
            Ok(page < self.pages)
        }
    }

    #[derive(Default)]
    struct RecordingLayout {
        objects: Mutex<Vec<String>>,
    }

    impl Layout for RecordingLayout {
        fn add_object(&self, _service: &str, title: &str, _location: &str) -> anyhow::Result<()> {
            self.objects.lock().unwrap().push(title.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingContent {
        requested: Mutex<Vec<String>>,
    }

    impl ContentManager for RecordingContent {
        fn fetch_online_content(&self, service: &str) {
            self.requested.lock().unwrap().push(service.to_string());
        }
    }

    struct Fixture {
        processor: Arc<TaskProcessor>,
        timer: Arc<ManualTimer>,
        content: Arc<RecordingContent>,
        layout: Arc<RecordingLayout>,
        handle: Arc<OnlineServiceHandle>,
    }

    fn fixture(pages: usize, interval: Duration, fail: bool) -> Fixture {
        let processor = Arc::new(TaskProcessor::new());
        processor.init().unwrap();
        Fixture {
            processor,
            timer: Arc::new(ManualTimer::default()),
            content: Arc::new(RecordingContent::default()),
            layout: Arc::new(RecordingLayout::default()),
            handle: OnlineServiceHandle::new(Arc::new(PagedService {
                pages,
                served: AtomicUsize::new(0),
                interval,
                fail,
            })),
        }
    }

    impl Fixture {
        fn task(&self, unscheduled_refresh: bool) -> Arc<Task> {
            Arc::new(
                FetchOnlineContent::new(
                    self.content.clone(),
                    &self.processor,
                    self.timer.clone(),
                    self.handle.clone(),
                    self.layout.clone(),
                    true,
                    unscheduled_refresh,
                )
                .into_task(),
            )
        }

        fn wait_idle(&self) -> bool {
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                if self.handle.task_count() == 0 && self.processor.get_tasklist().is_empty() {
                    return true;
                }
                thread::sleep(Duration::from_millis(5));
            }
            false
        }
    }

    #[test]
    fn chain_fetches_every_page_then_arms_timer() {
        let fx = fixture(3, Duration::from_secs(600), false);
        let first = fx.task(false);
        assert_eq!(first.task_type(), TaskType::FetchOnlineContent);
        assert_eq!(first.description(), "Updating content from paged");
        fx.processor.add_task(first.clone()).unwrap();

        assert!(fx.wait_idle());
        assert_eq!(first.status(), TaskStatus::Done);
        assert_eq!(
            *fx.layout.objects.lock().unwrap(),
            vec!["item 1", "item 2", "item 3"]
        );
        assert_eq!(fx.timer.intervals(), vec![(Duration::from_secs(600), true)]);

        fx.timer.fire();
        assert_eq!(*fx.content.requested.lock().unwrap(), vec!["paged"]);
        assert!(fx.timer.intervals().is_empty());
        fx.processor.shutdown();
    }

    #[test]
    fn unscheduled_refresh_does_not_arm_timer() {
        let fx = fixture(1, Duration::from_secs(600), false);
        fx.processor.add_task(fx.task(true)).unwrap();
        assert!(fx.wait_idle());
        assert!(fx.timer.intervals().is_empty());
        fx.processor.shutdown();
    }

    #[test]
    fn zero_interval_does_not_arm_timer() {
        let fx = fixture(1, Duration::ZERO, false);
        fx.processor.add_task(fx.task(false)).unwrap();
        assert!(fx.wait_idle());
        assert!(fx.timer.intervals().is_empty());
        fx.processor.shutdown();
    }

    #[test]
    fn failed_refresh_is_recorded_and_rearmed() {
        let fx = fixture(1, Duration::from_secs(60), true);
        let task = fx.task(false);
        fx.processor.add_task(task.clone()).unwrap();
        assert!(fx.wait_idle());
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(task.failure().unwrap().contains("service unreachable"));
        assert_eq!(fx.timer.intervals().len(), 1);
        fx.processor.shutdown();
    }

    #[test]
    fn invalidated_chain_task_releases_its_claim() {
        let fx = fixture(2, Duration::from_secs(60), false);
        let task = fx.task(false);
        assert_eq!(fx.handle.task_count(), 1);
        task.invalidate();
        drop(task);
        assert_eq!(fx.handle.task_count(), 0);
        fx.processor.shutdown();
    }

    #[test]
    fn no_reschedule_after_shutdown() {
        let fx = fixture(5, Duration::from_secs(60), false);
        let task = fx.task(false);
        fx.processor.shutdown();
        let ctx = {
            task.assign_id(99);
            task.context()
        };
        task.run_payload(&ctx).unwrap();
        assert_eq!(fx.layout.objects.lock().unwrap().len(), 1);
        assert!(fx.processor.get_tasklist().is_empty());
    }
}
