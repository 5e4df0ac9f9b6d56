use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{debug, error, info, warn};

use crate::error::CairnError;
use crate::task::{Task, TaskId, TaskStatus};
use crate::task_queue::{Dequeued, TaskQueue};

const FIRST_TASK_ID: TaskId = 1;
const WORKER_THREAD_NAME: &str = "cairn-tasks";

enum WorkerSlot {
    NotStarted,
    Running(JoinHandle<()>),
    Stopped,
}

/// Runs queued tasks one at a time on a dedicated worker thread.
///
/// Tasks execute strictly in the order they were added. Failures inside a
/// task are recorded on the task and never reach the caller of
/// [`TaskProcessor::add_task`].
pub struct TaskProcessor {
    queue: Arc<TaskQueue>,
    next_id: Mutex<TaskId>,
    shutdown: AtomicBool,
    worker: Mutex<WorkerSlot>,
    worker_thread: Arc<OnceLock<ThreadId>>,
}

impl TaskProcessor {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(TaskQueue::new()),
            next_id: Mutex::new(FIRST_TASK_ID),
            shutdown: AtomicBool::new(false),
            worker: Mutex::new(WorkerSlot::NotStarted),
            worker_thread: Arc::new(OnceLock::new()),
        }
    }

    /// Start the worker thread. Tasks added before this call wait in the
    /// queue until the worker is running.
    pub fn init(&self) -> Result<(), CairnError> {
        let mut worker = self.worker();
        match *worker {
            WorkerSlot::NotStarted => {}
            WorkerSlot::Running(_) => return Err(CairnError::ProcessorAlreadyStarted),
            WorkerSlot::Stopped => return Err(CairnError::ProcessorShutDown),
        }
        if self.is_shutting_down() {
            return Err(CairnError::ProcessorShutDown);
        }

        let queue = Arc::clone(&self.queue);
        let worker_thread = Arc::clone(&self.worker_thread);
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || run_worker(queue, worker_thread))
            .map_err(CairnError::WorkerSpawn)?;

        *worker = WorkerSlot::Running(handle);
        info!("task processor started");
        Ok(())
    }

    /// Assign the next id to `task` and queue it. Returns without waiting for
    /// execution.
    pub fn add_task(&self, task: Arc<Task>) -> Result<TaskId, CairnError> {
        if self.is_shutting_down() {
            debug!(description = %task.description(), "rejecting task after shutdown");
            return Err(CairnError::ProcessorShutDown);
        }

        let mut next_id = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
        let id = *next_id;
        let following = id
            .checked_add(1)
            .ok_or(CairnError::TaskIdExhausted(id))?;
        if !task.assign_id(id) {
            return Err(CairnError::TaskAlreadyQueued(task.id()));
        }
        self.queue.enqueue(Arc::clone(&task))?;
        *next_id = following;
        drop(next_id);

        debug!(
            task_id = id,
            task_type = %task.task_type(),
            description = %task.description(),
            "task enqueued"
        );
        Ok(id)
    }

    /// The running task (if any) followed by every queued task, in execution
    /// order.
    pub fn get_tasklist(&self) -> Vec<Arc<Task>> {
        self.queue.snapshot_with_in_flight()
    }

    pub fn get_current_task(&self) -> Option<Arc<Task>> {
        self.queue.in_flight()
    }

    /// Invalidate the task with `task_id` and any task whose parent it is.
    ///
    /// Queued tasks are skipped by the worker. A running task is only
    /// signalled when it is cancellable, and stops only if its payload polls
    /// the cancellation flag. Unknown ids are ignored.
    pub fn invalidate_task(&self, task_id: TaskId) {
        self.queue.for_each_with_in_flight(|task, running| {
            if !task.matches(task_id) {
                return;
            }
            if running && !task.is_cancellable() {
                debug!(task_id = task.id(), "running task is not cancellable");
                return;
            }
            task.invalidate();
            debug!(task_id = task.id(), running, "task invalidated");
        });
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop the worker and wait for it to exit. A task that is already
    /// running finishes first. Safe to call more than once.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            info!("shutting down task processor");
        }
        self.queue.stop();

        if self.worker_thread.get() == Some(&thread::current().id()) {
            // Called from inside a task; the loop exits once the task returns.
            warn!("task processor shutdown requested from the worker thread");
            return;
        }

        let mut worker = self.worker();
        if let WorkerSlot::Running(handle) = std::mem::replace(&mut *worker, WorkerSlot::Stopped) {
            if handle.thread().id() == thread::current().id() {
                warn!("task processor shutdown requested from the worker thread");
                return;
            }
            if handle.join().is_err() {
                error!("task worker panicked");
            }
            debug!("task worker joined");
        }
    }

    fn worker(&self) -> MutexGuard<'_, WorkerSlot> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TaskProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskProcessor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(queue: Arc<TaskQueue>, worker_thread: Arc<OnceLock<ThreadId>>) {
    // Recorded before the first task so a payload calling shutdown() is
    // recognised as running on this thread.
    let _ = worker_thread.set(thread::current().id());
    debug!("task worker running");
    loop {
        let task = match queue.dequeue_blocking() {
            Dequeued::Task(task) => task,
            Dequeued::Stop => break,
        };
        execute(&task);
        queue.complete(&task);
    }
    debug!("task worker exiting");
}

fn execute(task: &Task) {
    let task_id = task.id();
    if !task.is_valid() {
        task.set_status(TaskStatus::Invalid);
        debug!(task_id, "skipping invalidated task");
        return;
    }

    task.set_status(TaskStatus::Running);
    debug!(task_id, description = %task.description(), "task started");

    let ctx = task.context();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.run_payload(&ctx)));

    match outcome {
        Ok(_) if !task.is_valid() => {
            task.set_status(TaskStatus::Invalid);
            debug!(task_id, "task cancelled");
        }
        Ok(Ok(())) => {
            task.set_status(TaskStatus::Done);
            debug!(task_id, "task finished");
        }
        Ok(Err(err)) => {
            let message = format!("{err:#}");
            error!(task_id, description = %task.description(), error = %message, "task failed");
            task.record_failure(message);
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(task_id, description = %task.description(), error = %message, "task panicked");
            task.record_failure(message);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}
