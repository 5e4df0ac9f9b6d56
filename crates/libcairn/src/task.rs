use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

/// Identifier handed out by the owning [`TaskProcessor`](crate::TaskProcessor).
pub type TaskId = u64;

/// Id carried by a task that has not been enqueued yet.
pub const UNASSIGNED_TASK_ID: TaskId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Invalidated before or while running; no success is reported.
    Invalid,
    /// Waiting in the queue.
    Valid,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, TaskStatus::Invalid | TaskStatus::Done | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Generic,
    FetchOnlineContent,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskType::Generic => f.write_str("generic"),
            TaskType::FetchOnlineContent => f.write_str("fetch_online_content"),
        }
    }
}

/// The work a task performs. Implementations that want to be interruptible
/// poll [`TaskContext::is_cancelled`] at safe points.
pub trait TaskPayload: Send + Sync {
    fn run(&self, ctx: &TaskContext) -> anyhow::Result<()>;
}

struct FnPayload<F>(F);

impl<F> TaskPayload for FnPayload<F>
where
    F: Fn(&TaskContext) -> anyhow::Result<()> + Send + Sync,
{
    fn run(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        (self.0)(ctx)
    }
}

/// Handle passed to a running payload.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    token: CancellationToken,
}

impl TaskContext {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Bail out of the payload if the task has been invalidated.
    pub fn check_cancelled(&self) -> anyhow::Result<()> {
        if self.token.is_cancelled() {
            anyhow::bail!("task {} was cancelled", self.task_id);
        }
        Ok(())
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }
}

#[derive(Debug)]
struct TaskState {
    status: TaskStatus,
    failure: Option<String>,
}

/// A unit of deferred work run by the task worker.
pub struct Task {
    id: AtomicU64,
    parent_id: Option<TaskId>,
    description: String,
    task_type: TaskType,
    cancellable: bool,
    token: CancellationToken,
    state: Mutex<TaskState>,
    payload: Box<dyn TaskPayload>,
}

impl Task {
    pub fn new(description: impl Into<String>, payload: impl TaskPayload + 'static) -> Self {
        Self {
            id: AtomicU64::new(UNASSIGNED_TASK_ID),
            parent_id: None,
            description: description.into(),
            task_type: TaskType::Generic,
            cancellable: true,
            token: CancellationToken::new(),
            state: Mutex::new(TaskState {
                status: TaskStatus::Valid,
                failure: None,
            }),
            payload: Box::new(payload),
        }
    }

    /// Build a task from a closure.
    pub fn from_fn<F>(description: impl Into<String>, f: F) -> Self
    where
        F: Fn(&TaskContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::new(description, FnPayload(f))
    }

    pub fn with_cancellable(mut self, cancellable: bool) -> Self {
        self.cancellable = cancellable;
        self
    }

    pub fn with_parent(mut self, parent_id: TaskId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn id(&self) -> TaskId {
        self.id.load(Ordering::Acquire)
    }

    pub fn parent_id(&self) -> Option<TaskId> {
        self.parent_id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn is_cancellable(&self) -> bool {
        self.cancellable
    }

    /// False once the task has been invalidated.
    pub fn is_valid(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub fn status(&self) -> TaskStatus {
        self.state().status
    }

    /// Error text recorded when the payload failed.
    pub fn failure(&self) -> Option<String> {
        self.state().failure.clone()
    }

    /// Mark the task invalidated. A payload that polls its context will see
    /// the cancellation; a queued task will be skipped by the worker.
    pub fn invalidate(&self) {
        self.token.cancel();
    }

    pub(crate) fn matches(&self, id: TaskId) -> bool {
        self.id() == id || self.parent_id == Some(id)
    }

    /// Returns false if the task already carried an id.
    pub(crate) fn assign_id(&self, id: TaskId) -> bool {
        self.id
            .compare_exchange(UNASSIGNED_TASK_ID, id, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn context(&self) -> TaskContext {
        TaskContext {
            task_id: self.id(),
            token: self.token.clone(),
        }
    }

    pub(crate) fn run_payload(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        self.payload.run(ctx)
    }

    pub(crate) fn set_status(&self, status: TaskStatus) {
        self.state().status = status;
    }

    pub(crate) fn record_failure(&self, message: String) {
        let mut state = self.state();
        state.status = TaskStatus::Failed;
        state.failure = Some(message);
    }

    fn state(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("parent_id", &self.parent_id)
            .field("description", &self.description)
            .field("task_type", &self.task_type)
            .field("cancellable", &self.cancellable)
            .field("valid", &self.is_valid())
            .field("status", &self.status())
            .finish()
    }
}
