use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::CairnError;
use crate::task::Task;

/// Result of a blocking dequeue.
#[derive(Debug)]
pub enum Dequeued {
    Task(Arc<Task>),
    /// The queue was stopped; the consumer should exit.
    Stop,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Arc<Task>>,
    in_flight: Option<Arc<Task>>,
    stopped: bool,
}

/// FIFO hand-off between callers and the single task worker.
///
/// The task taken by the consumer stays visible as `in_flight` until
/// [`TaskQueue::complete`] is called, so listings never miss it between
/// dequeue and execution.
#[derive(Debug, Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `task`. Refused once the queue has been stopped, checked under
    /// the same lock the consumer uses.
    pub fn enqueue(&self, task: Arc<Task>) -> Result<(), CairnError> {
        let mut state = self.lock();
        if state.stopped {
            return Err(CairnError::ProcessorShutDown);
        }
        debug_assert!(
            !state.pending.iter().any(|t| Arc::ptr_eq(t, &task)),
            "task queued twice"
        );
        state.pending.push_back(task);
        self.cv.notify_one();
        Ok(())
    }

    /// Remove the head, waiting while the queue is empty. Returns
    /// [`Dequeued::Stop`] once [`TaskQueue::stop`] has been called, even if
    /// tasks remain.
    pub fn dequeue_blocking(&self) -> Dequeued {
        let mut state = self.lock();
        loop {
            if state.stopped {
                return Dequeued::Stop;
            }
            if let Some(task) = state.pending.pop_front() {
                state.in_flight = Some(task.clone());
                return Dequeued::Task(task);
            }
            state = self.cv.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Clear the in-flight slot after the consumer finished with a task.
    pub fn complete(&self, task: &Arc<Task>) {
        let mut state = self.lock();
        if state
            .in_flight
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, task))
        {
            state.in_flight = None;
        }
    }

    pub fn stop(&self) {
        let mut state = self.lock();
        state.stopped = true;
        self.cv.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Queued tasks in removal order.
    pub fn snapshot(&self) -> Vec<Arc<Task>> {
        self.lock().pending.iter().cloned().collect()
    }

    /// The in-flight task followed by the queued ones, taken atomically.
    pub fn snapshot_with_in_flight(&self) -> Vec<Arc<Task>> {
        let state = self.lock();
        state
            .in_flight
            .iter()
            .chain(state.pending.iter())
            .cloned()
            .collect()
    }

    pub fn in_flight(&self) -> Option<Arc<Task>> {
        self.lock().in_flight.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    /// Apply `f` to the in-flight task and every queued task under one lock.
    pub(crate) fn for_each_with_in_flight(&self, mut f: impl FnMut(&Arc<Task>, bool)) {
        let state = self.lock();
        if let Some(task) = &state.in_flight {
            f(task, true);
        }
        for task in &state.pending {
            f(task, false);
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
