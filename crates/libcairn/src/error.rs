use thiserror::Error;

use crate::task::TaskId;

#[derive(Error, Debug)]
pub enum CairnError {
    #[error("task processor is shut down")]
    ProcessorShutDown,

    #[error("task processor already started")]
    ProcessorAlreadyStarted,

    #[error("task {0} was already queued")]
    TaskAlreadyQueued(TaskId),

    #[error("failed to spawn task worker: {0}")]
    WorkerSpawn(std::io::Error),

    #[error(
        "failed to allocate a unique session id after {attempts} attempts (last id: {last_id})"
    )]
    SessionIdExhausted { attempts: usize, last_id: String },

    #[error("task ids exhausted after {0}")]
    TaskIdExhausted(TaskId),

    #[error("no tokio runtime available for the timer: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

impl CairnError {
    /// Whether the error points at a broken environment rather than a
    /// condition the caller can retry around.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CairnError::SessionIdExhausted { .. }
                | CairnError::TaskIdExhausted(_)
                | CairnError::WorkerSpawn(_)
        )
    }
}
