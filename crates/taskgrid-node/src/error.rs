use std::sync::PoisonError;

use thiserror::Error;

use crate::id::{AllocationId, TaskId, WorkerId};

pub type NodeResult<T> = Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    /// The ledger cannot satisfy the resource request.
    /// The ledger state is unchanged; the scheduler should pick another
    /// worker or wait for resources to be released.
    #[error("insufficient resources: {message}")]
    InsufficientResources { message: String },
    /// An allocation was released more than once.
    #[error("allocation {0} has already been released")]
    DoubleRelease(AllocationId),
    /// A task was assigned to a worker that is not idle.
    #[error("worker {worker_id} already has task {task_id} assigned")]
    AlreadyAssigned {
        worker_id: WorkerId,
        task_id: TaskId,
    },
    /// A worker state machine operation was invoked from the wrong state.
    #[error("invalid worker state: {0}")]
    InvalidWorkerState(String),
    #[error("internal error: {0}")]
    InternalError(String),
}

impl<T> From<PoisonError<T>> for NodeError {
    fn from(error: PoisonError<T>) -> Self {
        NodeError::InternalError(error.to_string())
    }
}
