// Error types for the event loop and its futures
//
// LoopError covers usage-sequence violations of the slave lifecycle, progress
// diagnostics for the restricted run modes and plumbing failures.
// TaskError is the rejection value carried by futures and tasks.

use std::time::Duration;
use thiserror::Error;

/// Why a future or task finished without a value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task was cancelled")]
    Cancelled,

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Future rejected: {0}")]
    Failed(String),
}

/// Errors raised by [`EventLoop`](crate::EventLoop) and the policy registry
#[derive(Error, Debug)]
pub enum LoopError {
    #[error("Event loop is closed")]
    Closed,

    #[error("Event loop is already running as a slave of the native main loop")]
    AlreadySlave,

    #[error("This event loop is not running as a slave")]
    NotSlave,

    #[error("Cannot close an event loop while it is a slave; call stop_slave_loop() first")]
    CloseWhileSlave,

    #[error("This event loop is already running")]
    AlreadyRunning,

    #[error("Another event loop is already the slave loop of this thread")]
    SlaveLoopActive,

    #[error(
        "Future cannot complete: no ready callbacks, timers or fd watches remain ({pending_tasks} tasks pending)"
    )]
    NoProgress { pending_tasks: usize },

    #[error("Future did not complete within {0:?} without the native main loop")]
    Stalled(Duration),

    #[error("Invalid future state: {0}")]
    InvalidState(&'static str),

    #[error("No event loop policy is installed on this thread")]
    NoPolicy,

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("I/O error while waiting for fd readiness: {0}")]
    Io(#[from] std::io::Error),
}

impl LoopError {
    /// True for errors caused by calling lifecycle methods in the wrong order
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            LoopError::Closed
                | LoopError::AlreadySlave
                | LoopError::NotSlave
                | LoopError::CloseWhileSlave
                | LoopError::AlreadyRunning
                | LoopError::SlaveLoopActive
        )
    }
}

/// Render a caught panic payload as a message
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
