use crate::env::EnvError;
use crate::manager::ManagerError;
use thiserror::Error;

/// Conditions a worker cannot recover from.
///
/// A worker that hits one of these stops; restarting it is up to whoever
/// launched it.
#[derive(Error, Debug)]
pub enum FatalError {
    /// The environment reported a failure explicitly marked non-retryable.
    #[error("non-retryable executor failure: {0}")]
    ExecutorFailure(String),

    /// A transient environment failure kept happening past the retry budget.
    #[error("execution failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: EnvError,
    },

    /// Reporting a new input to the manager failed.
    #[error("manager call failed: {0}")]
    Manager(#[from] ManagerError),

    /// The worker was driven down a path its configuration forbids.
    #[error("internal invariant violated: {0}")]
    Invariant(String),
}
