use thiserror::Error;

/// Errors from [`CompletionBarrier`](crate::CompletionBarrier) operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BarrierError {
    /// The barrier already holds a value; it can only be set once.
    #[error("completion barrier already set")]
    AlreadySet,
}
