use crate::validate::ValidationError;

/// Top-level error type for the Ensemble framework.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Debug, thiserror::Error)]
pub enum EnsembleError {
    /// A message failed structural validation before entering the bus.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// An error from the message bus (capacity, routing, delivery).
    #[error("bus error: {0}")]
    Bus(String),

    /// A middleware step violated its contract or failed outright.
    #[error("middleware error: {0}")]
    Middleware(String),

    /// An error raised inside a role's message handler.
    #[error("role error: {0}")]
    Role(String),

    /// An error raised inside a task body or the task scheduler.
    #[error("task error: {0}")]
    Task(String),

    /// An error in configuration parsing or validation.
    #[error("config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`EnsembleError`].
pub type EnsembleResult<T> = Result<T, EnsembleError>;
