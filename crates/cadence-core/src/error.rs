//! Cadence error types.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Result alias used across the Cadence crates.
pub type Result<T> = std::result::Result<T, CadenceError>;

#[derive(Debug, thiserror::Error)]
pub enum CadenceError {
    #[error("Invalid argument `{name}`: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    #[error("Duplicate task key: {0}")]
    DuplicateKey(String),

    #[error("{} task(s) failed to dispose: {}", .0.len(), summarize(.0))]
    Disposal(Vec<DisposalFailure>),

    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CadenceError {
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }

    /// Disposal failures carried by this error, if any.
    pub fn disposal_failures(&self) -> &[DisposalFailure] {
        match self {
            Self::Disposal(failures) => failures,
            _ => &[],
        }
    }
}

fn summarize(failures: &[DisposalFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.key, f.failure))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Why a task body or hook did not succeed.
#[derive(Debug, Clone)]
pub enum TaskFailure {
    /// The code returned an error.
    Error(Arc<anyhow::Error>),
    /// The code panicked; the payload message is kept when it was a string.
    Panicked(String),
}

impl TaskFailure {
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked(message)
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }
}

impl From<anyhow::Error> for TaskFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::Error(Arc::new(err))
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(err) => write!(f, "{err:#}"),
            Self::Panicked(msg) => write!(f, "panicked: {msg}"),
        }
    }
}

/// A task whose dispose hook failed.
#[derive(Debug, Clone)]
pub struct DisposalFailure {
    pub key: String,
    pub failure: TaskFailure,
}

/// Collect disposal failures into a single error, or `Ok` when there are none.
pub fn disposal_result(failures: Vec<DisposalFailure>) -> Result<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(CadenceError::Disposal(failures))
    }
}
