//! Error kinds at the subsystem seams.
//!
//! Most call sites use `anyhow::Result` with context; `CoreError` exists
//! so callers that need to branch on the kind of failure (the evolution
//! pipeline, the forge) can do so without string matching.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The journal could not write. Fatal to the caller; the process is
    /// expected to exit and be restarted by a supervisor.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Invalid input that was rejected before any state change: a bad
    /// tool name, unparseable generated source, a failed safety screen.
    #[error("validation failure: {0}")]
    Validation(String),

    /// A model backend failed (network, timeout, non-2xx). No ledger
    /// debit is recorded for these.
    #[error("model failure ({backend}): {message}")]
    Model { backend: String, message: String },

    /// A scheduled task raised. Caught by the scheduler, recorded, and
    /// the task is rescheduled normally.
    #[error("task failure in '{task}': {message}")]
    Task { task: String, message: String },

    /// An evolution phase failed. The pipeline records it and continues
    /// to later phases where possible.
    #[error("evolution phase '{phase}' failed: {message}")]
    Phase { phase: String, message: String },
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn model(backend: impl Into<String>, msg: impl Into<String>) -> Self {
        CoreError::Model {
            backend: backend.into(),
            message: msg.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind() {
        let err = CoreError::validation("bad tool name");
        assert!(err.to_string().contains("validation failure"));

        let err = CoreError::model("local-general", "timeout");
        assert!(err.to_string().contains("local-general"));
    }
}
