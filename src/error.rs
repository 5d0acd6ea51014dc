use std::process::ExitCode;

/// Errors that cause sling to exit with a specific code.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} failed (exit {code}): {message}")]
    ToolFailed {
        tool: String,
        code: i32,
        message: String,
    },

    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    /// Backoff active; retry later.
    #[error("{0}")]
    AdmissionDenied(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Integrity(String),

    #[error("{0}")]
    Other(String),
}

impl ExitError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Config(_) => ExitCode::from(2),
            Self::ToolNotFound { .. } => ExitCode::from(3),
            Self::ToolFailed { .. } => ExitCode::from(4),
            Self::Timeout { .. } => ExitCode::from(5),
            Self::Conflict(_) => ExitCode::from(6),
            Self::Integrity(_) => ExitCode::from(7),
            // EX_TEMPFAIL
            Self::AdmissionDenied(_) => ExitCode::from(75),
            Self::Other(_) => ExitCode::from(1),
        }
    }
}
