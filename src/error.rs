use std::io;

/// Errors surfaced by bridge commands and the stores behind them.
///
/// The Display strings are part of the wire contract: machine callers
/// distinguish kinds by their stable prefixes (`Unauthorized`, `Blocked`,
/// `Unhandled command:`, `Missing`, ...), so variants must keep their
/// message shapes when they change internally.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Blocked")]
    Blocked,

    #[error("Unhandled command: {0}")]
    UnhandledCommand(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Missing {0}")]
    MissingParam(&'static str),

    #[error("Failed to parse {param}: {detail}")]
    ParseParam { param: &'static str, detail: String },

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Daemon unavailable: {0}")]
    DaemonUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Timeout")]
    Timeout,

    #[error("Cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Short kind tag used in audit entries and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidRequest(_) => "invalid_request",
            CoreError::Unauthorized => "unauthorized",
            CoreError::Blocked => "blocked",
            CoreError::UnhandledCommand(_) => "not_found",
            CoreError::NotFound(_) => "not_found",
            CoreError::MissingParam(_) => "invalid_argument",
            CoreError::ParseParam { .. } => "invalid_argument",
            CoreError::PreconditionFailed(_) => "precondition_failed",
            CoreError::DaemonUnavailable(_) => "daemon_unavailable",
            CoreError::Io(_) => "io_error",
            CoreError::Timeout => "timeout",
            CoreError::Cancelled => "cancelled",
            CoreError::Internal(_) => "internal",
        }
    }

    /// Fold an anyhow error chain into `Internal`, preserving context lines.
    pub fn internal(err: anyhow::Error) -> Self {
        CoreError::Internal(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::InvalidRequest(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
