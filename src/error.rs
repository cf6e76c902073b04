//! Stage error taxonomy.
//!
//! Every pipeline stage reports failure as a [`StageError`]. The orchestrator
//! catches these at stage boundaries and records them in the ledger; they
//! never escape as a process crash.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    /// The exporter ran but did not signal success.
    #[error("exporter did not report success: {0}")]
    ExternalTool(String),
    /// A network, object-store, vector-index, or chat-platform call failed.
    #[error("transport failure: {0}")]
    Transport(String),
    /// A transcript was malformed or the store rejected a write.
    #[error("data failure: {0}")]
    Data(String),
    /// The bot lacks the rights needed for the operation.
    #[error("permission denied: {0}")]
    Permission(String),
    /// An external call did not finish within its time budget.
    #[error("timed out after {0}s")]
    Timeout(u64),
}

impl StageError {
    /// Short machine-readable kind, used in job records and HTTP bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::ExternalTool(_) => "external_tool",
            StageError::Transport(_) => "transport",
            StageError::Data(_) => "data",
            StageError::Permission(_) => "permission",
            StageError::Timeout(_) => "timeout",
        }
    }
}

impl From<sqlx::Error> for StageError {
    fn from(err: sqlx::Error) -> Self {
        StageError::Data(err.to_string())
    }
}

impl From<reqwest::Error> for StageError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StageError::Transport(format!("request timed out: {}", err))
        } else {
            StageError::Transport(err.to_string())
        }
    }
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        StageError::Data(err.to_string())
    }
}

pub type StageResult<T> = std::result::Result<T, StageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(StageError::ExternalTool("x".into()).kind(), "external_tool");
        assert_eq!(StageError::Permission("x".into()).kind(), "permission");
        assert_eq!(StageError::Timeout(5).kind(), "timeout");
    }

    #[test]
    fn display_includes_detail() {
        let err = StageError::Data("bad json at line 3".into());
        assert_eq!(err.to_string(), "data failure: bad json at line 3");
        assert_eq!(StageError::Timeout(600).to_string(), "timed out after 600s");
    }
}
