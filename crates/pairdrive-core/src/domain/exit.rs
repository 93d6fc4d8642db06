//! Two-level stage results
//!
//! Every pipeline stage and every network job reports an [`ExitCode`] (the
//! class of failure) refined by an [`ExitCause`]. Stages never mask errors;
//! they bubble `(code, cause)` pairs to the supervisor, which decides whether
//! to restart the pass, pause, or surface the error.

use thiserror::Error;

/// Class of a stage or job outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitCode {
    Ok,
    /// Unrecoverable local problem (disk full, permissions, ...)
    SystemError,
    /// The pass data can no longer be trusted; reobserve and retry
    DataError,
    /// Server-side error reported by the backend
    BackError,
    /// Transport-level failure
    NetworkError,
    /// The world changed mid-pass; discard and start over
    NeedRestart,
    OperationCanceled,
    InvalidToken,
    RateLimited,
    /// The access token was refreshed; the request must be replayed
    TokenRefreshed,
}

impl ExitCode {
    pub fn is_ok(self) -> bool {
        matches!(self, ExitCode::Ok)
    }
}

/// Refinement of an [`ExitCode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExitCause {
    #[default]
    Unknown,
    InvalidName,
    ApiErr,
    FileTooBig,
    NotFound,
    QuotaExceeded,
    FileAlreadyExist,
    NetworkTimeout,
    SocketsDefuncted,
    FileAccessError,
    MoveToTrashFailed,
    InvalidSnapshot,
    UnexpectedFileSystemEvent,
    NotEnoughDiskSpace,
}

/// Error type carried between stages
///
/// Wraps the `(code, cause)` pair together with a human-readable context
/// message for the logs.
#[derive(Debug, Clone, Error)]
#[error("{code:?}/{cause:?}: {message}")]
pub struct StepError {
    pub code: ExitCode,
    pub cause: ExitCause,
    pub message: String,
}

impl StepError {
    pub fn new(code: ExitCode, cause: ExitCause, message: impl Into<String>) -> Self {
        Self {
            code,
            cause,
            message: message.into(),
        }
    }

    pub fn data(cause: ExitCause, message: impl Into<String>) -> Self {
        Self::new(ExitCode::DataError, cause, message)
    }

    pub fn system(cause: ExitCause, message: impl Into<String>) -> Self {
        Self::new(ExitCode::SystemError, cause, message)
    }

    pub fn network(cause: ExitCause, message: impl Into<String>) -> Self {
        Self::new(ExitCode::NetworkError, cause, message)
    }

    pub fn need_restart(message: impl Into<String>) -> Self {
        Self::new(ExitCode::NeedRestart, ExitCause::Unknown, message)
    }

    pub fn canceled() -> Self {
        Self::new(ExitCode::OperationCanceled, ExitCause::Unknown, "canceled")
    }

    /// True when the supervisor should discard the pass and reobserve
    pub fn wants_restart(&self) -> bool {
        matches!(self.code, ExitCode::NeedRestart | ExitCode::DataError)
    }
}

pub type StepResult<T> = Result<T, StepError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wants_restart() {
        assert!(StepError::need_restart("snapshot changed").wants_restart());
        assert!(StepError::data(ExitCause::InvalidSnapshot, "tmp node left").wants_restart());
        assert!(!StepError::system(ExitCause::NotEnoughDiskSpace, "disk").wants_restart());
        assert!(!StepError::canceled().wants_restart());
    }

    #[test]
    fn test_display_carries_code_and_cause() {
        let err = StepError::system(ExitCause::NotEnoughDiskSpace, "only 1 MiB free");
        let text = err.to_string();
        assert!(text.contains("SystemError"));
        assert!(text.contains("NotEnoughDiskSpace"));
        assert!(text.contains("only 1 MiB free"));
    }
}
