//! Error classification and backoff policy
//!
//! The job layer classifies every `(code, cause)` pair so the executor can
//! decide what to do without inspecting causes itself:
//!
//! - `Managed`: a business outcome the caller handles specifically
//!   (already exists, not found, quota, ...)
//! - `Retryable`: transient; retry locally with backoff
//! - `Fatal`: give up on the operation

use std::time::Duration;

use pairdrive_core::domain::{ExitCause, ExitCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Managed,
    Retryable,
    Fatal,
}

/// Classifies a job result.
pub fn classify(code: ExitCode, cause: ExitCause) -> ErrorClass {
    match code {
        ExitCode::Ok => ErrorClass::Managed,
        ExitCode::NetworkError | ExitCode::RateLimited | ExitCode::TokenRefreshed => {
            ErrorClass::Retryable
        }
        ExitCode::BackError => match cause {
            ExitCause::NotFound
            | ExitCause::FileAlreadyExist
            | ExitCause::FileTooBig
            | ExitCause::QuotaExceeded
            | ExitCause::InvalidName => ErrorClass::Managed,
            // 5xx and unclassified API errors are worth another attempt
            _ => ErrorClass::Retryable,
        },
        ExitCode::SystemError
        | ExitCode::DataError
        | ExitCode::NeedRestart
        | ExitCode::OperationCanceled
        | ExitCode::InvalidToken => ErrorClass::Fatal,
    }
}

/// True when this outcome grants an extra attempt beyond the normal budget.
///
/// A refreshed token or an explicit server throttle is not the operation's
/// fault, so it does not consume one of its attempts.
pub fn grants_extra_attempt(code: ExitCode) -> bool {
    matches!(code, ExitCode::TokenRefreshed | ExitCode::RateLimited)
}

/// Exponential backoff schedule: 1s, 2s, 4s, 8s, 16s, capped.
pub fn backoff_delay(attempt: u32) -> Duration {
    let capped = attempt.min(4);
    Duration::from_secs(1u64 << capped)
}
