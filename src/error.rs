use std::error::Error;
use std::fmt::{Display, Formatter};

/// Status codes shared by local failures and errors reported by the remote service.
///
/// The numeric values returned by [`SyncErrorCode::rpc_status`] follow the
/// canonical RPC status numbering used on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncErrorCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl SyncErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorCode::Cancelled => "docsync/cancelled",
            SyncErrorCode::Unknown => "docsync/unknown",
            SyncErrorCode::InvalidArgument => "docsync/invalid-argument",
            SyncErrorCode::DeadlineExceeded => "docsync/deadline-exceeded",
            SyncErrorCode::NotFound => "docsync/not-found",
            SyncErrorCode::AlreadyExists => "docsync/already-exists",
            SyncErrorCode::PermissionDenied => "docsync/permission-denied",
            SyncErrorCode::ResourceExhausted => "docsync/resource-exhausted",
            SyncErrorCode::FailedPrecondition => "docsync/failed-precondition",
            SyncErrorCode::Aborted => "docsync/aborted",
            SyncErrorCode::OutOfRange => "docsync/out-of-range",
            SyncErrorCode::Unimplemented => "docsync/unimplemented",
            SyncErrorCode::Internal => "docsync/internal",
            SyncErrorCode::Unavailable => "docsync/unavailable",
            SyncErrorCode::DataLoss => "docsync/data-loss",
            SyncErrorCode::Unauthenticated => "docsync/unauthenticated",
        }
    }

    /// Maps a numeric RPC status onto a code. Unrecognised values map to `Unknown`.
    pub fn from_rpc_status(status: i32) -> Self {
        match status {
            1 => SyncErrorCode::Cancelled,
            2 => SyncErrorCode::Unknown,
            3 => SyncErrorCode::InvalidArgument,
            4 => SyncErrorCode::DeadlineExceeded,
            5 => SyncErrorCode::NotFound,
            6 => SyncErrorCode::AlreadyExists,
            7 => SyncErrorCode::PermissionDenied,
            8 => SyncErrorCode::ResourceExhausted,
            9 => SyncErrorCode::FailedPrecondition,
            10 => SyncErrorCode::Aborted,
            11 => SyncErrorCode::OutOfRange,
            12 => SyncErrorCode::Unimplemented,
            13 => SyncErrorCode::Internal,
            14 => SyncErrorCode::Unavailable,
            15 => SyncErrorCode::DataLoss,
            16 => SyncErrorCode::Unauthenticated,
            _ => SyncErrorCode::Unknown,
        }
    }

    pub fn rpc_status(&self) -> i32 {
        match self {
            SyncErrorCode::Cancelled => 1,
            SyncErrorCode::Unknown => 2,
            SyncErrorCode::InvalidArgument => 3,
            SyncErrorCode::DeadlineExceeded => 4,
            SyncErrorCode::NotFound => 5,
            SyncErrorCode::AlreadyExists => 6,
            SyncErrorCode::PermissionDenied => 7,
            SyncErrorCode::ResourceExhausted => 8,
            SyncErrorCode::FailedPrecondition => 9,
            SyncErrorCode::Aborted => 10,
            SyncErrorCode::OutOfRange => 11,
            SyncErrorCode::Unimplemented => 12,
            SyncErrorCode::Internal => 13,
            SyncErrorCode::Unavailable => 14,
            SyncErrorCode::DataLoss => 15,
            SyncErrorCode::Unauthenticated => 16,
        }
    }

    /// Transport-level conditions that are handled by backing off and retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncErrorCode::Unavailable
                | SyncErrorCode::DeadlineExceeded
                | SyncErrorCode::ResourceExhausted
                | SyncErrorCode::Unknown
                | SyncErrorCode::Internal
                | SyncErrorCode::Cancelled
                | SyncErrorCode::Aborted
                | SyncErrorCode::Unauthenticated
        )
    }

    /// Errors that retrying the same request can never fix.
    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SyncError {
    pub code: SyncErrorCode,
    message: String,
}

impl SyncError {
    pub fn new(code: SyncErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for SyncError {}

pub type SyncResult<T> = Result<T, SyncError>;

pub(crate) const PRIMARY_LEASE_LOST_MESSAGE: &str =
    "The current client lost its primary lease on the local persistence";

pub fn invalid_argument(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Internal, message)
}

pub fn not_found(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::NotFound, message)
}

pub fn already_exists(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::AlreadyExists, message)
}

pub fn permission_denied(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::PermissionDenied, message)
}

pub fn failed_precondition(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::FailedPrecondition, message)
}

pub fn aborted(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Aborted, message)
}

pub fn unauthenticated(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Unauthenticated, message)
}

pub fn unavailable(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Unavailable, message)
}

pub fn deadline_exceeded(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::DeadlineExceeded, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::ResourceExhausted, message)
}

pub fn cancelled(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Cancelled, message)
}

pub fn data_loss(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::DataLoss, message)
}

pub fn primary_lease_lost() -> SyncError {
    failed_precondition(PRIMARY_LEASE_LOST_MESSAGE)
}

/// Lease contention is recoverable: the operation is retried once the lease is reacquired.
pub fn is_primary_lease_lost(error: &SyncError) -> bool {
    error.code == SyncErrorCode::FailedPrecondition && error.message == PRIMARY_LEASE_LOST_MESSAGE
}
