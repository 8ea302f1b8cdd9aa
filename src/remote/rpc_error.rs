use serde_json::Value as JsonValue;

use crate::error::{SyncError, SyncErrorCode};

/// Whether a stream or request failing with `code` can never succeed when
/// retried unchanged.
pub fn is_permanent_error(code: SyncErrorCode) -> bool {
    match code {
        SyncErrorCode::Cancelled
        | SyncErrorCode::Unknown
        | SyncErrorCode::DeadlineExceeded
        | SyncErrorCode::ResourceExhausted
        | SyncErrorCode::Internal
        | SyncErrorCode::Unavailable
        | SyncErrorCode::Unauthenticated => false,
        SyncErrorCode::InvalidArgument
        | SyncErrorCode::NotFound
        | SyncErrorCode::AlreadyExists
        | SyncErrorCode::PermissionDenied
        | SyncErrorCode::FailedPrecondition
        | SyncErrorCode::Aborted
        | SyncErrorCode::OutOfRange
        | SyncErrorCode::Unimplemented
        | SyncErrorCode::DataLoss => true,
    }
}

/// Writes that were aborted (contention on the server) are retried even
/// though the code is otherwise permanent.
pub fn is_permanent_write_error(code: SyncErrorCode) -> bool {
    is_permanent_error(code) && code != SyncErrorCode::Aborted
}

/// Maps a canonical status name such as `PERMISSION_DENIED`.
pub fn code_from_status_name(status: &str) -> SyncErrorCode {
    match status {
        "CANCELLED" => SyncErrorCode::Cancelled,
        "INVALID_ARGUMENT" => SyncErrorCode::InvalidArgument,
        "DEADLINE_EXCEEDED" => SyncErrorCode::DeadlineExceeded,
        "NOT_FOUND" => SyncErrorCode::NotFound,
        "ALREADY_EXISTS" => SyncErrorCode::AlreadyExists,
        "PERMISSION_DENIED" => SyncErrorCode::PermissionDenied,
        "RESOURCE_EXHAUSTED" => SyncErrorCode::ResourceExhausted,
        "FAILED_PRECONDITION" => SyncErrorCode::FailedPrecondition,
        "ABORTED" => SyncErrorCode::Aborted,
        "OUT_OF_RANGE" => SyncErrorCode::OutOfRange,
        "UNIMPLEMENTED" => SyncErrorCode::Unimplemented,
        "INTERNAL" => SyncErrorCode::Internal,
        "UNAVAILABLE" => SyncErrorCode::Unavailable,
        "DATA_LOSS" => SyncErrorCode::DataLoss,
        "UNAUTHENTICATED" => SyncErrorCode::Unauthenticated,
        other => {
            log::warn!("unrecognised status name {other}");
            SyncErrorCode::Unknown
        }
    }
}

/// Decodes a `{"code": .., "message": ..}` status object. The code may be
/// numeric or a status name; anything else reads as `Unknown`.
pub fn decode_status(status: &JsonValue) -> SyncError {
    let code = match status.get("code") {
        Some(JsonValue::Number(number)) => number
            .as_i64()
            .map(|code| SyncErrorCode::from_rpc_status(code as i32))
            .unwrap_or(SyncErrorCode::Unknown),
        Some(JsonValue::String(name)) => code_from_status_name(name),
        _ => SyncErrorCode::Unknown,
    };
    let message = status
        .get("message")
        .and_then(JsonValue::as_str)
        .unwrap_or_default();
    SyncError::new(code, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn aborted_writes_are_retried() {
        assert!(is_permanent_error(SyncErrorCode::Aborted));
        assert!(!is_permanent_write_error(SyncErrorCode::Aborted));
        assert!(is_permanent_write_error(SyncErrorCode::PermissionDenied));
        assert!(!is_permanent_write_error(SyncErrorCode::Unavailable));
    }

    #[test]
    fn decodes_numeric_and_named_codes() {
        let numeric = decode_status(&json!({ "code": 7, "message": "no" }));
        assert_eq!(numeric.code, SyncErrorCode::PermissionDenied);
        assert_eq!(numeric.message(), "no");

        let named = decode_status(&json!({ "code": "RESOURCE_EXHAUSTED" }));
        assert_eq!(named.code, SyncErrorCode::ResourceExhausted);

        assert_eq!(decode_status(&json!({})).code, SyncErrorCode::Unknown);
    }
}
