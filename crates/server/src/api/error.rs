//! Mapping from dispatcher errors to HTTP responses.

use axum::{http::StatusCode, Json};
use serde::Serialize;

use fleetguard_core::{ChangeError, DispatchError, LedgerError, SnapshotError, UpgradeError};

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Machine-readable reason, e.g. `locked` or `not_ready`.
    pub code: &'static str,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub type ApiResult<T> = Result<T, ApiError>;

pub fn api_error(status: StatusCode, code: &'static str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code,
        }),
    )
}

pub fn bad_request(error: impl Into<String>) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, "invalid", error)
}

pub fn internal(error: impl Into<String>) -> ApiError {
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "error", error)
}

fn status_for(err: &DispatchError) -> (StatusCode, &'static str) {
    match err {
        DispatchError::DeviceNotFound(_) | DispatchError::JobNotFound(_) => {
            (StatusCode::NOT_FOUND, "not_found")
        }
        DispatchError::DeviceDisabled(_) => (StatusCode::CONFLICT, "disabled"),
        DispatchError::DeviceLocked { .. } => (StatusCode::CONFLICT, "locked"),
        DispatchError::Duplicate { .. } => (StatusCode::CONFLICT, "duplicate"),
        DispatchError::NotPending { .. } | DispatchError::NotAwaitingConfirmation(_) => {
            (StatusCode::CONFLICT, "invalid_state")
        }
        DispatchError::UpgradeNotReady { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "not_ready"),
        DispatchError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid"),
        DispatchError::Change(ChangeError::TimeoutOutOfRange { .. }) => {
            (StatusCode::BAD_REQUEST, "invalid")
        }
        DispatchError::Change(ChangeError::NotAwaitingConfirmation(_)) => {
            (StatusCode::CONFLICT, "invalid_state")
        }
        DispatchError::Ledger(LedgerError::NotFound(_)) => (StatusCode::NOT_FOUND, "not_found"),
        DispatchError::Ledger(LedgerError::DeviceLocked { .. }) => {
            (StatusCode::CONFLICT, "locked")
        }
        DispatchError::Ledger(LedgerError::LockHeld { .. })
        | DispatchError::Ledger(LedgerError::InvalidTransition { .. }) => {
            (StatusCode::CONFLICT, "invalid_state")
        }
        DispatchError::Snapshot(SnapshotError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, "not_found")
        }
        DispatchError::Upgrade(UpgradeError::ImageNotFound(_)) => {
            (StatusCode::NOT_FOUND, "not_found")
        }
        DispatchError::Upgrade(UpgradeError::InvalidVersion(_)) => {
            (StatusCode::BAD_REQUEST, "invalid")
        }
        DispatchError::Upgrade(UpgradeError::Unreachable { .. })
        | DispatchError::Upgrade(UpgradeError::Transport(_)) => {
            (StatusCode::BAD_GATEWAY, "unreachable")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "error"),
    }
}

impl From<DispatchError> for ErrorResponse {
    fn from(err: DispatchError) -> Self {
        let (_, code) = status_for(&err);
        Self {
            error: err.to_string(),
            code,
        }
    }
}

/// Convert a dispatcher error into a status and JSON body.
pub fn dispatch_error(err: DispatchError) -> ApiError {
    let (status, _) = status_for(&err);
    (status, Json(ErrorResponse::from(err)))
}
