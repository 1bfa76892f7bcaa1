use thiserror::Error;

use crate::auth::AuthError;

/// Failure reported by the service-manager connection itself.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("d-bus error: {0}")]
    Bus(String),
    #[error("unit {unit}: {message}")]
    Unit { unit: String, message: String },
}

impl From<zbus::Error> for BackendError {
    fn from(err: zbus::Error) -> Self {
        BackendError::Bus(err.to_string())
    }
}

impl From<zbus::fdo::Error> for BackendError {
    fn from(err: zbus::fdo::Error) -> Self {
        BackendError::Bus(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum UnitError {
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },
    #[error("unsupported action '{0}'. Supported: {}", crate::units::UnitAction::NAMES.join(", "))]
    UnsupportedAction(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("backend error: {0}")]
    Transport(#[from] BackendError),
    #[error("job for {unit} finished with result '{result}'")]
    OperationFailed { unit: String, result: String },
    #[error("operation already in progress for {unit} (job {job})")]
    OperationInProgress { unit: String, job: String },
    #[error("request cancelled")]
    Cancelled,
}

impl UnitError {
    /// Short machine-readable tag used in tool responses.
    pub fn kind(&self) -> &'static str {
        match self {
            UnitError::Unauthorized { .. } => "unauthorized",
            UnitError::UnsupportedAction(_) => "unsupported_action",
            UnitError::InvalidArgument(_) => "invalid_argument",
            UnitError::Transport(_) => "transport",
            UnitError::OperationFailed { .. } => "operation_failed",
            UnitError::OperationInProgress { .. } => "operation_in_progress",
            UnitError::Cancelled => "cancelled",
        }
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        UnitError::Unauthorized {
            reason: reason.into(),
        }
    }
}

impl From<AuthError> for UnitError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Broker(message) => UnitError::Transport(BackendError::Bus(message)),
            other => UnitError::unauthorized(other.to_string()),
        }
    }
}
