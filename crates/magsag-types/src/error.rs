use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable machine-readable codes for user-visible failures. Transport
/// layers map these onto their own status spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Unauthorized,
    InsufficientPermissions,
    InvalidPayload,
    InvalidRequest,
    Conflict,
    ExecutionFailed,
    AgentNotFound,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::InsufficientPermissions => "insufficient_permissions",
            ErrorCode::InvalidPayload => "invalid_payload",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::Conflict => "conflict",
            ErrorCode::ExecutionFailed => "execution_failed",
            ErrorCode::AgentNotFound => "agent_not_found",
            ErrorCode::InternalError => "internal_error",
        }
    }
}

/// API-shaped failure object: `{code, message}`.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{}: {}", .code.as_str(), .message)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Schema or enum mismatch raised at load or ingress; never caught by the
/// core.
#[derive(Debug, Clone, Error)]
#[error("validation error: {0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
