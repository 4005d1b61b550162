use magsag_governance::GateError;
use magsag_memory::MemoryError;
use magsag_storage::StorageError;
use magsag_types::{ApiError, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("no successful tasks for run {0}")]
    NoSuccessfulTasks(String),

    #[error("agent execution failed: {0}")]
    Execution(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl RunnerError {
    /// Project onto the fixed `{code, message}` shape surfaced to callers.
    pub fn to_api_error(&self) -> ApiError {
        let code = match self {
            RunnerError::AgentNotFound(_) => ErrorCode::AgentNotFound,
            RunnerError::NoSuccessfulTasks(_) | RunnerError::Execution(_) => {
                ErrorCode::ExecutionFailed
            }
            RunnerError::Gate(GateError::Denied(_)) => ErrorCode::InsufficientPermissions,
            RunnerError::Gate(GateError::NotFound(_)) => ErrorCode::NotFound,
            RunnerError::Gate(GateError::AlreadyResolved { .. }) => ErrorCode::Conflict,
            RunnerError::Gate(_) => ErrorCode::ExecutionFailed,
            RunnerError::Storage(StorageError::NotFound { .. }) => ErrorCode::NotFound,
            RunnerError::Storage(_) | RunnerError::Memory(_) => ErrorCode::InternalError,
        };
        ApiError::new(code, self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_codes_follow_error_kind() {
        let not_found = RunnerError::AgentNotFound("ghost".to_string()).to_api_error();
        assert_eq!(not_found.code, ErrorCode::AgentNotFound);

        let denied = RunnerError::Gate(GateError::Denied("no".to_string())).to_api_error();
        assert_eq!(denied.code, ErrorCode::InsufficientPermissions);

        let conflict = RunnerError::Gate(GateError::AlreadyResolved {
            ticket_id: "t".to_string(),
            status: magsag_types::TicketStatus::Approved,
        })
        .to_api_error();
        assert_eq!(conflict.code, ErrorCode::Conflict);
        assert_eq!(conflict.code.as_str(), "conflict");

        let failed = RunnerError::NoSuccessfulTasks("r".to_string()).to_api_error();
        assert_eq!(failed.code, ErrorCode::ExecutionFailed);
        assert!(failed.message.contains("r"));
    }
}
