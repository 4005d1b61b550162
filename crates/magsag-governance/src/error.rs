use magsag_storage::StorageError;
use magsag_types::TicketStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("approval denied: {0}")]
    Denied(String),

    #[error("approval timed out: {0}")]
    Timeout(String),

    #[error("approval ticket not found: {0}")]
    NotFound(String),

    #[error("ticket already {status}")]
    AlreadyResolved {
        ticket_id: String,
        status: TicketStatus,
    },

    #[error("approval wait cancelled")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("tool execution failed: {0}")]
    Tool(String),
}

impl From<anyhow::Error> for GateError {
    fn from(err: anyhow::Error) -> Self {
        GateError::Tool(format!("{err:#}"))
    }
}
