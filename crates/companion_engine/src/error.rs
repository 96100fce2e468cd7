use companion_engine_abi::EngineError;
use companion_engine_store::StoreError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid {field}: {message}")]
    InvalidPayload {
        field: &'static str,
        message: String,
    },
    #[error("session {session_id} is closed")]
    Closed { session_id: String },
}

impl SessionError {
    pub(crate) fn invalid_payload(field: &'static str, err: impl ToString) -> Self {
        SessionError::InvalidPayload {
            field,
            message: err.to_string(),
        }
    }
}
