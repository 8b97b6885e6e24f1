use thiserror::Error;

#[derive(Debug, Error)]
pub enum KfcError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No model-task configured for '{task}'")]
    ModelTaskMissing { task: String },

    #[error("LLM transport failure: {0}")]
    LlmTransport(String),

    #[error("LLM response was not parseable as a tool-call result: {0}")]
    UnparseableResponse(String),

    #[error("Session backing-store I/O failure: {0}")]
    StoreIo(String),

    #[error("Host stream registry does not know stream {stream_id}")]
    StreamNotFound { stream_id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KfcError {
    /// Short machine-readable tag, for structured log fields and host-side
    /// branching — mirrors the wire error codes of the gateway this crate
    /// was lifted out of.
    pub fn code(&self) -> &'static str {
        match self {
            KfcError::Config(_) => "CONFIG_ERROR",
            KfcError::ModelTaskMissing { .. } => "MODEL_TASK_MISSING",
            KfcError::LlmTransport(_) => "LLM_TRANSPORT_ERROR",
            KfcError::UnparseableResponse(_) => "UNPARSEABLE_RESPONSE",
            KfcError::StoreIo(_) => "STORE_IO_ERROR",
            KfcError::StreamNotFound { .. } => "STREAM_NOT_FOUND",
            KfcError::Serialization(_) => "SERIALIZATION_ERROR",
            KfcError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, KfcError>;
