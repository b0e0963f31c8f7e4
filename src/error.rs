use crate::clients::ExternalError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Resources already claimed: {}", resource_ids.join(", "))]
    Conflict { resource_ids: Vec<String> },

    #[error("Transient external error: {0}")]
    TransientExternal(String),

    #[error("Permanent external error: {0}")]
    PermanentExternal(String),

    #[error("Execution {execution_id} has {completed}/{total} waves completed")]
    FinalizationPrecondition {
        execution_id: String,
        completed: usize,
        total: usize,
    },

    #[error("Wave {wave_number} of execution {execution_id} is already starting")]
    WaveStarting {
        execution_id: String,
        wave_number: u32,
    },

    #[error("Operation '{operation}' is not valid for execution {execution_id} in status {status}")]
    InvalidTransition {
        execution_id: String,
        operation: &'static str,
        status: String,
    },
}

impl AppError {
    /// Stable machine-readable code used by the request dispatcher.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_)
            | AppError::Serialization(_)
            | AppError::Io(_)
            | AppError::TaskJoin(_) => "internal",
            AppError::ExecutionNotFound(_) => "not_found",
            AppError::Validation(_) => "validation",
            AppError::Conflict { .. } => "conflict",
            AppError::TransientExternal(_) => "transient_external",
            AppError::PermanentExternal(_) => "permanent_external",
            AppError::FinalizationPrecondition { .. } => "finalization_precondition",
            AppError::InvalidTransition { .. } | AppError::WaveStarting { .. } => {
                "invalid_transition"
            }
        }
    }
}

impl From<ExternalError> for AppError {
    fn from(err: ExternalError) -> Self {
        match err {
            ExternalError::Transient(msg) => AppError::TransientExternal(msg),
            ExternalError::Permanent(msg) => AppError::PermanentExternal(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
