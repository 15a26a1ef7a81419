use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskmillError {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Unknown queue: {name}")]
    QueueNotFound { name: String },

    #[error("Job already exists: {id}")]
    Conflict { id: String },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Handler error: {message}")]
    Handler { message: String },

    #[error("Broker error: {message}")]
    Broker { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl TaskmillError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }
}
