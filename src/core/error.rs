use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnvError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict error: {0}")]
    Conflict(String),

    #[error("Environment not found: {0}")]
    NotFound(String),

    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Container runtime operation failed: {0}")]
    RuntimeOperationFailed(String),

    #[error("Registry store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EnvResult<T> = Result<T, EnvError>;
