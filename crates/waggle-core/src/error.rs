use thiserror::Error;

pub type WaggleResult<T> = Result<T, WaggleError>;

#[derive(Error, Debug)]
pub enum WaggleError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Position error: {0}")]
    Position(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Task error: {0}")]
    Task(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Execution cancelled: {0}")]
    Cancelled(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
