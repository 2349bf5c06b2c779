use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Invalid entry: {message}")]
    InvalidEntry { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}
