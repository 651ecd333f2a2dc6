use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InversionError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("File not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("Format error in {} (line {line}): {message}", path.display())]
    Format {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Numerical error: {0}")]
    Numerical(String),
}

pub type InversionResult<T> = Result<T, InversionError>;

impl InversionError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        InversionError::Configuration(message.into())
    }
}
