// Error types for configuration loading

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration key not found: {0}")]
    KeyNotFound(String),

    #[error("Failed to parse {key}: {message}")]
    ParseError { key: String, message: String },

    #[error("Failed to load .env file: {0}")]
    DotenvError(#[from] dotenvy::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
