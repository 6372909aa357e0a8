//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CoreError {
    #[error("Chart not found: {path}")]
    ChartNotFound { path: String },

    #[error("Invalid Chart.yaml: {message}")]
    InvalidChart { message: String },

    #[error("Invalid value override '{expression}': {message}")]
    InvalidValueSyntax { expression: String, message: String },

    #[error("No value at path '{path}'")]
    ValuePathNotFound { path: String },

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid version: {0}")]
    InvalidVersion(#[from] semver::Error),

    #[error("Cannot access file '{path}': {message}")]
    FileAccess { path: String, message: String },

    #[error("Invalid glob pattern: {message}")]
    GlobPattern { message: String },
}

impl CoreError {
    pub(crate) fn invalid_syntax(expression: &str, message: impl Into<String>) -> Self {
        Self::InvalidValueSyntax {
            expression: expression.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
