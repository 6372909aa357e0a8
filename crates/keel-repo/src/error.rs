//! Error types for dependency resolution

use thiserror::Error;

/// Dependency resolution errors
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RepoError {
    // ============ Source Errors ============
    #[error("Chart not found: {name} in repository {repository}")]
    ChartNotFound { name: String, repository: String },

    #[error("Version not found: {name}@{version} in repository {repository}")]
    VersionNotFound {
        name: String,
        version: String,
        repository: String,
    },

    #[error("Chart source error: {message}")]
    Source { message: String },

    // ============ Dependency Errors ============
    #[error("Version constraint unsatisfiable: {name} requires {constraint}, available: {available}")]
    UnsatisfiableConstraint {
        name: String,
        constraint: String,
        available: String,
    },

    #[error("Invalid version constraint for {name}: '{constraint}' ({message})")]
    InvalidConstraint {
        name: String,
        constraint: String,
        message: String,
    },

    #[error("Duplicate dependency name: {name}")]
    DuplicateDependency { name: String },

    #[error("Dependency nesting exceeds {max_depth} levels at {name}")]
    TooDeep { name: String, max_depth: usize },

    // ============ Lock Errors ============
    #[error("Lock is out of date: declarations digest {actual} does not match locked {expected}. Re-resolve dependencies")]
    LockMismatch { expected: String, actual: String },

    #[error("Dependency {name} is enabled but missing from the lock. Re-resolve dependencies")]
    MissingLockEntry { name: String },

    #[error("Lock entry for {name} is stale: {version} no longer satisfies {constraint}")]
    StaleLockEntry {
        name: String,
        version: String,
        constraint: String,
    },

    #[error("Integrity check failed for {name}: expected {expected}, got {actual}")]
    IntegrityCheckFailed {
        name: String,
        expected: String,
        actual: String,
    },

    // ============ IO Errors ============
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Core(#[from] keel_core::CoreError),
}

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, RepoError>;

impl From<serde_yaml::Error> for RepoError {
    fn from(e: serde_yaml::Error) -> Self {
        RepoError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for RepoError {
    fn from(e: serde_json::Error) -> Self {
        RepoError::Serialization(e.to_string())
    }
}
