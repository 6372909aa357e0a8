//! Error types for keel-release

use std::time::Duration;

use thiserror::Error;

use keel_engine::HookEvent;

use crate::cluster::ClusterError;
use crate::release::ReleaseStatus;

/// Result type for release operations
pub type Result<T> = std::result::Result<T, ReleaseError>;

/// Errors raised by release transitions, hooks and storage
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReleaseError {
    /// Release or revision does not exist
    #[error("{}", not_found_message(.name, .revision))]
    NotFound { name: String, revision: Option<u32> },

    /// Another transition won the race for this release
    #[error("concurrent modification of release '{name}' at revision {revision}: {reason}")]
    ConcurrentModification {
        name: String,
        revision: u32,
        reason: String,
    },

    /// The requested action is not allowed from the release's current state
    #[error("cannot {action} release '{name}': {reason}")]
    InvalidTransition {
        name: String,
        action: String,
        reason: String,
    },

    /// The release name cannot be used
    #[error("invalid release name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// A hook did not reach an outcome within its timeout
    #[error("hook '{hook}' timed out after {timeout:?} during {event}")]
    HookTimeout {
        hook: String,
        event: HookEvent,
        timeout: Duration,
    },

    /// A hook reached a failed outcome
    #[error("hook '{hook}' failed during {event}: {message}")]
    HookFailed {
        hook: String,
        event: HookEvent,
        message: String,
    },

    /// Applying manifests to the cluster failed
    #[error("failed to apply manifests: {source}")]
    ApplyFailed {
        #[source]
        source: ClusterError,
    },

    /// Any other cluster call failed
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// The caller cancelled the transition or its deadline passed
    #[error("transition of release '{name}' at revision {revision} was cancelled")]
    Cancelled { name: String, revision: u32 },

    /// A transition failed after its revision was recorded
    #[error("release '{name}' revision {revision} is {status}: {source}")]
    RevisionFailed {
        name: String,
        revision: u32,
        status: ReleaseStatus,
        #[source]
        source: Box<ReleaseError>,
    },

    /// Rendering failed (carries every per-template cause)
    #[error(transparent)]
    Render(#[from] keel_engine::EngineError),

    /// Dependency resolution failed
    #[error(transparent)]
    Resolve(#[from] keel_repo::RepoError),

    /// Chart or value error (includes invalid `--set` syntax)
    #[error(transparent)]
    Values(#[from] keel_core::CoreError),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Compression error
    #[error("compression error: {0}")]
    Compression(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn not_found_message(name: &str, revision: &Option<u32>) -> String {
    match revision {
        Some(revision) => format!("revision {} of release '{}' not found", revision, name),
        None => format!("release '{}' not found", name),
    }
}

impl From<serde_json::Error> for ReleaseError {
    fn from(e: serde_json::Error) -> Self {
        ReleaseError::Serialization(e.to_string())
    }
}

impl ReleaseError {
    pub(crate) fn not_found(name: &str, revision: Option<u32>) -> Self {
        Self::NotFound {
            name: name.to_string(),
            revision,
        }
    }

    pub(crate) fn conflict(name: &str, revision: u32, reason: impl Into<String>) -> Self {
        Self::ConcurrentModification {
            name: name.to_string(),
            revision,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(name: &str, action: &str, reason: impl Into<String>) -> Self {
        Self::InvalidTransition {
            name: name.to_string(),
            action: action.to_string(),
            reason: reason.into(),
        }
    }

    /// The underlying cause, looking through [`ReleaseError::RevisionFailed`]
    pub fn cause(&self) -> &ReleaseError {
        match self {
            Self::RevisionFailed { source, .. } => source.cause(),
            other => other,
        }
    }

    /// Whether retrying the same transition may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self.cause(), Self::ConcurrentModification { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.cause(), Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_messages() {
        assert_eq!(
            ReleaseError::not_found("web", None).to_string(),
            "release 'web' not found"
        );
        assert_eq!(
            ReleaseError::not_found("web", Some(3)).to_string(),
            "revision 3 of release 'web' not found"
        );
    }

    #[test]
    fn test_cause_looks_through_revision_failure() {
        let err = ReleaseError::RevisionFailed {
            name: "web".to_string(),
            revision: 2,
            status: ReleaseStatus::Failed {
                reason: "boom".to_string(),
            },
            source: Box::new(ReleaseError::HookFailed {
                hook: "smoke".to_string(),
                event: HookEvent::PostUpgrade,
                message: "boom".to_string(),
            }),
        };
        assert!(matches!(err.cause(), ReleaseError::HookFailed { .. }));
        assert!(err.to_string().starts_with("release 'web' revision 2 is failed"));
        assert!(!err.is_retryable());
        assert!(ReleaseError::conflict("web", 2, "taken").is_retryable());
    }
}
