//! Release information exposed to templates

use serde::{Deserialize, Serialize};

/// Release information for templates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseInfo {
    /// Release name
    pub name: String,

    /// Target namespace
    pub namespace: String,

    /// Revision number being rendered
    pub revision: u32,

    /// Is this an install operation?
    pub is_install: bool,

    /// Is this an upgrade operation?
    pub is_upgrade: bool,

    /// Is this a rollback operation?
    pub is_rollback: bool,

    /// Service (always "Keel")
    pub service: String,
}

impl ReleaseInfo {
    fn base(name: &str, namespace: &str, revision: u32) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            revision,
            is_install: false,
            is_upgrade: false,
            is_rollback: false,
            service: "Keel".to_string(),
        }
    }

    /// Create release info for a first install
    pub fn for_install(name: &str, namespace: &str) -> Self {
        Self {
            is_install: true,
            ..Self::base(name, namespace, 1)
        }
    }

    /// Create release info for an upgrade
    pub fn for_upgrade(name: &str, namespace: &str, revision: u32) -> Self {
        Self {
            is_upgrade: true,
            ..Self::base(name, namespace, revision)
        }
    }

    /// Create release info for a rollback
    ///
    /// A rollback is rendered as an upgrade to the target's chart and values.
    pub fn for_rollback(name: &str, namespace: &str, revision: u32) -> Self {
        Self {
            is_upgrade: true,
            is_rollback: true,
            ..Self::base(name, namespace, revision)
        }
    }

    /// Override the revision (reinstall over uninstalled history)
    pub fn with_revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }
}
