//! Release revisions and their status state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_core::{Chart, Values};
use keel_engine::{HookManifest, RenderedOutput};

/// One immutable revision of a release
///
/// Everything but `status` and the deployment timestamps is fixed when the
/// revision is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    /// Release name
    pub name: String,

    /// Target namespace
    pub namespace: String,

    /// Revision number (starts at 1, monotonic per name)
    pub revision: u32,

    /// Chart tree the revision was rendered from
    pub chart: Chart,

    /// `name-version` of the chart
    pub chart_ref: String,

    /// User-supplied values
    pub config: Values,

    /// Merged values of the root scope used for rendering
    pub values: Values,

    /// Rendered manifest stream (hooks excluded)
    pub manifest: String,

    /// Rendered hooks
    #[serde(default)]
    pub hooks: Vec<HookManifest>,

    /// Current status
    pub status: ReleaseStatus,

    /// When the release was first deployed (carried across revisions)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_deployed: Option<DateTime<Utc>>,

    /// When this revision was deployed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_deployed: Option<DateTime<Utc>>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Human-readable description of the transition
    #[serde(default)]
    pub description: String,

    /// Rendered `NOTES.txt`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Revision {
    /// A new revision in `status` with nothing rendered yet
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        revision: u32,
        chart: Chart,
        config: Values,
        status: ReleaseStatus,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            revision,
            chart_ref: chart.reference(),
            chart,
            config,
            values: Values::new(),
            manifest: String::new(),
            hooks: Vec::new(),
            status,
            first_deployed: None,
            last_deployed: None,
            created_at: Utc::now(),
            description: String::new(),
            notes: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_first_deployed(mut self, first_deployed: Option<DateTime<Utc>>) -> Self {
        self.first_deployed = first_deployed;
        self
    }

    /// Attach render output
    pub fn with_rendered(mut self, values: Values, output: &RenderedOutput) -> Self {
        self.values = values;
        self.manifest = output.manifest();
        self.hooks = output.hooks();
        self.notes = output.notes.clone();
        self
    }

    /// Storage key for this revision
    pub fn storage_key(&self) -> String {
        format!("keel.release.v1.{}.v{}", self.name, self.revision)
    }

    /// Apply a status change, stamping deployment times
    pub fn transition(&mut self, status: ReleaseStatus) {
        if status == ReleaseStatus::Deployed {
            let now = Utc::now();
            self.last_deployed = Some(now);
            self.first_deployed.get_or_insert(now);
        }
        self.status = status;
    }
}

/// Status of one revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
#[non_exhaustive]
pub enum ReleaseStatus {
    /// Installation in progress
    PendingInstall,

    /// Upgrade in progress
    PendingUpgrade,

    /// Rollback to `target` in progress
    PendingRollback { target: u32 },

    /// Live on the cluster
    Deployed,

    /// Transition failed
    Failed { reason: String },

    /// Replaced by a newer deployed revision
    Superseded,

    /// Uninstallation in progress
    Uninstalling,

    /// Removed from the cluster, history kept
    Uninstalled,
}

impl ReleaseStatus {
    /// Whether a transition is in flight
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::PendingInstall | Self::PendingUpgrade | Self::PendingRollback { .. } | Self::Uninstalling
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_pending()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Kebab-case status name
    pub fn status_name(&self) -> &'static str {
        match self {
            Self::PendingInstall => "pending-install",
            Self::PendingUpgrade => "pending-upgrade",
            Self::PendingRollback { .. } => "pending-rollback",
            Self::Deployed => "deployed",
            Self::Failed { .. } => "failed",
            Self::Superseded => "superseded",
            Self::Uninstalling => "uninstalling",
            Self::Uninstalled => "uninstalled",
        }
    }
}

impl std::fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed { reason } => write!(f, "failed: {}", reason),
            Self::PendingRollback { target } => write!(f, "pending-rollback to {}", target),
            other => f.write_str(other.status_name()),
        }
    }
}

/// Longest accepted release name
pub const MAX_NAME_LEN: usize = 53;

/// Check a release name: lowercase alphanumerics, `-` and `.`, starting and
/// ending with an alphanumeric, at most [`MAX_NAME_LEN`] characters
pub fn validate_name(name: &str) -> crate::error::Result<()> {
    let invalid = |reason: &str| crate::error::ReleaseError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid(&format!("name is longer than {} characters", MAX_NAME_LEN)));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return Err(invalid(
            "only lowercase letters, digits, '-' and '.' are allowed",
        ));
    }
    let alnum = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    if !alnum(name.chars().next()) || !alnum(name.chars().last()) {
        return Err(invalid("name must start and end with a letter or digit"));
    }
    Ok(())
}

/// All revisions sharing a name, in ascending order
#[derive(Debug, Clone, PartialEq)]
pub struct Release {
    pub name: String,
    pub revisions: Vec<Revision>,
}

impl Release {
    pub fn new(name: impl Into<String>, mut revisions: Vec<Revision>) -> Self {
        revisions.sort_by_key(|r| r.revision);
        Self {
            name: name.into(),
            revisions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    /// Highest-numbered revision
    pub fn latest(&self) -> Option<&Revision> {
        self.revisions.last()
    }

    /// Highest-numbered terminal revision that is not superseded
    pub fn current(&self) -> Option<&Revision> {
        self.revisions
            .iter()
            .rev()
            .find(|r| r.status.is_terminal() && r.status != ReleaseStatus::Superseded)
    }

    /// Highest-numbered deployed revision
    pub fn deployed(&self) -> Option<&Revision> {
        self.revisions
            .iter()
            .rev()
            .find(|r| r.status == ReleaseStatus::Deployed)
    }

    /// The in-flight revision, if any
    pub fn pending(&self) -> Option<&Revision> {
        self.revisions.iter().find(|r| r.status.is_pending())
    }

    /// Number the next revision gets
    pub fn next_revision(&self) -> u32 {
        self.latest().map_or(1, |r| r.revision + 1)
    }

    /// Default rollback target: the last revision that was live before the
    /// currently deployed one
    pub fn previous_deployed(&self) -> Option<&Revision> {
        let below = self.deployed().map_or(u32::MAX, |r| r.revision);
        self.revisions.iter().rev().find(|r| {
            r.revision < below
                && matches!(r.status, ReleaseStatus::Superseded | ReleaseStatus::Deployed)
        })
    }

    /// Whether the release is absent from the cluster
    pub fn is_uninstalled(&self) -> bool {
        self.latest()
            .is_none_or(|r| r.status == ReleaseStatus::Uninstalled)
    }
}
