//! Lock format for reproducible dependency sets
//!
//! Key features:
//! - Exact versions (not ranges), in declaration order
//! - SHA256 digest of each resolved chart
//! - Digest of the dependency declarations to detect drift
//!
//! A lock carries no timestamp: resolving the same declarations against the
//! same available versions yields a byte-identical lock.

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::path::Path;

use keel_core::Chart;

use crate::error::{RepoError, Result};

/// Current lock format version
pub const LOCK_VERSION: u32 = 1;

/// Resolved dependency set (`Chart.lock`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    /// Lock format version
    #[serde(default = "default_version")]
    pub version: u32,

    /// Digest of the dependency declarations this lock was produced from
    pub declarations_digest: String,

    /// How strictly fetched charts are checked against locked digests
    #[serde(default)]
    pub policy: LockPolicy,

    /// Locked dependencies, in declaration order
    #[serde(default)]
    pub dependencies: Vec<LockedDependency>,
}

fn default_version() -> u32 {
    LOCK_VERSION
}

/// Lock policy - how strict should verification be?
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockPolicy {
    /// Exact version + digest must match
    Strict,

    /// Exact version only; a changed digest is reported but accepted
    #[default]
    Version,
}

/// A locked dependency with exact version and integrity digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedDependency {
    /// Dependency name
    pub name: String,

    /// Alias if specified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Exact resolved version (NOT a range)
    pub version: Version,

    /// Repository reference where this was resolved from
    pub repository: String,

    /// SHA256 digest reported by the chart source
    pub digest: String,

    /// Original version constraint
    pub constraint: String,
}

impl LockedDependency {
    /// Effective name (alias or original name)
    pub fn effective_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Result of integrity verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    /// Perfect match
    Match,
    /// Version matches but digest changed (republished)
    DigestChanged { expected: String, actual: String },
}

impl Lock {
    /// Create an empty lock for a chart's current declarations
    pub fn for_chart(chart: &Chart) -> Self {
        Self {
            version: LOCK_VERSION,
            declarations_digest: chart.dependencies_digest(),
            policy: LockPolicy::default(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_policy(mut self, policy: LockPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Load lock from path
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Save lock to path
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check the lock against a chart's current declarations
    ///
    /// Fails with `LockMismatch` when the declarations changed since the lock
    /// was produced, and with `StaleLockEntry` when a locked version no longer
    /// satisfies its constraint.
    pub fn verify_against(&self, chart: &Chart) -> Result<()> {
        let actual = chart.dependencies_digest();
        if self.declarations_digest != actual {
            return Err(RepoError::LockMismatch {
                expected: self.declarations_digest.clone(),
                actual,
            });
        }

        for locked in &self.dependencies {
            let req = VersionReq::parse(&locked.constraint).map_err(|e| {
                RepoError::InvalidConstraint {
                    name: locked.name.clone(),
                    constraint: locked.constraint.clone(),
                    message: e.to_string(),
                }
            })?;
            if !satisfies(&req, &locked.version) {
                return Err(RepoError::StaleLockEntry {
                    name: locked.effective_name().to_string(),
                    version: locked.version.to_string(),
                    constraint: locked.constraint.clone(),
                });
            }
        }
        Ok(())
    }

    /// Get a locked dependency by effective name
    pub fn get(&self, name: &str) -> Option<&LockedDependency> {
        self.dependencies.iter().find(|d| d.effective_name() == name)
    }

    /// Verify a fetched chart's digest against the locked one
    pub fn verify_digest(&self, name: &str, actual: &str) -> Result<VerifyResult> {
        let Some(locked) = self.get(name) else {
            return Err(RepoError::ChartNotFound {
                name: name.to_string(),
                repository: "lock".to_string(),
            });
        };

        if locked.digest == actual {
            return Ok(VerifyResult::Match);
        }

        match self.policy {
            LockPolicy::Strict => Err(RepoError::IntegrityCheckFailed {
                name: name.to_string(),
                expected: locked.digest.clone(),
                actual: actual.to_string(),
            }),
            LockPolicy::Version => Ok(VerifyResult::DigestChanged {
                expected: locked.digest.clone(),
                actual: actual.to_string(),
            }),
        }
    }
}

/// Constraint check that also admits pre-releases when the caller opted in
pub(crate) fn satisfies(req: &VersionReq, version: &Version) -> bool {
    if req.matches(version) {
        return true;
    }
    // `VersionReq` excludes pre-releases unless a comparator names the same
    // major.minor.patch; compare the release part for opted-in pre-releases
    !version.pre.is_empty() && req.matches(&Version::new(version.major, version.minor, version.patch))
}
