//! Template rendering context

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::chart::ChartMetadata;
use crate::error::{CoreError, Result};
use crate::release::ReleaseInfo;
use crate::values::Values;

/// Context available to all templates of one chart scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateContext {
    /// Effective values of the scope
    pub values: JsonValue,

    /// Release information
    pub release: ReleaseInfo,

    /// Chart metadata
    pub chart: ChartInfo,

    /// Cluster capabilities
    pub capabilities: Capabilities,

    /// Current template info
    pub template: TemplateInfo,
}

/// Chart information for templates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartInfo {
    pub name: String,
    pub version: String,
    pub app_version: Option<String>,
    pub description: Option<String>,
}

impl From<&ChartMetadata> for ChartInfo {
    fn from(meta: &ChartMetadata) -> Self {
        Self {
            name: meta.name.clone(),
            version: meta.version.to_string(),
            app_version: meta.app_version.clone(),
            description: meta.description.clone(),
        }
    }
}

/// Cluster capabilities
///
/// Captured from the cluster before each render so that templates can gate
/// resources on the APIs actually served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Kubernetes version
    pub kube_version: KubeVersion,

    /// Available API versions (`group/version` and `group/version/Kind`)
    pub api_versions: BTreeSet<String>,
}

/// API versions every conformant cluster serves
const DEFAULT_API_VERSIONS: &[&str] = &[
    "v1",
    "apps/v1",
    "batch/v1",
    "networking.k8s.io/v1",
    "policy/v1",
    "rbac.authorization.k8s.io/v1",
    "autoscaling/v2",
];

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            kube_version: KubeVersion::default(),
            api_versions: DEFAULT_API_VERSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Capabilities {
    /// Capabilities with an explicit version and no API versions
    pub fn new(kube_version: KubeVersion) -> Self {
        Self {
            kube_version,
            api_versions: BTreeSet::new(),
        }
    }

    pub fn with_api_version(mut self, api: impl Into<String>) -> Self {
        self.api_versions.insert(api.into());
        self
    }

    pub fn with_api_versions<I, S>(mut self, apis: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.api_versions.extend(apis.into_iter().map(Into::into));
        self
    }

    /// Whether the cluster serves `api` (`group/version` or `group/version/Kind`)
    pub fn has(&self, api: &str) -> bool {
        if self.api_versions.contains(api) {
            return true;
        }
        // `apps/v1/Deployment` is served when `apps/v1` is
        api.rsplit_once('/')
            .filter(|(group_version, kind)| {
                kind.chars().next().is_some_and(|c| c.is_ascii_uppercase())
                    && !group_version.is_empty()
            })
            .is_some_and(|(group_version, _)| self.api_versions.contains(group_version))
    }
}

/// Kubernetes version info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeVersion {
    pub version: String,
    pub major: String,
    pub minor: String,
}

impl Default for KubeVersion {
    fn default() -> Self {
        Self::new("1.28.0")
    }
}

impl KubeVersion {
    pub fn new(version: &str) -> Self {
        let version = version.trim_start_matches('v');
        let parts: Vec<&str> = version.split('.').collect();

        Self {
            version: format!("v{}", version),
            major: parts.first().unwrap_or(&"1").to_string(),
            minor: parts.get(1).unwrap_or(&"0").to_string(),
        }
    }

    /// Parse as a semantic version, padding missing components with zero
    pub fn semver(&self) -> Result<semver::Version> {
        let raw = self.version.trim_start_matches('v');
        let core = raw.split(['-', '+']).next().unwrap_or(raw);
        let mut parts = core.split('.').map(|p| p.parse::<u64>());
        let mut next = || -> Result<u64> {
            match parts.next() {
                Some(Ok(n)) => Ok(n),
                Some(Err(_)) => Err(CoreError::InvalidChart {
                    message: format!("invalid Kubernetes version '{}'", self.version),
                }),
                None => Ok(0),
            }
        };
        let (major, minor, patch) = (next()?, next()?, next()?);
        Ok(semver::Version::new(major, minor, patch))
    }
}

/// Current template information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInfo {
    /// Template name (path relative to `templates/`)
    pub name: String,

    /// Base path of the chart scope (`""` for the root chart)
    pub base_path: String,
}

impl TemplateContext {
    /// Create a new template context
    pub fn new(values: Values, release: ReleaseInfo, chart: &ChartMetadata) -> Self {
        Self {
            values: values.into_inner(),
            release,
            chart: ChartInfo::from(chart),
            capabilities: Capabilities::default(),
            template: TemplateInfo::default(),
        }
    }

    /// Set the current template info
    pub fn with_template(mut self, name: &str, base_path: &str) -> Self {
        self.template = TemplateInfo {
            name: name.to_string(),
            base_path: base_path.to_string(),
        };
        self
    }

    /// Set capabilities
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}
