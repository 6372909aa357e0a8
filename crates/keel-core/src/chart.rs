//! Chart definition and loading
//!
//! A [`Chart`] is an immutable tree: metadata, templates, non-template files,
//! default values, and child charts keyed by their effective name.

use std::collections::BTreeMap;
use std::path::Path;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::context::KubeVersion;
use crate::error::{CoreError, Result};
use crate::values::Values;

/// Supported `apiVersion` values in `Chart.yaml`
pub const SUPPORTED_API_VERSIONS: &[&str] = &["keel/v1", "v2"];

/// Depth limit for nested subcharts when loading from disk
const MAX_LOAD_DEPTH: usize = 10;

/// Chart metadata (`Chart.yaml`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    /// API version
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Chart name
    pub name: String,

    /// Chart version (SemVer)
    pub version: Version,

    /// Chart kind
    #[serde(default)]
    pub kind: ChartKind,

    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Version of the packaged application
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,

    /// Kubernetes version compatibility range (e.g. `>=1.25.0`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_version: Option<String>,

    /// Declared dependencies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,

    /// Keywords
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,

    /// Free-form annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ChartMetadata {
    /// Minimal metadata for a chart
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            api_version: default_api_version(),
            name: name.into(),
            version,
            kind: ChartKind::default(),
            description: None,
            app_version: None,
            kube_version: None,
            dependencies: Vec::new(),
            keywords: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }

    /// Check the chart's `kubeVersion` range against a cluster version
    ///
    /// Pre-release and build suffixes of the cluster version (`1.28.3-gke.100`)
    /// are ignored. Charts without a range support every version.
    pub fn supports_kube_version(&self, kube: &KubeVersion) -> Result<bool> {
        let Some(range) = &self.kube_version else {
            return Ok(true);
        };
        let req = VersionReq::parse(range).map_err(|e| CoreError::InvalidChart {
            message: format!("invalid kubeVersion range '{}': {}", range, e),
        })?;
        let cluster = kube.semver()?;
        Ok(req.matches(&Version::new(cluster.major, cluster.minor, cluster.patch)))
    }
}

fn default_api_version() -> String {
    "keel/v1".to_string()
}

/// Chart type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    /// Deployable chart
    #[default]
    Application,
    /// Helper-only chart: templates are importable but never emitted
    Library,
}

/// When to resolve a dependency
///
/// Controls whether a dependency is resolved/downloaded based on conditions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolvePolicy {
    /// Always resolve, regardless of condition (useful for vendoring/caching)
    ///
    /// Rendering still honours the condition.
    Always,

    /// Only resolve if gating evaluates to true (default)
    #[default]
    WhenEnabled,

    /// Never resolve - dependency must already be vendored under `charts/`
    Never,
}

/// Chart dependency declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    /// Dependency name
    pub name: String,

    /// Version constraint (semver range)
    pub version: String,

    /// Repository reference
    #[serde(default)]
    pub repository: String,

    /// Static enable/disable flag
    ///
    /// When `false`, this dependency is ignored during resolution and rendering.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Comma-separated list of dotted value paths
    ///
    /// The first path that exists in the parent's values decides.
    /// Example: `redis.enabled,global.redis.enabled`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Resolution policy
    #[serde(default)]
    pub resolve: ResolvePolicy,

    /// Tags for grouped inclusion (`tags.<tag>` in values)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Alias name (overrides dependency name in values and output paths)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Allow pre-release versions to satisfy the constraint
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub prerelease: bool,
}

impl Dependency {
    /// Declare a dependency with default flags
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        repository: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            repository: repository.into(),
            enabled: true,
            condition: None,
            resolve: ResolvePolicy::default(),
            tags: Vec::new(),
            alias: None,
            prerelease: false,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Get the effective name (alias if set, otherwise name)
    #[inline]
    pub fn effective_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Parse the version constraint
    pub fn version_req(&self) -> std::result::Result<VersionReq, semver::Error> {
        VersionReq::parse(&self.version)
    }
}

fn default_true() -> bool {
    true
}

/// A loaded chart tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chart {
    /// Chart metadata
    pub metadata: ChartMetadata,

    /// Templates keyed by path relative to `templates/`
    #[serde(default)]
    pub templates: BTreeMap<String, String>,

    /// Default values (`values.yaml`)
    #[serde(default)]
    pub values: Values,

    /// Non-template files keyed by path relative to the chart root
    #[serde(default, with = "bytes_map")]
    pub files: BTreeMap<String, Vec<u8>>,

    /// Child charts keyed by effective name
    #[serde(default)]
    pub subcharts: BTreeMap<String, Chart>,
}

impl Chart {
    /// Create an empty chart
    pub fn new(metadata: ChartMetadata) -> Self {
        Self {
            metadata,
            templates: BTreeMap::new(),
            values: Values::new(),
            files: BTreeMap::new(),
            subcharts: BTreeMap::new(),
        }
    }

    pub fn with_template(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.templates.insert(path.into(), content.into());
        self
    }

    pub fn with_values(mut self, values: Values) -> Self {
        self.values = values;
        self
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.metadata.dependencies.push(dependency);
        self
    }

    pub fn with_subchart(mut self, name: impl Into<String>, chart: Chart) -> Self {
        self.subcharts.insert(name.into(), chart);
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn version(&self) -> &Version {
        &self.metadata.version
    }

    /// `name-version` reference used in logs and release records
    pub fn reference(&self) -> String {
        format!("{}-{}", self.metadata.name, self.metadata.version)
    }

    /// Look up a child chart by effective name
    pub fn subchart(&self, name: &str) -> Option<&Chart> {
        self.subcharts.get(name)
    }

    /// Look up the dependency declaration for a child chart
    pub fn dependency(&self, effective_name: &str) -> Option<&Dependency> {
        self.metadata
            .dependencies
            .iter()
            .find(|d| d.effective_name() == effective_name)
    }

    /// Declared, statically enabled dependencies not present as subcharts
    ///
    /// A chart with any such dependency is "unlocked".
    pub fn missing_dependencies(&self) -> Vec<&Dependency> {
        self.metadata
            .dependencies
            .iter()
            .filter(|d| d.enabled && !self.subcharts.contains_key(d.effective_name()))
            .collect()
    }

    /// Stable digest of the dependency declarations
    pub fn dependencies_digest(&self) -> String {
        let bytes = serde_json::to_vec(&self.metadata.dependencies).unwrap_or_default();
        sha256_digest(&bytes)
    }

    /// Stable content digest of the whole chart tree
    pub fn digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(sha256_digest(&bytes))
    }

    /// Load a chart from a directory
    ///
    /// Layout: `Chart.yaml`, optional `values.yaml`, `templates/`, `charts/`
    /// (one subdirectory per vendored subchart); every other file is exposed
    /// through the files API.
    pub fn load_dir<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_dir_at_depth(path.as_ref(), 0)
    }

    fn load_dir_at_depth(root: &Path, depth: usize) -> Result<Self> {
        if depth > MAX_LOAD_DEPTH {
            return Err(CoreError::InvalidChart {
                message: format!(
                    "subchart nesting exceeds {} levels at {}",
                    MAX_LOAD_DEPTH,
                    root.display()
                ),
            });
        }

        if !root.is_dir() {
            return Err(CoreError::ChartNotFound {
                path: root.display().to_string(),
            });
        }

        let chart_file = root.join("Chart.yaml");
        if !chart_file.exists() {
            return Err(CoreError::InvalidChart {
                message: format!("Chart.yaml not found in {}", root.display()),
            });
        }

        let metadata: ChartMetadata = serde_yaml::from_str(&std::fs::read_to_string(&chart_file)?)?;
        if !SUPPORTED_API_VERSIONS.contains(&metadata.api_version.as_str()) {
            return Err(CoreError::InvalidChart {
                message: format!(
                    "Unsupported API version: {}. Expected one of: {}",
                    metadata.api_version,
                    SUPPORTED_API_VERSIONS.join(", ")
                ),
            });
        }

        let values_path = root.join("values.yaml");
        let values = if values_path.exists() {
            Values::from_file(&values_path)?
        } else {
            Values::new()
        };

        let mut chart = Chart::new(metadata).with_values(values);

        let templates_dir = root.join("templates");
        let charts_dir = root.join("charts");

        for entry in walkdir::WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.path() != charts_dir)
        {
            let entry = entry.map_err(|e| CoreError::FileAccess {
                path: root.display().to_string(),
                message: e.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();

            if let Ok(rel) = path.strip_prefix(&templates_dir) {
                let content = std::fs::read_to_string(path)?;
                chart.templates.insert(to_slash_path(rel), content);
                continue;
            }

            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            let rel = to_slash_path(rel);
            if rel == "Chart.yaml" || rel == "values.yaml" {
                continue;
            }
            chart.files.insert(rel, std::fs::read(path)?);
        }

        if charts_dir.is_dir() {
            let mut dirs: Vec<_> = std::fs::read_dir(&charts_dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.join("Chart.yaml").exists())
                .collect();
            dirs.sort();

            for dir in dirs {
                let sub = Self::load_dir_at_depth(&dir, depth + 1)?;
                let key = chart
                    .metadata
                    .dependencies
                    .iter()
                    .find(|d| d.name == sub.metadata.name && d.alias.is_some())
                    .map(|d| d.effective_name().to_string())
                    .unwrap_or_else(|| sub.metadata.name.clone());
                chart.subcharts.insert(key, sub);
            }
        }

        Ok(chart)
    }
}

fn to_slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Compute `sha256:<hex>` for a byte slice
pub fn sha256_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Serialize file contents as base64 strings
mod bytes_map {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(files: &BTreeMap<String, Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded: BTreeMap<&String, String> =
            files.iter().map(|(k, v)| (k, STANDARD.encode(v))).collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = BTreeMap::<String, String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(k, v)| {
                STANDARD
                    .decode(v.as_bytes())
                    .map(|bytes| (k, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
