//! Chart source abstraction
//!
//! The resolver only needs two things from wherever charts live: the set of
//! published versions and the chart content for one version. Registry and
//! HTTP transports implement [`ChartSource`]; [`MemoryChartSource`] serves
//! tests and embedders that already hold their charts in memory.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use semver::Version;

use keel_core::{Chart, Dependency};

use crate::error::{RepoError, Result};

/// Reference to a chart in a repository
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChartRef {
    pub repository: String,
    pub name: String,
}

impl ChartRef {
    pub fn new(repository: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            name: name.into(),
        }
    }
}

impl From<&Dependency> for ChartRef {
    fn from(dep: &Dependency) -> Self {
        Self::new(&dep.repository, &dep.name)
    }
}

impl std::fmt::Display for ChartRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.repository, self.name)
    }
}

/// Where charts come from
#[async_trait]
pub trait ChartSource: Send + Sync {
    /// All published versions of a chart
    async fn list_versions(&self, chart: &ChartRef) -> Result<BTreeSet<Version>>;

    /// Chart content for one version
    async fn fetch(&self, chart: &ChartRef, version: &Version) -> Result<Chart>;

    /// Content digest of one version (`sha256:<hex>`)
    ///
    /// Sources with an index should answer from it; the default fetches and
    /// hashes the chart.
    async fn digest(&self, chart: &ChartRef, version: &Version) -> Result<String> {
        Ok(self.fetch(chart, version).await?.digest()?)
    }
}

#[async_trait]
impl<T: ChartSource + ?Sized> ChartSource for Arc<T> {
    async fn list_versions(&self, chart: &ChartRef) -> Result<BTreeSet<Version>> {
        (**self).list_versions(chart).await
    }

    async fn fetch(&self, chart: &ChartRef, version: &Version) -> Result<Chart> {
        (**self).fetch(chart, version).await
    }

    async fn digest(&self, chart: &ChartRef, version: &Version) -> Result<String> {
        (**self).digest(chart, version).await
    }
}

/// Counters for source calls, for assertions in tests
#[derive(Debug, Default)]
pub struct SourceCounts {
    pub list_versions: AtomicUsize,
    pub fetch: AtomicUsize,
}

/// In-memory chart source
#[derive(Debug, Default)]
pub struct MemoryChartSource {
    charts: RwLock<BTreeMap<ChartRef, BTreeMap<Version, Chart>>>,
    counts: SourceCounts,
}

impl MemoryChartSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a chart under `repository`
    pub fn with_chart(self, repository: &str, chart: Chart) -> Self {
        self.publish(repository, chart);
        self
    }

    /// Publish a chart under `repository` (shared handle)
    pub fn publish(&self, repository: &str, chart: Chart) {
        let key = ChartRef::new(repository, chart.name());
        let mut charts = match self.charts.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        charts
            .entry(key)
            .or_default()
            .insert(chart.version().clone(), chart);
    }

    pub fn counts(&self) -> &SourceCounts {
        &self.counts
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<ChartRef, BTreeMap<Version, Chart>>>> {
        self.charts.read().map_err(|_| RepoError::Source {
            message: "chart source lock poisoned".to_string(),
        })
    }
}

#[async_trait]
impl ChartSource for MemoryChartSource {
    async fn list_versions(&self, chart: &ChartRef) -> Result<BTreeSet<Version>> {
        self.counts.list_versions.fetch_add(1, Ordering::SeqCst);
        let charts = self.read()?;
        let versions = charts.get(chart).ok_or_else(|| RepoError::ChartNotFound {
            name: chart.name.clone(),
            repository: chart.repository.clone(),
        })?;
        Ok(versions.keys().cloned().collect())
    }

    async fn fetch(&self, chart: &ChartRef, version: &Version) -> Result<Chart> {
        self.counts.fetch.fetch_add(1, Ordering::SeqCst);
        let charts = self.read()?;
        charts
            .get(chart)
            .and_then(|versions| versions.get(version))
            .cloned()
            .ok_or_else(|| RepoError::VersionNotFound {
                name: chart.name.clone(),
                version: version.to_string(),
                repository: chart.repository.clone(),
            })
    }
}
