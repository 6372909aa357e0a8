//! Dependency resolution with conditional filtering
//!
//! Key features:
//! - **Gating**: Skip dependencies switched off by `enabled`, conditions or tags
//! - **Highest satisfying version**: Deterministic selection per constraint
//! - **Bounded concurrency**: Independent dependencies resolve in parallel
//! - **Lock reuse**: A verified lock short-circuits resolution

use futures::future::BoxFuture;
use futures::{StreamExt, TryStreamExt};
use semver::{Version, VersionReq};
use std::collections::{BTreeSet, HashSet};

use keel_core::{Chart, Dependency, GateDecision, GatingPolicy, SkipReason, Values};

use crate::error::{RepoError, Result};
use crate::lock::{Lock, LockedDependency, VerifyResult, satisfies};
use crate::source::{ChartRef, ChartSource};

/// Resolver configuration
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Maximum number of dependencies queried at once
    pub concurrency: usize,

    /// Gating policy for conditions and tags
    pub gating: GatingPolicy,

    /// Maximum subchart nesting followed by [`DependencyResolver::build`]
    pub max_depth: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            gating: GatingPolicy::default(),
            max_depth: 10,
        }
    }
}

impl ResolverConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_gating(mut self, gating: GatingPolicy) -> Self {
        self.gating = gating;
        self
    }
}

/// A dependency that was skipped during resolution
#[derive(Debug, Clone)]
pub struct SkippedDependency {
    /// The original dependency
    pub dependency: Dependency,
    /// Why it was skipped
    pub reason: SkipReason,
}

/// Result of filtering dependencies before resolution
#[derive(Debug, Default)]
pub struct FilterResult {
    /// Dependencies that should be resolved, in declaration order
    pub to_resolve: Vec<Dependency>,
    /// Dependencies that were skipped
    pub skipped: Vec<SkippedDependency>,
}

impl FilterResult {
    /// Check if any dependencies were skipped
    pub fn has_skipped(&self) -> bool {
        !self.skipped.is_empty()
    }

    /// Get a summary of skipped dependencies for display
    pub fn skipped_summary(&self) -> String {
        self.skipped
            .iter()
            .map(|s| format!("  {} ({})", s.dependency.effective_name(), s.reason))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Filter dependencies by `enabled`, resolve policy, conditions and tags
///
/// `values` is the declaring chart's merged value tree.
pub fn filter_dependencies(
    deps: &[Dependency],
    values: &Values,
    gating: &GatingPolicy,
) -> Result<FilterResult> {
    let mut result = FilterResult::default();
    let mut seen = HashSet::new();

    for dep in deps {
        match gating.should_resolve(dep, values) {
            GateDecision::Include => {
                if !seen.insert(dep.effective_name().to_string()) {
                    return Err(RepoError::DuplicateDependency {
                        name: dep.effective_name().to_string(),
                    });
                }
                result.to_resolve.push(dep.clone());
            }
            GateDecision::Exclude(reason) => result.skipped.push(SkippedDependency {
                dependency: dep.clone(),
                reason,
            }),
        }
    }

    Ok(result)
}

/// Outcome of a resolution pass
#[derive(Debug)]
pub struct Resolution {
    pub lock: Lock,
    pub skipped: Vec<SkippedDependency>,
}

/// Resolves chart dependencies against a [`ChartSource`]
pub struct DependencyResolver<S> {
    source: S,
    config: ResolverConfig,
}

impl<S: ChartSource> DependencyResolver<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            config: ResolverConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ResolverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Resolve a chart's declared dependencies into a lock
    ///
    /// `values` are user overrides; gating sees them merged over the chart's
    /// defaults. Entries follow declaration order.
    pub async fn resolve(&self, chart: &Chart, values: &Values) -> Result<Resolution> {
        let merged = chart.values.merged(values);
        let filtered =
            filter_dependencies(&chart.metadata.dependencies, &merged, &self.config.gating)?;

        for skipped in &filtered.skipped {
            tracing::debug!(
                chart = %chart.name(),
                dependency = %skipped.dependency.effective_name(),
                reason = %skipped.reason,
                "skipping dependency"
            );
        }

        // Futures are built up front so the stream holds no borrowing closure
        let lookups: Vec<_> = filtered
            .to_resolve
            .iter()
            .map(|dep| self.resolve_one(dep))
            .collect();
        let entries: Vec<LockedDependency> = futures::stream::iter(lookups)
            .buffered(self.config.concurrency.max(1))
            .try_collect()
            .await?;

        tracing::info!(
            chart = %chart.name(),
            resolved = entries.len(),
            skipped = filtered.skipped.len(),
            "resolved dependencies"
        );

        let mut lock = Lock::for_chart(chart);
        lock.dependencies = entries;
        Ok(Resolution {
            lock,
            skipped: filtered.skipped,
        })
    }

    /// Check a lock against the chart's current declarations
    pub fn verify_lock(&self, chart: &Chart, lock: &Lock) -> Result<()> {
        lock.verify_against(chart)
    }

    /// Reuse `lock` when it still matches, resolve afresh when none is given
    ///
    /// A lock that no longer matches is an error rather than silently replaced.
    pub async fn resolve_or_reuse(
        &self,
        chart: &Chart,
        values: &Values,
        lock: Option<&Lock>,
    ) -> Result<Lock> {
        match lock {
            Some(lock) => {
                self.verify_lock(chart, lock)?;
                Ok(lock.clone())
            }
            None => Ok(self.resolve(chart, values).await?.lock),
        }
    }

    /// Fetch every locked dependency and attach it as a subchart
    ///
    /// Subcharts that declare dependencies of their own are resolved and built
    /// in turn. Subcharts already present (vendored) are kept as they are.
    pub async fn build(&self, chart: &Chart, values: &Values, lock: &Lock) -> Result<Chart> {
        self.verify_lock(chart, lock)?;
        let merged = chart.values.merged(values);
        self.check_coverage(chart, &merged, lock)?;
        self.build_at_depth(chart.clone(), merged, lock.clone(), 0).await
    }

    /// Every dependency that gating admits with `merged` must be locked or vendored
    ///
    /// A lock resolved while a condition was false carries no entry for that
    /// dependency; building from it after the condition flipped would drop it.
    fn check_coverage(&self, chart: &Chart, merged: &Values, lock: &Lock) -> Result<()> {
        for dep in &chart.metadata.dependencies {
            let name = dep.effective_name();
            if chart.subcharts.contains_key(name) || lock.get(name).is_some() {
                continue;
            }
            if let GateDecision::Include = self.config.gating.evaluate(dep, merged) {
                return Err(RepoError::MissingLockEntry {
                    name: name.to_string(),
                });
            }
        }
        Ok(())
    }

    fn build_at_depth<'a>(
        &'a self,
        mut chart: Chart,
        merged: Values,
        lock: Lock,
        depth: usize,
    ) -> BoxFuture<'a, Result<Chart>> {
        Box::pin(async move {
            if depth > self.config.max_depth {
                return Err(RepoError::TooDeep {
                    name: chart.name().to_string(),
                    max_depth: self.config.max_depth,
                });
            }

            let pending: Vec<LockedDependency> = lock
                .dependencies
                .iter()
                .filter(|locked| !chart.subcharts.contains_key(locked.effective_name()))
                .cloned()
                .collect();

            let fetches: Vec<_> = pending
                .into_iter()
                .map(|locked| {
                    let lock = &lock;
                    async move {
                        let chart_ref = ChartRef::new(&locked.repository, &locked.name);
                        let sub = self.source.fetch(&chart_ref, &locked.version).await?;
                        if let VerifyResult::DigestChanged { expected, actual } =
                            lock.verify_digest(locked.effective_name(), &sub.digest()?)?
                        {
                            tracing::warn!(
                                dependency = %locked.effective_name(),
                                %expected,
                                %actual,
                                "chart digest changed since lock was written"
                            );
                        }
                        Ok::<_, RepoError>((locked.effective_name().to_string(), sub))
                    }
                })
                .collect();
            let fetched: Vec<(String, Chart)> = futures::stream::iter(fetches)
                .buffered(self.config.concurrency.max(1))
                .try_collect()
                .await?;

            for (name, sub) in fetched {
                chart.subcharts.insert(name, sub);
            }

            // Recurse into subcharts that are themselves unlocked
            let names: Vec<String> = chart.subcharts.keys().cloned().collect();
            for name in names {
                let Some(sub) = chart.subcharts.get(&name) else {
                    continue;
                };
                if sub.missing_dependencies().is_empty() {
                    continue;
                }
                let sub = sub.clone();
                let scoped = Values::for_subchart(&sub.values, &merged, &name);
                let overrides = merged.scope_for_subchart(&name);
                let sub_lock = self.resolve(&sub, &overrides).await?.lock;
                let built = self
                    .build_at_depth(sub, scoped, sub_lock, depth + 1)
                    .await?;
                chart.subcharts.insert(name, built);
            }

            Ok(chart)
        })
    }

    async fn resolve_one(&self, dep: &Dependency) -> Result<LockedDependency> {
        let req = dep.version_req().map_err(|e| RepoError::InvalidConstraint {
            name: dep.name.clone(),
            constraint: dep.version.clone(),
            message: e.to_string(),
        })?;

        let chart_ref = ChartRef::from(dep);
        let versions = self.source.list_versions(&chart_ref).await?;

        let version = select_version(&req, &versions, dep.prerelease).ok_or_else(|| {
            RepoError::UnsatisfiableConstraint {
                name: dep.effective_name().to_string(),
                constraint: dep.version.clone(),
                available: if versions.is_empty() {
                    "none".to_string()
                } else {
                    versions
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                },
            }
        })?;

        let digest = self.source.digest(&chart_ref, &version).await?;
        tracing::debug!(
            dependency = %dep.effective_name(),
            constraint = %dep.version,
            %version,
            "selected version"
        );

        Ok(LockedDependency {
            name: dep.name.clone(),
            alias: dep.alias.clone(),
            version,
            repository: dep.repository.clone(),
            digest,
            constraint: dep.version.clone(),
        })
    }
}

/// Highest version satisfying `req`
///
/// Pre-releases qualify only when the constraint names one for the same
/// release, or when `include_prerelease` is set.
pub fn select_version(
    req: &VersionReq,
    available: &BTreeSet<Version>,
    include_prerelease: bool,
) -> Option<Version> {
    available
        .iter()
        .rev()
        .find(|v| req.matches(v) || (include_prerelease && satisfies(req, v)))
        .cloned()
}
