//! Release lifecycle
//!
//! [`ReleaseManager`] drives install, upgrade, rollback and uninstall
//! transitions. Each transition records a revision before touching the
//! cluster, so history reflects every attempt. The storage backend's
//! conditional create decides which of two concurrent transitions wins.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use keel_core::{Chart, ReleaseInfo, ValueCompositor, ValueLayer, ValueSource, Values};
use keel_engine::{ChartRenderer, HookEvent, RenderedOutput};
use keel_repo::{ChartSource, DependencyResolver, Lock, MemoryChartSource, ResolverConfig};

use crate::actions::{InstallOptions, RollbackOptions, UninstallOptions, UpgradeOptions};
use crate::cluster::{ClusterClient, ClusterError, ResourceManifest};
use crate::error::{ReleaseError, Result};
use crate::hooks::{HookRun, HookScheduler, SchedulerConfig};
use crate::release::{Release, ReleaseStatus, Revision, validate_name};
use crate::storage::StorageBackend;

/// Cluster-facing part of a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Install,
    Upgrade,
    Rollback,
}

impl Action {
    fn hook_events(self) -> (HookEvent, HookEvent) {
        match self {
            Self::Install => (HookEvent::PreInstall, HookEvent::PostInstall),
            Self::Upgrade => (HookEvent::PreUpgrade, HookEvent::PostUpgrade),
            Self::Rollback => (HookEvent::PreRollback, HookEvent::PostRollback),
        }
    }

    fn verb(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Upgrade => "upgrade",
            Self::Rollback => "roll back",
        }
    }
}

/// Step settings shared by every action
struct Steps<'a> {
    action: Action,
    wait: bool,
    timeout: Duration,
    cancel: &'a CancellationToken,
    deadline: Option<Duration>,
}

/// Drives release transitions against storage and a cluster
pub struct ReleaseManager<S, C, Src = MemoryChartSource> {
    storage: S,
    cluster: C,
    resolver: DependencyResolver<Src>,
    compositor: ValueCompositor,
    renderer: ChartRenderer,
    scheduler: SchedulerConfig,
    max_history: Option<usize>,
}

impl<S: StorageBackend, C: ClusterClient> ReleaseManager<S, C, MemoryChartSource> {
    /// Manager for charts whose dependencies are already vendored
    pub fn new(storage: S, cluster: C) -> Self {
        Self::with_source(storage, cluster, MemoryChartSource::new())
    }
}

impl<S: StorageBackend, C: ClusterClient, Src: ChartSource> ReleaseManager<S, C, Src> {
    /// Manager resolving dependencies from `source`
    pub fn with_source(storage: S, cluster: C, source: Src) -> Self {
        let config = ResolverConfig::default();
        Self {
            storage,
            cluster,
            compositor: ValueCompositor::new(config.gating.clone()),
            resolver: DependencyResolver::new(source).with_config(config),
            renderer: ChartRenderer::default(),
            scheduler: SchedulerConfig::default(),
            max_history: None,
        }
    }

    /// Resolver settings; the gating policy also drives value composition
    pub fn with_resolver_config(mut self, config: ResolverConfig) -> Self {
        self.compositor = ValueCompositor::new(config.gating.clone());
        self.resolver = self.resolver.with_config(config);
        self
    }

    pub fn with_renderer(mut self, renderer: ChartRenderer) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    /// Keep at most `max` revisions per release (superseded ones are pruned)
    pub fn with_max_history(mut self, max: usize) -> Self {
        self.max_history = Some(max.max(1));
        self
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    // ========== Resolution and rendering ==========

    /// Resolve the chart's dependencies into a lock
    pub async fn resolve(&self, chart: &Chart, values: &Values) -> Result<Lock> {
        Ok(self.resolver.resolve(chart, values).await?.lock)
    }

    /// Render a chart without recording anything
    pub async fn render(
        &self,
        chart: &Chart,
        lock: Option<&Lock>,
        layers: &[ValueLayer],
        release: &ReleaseInfo,
    ) -> Result<RenderedOutput> {
        let user = ValueCompositor::user_values(layers);
        let chart = self.prepare(chart, &user, lock).await?;
        let capabilities = self.cluster.capabilities().await?;
        let scoped = self.compositor.compose(&chart, layers);
        Ok(self.renderer.render(&chart, &scoped, release, &capabilities)?)
    }

    /// Attach every enabled dependency as a subchart
    async fn prepare(&self, chart: &Chart, user: &Values, lock: Option<&Lock>) -> Result<Chart> {
        if chart.missing_dependencies().is_empty() {
            if let Some(lock) = lock {
                self.resolver.verify_lock(chart, lock)?;
            }
            return Ok(chart.clone());
        }
        let lock = self.resolver.resolve_or_reuse(chart, user, lock).await?;
        Ok(self.resolver.build(chart, user, &lock).await?)
    }

    /// Render `revision` and record it, as pending or (if rendering failed)
    /// as failed
    async fn record(
        &self,
        revision: Revision,
        layers: &[ValueLayer],
        release: &ReleaseInfo,
    ) -> Result<Revision> {
        let capabilities = self.cluster.capabilities().await?;
        let scoped = self.compositor.compose(&revision.chart, layers);

        match self
            .renderer
            .render(&revision.chart, &scoped, release, &capabilities)
        {
            Ok(output) => {
                let revision = revision.with_rendered(scoped.values, &output);
                self.storage.create_if_absent(&revision).await?;
                tracing::info!(
                    release = %revision.name,
                    revision = revision.revision,
                    status = %revision.status,
                    chart = %revision.chart_ref,
                    "recorded revision"
                );
                Ok(revision)
            }
            Err(e) => {
                let status = ReleaseStatus::Failed {
                    reason: e.to_string(),
                };
                let mut failed = revision;
                failed.values = scoped.values;
                failed.status = status.clone();
                self.storage.create_if_absent(&failed).await?;
                tracing::warn!(
                    release = %failed.name,
                    revision = failed.revision,
                    error = %e,
                    "render failed"
                );
                Err(ReleaseError::RevisionFailed {
                    name: failed.name,
                    revision: failed.revision,
                    status,
                    source: Box::new(e.into()),
                })
            }
        }
    }

    // ========== Install ==========

    /// Install a release
    pub async fn install(
        &self,
        chart: &Chart,
        layers: &[ValueLayer],
        options: &InstallOptions,
    ) -> Result<Revision> {
        let name = options.name.as_str();
        validate_name(name)?;
        let history = self.release(name).await?;
        ensure_idle(&history)?;
        if !history.is_uninstalled() {
            let latest = history.latest().map_or(0, |r| r.revision);
            return Err(ReleaseError::invalid(
                name,
                "install",
                format!("revision {} is live, use upgrade", latest),
            ));
        }

        let number = history.next_revision();
        let config = ValueCompositor::user_values(layers);
        let chart = self.prepare(chart, &config, options.lock.as_ref()).await?;

        tracing::info!(release = %name, revision = number, chart = %chart.reference(), "installing");

        let revision = Revision::new(
            name,
            &options.namespace,
            number,
            chart,
            config,
            ReleaseStatus::PendingInstall,
        )
        .with_description(
            options
                .description
                .clone()
                .unwrap_or_else(|| "Install complete".to_string()),
        );
        let info = ReleaseInfo::for_install(name, &options.namespace).with_revision(number);
        let revision = self.record(revision, layers, &info).await?;

        let steps = Steps {
            action: Action::Install,
            wait: options.wait,
            timeout: options.timeout,
            cancel: &options.cancel,
            deadline: options.deadline,
        };
        self.drive(revision, &steps).await
    }

    // ========== Upgrade ==========

    /// Upgrade a release to a new chart or new values
    pub async fn upgrade(
        &self,
        chart: &Chart,
        layers: &[ValueLayer],
        options: &UpgradeOptions,
    ) -> Result<Revision> {
        let name = options.name.as_str();
        let history = self.release(name).await?;
        if history.is_uninstalled() {
            if options.install {
                return self.install(chart, layers, &options.to_install()).await;
            }
            return Err(ReleaseError::not_found(name, None));
        }
        ensure_idle(&history)?;

        let base = history
            .deployed()
            .or_else(|| history.current())
            .ok_or_else(|| ReleaseError::not_found(name, None))?;

        let mut effective: Vec<ValueLayer> = Vec::with_capacity(layers.len() + 1);
        if options.reuse_values {
            effective.push(stored_layer(&base.config));
        }
        effective.extend_from_slice(layers);

        let number = history.next_revision();
        let config = ValueCompositor::user_values(&effective);
        let chart = self.prepare(chart, &config, options.lock.as_ref()).await?;

        tracing::info!(
            release = %name,
            from = base.revision,
            revision = number,
            chart = %chart.reference(),
            reuse_values = options.reuse_values,
            "upgrading"
        );

        let revision = Revision::new(
            name,
            &options.namespace,
            number,
            chart,
            config,
            ReleaseStatus::PendingUpgrade,
        )
        .with_first_deployed(first_deployed(&history))
        .with_description(
            options
                .description
                .clone()
                .unwrap_or_else(|| "Upgrade complete".to_string()),
        );
        let info = ReleaseInfo::for_upgrade(name, &options.namespace, number);
        let revision = self.record(revision, &effective, &info).await?;

        let steps = Steps {
            action: Action::Upgrade,
            wait: options.wait,
            timeout: options.timeout,
            cancel: &options.cancel,
            deadline: options.deadline,
        };
        self.drive(revision, &steps).await
    }

    // ========== Rollback ==========

    /// Roll back to an earlier revision
    ///
    /// The target's chart and values are rendered again, against the current
    /// cluster capabilities, into a new top revision. The target itself is
    /// not modified.
    pub async fn rollback(&self, options: &RollbackOptions) -> Result<Revision> {
        let name = options.name.as_str();
        let history = self.release(name).await?;
        if history.is_empty() {
            return Err(ReleaseError::not_found(name, None));
        }
        ensure_idle(&history)?;

        let target = match options.revision {
            Some(number) => history
                .revisions
                .iter()
                .find(|r| r.revision == number)
                .ok_or_else(|| ReleaseError::not_found(name, Some(number)))?,
            None => history.previous_deployed().ok_or_else(|| {
                ReleaseError::invalid(name, "roll back", "no earlier deployed revision")
            })?,
        };

        let number = history.next_revision();
        tracing::info!(release = %name, target = target.revision, revision = number, "rolling back");

        let revision = Revision::new(
            name,
            &target.namespace,
            number,
            target.chart.clone(),
            target.config.clone(),
            ReleaseStatus::PendingRollback {
                target: target.revision,
            },
        )
        .with_first_deployed(first_deployed(&history))
        .with_description(
            options
                .description
                .clone()
                .unwrap_or_else(|| format!("Rollback to {}", target.revision)),
        );
        let info = ReleaseInfo::for_rollback(name, &target.namespace, number);
        let layers = [stored_layer(&target.config)];
        let revision = self.record(revision, &layers, &info).await?;

        let steps = Steps {
            action: Action::Rollback,
            wait: options.wait,
            timeout: options.timeout,
            cancel: &options.cancel,
            deadline: options.deadline,
        };
        self.drive(revision, &steps).await
    }

    // ========== Uninstall ==========

    /// Remove a release's objects from the cluster
    ///
    /// History is kept (the revision ends `uninstalled`) unless purging. The
    /// switch to `uninstalling` is refused by storage if another transition
    /// recorded a pending revision in the meantime.
    pub async fn uninstall(&self, options: &UninstallOptions) -> Result<Revision> {
        let name = options.name.as_str();
        let history = self.release(name).await?;
        if history.is_empty() {
            return Err(ReleaseError::not_found(name, None));
        }
        ensure_idle(&history)?;

        let current = history
            .current()
            .filter(|r| matches!(r.status, ReleaseStatus::Deployed | ReleaseStatus::Failed { .. }))
            .ok_or_else(|| ReleaseError::invalid(name, "uninstall", "release is not installed"))?;

        let revision = self
            .storage
            .compare_and_set_status(
                name,
                current.revision,
                &current.status,
                ReleaseStatus::Uninstalling,
            )
            .await?;
        tracing::info!(release = %name, revision = revision.revision, "uninstalling");

        let outcome = with_deadline(
            options.deadline,
            &revision,
            self.uninstall_steps(&revision, &options.cancel),
        )
        .await;

        match outcome {
            Ok(()) => {
                let uninstalled = self
                    .storage
                    .update_status(name, revision.revision, ReleaseStatus::Uninstalled)
                    .await?;
                if options.purge {
                    let removed = self.storage.purge(name).await?;
                    tracing::info!(release = %name, revisions = removed.len(), "purged history");
                }
                tracing::info!(release = %name, revision = revision.revision, "uninstalled");
                Ok(uninstalled)
            }
            Err(e) => self.fail(&revision, e).await,
        }
    }

    async fn uninstall_steps(&self, revision: &Revision, cancel: &CancellationToken) -> Result<()> {
        let run = hook_run(revision, cancel);
        let mut scheduler = HookScheduler::new(self.scheduler.clone());

        scheduler
            .run_event(&self.cluster, &revision.hooks, HookEvent::PreDelete, &run)
            .await?;

        let mut objects: Vec<_> = ResourceManifest::from_stream(&revision.manifest, &revision.namespace)?
            .into_iter()
            .map(|r| r.object)
            .collect();
        objects.reverse();
        cancellable(cancel, revision, self.cluster.delete(&objects)).await??;
        tracing::debug!(release = %revision.name, objects = objects.len(), "deleted objects");

        scheduler
            .run_event(&self.cluster, &revision.hooks, HookEvent::PostDelete, &run)
            .await
    }

    // ========== Transition driver ==========

    /// Run hooks and apply for a recorded pending revision, then settle it
    async fn drive(&self, revision: Revision, steps: &Steps<'_>) -> Result<Revision> {
        let outcome = with_deadline(steps.deadline, &revision, self.apply_steps(&revision, steps)).await;

        match outcome {
            Ok(()) => {
                let deployed = self
                    .storage
                    .compare_and_set_status(
                        &revision.name,
                        revision.revision,
                        &revision.status,
                        ReleaseStatus::Deployed,
                    )
                    .await?;
                self.supersede(&deployed).await?;
                self.prune(&deployed.name).await?;
                tracing::info!(
                    release = %deployed.name,
                    revision = deployed.revision,
                    action = steps.action.verb(),
                    "deployed"
                );
                Ok(deployed)
            }
            Err(e) => self.fail(&revision, e).await,
        }
    }

    async fn apply_steps(&self, revision: &Revision, steps: &Steps<'_>) -> Result<()> {
        let (pre, post) = steps.action.hook_events();
        let run = hook_run(revision, steps.cancel);
        let mut scheduler = HookScheduler::new(self.scheduler.clone());

        scheduler
            .run_event(&self.cluster, &revision.hooks, pre, &run)
            .await?;

        let resources = ResourceManifest::from_stream(&revision.manifest, &revision.namespace)
            .map_err(|source| ReleaseError::ApplyFailed { source })?;
        let report = cancellable(steps.cancel, revision, self.cluster.apply(&resources))
            .await?
            .map_err(|source| ReleaseError::ApplyFailed { source })?;
        tracing::debug!(
            release = %revision.name,
            revision = revision.revision,
            created = report.created.len(),
            updated = report.updated.len(),
            "applied manifests"
        );

        if steps.wait && !resources.is_empty() {
            let objects: Vec<_> = resources.iter().map(|r| r.object.clone()).collect();
            let waited = cancellable(
                steps.cancel,
                revision,
                tokio::time::timeout(
                    steps.timeout,
                    self.cluster.wait_until_ready(&objects, steps.timeout),
                ),
            )
            .await?;
            match waited {
                Ok(ready) => ready.map_err(|source| ReleaseError::ApplyFailed { source })?,
                Err(_) => {
                    return Err(ReleaseError::ApplyFailed {
                        source: ClusterError::Timeout(steps.timeout),
                    });
                }
            }
        }

        scheduler
            .run_event(&self.cluster, &revision.hooks, post, &run)
            .await
    }

    /// Settle a revision whose transition did not complete
    ///
    /// Cancellation leaves it pending; anything else marks it failed.
    async fn fail(&self, revision: &Revision, error: ReleaseError) -> Result<Revision> {
        if matches!(error, ReleaseError::Cancelled { .. }) {
            tracing::warn!(
                release = %revision.name,
                revision = revision.revision,
                status = %revision.status,
                "transition cancelled"
            );
            return Err(error);
        }

        let status = ReleaseStatus::Failed {
            reason: error.to_string(),
        };
        self.storage
            .update_status(&revision.name, revision.revision, status.clone())
            .await?;
        tracing::warn!(
            release = %revision.name,
            revision = revision.revision,
            error = %error,
            "transition failed"
        );
        Err(ReleaseError::RevisionFailed {
            name: revision.name.clone(),
            revision: revision.revision,
            status,
            source: Box::new(error),
        })
    }

    /// Mark every other deployed revision superseded
    async fn supersede(&self, deployed: &Revision) -> Result<()> {
        for previous in self.storage.list(&deployed.name).await? {
            if previous.revision != deployed.revision && previous.status == ReleaseStatus::Deployed {
                self.storage
                    .update_status(&previous.name, previous.revision, ReleaseStatus::Superseded)
                    .await?;
                tracing::debug!(release = %previous.name, revision = previous.revision, "superseded");
            }
        }
        Ok(())
    }

    /// Drop the oldest superseded revisions beyond `max_history`
    async fn prune(&self, name: &str) -> Result<()> {
        let Some(max) = self.max_history else {
            return Ok(());
        };
        let revisions = self.storage.list(name).await?;
        let excess = revisions.len().saturating_sub(max);
        let prunable = revisions
            .iter()
            .filter(|r| r.status == ReleaseStatus::Superseded)
            .take(excess);
        for revision in prunable {
            self.storage.delete(name, revision.revision).await?;
            tracing::debug!(release = %name, revision = revision.revision, "pruned revision");
        }
        Ok(())
    }

    // ========== Query Operations ==========

    /// All revisions of a release, oldest first
    pub async fn history(&self, name: &str) -> Result<Vec<Revision>> {
        let revisions = self.storage.list(name).await?;
        if revisions.is_empty() {
            return Err(ReleaseError::not_found(name, None));
        }
        Ok(revisions)
    }

    /// The revision that describes the release's state
    ///
    /// The in-flight revision if one is pending, else the highest revision
    /// that has not been superseded.
    pub async fn status(&self, name: &str) -> Result<Revision> {
        let release = self.release(name).await?;
        release
            .pending()
            .or_else(|| release.current())
            .or_else(|| release.latest())
            .cloned()
            .ok_or_else(|| ReleaseError::not_found(name, None))
    }

    /// One revision
    pub async fn get(&self, name: &str, revision: u32) -> Result<Revision> {
        self.storage.get(name, revision).await
    }

    /// Latest revision of every release
    pub async fn list_releases(&self) -> Result<Vec<Revision>> {
        let mut latest = Vec::new();
        for name in self.storage.list_names().await? {
            if let Some(revision) = self.storage.latest(&name).await? {
                latest.push(revision);
            }
        }
        Ok(latest)
    }

    /// Mark an interrupted (still pending) revision as failed
    pub async fn recover(&self, name: &str) -> Result<Revision> {
        let release = self.release(name).await?;
        let pending = release
            .pending()
            .ok_or_else(|| ReleaseError::invalid(name, "recover", "no transition in progress"))?;
        tracing::warn!(release = %name, revision = pending.revision, status = %pending.status, "recovering");
        self.storage
            .compare_and_set_status(
                name,
                pending.revision,
                &pending.status,
                ReleaseStatus::Failed {
                    reason: "recovered from interrupted transition".to_string(),
                },
            )
            .await
    }

    async fn release(&self, name: &str) -> Result<Release> {
        Ok(Release::new(name, self.storage.list(name).await?))
    }
}

fn ensure_idle(history: &Release) -> Result<()> {
    match history.pending() {
        Some(pending) => Err(ReleaseError::conflict(
            &history.name,
            pending.revision,
            format!("revision {} is {}", pending.revision, pending.status),
        )),
        None => Ok(()),
    }
}

fn first_deployed(history: &Release) -> Option<chrono::DateTime<chrono::Utc>> {
    history.revisions.iter().find_map(|r| r.first_deployed)
}

/// Previously stored user values as a layer
fn stored_layer(config: &Values) -> ValueLayer {
    ValueLayer::values(ValueSource::Inline, config.clone())
}

fn hook_run<'a>(revision: &'a Revision, cancel: &'a CancellationToken) -> HookRun<'a> {
    HookRun {
        release: &revision.name,
        revision: revision.revision,
        namespace: &revision.namespace,
        cancel,
    }
}

fn cancelled(revision: &Revision) -> ReleaseError {
    ReleaseError::Cancelled {
        name: revision.name.clone(),
        revision: revision.revision,
    }
}

/// Race `future` against the caller's cancellation
async fn cancellable<T>(
    cancel: &CancellationToken,
    revision: &Revision,
    future: impl Future<Output = T>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(cancelled(revision)),
        value = future => Ok(value),
    }
}

/// Bound a transition by its deadline; expiry counts as cancellation
async fn with_deadline(
    deadline: Option<Duration>,
    revision: &Revision,
    future: impl Future<Output = Result<()>>,
) -> Result<()> {
    match deadline {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .unwrap_or_else(|_| Err(cancelled(revision))),
        None => future.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use keel_core::{ChartMetadata, Dependency};
    use keel_engine::DeletePolicy;
    use semver::Version;

    use crate::cluster::{ClusterOperation, MockClusterClient};
    use crate::storage::MemoryStorage;

    type Manager = ReleaseManager<MemoryStorage, MockClusterClient>;

    fn web_chart(version: &str) -> Chart {
        Chart::new(ChartMetadata::new("web", Version::parse(version).unwrap()))
            .with_values(Values::from_yaml("replicas: 1\nimage: x\n").unwrap())
            .with_template(
                "deployment.yaml",
                "kind: Deployment\nmetadata:\n  name: {{ release.name }}\nreplicas: {{ values.replicas }}\nimage: {{ values.image }}\n",
            )
            .with_template(
                "service.yaml",
                "kind: Service\nmetadata:\n  name: {{ release.name }}-svc\n",
            )
    }

    fn with_hook(chart: Chart, name: &str, event: &str, policy: &str) -> Chart {
        chart.with_template(
            &format!("{}.yaml", name),
            &format!(
                "kind: Job\nmetadata:\n  name: {}\n  annotations:\n    keel.sh/hook: {}\n    keel.sh/hook-delete-policy: {}\n",
                name, event, policy
            ),
        )
    }

    fn set(overrides: &[&str]) -> Vec<ValueLayer> {
        let overrides: Vec<String> = overrides.iter().map(|s| s.to_string()).collect();
        vec![ValueLayer::inline(&overrides).unwrap()]
    }

    fn manager() -> (Manager, MemoryStorage, MockClusterClient) {
        let storage = MemoryStorage::new();
        let cluster = MockClusterClient::new();
        let manager = ReleaseManager::new(storage.clone(), cluster.clone());
        (manager, storage, cluster)
    }

    fn statuses(revisions: &[Revision]) -> Vec<(u32, &'static str)> {
        revisions
            .iter()
            .map(|r| (r.revision, r.status.status_name()))
            .collect()
    }

    #[tokio::test]
    async fn test_install_merges_overrides_over_defaults() {
        let (manager, _, cluster) = manager();

        let revision = manager
            .install(&web_chart("1.0.0"), &set(&["replicas=2"]), &InstallOptions::new("web", "prod"))
            .await
            .unwrap();

        assert_eq!(revision.revision, 1);
        assert_eq!(revision.status, ReleaseStatus::Deployed);
        assert_eq!(revision.values.get("replicas"), Some(&serde_json::json!(2)));
        assert_eq!(revision.values.get("image"), Some(&serde_json::json!("x")));
        assert_eq!(revision.config.get("replicas"), Some(&serde_json::json!(2)));
        assert!(revision.config.get("image").is_none());
        assert!(revision.first_deployed.is_some());
        assert!(cluster.content("web").unwrap().contains("replicas: 2"));
        assert!(cluster.contains("web-svc"));
    }

    #[tokio::test]
    async fn test_install_twice_is_rejected() {
        let (manager, _, _) = manager();
        let options = InstallOptions::new("web", "prod");
        manager.install(&web_chart("1.0.0"), &[], &options).await.unwrap();

        let err = manager
            .install(&web_chart("1.0.0"), &[], &options)
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::InvalidTransition { .. }));
        assert_eq!(manager.history("web").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upgrade_supersedes_previous() {
        let (manager, _, cluster) = manager();
        manager
            .install(&web_chart("1.0.0"), &[], &InstallOptions::new("web", "prod"))
            .await
            .unwrap();

        let upgraded = manager
            .upgrade(&web_chart("1.1.0"), &set(&["replicas=3"]), &UpgradeOptions::new("web", "prod"))
            .await
            .unwrap();

        assert_eq!(upgraded.revision, 2);
        assert_eq!(upgraded.chart_ref, "web-1.1.0");
        let history = manager.history("web").await.unwrap();
        assert_eq!(statuses(&history), vec![(1, "superseded"), (2, "deployed")]);
        assert_eq!(upgraded.first_deployed, history[0].first_deployed);
        assert!(cluster.content("web").unwrap().contains("replicas: 3"));
    }

    #[tokio::test]
    async fn test_upgrade_reuse_and_reset_values() {
        let (manager, _, _) = manager();
        manager
            .install(&web_chart("1.0.0"), &set(&["replicas=4"]), &InstallOptions::new("web", "prod"))
            .await
            .unwrap();

        let reused = manager
            .upgrade(
                &web_chart("1.0.0"),
                &set(&["image=y"]),
                &UpgradeOptions::new("web", "prod").with_reuse_values(),
            )
            .await
            .unwrap();
        assert_eq!(reused.values.get("replicas"), Some(&serde_json::json!(4)));
        assert_eq!(reused.values.get("image"), Some(&serde_json::json!("y")));

        let reset = manager
            .upgrade(&web_chart("1.0.0"), &set(&["image=z"]), &UpgradeOptions::new("web", "prod"))
            .await
            .unwrap();
        assert_eq!(reset.values.get("replicas"), Some(&serde_json::json!(1)));
    }

    #[tokio::test]
    async fn test_upgrade_missing_release() {
        let (manager, _, _) = manager();
        let err = manager
            .upgrade(&web_chart("1.0.0"), &[], &UpgradeOptions::new("web", "prod"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let installed = manager
            .upgrade(&web_chart("1.0.0"), &[], &UpgradeOptions::new("web", "prod").with_install())
            .await
            .unwrap();
        assert_eq!(installed.revision, 1);
        assert_eq!(installed.status, ReleaseStatus::Deployed);
    }

    #[tokio::test]
    async fn test_failed_post_upgrade_hook_keeps_previous_deployed() {
        let (manager, _, cluster) = manager();
        manager
            .install(&web_chart("1.0.0"), &[], &InstallOptions::new("web", "prod"))
            .await
            .unwrap();

        cluster.fail_ready("smoke");
        let chart = with_hook(web_chart("1.1.0"), "smoke", "post-upgrade", "hook-succeeded");
        let err = manager
            .upgrade(&chart, &[], &UpgradeOptions::new("web", "prod"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ReleaseError::RevisionFailed { revision: 2, .. }
        ));
        assert!(matches!(err.cause(), ReleaseError::HookFailed { hook, .. } if hook == "smoke"));

        let history = manager.history("web").await.unwrap();
        assert_eq!(statuses(&history), vec![(1, "deployed"), (2, "failed")]);
        assert!(cluster.contains("smoke"));
        assert_eq!(manager.status("web").await.unwrap().revision, 2);
    }

    #[tokio::test]
    async fn test_hook_succeeded_policy_removes_hook() {
        let (manager, _, cluster) = manager();
        let chart = with_hook(web_chart("1.0.0"), "migrate", "pre-install", "hook-succeeded");

        manager
            .install(&chart, &[], &InstallOptions::new("web", "prod"))
            .await
            .unwrap();

        assert!(!cluster.contains("migrate"));
        let ops = cluster.operations();
        let hook_apply = ops
            .iter()
            .position(|op| matches!(op, ClusterOperation::Apply(o) if o.name == "migrate"))
            .unwrap();
        let main_apply = ops
            .iter()
            .position(|op| matches!(op, ClusterOperation::Apply(o) if o.name == "web"))
            .unwrap();
        assert!(hook_apply < main_apply);
    }

    #[tokio::test]
    async fn test_render_failure_records_failed_revision() {
        let (manager, _, cluster) = manager();
        manager
            .install(&web_chart("1.0.0"), &[], &InstallOptions::new("web", "prod"))
            .await
            .unwrap();
        cluster.reset_operations();

        let broken = web_chart("2.0.0").with_template("bad.yaml", "{{ values.missing.deeper }}");
        let err = manager
            .upgrade(&broken, &[], &UpgradeOptions::new("web", "prod"))
            .await
            .unwrap_err();

        assert!(matches!(err.cause(), ReleaseError::Render(_)));
        assert!(cluster.operations().is_empty());

        let fixed = manager
            .upgrade(&web_chart("2.0.1"), &[], &UpgradeOptions::new("web", "prod"))
            .await
            .unwrap();
        let history = manager.history("web").await.unwrap();
        assert_eq!(fixed.revision, 3);
        assert_eq!(
            statuses(&history),
            vec![(1, "superseded"), (2, "failed"), (3, "deployed")]
        );
    }

    #[tokio::test]
    async fn test_apply_failure_marks_revision_failed() {
        let (manager, _, cluster) = manager();
        cluster.reject_apply("web-svc");

        let err = manager
            .install(&web_chart("1.0.0"), &[], &InstallOptions::new("web", "prod"))
            .await
            .unwrap_err();

        assert!(matches!(err.cause(), ReleaseError::ApplyFailed { .. }));
        assert!(manager.get("web", 1).await.unwrap().status.is_failed());
    }

    #[tokio::test]
    async fn test_wait_timeout_is_apply_failure() {
        let (manager, _, cluster) = manager();
        cluster.delay_ready("web", Duration::from_millis(500));

        let err = manager
            .install(
                &web_chart("1.0.0"),
                &[],
                &InstallOptions::new("web", "prod").with_wait(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.cause(),
            ReleaseError::ApplyFailed { source: ClusterError::Timeout(_) }
        ));
    }

    #[tokio::test]
    async fn test_rollback_creates_new_revision_from_target() {
        let (manager, storage, cluster) = manager();
        manager
            .install(&web_chart("1.0.0"), &set(&["replicas=2"]), &InstallOptions::new("web", "prod"))
            .await
            .unwrap();
        manager
            .upgrade(&web_chart("1.1.0"), &set(&["replicas=5"]), &UpgradeOptions::new("web", "prod"))
            .await
            .unwrap();
        let target_before = storage.get("web", 1).await.unwrap();

        let rolled = manager.rollback(&RollbackOptions::new("web")).await.unwrap();

        assert_eq!(rolled.revision, 3);
        assert_eq!(rolled.chart_ref, "web-1.0.0");
        assert_eq!(rolled.values.get("replicas"), Some(&serde_json::json!(2)));
        assert_eq!(rolled.description, "Rollback to 1");
        assert_eq!(storage.get("web", 1).await.unwrap(), target_before);
        assert!(cluster.content("web").unwrap().contains("replicas: 2"));

        let history = manager.history("web").await.unwrap();
        assert_eq!(
            statuses(&history),
            vec![(1, "superseded"), (2, "superseded"), (3, "deployed")]
        );
    }

    #[tokio::test]
    async fn test_rollback_errors() {
        let (manager, _, _) = manager();
        assert!(
            manager
                .rollback(&RollbackOptions::new("web"))
                .await
                .unwrap_err()
                .is_not_found()
        );

        manager
            .install(&web_chart("1.0.0"), &[], &InstallOptions::new("web", "prod"))
            .await
            .unwrap();
        let err = manager.rollback(&RollbackOptions::new("web")).await.unwrap_err();
        assert!(matches!(err, ReleaseError::InvalidTransition { .. }));

        let err = manager
            .rollback(&RollbackOptions::new("web").to_revision(7))
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::NotFound { revision: Some(7), .. }));
    }

    #[tokio::test]
    async fn test_uninstall_deletes_in_reverse_order() {
        let (manager, _, cluster) = manager();
        let chart = with_hook(web_chart("1.0.0"), "backup", "pre-delete", "hook-succeeded");
        manager
            .install(&chart, &[], &InstallOptions::new("web", "prod"))
            .await
            .unwrap();
        cluster.reset_operations();

        let revision = manager.uninstall(&UninstallOptions::new("web")).await.unwrap();
        assert_eq!(revision.status, ReleaseStatus::Uninstalled);
        assert!(cluster.objects().is_empty());

        let deleted: Vec<String> = cluster
            .operations()
            .into_iter()
            .filter_map(|op| match op {
                ClusterOperation::Delete(o) => Some(o.name),
                _ => None,
            })
            .collect();
        assert_eq!(deleted, vec!["backup", "web-svc", "web"]);

        let history = manager.history("web").await.unwrap();
        assert_eq!(statuses(&history), vec![(1, "uninstalled")]);

        let again = manager
            .install(&web_chart("1.0.0"), &[], &InstallOptions::new("web", "prod"))
            .await
            .unwrap();
        assert_eq!(again.revision, 2);
    }

    #[tokio::test]
    async fn test_uninstall_purge() {
        let (manager, storage, _) = manager();
        manager
            .install(&web_chart("1.0.0"), &[], &InstallOptions::new("web", "prod"))
            .await
            .unwrap();

        manager
            .uninstall(&UninstallOptions::new("web").with_purge())
            .await
            .unwrap();
        assert_eq!(storage.revision_count(), 0);
        assert!(manager.history("web").await.unwrap_err().is_not_found());
        assert!(
            manager
                .uninstall(&UninstallOptions::new("web"))
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn test_concurrent_upgrades_one_wins() {
        let (manager, _, cluster) = manager();
        manager
            .install(&web_chart("1.0.0"), &[], &InstallOptions::new("web", "prod"))
            .await
            .unwrap();
        cluster.delay_apply(Duration::from_millis(20));

        let first_layers = set(&["replicas=2"]);
        let second_layers = set(&["replicas=3"]);
        let first_options = UpgradeOptions::new("web", "prod");
        let second_options = UpgradeOptions::new("web", "prod");
        let chart = web_chart("1.1.0");
        let (first, second) = tokio::join!(
            manager.upgrade(&chart, &first_layers, &first_options),
            manager.upgrade(&chart, &second_layers, &second_options),
        );

        let outcomes = [first, second];
        let winners = outcomes.iter().filter(|r| r.is_ok()).count();
        let conflicts = outcomes
            .iter()
            .filter(|r| matches!(r, Err(ReleaseError::ConcurrentModification { .. })))
            .count();
        assert_eq!((winners, conflicts), (1, 1));

        let history = manager.history("web").await.unwrap();
        assert_eq!(statuses(&history), vec![(1, "superseded"), (2, "deployed")]);
    }

    /// Memory storage whose status compare-and-swap lands late
    #[derive(Clone)]
    struct SlowStatusStorage {
        inner: MemoryStorage,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl StorageBackend for SlowStatusStorage {
        async fn get(&self, name: &str, revision: u32) -> Result<Revision> {
            self.inner.get(name, revision).await
        }

        async fn list(&self, name: &str) -> Result<Vec<Revision>> {
            self.inner.list(name).await
        }

        async fn create_if_absent(&self, revision: &Revision) -> Result<()> {
            self.inner.create_if_absent(revision).await
        }

        async fn update_status(
            &self,
            name: &str,
            revision: u32,
            status: ReleaseStatus,
        ) -> Result<Revision> {
            self.inner.update_status(name, revision, status).await
        }

        async fn compare_and_set_status(
            &self,
            name: &str,
            revision: u32,
            expected: &ReleaseStatus,
            status: ReleaseStatus,
        ) -> Result<Revision> {
            tokio::time::sleep(self.delay).await;
            self.inner
                .compare_and_set_status(name, revision, expected, status)
                .await
        }

        async fn delete(&self, name: &str, revision: u32) -> Result<Revision> {
            self.inner.delete(name, revision).await
        }

        async fn purge(&self, name: &str) -> Result<Vec<Revision>> {
            self.inner.purge(name).await
        }

        async fn list_names(&self) -> Result<Vec<String>> {
            self.inner.list_names().await
        }
    }

    #[tokio::test]
    async fn test_uninstall_racing_upgrade_one_wins() {
        let storage = SlowStatusStorage {
            inner: MemoryStorage::new(),
            delay: Duration::from_millis(5),
        };
        let cluster = MockClusterClient::new();
        let manager = ReleaseManager::new(storage, cluster.clone());
        manager
            .install(&web_chart("1.0.0"), &[], &InstallOptions::new("web", "prod"))
            .await
            .unwrap();
        cluster.delay_apply(Duration::from_millis(20));

        // The upgrade records revision 2 while the uninstall's status swap is in flight
        let uninstall_options = UninstallOptions::new("web");
        let upgrade_options = UpgradeOptions::new("web", "prod");
        let chart = web_chart("1.1.0");
        let (uninstalled, upgraded) = tokio::join!(
            manager.uninstall(&uninstall_options),
            manager.upgrade(&chart, &[], &upgrade_options),
        );

        let err = uninstalled.unwrap_err();
        assert!(matches!(err, ReleaseError::ConcurrentModification { revision: 1, .. }));
        assert_eq!(upgraded.unwrap().status, ReleaseStatus::Deployed);

        let history = manager.history("web").await.unwrap();
        assert_eq!(statuses(&history), vec![(1, "superseded"), (2, "deployed")]);
        assert!(history.iter().all(|r| !r.status.is_pending()));
        assert!(manager.cluster().contains("web"));
    }

    #[tokio::test]
    async fn test_cancellation_leaves_revision_pending() {
        let (manager, _, cluster) = manager();
        cluster.delay_apply(Duration::from_millis(200));
        let cancel = CancellationToken::new();
        let options = InstallOptions::new("web", "prod").with_cancel(cancel.clone());

        let trigger = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        };
        let chart = web_chart("1.0.0");
        let (result, _) = tokio::join!(manager.install(&chart, &[], &options), trigger);

        assert!(matches!(result, Err(ReleaseError::Cancelled { revision: 1, .. })));
        let status = manager.status("web").await.unwrap();
        assert_eq!(status.status, ReleaseStatus::PendingInstall);

        let blocked = manager
            .upgrade(&web_chart("1.0.0"), &[], &UpgradeOptions::new("web", "prod"))
            .await
            .unwrap_err();
        assert!(blocked.is_retryable());

        let recovered = manager.recover("web").await.unwrap();
        assert!(recovered.status.is_failed());
    }

    #[tokio::test]
    async fn test_deadline_counts_as_cancellation() {
        let (manager, _, cluster) = manager();
        cluster.delay_apply(Duration::from_millis(200));

        let err = manager
            .install(
                &web_chart("1.0.0"),
                &[],
                &InstallOptions::new("web", "prod").with_deadline(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_max_history_prunes_superseded() {
        let (manager, storage, _) = manager();
        let manager = manager.with_max_history(2);
        manager
            .install(&web_chart("1.0.0"), &[], &InstallOptions::new("web", "prod"))
            .await
            .unwrap();
        for version in ["1.0.1", "1.0.2", "1.0.3"] {
            manager
                .upgrade(&web_chart(version), &[], &UpgradeOptions::new("web", "prod"))
                .await
                .unwrap();
        }

        let numbers: Vec<u32> = storage
            .list("web")
            .await
            .unwrap()
            .iter()
            .map(|r| r.revision)
            .collect();
        assert_eq!(numbers, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_dependencies_resolved_from_source() {
        let postgres = Chart::new(ChartMetadata::new("postgres", Version::new(12, 1, 0)))
            .with_values(Values::from_yaml("port: 5432").unwrap())
            .with_template(
                "statefulset.yaml",
                "kind: StatefulSet\nmetadata:\n  name: {{ release.name }}-db\nport: {{ values.port }}\n",
            );
        let source = Arc::new(MemoryChartSource::new().with_chart("repo", postgres));
        let manager = ReleaseManager::with_source(MemoryStorage::new(), MockClusterClient::new(), source);

        let chart = web_chart("1.0.0").with_dependency(
            Dependency::new("postgres", "^12", "repo")
                .with_alias("db")
                .with_condition("db.enabled"),
        );

        let lock = manager.resolve(&chart, &Values::new()).await.unwrap();
        assert_eq!(lock.dependencies.len(), 1);

        let revision = manager
            .install(
                &chart,
                &set(&["db.enabled=true", "db.port=6543"]),
                &InstallOptions::new("web", "prod").with_lock(lock),
            )
            .await
            .unwrap();
        assert!(revision.chart.subchart("db").is_some());
        assert!(revision.manifest.contains("port: 6543"));
        assert!(manager.cluster().contains("web-db"));
    }

    #[tokio::test]
    async fn test_lock_without_enabled_dependency_is_rejected() {
        let postgres = Chart::new(ChartMetadata::new("postgres", Version::new(12, 1, 0)))
            .with_template("statefulset.yaml", "kind: StatefulSet\nmetadata:\n  name: db\n");
        let source = MemoryChartSource::new().with_chart("repo", postgres);
        let manager = ReleaseManager::with_source(MemoryStorage::new(), MockClusterClient::new(), source);
        let chart = web_chart("1.0.0").with_dependency(
            Dependency::new("postgres", "^12", "repo")
                .with_alias("db")
                .with_condition("db.enabled"),
        );

        let off = Values::from_yaml("db:\n  enabled: false\n").unwrap();
        let lock = manager.resolve(&chart, &off).await.unwrap();
        assert!(lock.dependencies.is_empty());

        let err = manager
            .install(
                &chart,
                &set(&["db.enabled=true"]),
                &InstallOptions::new("web", "prod").with_lock(lock),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReleaseError::Resolve(keel_repo::RepoError::MissingLockEntry { ref name }) if name == "db"
        ));
        assert!(manager.history("web").await.unwrap_err().is_not_found());
        assert!(!manager.cluster().contains("db"));
    }

    #[tokio::test]
    async fn test_queries() {
        let (manager, _, _) = manager();
        for name in ["api", "web"] {
            manager
                .install(&web_chart("1.0.0"), &[], &InstallOptions::new(name, "prod"))
                .await
                .unwrap();
        }
        manager
            .upgrade(&web_chart("1.1.0"), &[], &UpgradeOptions::new("web", "prod"))
            .await
            .unwrap();

        let listed: Vec<(String, u32)> = manager
            .list_releases()
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.name, r.revision))
            .collect();
        assert_eq!(listed, vec![("api".to_string(), 1), ("web".to_string(), 2)]);
        assert_eq!(manager.status("web").await.unwrap().revision, 2);
        assert!(manager.get("web", 9).await.unwrap_err().is_not_found());
        assert!(manager.status("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_hook_scheduling_respects_delete_policy_default() {
        let (manager, _, cluster) = manager();
        let chart = web_chart("1.0.0").with_template(
            "seed.yaml",
            "kind: Job\nmetadata:\n  name: seed\n  annotations:\n    keel.sh/hook: post-install\n",
        );
        manager
            .install(&chart, &[], &InstallOptions::new("web", "prod"))
            .await
            .unwrap();

        assert!(cluster.contains("seed"));
        let revision = manager.get("web", 1).await.unwrap();
        assert!(revision.hooks[0].meta.has_delete_policy(DeletePolicy::BeforeHookCreation));
    }
}
