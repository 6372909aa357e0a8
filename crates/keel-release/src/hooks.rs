//! Hook scheduling
//!
//! Hooks of one lifecycle event run one at a time, ordered by weight then
//! name. Each hook is applied, waited on within its own timeout, and cleaned
//! up according to its delete policies. The first failure aborts the event.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use keel_engine::{DeletePolicy, HookEvent, HookManifest, sort_hooks};

use crate::cluster::{ClusterClient, ObjectRef, ResourceManifest};
use crate::error::{ReleaseError, Result};

/// Hook scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Timeout for hooks without a `keel.sh/hook-timeout` annotation
    #[serde(default = "default_hook_timeout", with = "humantime_serde")]
    pub default_timeout: Duration,
}

fn default_hook_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_hook_timeout(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// The transition a set of hooks runs for
#[derive(Debug, Clone, Copy)]
pub struct HookRun<'a> {
    pub release: &'a str,
    pub revision: u32,
    pub namespace: &'a str,
    pub cancel: &'a CancellationToken,
}

/// How a hook ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Succeeded,
    Failed(String),
    TimedOut,
}

/// Record of one executed hook
#[derive(Debug, Clone)]
pub struct HookResult {
    pub name: String,
    pub event: HookEvent,
    pub outcome: HookOutcome,
    /// Whether the hook object was deleted afterwards
    pub deleted: bool,
    pub duration: Duration,
}

impl HookResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == HookOutcome::Succeeded
    }
}

/// Runs lifecycle hooks against a cluster
#[derive(Debug, Clone, Default)]
pub struct HookScheduler {
    config: SchedulerConfig,
    results: Vec<HookResult>,
}

impl HookScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            results: Vec::new(),
        }
    }

    /// Hooks executed so far, in order
    pub fn results(&self) -> &[HookResult] {
        &self.results
    }

    /// Results for one event
    pub fn results_for(&self, event: HookEvent) -> Vec<&HookResult> {
        self.results.iter().filter(|r| r.event == event).collect()
    }

    /// Run every hook attached to `event`
    ///
    /// Stops at the first hook that fails or times out.
    pub async fn run_event<C: ClusterClient + ?Sized>(
        &mut self,
        client: &C,
        hooks: &[HookManifest],
        event: HookEvent,
        run: &HookRun<'_>,
    ) -> Result<()> {
        let mut selected: Vec<HookManifest> = hooks
            .iter()
            .filter(|h| h.meta.runs_on(event))
            .cloned()
            .collect();
        if selected.is_empty() {
            return Ok(());
        }
        sort_hooks(&mut selected);

        tracing::info!(
            release = %run.release,
            revision = run.revision,
            %event,
            count = selected.len(),
            "running hooks"
        );

        for hook in &selected {
            if run.cancel.is_cancelled() {
                return Err(cancelled(run));
            }
            self.run_hook(client, hook, event, run).await?;
        }
        Ok(())
    }

    async fn run_hook<C: ClusterClient + ?Sized>(
        &mut self,
        client: &C,
        hook: &HookManifest,
        event: HookEvent,
        run: &HookRun<'_>,
    ) -> Result<()> {
        let name = hook.meta.name.clone();
        let resource =
            ResourceManifest::parse(&hook.content, run.namespace).map_err(|e| ReleaseError::HookFailed {
                hook: name.clone(),
                event,
                message: e.to_string(),
            })?;
        let object = resource.object.clone();
        let started = Instant::now();

        if hook.meta.has_delete_policy(DeletePolicy::BeforeHookCreation) {
            tracing::debug!(hook = %name, "deleting previous hook object");
            client.delete(std::slice::from_ref(&object)).await?;
        }

        tracing::debug!(hook = %name, %event, weight = hook.meta.weight, "applying hook");
        let outcome = match client.apply(std::slice::from_ref(&resource)).await {
            Ok(_) => {
                let timeout = hook.meta.timeout.unwrap_or(self.config.default_timeout);
                tokio::select! {
                    _ = run.cancel.cancelled() => return Err(cancelled(run)),
                    waited = tokio::time::timeout(
                        timeout,
                        client.wait_until_ready(std::slice::from_ref(&object), timeout),
                    ) => match waited {
                        Ok(Ok(())) => HookOutcome::Succeeded,
                        Ok(Err(e)) => HookOutcome::Failed(e.to_string()),
                        Err(_) => HookOutcome::TimedOut,
                    },
                }
            }
            Err(e) => HookOutcome::Failed(e.to_string()),
        };

        let policy = match outcome {
            HookOutcome::Succeeded => DeletePolicy::HookSucceeded,
            _ => DeletePolicy::HookFailed,
        };
        let deleted = hook.meta.has_delete_policy(policy) && self.cleanup(client, &object).await;

        self.results.push(HookResult {
            name: name.clone(),
            event,
            outcome: outcome.clone(),
            deleted,
            duration: started.elapsed(),
        });

        match outcome {
            HookOutcome::Succeeded => {
                tracing::info!(hook = %name, %event, deleted, "hook succeeded");
                Ok(())
            }
            HookOutcome::Failed(message) => {
                tracing::warn!(hook = %name, %event, %message, "hook failed");
                Err(ReleaseError::HookFailed {
                    hook: name,
                    event,
                    message,
                })
            }
            HookOutcome::TimedOut => {
                let timeout = hook.meta.timeout.unwrap_or(self.config.default_timeout);
                tracing::warn!(hook = %name, %event, ?timeout, "hook timed out");
                Err(ReleaseError::HookTimeout {
                    hook: name,
                    event,
                    timeout,
                })
            }
        }
    }

    async fn cleanup<C: ClusterClient + ?Sized>(&self, client: &C, object: &ObjectRef) -> bool {
        match client.delete(std::slice::from_ref(object)).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(object = %object, error = %e, "failed to delete hook object");
                false
            }
        }
    }
}

fn cancelled(run: &HookRun<'_>) -> ReleaseError {
    ReleaseError::Cancelled {
        name: run.release.to_string(),
        revision: run.revision,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterOperation, MockClusterClient};
    use keel_engine::HookMeta;

    fn hook(name: &str, weight: i32, policies: Vec<DeletePolicy>) -> HookManifest {
        HookManifest {
            path: format!("{}.yaml", name),
            content: format!("apiVersion: batch/v1\nkind: Job\nmetadata:\n  name: {}\n", name),
            meta: HookMeta {
                name: name.to_string(),
                kind: "Job".to_string(),
                events: vec![HookEvent::PostUpgrade],
                weight,
                delete_policies: policies,
                timeout: None,
            },
        }
    }

    fn applied(cluster: &MockClusterClient) -> Vec<String> {
        cluster
            .operations()
            .into_iter()
            .filter_map(|op| match op {
                ClusterOperation::Apply(o) => Some(o.name),
                _ => None,
            })
            .collect()
    }

    async fn run(
        scheduler: &mut HookScheduler,
        cluster: &MockClusterClient,
        hooks: &[HookManifest],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let run = HookRun {
            release: "web",
            revision: 2,
            namespace: "default",
            cancel,
        };
        scheduler
            .run_event(cluster, hooks, HookEvent::PostUpgrade, &run)
            .await
    }

    #[tokio::test]
    async fn test_no_hooks_is_noop() {
        let cluster = MockClusterClient::new();
        let mut scheduler = HookScheduler::default();
        run(&mut scheduler, &cluster, &[], &CancellationToken::new())
            .await
            .unwrap();
        assert!(cluster.operations().is_empty());
        assert!(scheduler.results().is_empty());
    }

    #[tokio::test]
    async fn test_weight_then_name_order() {
        let cluster = MockClusterClient::new();
        let mut scheduler = HookScheduler::default();
        let hooks = vec![
            hook("zeta", 0, vec![]),
            hook("late", 5, vec![]),
            hook("alpha", 0, vec![]),
            hook("early", -3, vec![]),
        ];
        run(&mut scheduler, &cluster, &hooks, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(applied(&cluster), vec!["early", "alpha", "zeta", "late"]);
    }

    #[tokio::test]
    async fn test_before_hook_creation_is_default() {
        let cluster = MockClusterClient::new();
        let mut scheduler = HookScheduler::default();
        run(&mut scheduler, &cluster, &[hook("migrate", 0, vec![])], &CancellationToken::new())
            .await
            .unwrap();

        let ops = cluster.operations();
        assert!(matches!(&ops[0], ClusterOperation::Delete(o) if o.name == "migrate"));
        assert!(cluster.contains("migrate"));
        assert!(!scheduler.results()[0].deleted);
    }

    #[tokio::test]
    async fn test_hook_succeeded_policy_deletes_on_success() {
        let cluster = MockClusterClient::new();
        let mut scheduler = HookScheduler::default();
        let hooks = vec![hook("smoke", 0, vec![DeletePolicy::HookSucceeded])];
        run(&mut scheduler, &cluster, &hooks, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!cluster.contains("smoke"));
        assert!(scheduler.results()[0].deleted);
    }

    #[tokio::test]
    async fn test_failure_keeps_hook_and_fails_fast() {
        let cluster = MockClusterClient::new();
        cluster.fail_ready("smoke");
        let mut scheduler = HookScheduler::default();
        let hooks = vec![
            hook("smoke", 0, vec![DeletePolicy::HookSucceeded]),
            hook("notify", 1, vec![]),
        ];

        let err = run(&mut scheduler, &cluster, &hooks, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::HookFailed { ref hook, .. } if hook == "smoke"));
        assert!(cluster.contains("smoke"));
        assert_eq!(applied(&cluster), vec!["smoke"]);
        assert_eq!(scheduler.results().len(), 1);
    }

    #[tokio::test]
    async fn test_hook_failed_policy_deletes_on_failure() {
        let cluster = MockClusterClient::new();
        cluster.fail_ready("smoke");
        let mut scheduler = HookScheduler::default();
        let hooks = vec![hook("smoke", 0, vec![DeletePolicy::HookFailed])];

        assert!(run(&mut scheduler, &cluster, &hooks, &CancellationToken::new()).await.is_err());
        assert!(!cluster.contains("smoke"));
    }

    #[tokio::test]
    async fn test_timeout_names_hook() {
        let cluster = MockClusterClient::new();
        cluster.delay_ready("slow", Duration::from_millis(500));
        let mut scheduler =
            HookScheduler::new(SchedulerConfig::default().with_default_timeout(Duration::from_millis(20)));

        let hooks = vec![hook("slow", 0, vec![]), hook("notify", 1, vec![])];
        let err = run(&mut scheduler, &cluster, &hooks, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::HookTimeout { ref hook, .. } if hook == "slow"));
        assert_eq!(scheduler.results()[0].outcome, HookOutcome::TimedOut);

        // The later hook of the event never runs
        assert_eq!(applied(&cluster), vec!["slow"]);
        assert!(!cluster.contains("notify"));
        assert_eq!(scheduler.results().len(), 1);
    }

    #[tokio::test]
    async fn test_annotation_timeout_overrides_default() {
        let cluster = MockClusterClient::new();
        cluster.delay_ready("slow", Duration::from_millis(50));
        let mut scheduler =
            HookScheduler::new(SchedulerConfig::default().with_default_timeout(Duration::from_millis(10)));
        let mut slow = hook("slow", 0, vec![]);
        slow.meta.timeout = Some(Duration::from_secs(5));

        run(&mut scheduler, &cluster, &[slow], &CancellationToken::new())
            .await
            .unwrap();
        assert!(scheduler.results()[0].succeeded());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cluster = MockClusterClient::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut scheduler = HookScheduler::default();

        let err = run(&mut scheduler, &cluster, &[hook("migrate", 0, vec![])], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::Cancelled { revision: 2, .. }));
        assert!(cluster.operations().is_empty());
    }

    #[test]
    fn test_scheduler_config_serde() {
        let config: SchedulerConfig = serde_json::from_str(r#"{"defaultTimeout":"90s"}"#).unwrap();
        assert_eq!(config.default_timeout, Duration::from_secs(90));
        let config: SchedulerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.default_timeout, Duration::from_secs(300));
    }
}
