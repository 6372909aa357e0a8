//! Cluster client interface
//!
//! The release state machine never talks to a cluster API directly. It goes
//! through [`ClusterClient`], which a live client (server-side apply, watch)
//! implements outside this crate. [`MockClusterClient`] keeps objects in
//! memory and records every call.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use keel_core::{Capabilities, split_documents};

/// Errors reported by a cluster client
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClusterError {
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("{object} rejected: {message}")]
    Rejected { object: ObjectRef, message: String },

    #[error("{object} failed: {message}")]
    NotReady { object: ObjectRef, message: String },

    #[error("resources not ready within {0:?}")]
    Timeout(Duration),

    #[error("cluster unavailable: {0}")]
    Unavailable(String),
}

/// Identity of one cluster object
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", ns, self.kind, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectHead {
    #[serde(default)]
    api_version: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    metadata: HeadMetadata,
}

#[derive(Deserialize, Default)]
struct HeadMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: Option<String>,
}

/// One object to apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceManifest {
    pub object: ObjectRef,
    pub content: String,
}

impl ResourceManifest {
    /// Parse one YAML document, defaulting its namespace
    pub fn parse(content: &str, namespace: &str) -> Result<Self, ClusterError> {
        let head: ObjectHead = serde_yaml::from_str(content)
            .map_err(|e| ClusterError::InvalidManifest(e.to_string()))?;
        if head.kind.is_empty() || head.metadata.name.is_empty() {
            return Err(ClusterError::InvalidManifest(
                "document has no kind or metadata.name".to_string(),
            ));
        }
        Ok(Self {
            object: ObjectRef {
                api_version: head.api_version,
                kind: head.kind,
                name: head.metadata.name,
                namespace: Some(head.metadata.namespace.unwrap_or_else(|| namespace.to_string())),
            },
            content: content.to_string(),
        })
    }

    /// Parse a `---` separated manifest stream in order
    pub fn from_stream(manifest: &str, namespace: &str) -> Result<Vec<Self>, ClusterError> {
        split_documents(manifest)
            .iter()
            .map(|doc| Self::parse(doc, namespace))
            .collect()
    }
}

/// Outcome of an apply call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub created: Vec<ObjectRef>,
    pub updated: Vec<ObjectRef>,
}

impl ApplyReport {
    pub fn total(&self) -> usize {
        self.created.len() + self.updated.len()
    }
}

/// Narrow interface to the cluster
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Kubernetes version and served API versions
    async fn capabilities(&self) -> Result<Capabilities, ClusterError>;

    /// Create or update objects, in order
    async fn apply(&self, resources: &[ResourceManifest]) -> Result<ApplyReport, ClusterError>;

    /// Delete objects, in order; absent objects are not an error
    async fn delete(&self, objects: &[ObjectRef]) -> Result<(), ClusterError>;

    /// Wait until every object is ready (or, for jobs and pods, completed)
    async fn wait_until_ready(
        &self,
        objects: &[ObjectRef],
        timeout: Duration,
    ) -> Result<(), ClusterError>;
}

#[async_trait]
impl<T: ClusterClient + ?Sized> ClusterClient for Arc<T> {
    async fn capabilities(&self) -> Result<Capabilities, ClusterError> {
        (**self).capabilities().await
    }

    async fn apply(&self, resources: &[ResourceManifest]) -> Result<ApplyReport, ClusterError> {
        (**self).apply(resources).await
    }

    async fn delete(&self, objects: &[ObjectRef]) -> Result<(), ClusterError> {
        (**self).delete(objects).await
    }

    async fn wait_until_ready(
        &self,
        objects: &[ObjectRef],
        timeout: Duration,
    ) -> Result<(), ClusterError> {
        (**self).wait_until_ready(objects, timeout).await
    }
}

/// A call recorded by [`MockClusterClient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterOperation {
    Apply(ObjectRef),
    Delete(ObjectRef),
    Wait(ObjectRef),
}

#[derive(Debug, Default)]
struct MockState {
    capabilities: Option<Capabilities>,
    objects: BTreeMap<ObjectRef, String>,
    operations: Vec<ClusterOperation>,
    reject_apply: HashSet<String>,
    fail_ready: HashSet<String>,
    ready_delay: HashMap<String, Duration>,
    apply_delay: Option<Duration>,
}

/// In-memory cluster for tests
///
/// Failures and delays are keyed by object name. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockClusterClient {
    state: Arc<RwLock<MockState>>,
}

impl MockClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(self, capabilities: Capabilities) -> Self {
        self.write().capabilities = Some(capabilities);
        self
    }

    /// Reject any apply that includes `name`
    pub fn reject_apply(&self, name: &str) {
        self.write().reject_apply.insert(name.to_string());
    }

    /// Report `name` as failed when waited on
    pub fn fail_ready(&self, name: &str) {
        self.write().fail_ready.insert(name.to_string());
    }

    /// Make waits on `name` take `delay`
    pub fn delay_ready(&self, name: &str, delay: Duration) {
        self.write().ready_delay.insert(name.to_string(), delay);
    }

    /// Make every apply take `delay`
    pub fn delay_apply(&self, delay: Duration) {
        self.write().apply_delay = Some(delay);
    }

    /// Every call so far, in order
    pub fn operations(&self) -> Vec<ClusterOperation> {
        self.read().operations.clone()
    }

    pub fn reset_operations(&self) {
        self.write().operations.clear();
    }

    /// Objects currently present
    pub fn objects(&self) -> Vec<ObjectRef> {
        self.read().objects.keys().cloned().collect()
    }

    /// Whether an object named `name` is present
    pub fn contains(&self, name: &str) -> bool {
        self.read().objects.keys().any(|o| o.name == name)
    }

    /// Stored content of the object named `name`
    pub fn content(&self, name: &str) -> Option<String> {
        self.read()
            .objects
            .iter()
            .find(|(o, _)| o.name == name)
            .map(|(_, c)| c.clone())
    }

    fn read(&self) -> RwLockReadGuard<'_, MockState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, MockState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ClusterClient for MockClusterClient {
    async fn capabilities(&self) -> Result<Capabilities, ClusterError> {
        Ok(self.read().capabilities.clone().unwrap_or_default())
    }

    async fn apply(&self, resources: &[ResourceManifest]) -> Result<ApplyReport, ClusterError> {
        let delay = self.read().apply_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.write();
        let mut report = ApplyReport::default();
        for resource in resources {
            state
                .operations
                .push(ClusterOperation::Apply(resource.object.clone()));
            if state.reject_apply.contains(&resource.object.name) {
                return Err(ClusterError::Rejected {
                    object: resource.object.clone(),
                    message: "admission denied".to_string(),
                });
            }
            let previous = state
                .objects
                .insert(resource.object.clone(), resource.content.clone());
            match previous {
                Some(_) => report.updated.push(resource.object.clone()),
                None => report.created.push(resource.object.clone()),
            }
        }
        Ok(report)
    }

    async fn delete(&self, objects: &[ObjectRef]) -> Result<(), ClusterError> {
        let mut state = self.write();
        for object in objects {
            state.operations.push(ClusterOperation::Delete(object.clone()));
            state.objects.remove(object);
        }
        Ok(())
    }

    async fn wait_until_ready(
        &self,
        objects: &[ObjectRef],
        _timeout: Duration,
    ) -> Result<(), ClusterError> {
        for object in objects {
            let delay = {
                let mut state = self.write();
                state.operations.push(ClusterOperation::Wait(object.clone()));
                state.ready_delay.get(&object.name).copied()
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.read().fail_ready.contains(&object.name) {
                return Err(ClusterError::NotReady {
                    object: object.clone(),
                    message: "job reached BackoffLimitExceeded".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "---\n# Source: svc.yaml\napiVersion: v1\nkind: Service\nmetadata:\n  name: web\n---\n# Source: deploy.yaml\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  namespace: other\n";

    #[test]
    fn test_from_stream() {
        let resources = ResourceManifest::from_stream(STREAM, "prod").unwrap();
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].object.to_string(), "prod/Service/web");
        assert_eq!(resources[1].object.namespace.as_deref(), Some("other"));
        assert!(ResourceManifest::from_stream("", "prod").unwrap().is_empty());
    }

    #[test]
    fn test_from_stream_keeps_block_scalars_whole() {
        let stream = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: script\ndata:\n  run.sh: |\n    echo one\n    ---separator-looking\n---\napiVersion: v1\nkind: Service\nmetadata:\n  name: web\n";
        let resources = ResourceManifest::from_stream(stream, "prod").unwrap();
        assert_eq!(resources.len(), 2);
        assert!(resources[0].content.contains("---separator-looking"));
        assert_eq!(resources[1].object.name, "web");
    }

    #[test]
    fn test_parse_requires_identity() {
        assert!(ResourceManifest::parse("kind: ConfigMap", "prod").is_err());
        assert!(ResourceManifest::parse("key: [unclosed", "prod").is_err());
    }

    #[tokio::test]
    async fn test_mock_apply_and_delete() {
        let cluster = MockClusterClient::new();
        let resources = ResourceManifest::from_stream(STREAM, "prod").unwrap();

        let report = cluster.apply(&resources).await.unwrap();
        assert_eq!(report.created.len(), 2);
        let report = cluster.apply(&resources[..1]).await.unwrap();
        assert_eq!(report.updated.len(), 1);

        cluster.delete(&[resources[0].object.clone()]).await.unwrap();
        assert_eq!(cluster.objects(), vec![resources[1].object.clone()]);
        assert_eq!(cluster.operations().len(), 4);
    }

    #[tokio::test]
    async fn test_mock_injected_failures() {
        let cluster = MockClusterClient::new();
        let resources = ResourceManifest::from_stream(STREAM, "prod").unwrap();

        cluster.fail_ready("web");
        let err = cluster
            .wait_until_ready(&[resources[0].object.clone()], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NotReady { .. }));

        cluster.reject_apply("web");
        assert!(cluster.apply(&resources).await.is_err());
    }
}
