//! Keel Release - release lifecycle on top of resolution and rendering
//!
//! This crate provides:
//! - **Release state machine**: install, upgrade, rollback and uninstall with
//!   append-only revision history
//! - **Hook scheduling**: weighted, sequential hooks with delete policies and timeouts
//! - **Storage backends**: in-memory and file-based, with conditional creates
//! - **Cluster interface**: the narrow `ClusterClient` trait and an in-memory mock

pub mod actions;
pub mod cluster;
pub mod error;
pub mod hooks;
pub mod manager;
pub mod release;
pub mod storage;

pub use actions::{InstallOptions, RollbackOptions, UninstallOptions, UpgradeOptions};
pub use cluster::{
    ApplyReport, ClusterClient, ClusterError, ClusterOperation, MockClusterClient, ObjectRef,
    ResourceManifest,
};
pub use error::{ReleaseError, Result};
pub use hooks::{HookOutcome, HookResult, HookRun, HookScheduler, SchedulerConfig};
pub use manager::ReleaseManager;
pub use release::{Release, ReleaseStatus, Revision, validate_name};
pub use storage::{
    CompressionMethod, FileStorage, MemoryStorage, OperationCounts, StorageBackend, StorageConfig,
};
