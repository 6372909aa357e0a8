//! Keel Repo - chart sources and dependency resolution
//!
//! - `ChartSource`: where charts and their versions come from
//! - `DependencyResolver`: constraint solving, gating, and subchart assembly
//! - `Lock`: the reproducible, ordered result of a resolution

pub mod dependency;
pub mod error;
pub mod lock;
pub mod source;

pub use dependency::{
    DependencyResolver, FilterResult, Resolution, ResolverConfig, SkippedDependency,
    filter_dependencies, select_version,
};
pub use error::{RepoError, Result};
pub use lock::{Lock, LockPolicy, LockedDependency, VerifyResult};
pub use source::{ChartRef, ChartSource, MemoryChartSource, SourceCounts};
