//! Keel Core - chart model and value composition
//!
//! This crate provides the foundational types used throughout Keel:
//! - `Chart`: The chart tree (metadata, templates, files, defaults, subcharts)
//! - `Values`: Configuration values with deep merge and `--set` parsing
//! - `ValueCompositor`: Per-scope value trees for a chart and its subcharts
//! - `GatingPolicy`: Condition/tag evaluation for dependencies
//! - `TemplateContext`: Template rendering context and cluster capabilities
//! - `Files`: Chart-scoped file access for templates

pub mod chart;
pub mod compose;
pub mod context;
pub mod documents;
pub mod error;
pub mod files;
pub mod gating;
pub mod inspect;
pub mod release;
pub mod values;

pub use chart::{Chart, ChartKind, ChartMetadata, Dependency, ResolvePolicy, sha256_digest};
pub use compose::{Provenance, ScopedValues, ValueCompositor, ValueLayer, ValueSource};
pub use context::{Capabilities, ChartInfo, KubeVersion, TemplateContext, TemplateInfo};
pub use documents::split_documents;
pub use error::{CoreError, Result};
pub use files::{ChartFileProvider, FileEntry, FileProvider, Files};
pub use gating::{GateDecision, GatePrecedence, GatingPolicy, SkipReason, TagMode, UnsetGate};
pub use inspect::{ShowKind, show, show_values_path};
pub use release::ReleaseInfo;
pub use values::{Values, parse_set_values};
