//! Keel Engine - Jinja2 rendering for Kubernetes charts
//!
//! This crate provides a MiniJinja-based template engine with:
//! - Kubernetes-specific filters (toyaml, b64encode, nindent, etc.)
//! - Capability checks (`has_api`, `require_api`) and bounded `tpl`
//! - Human-readable error messages with suggestions
//! - Multi-error collection across a whole chart tree
//! - Post-render classification of documents into manifests and hooks

pub mod annotations;
pub mod engine;
pub mod error;
pub mod files_object;
pub mod filters;
pub mod functions;
pub mod output;
pub mod renderer;
pub mod suggestions;

pub use annotations::{DeletePolicy, HookEvent, HookMeta};
pub use engine::{Engine, EngineBuilder, ScopeRender};
pub use error::{EngineError, RenderReport, Result, TemplateError, TemplateErrorKind};
pub use output::{HookManifest, RenderedFile, RenderedOutput, sort_hooks};
pub use renderer::{ChartRenderer, RendererConfig};
pub use suggestions::{AVAILABLE_FILTERS, AVAILABLE_FUNCTIONS};
