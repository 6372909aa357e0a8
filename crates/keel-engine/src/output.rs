//! Rendered output and post-render hook classification

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use keel_core::split_documents;

use crate::annotations::{HookEvent, HookMeta, parse_hook};

/// One rendered YAML document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RenderedFile {
    /// Applied as part of the release
    Manifest { content: String },
    /// Run at lifecycle events by the hook scheduler
    Hook { content: String, meta: HookMeta },
}

impl RenderedFile {
    pub fn content(&self) -> &str {
        match self {
            Self::Manifest { content } | Self::Hook { content, .. } => content,
        }
    }

    pub fn hook(&self) -> Option<&HookMeta> {
        match self {
            Self::Hook { meta, .. } => Some(meta),
            Self::Manifest { .. } => None,
        }
    }
}

/// A hook ready for scheduling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookManifest {
    /// Output path the hook was rendered to
    pub path: String,
    pub content: String,
    pub meta: HookMeta,
}

/// Output of rendering a chart tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedOutput {
    /// Documents keyed by output path (`path` or `path#n` for multi-document
    /// templates), in render order
    pub files: IndexMap<String, RenderedFile>,

    /// Rendered `NOTES.txt` of the root chart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl RenderedOutput {
    /// Split one template's text into documents and classify each
    pub(crate) fn add_template(&mut self, path: &str, text: &str) -> Result<(), String> {
        let documents = split_documents(text);
        let multi = documents.len() > 1;

        for (index, doc) in documents.into_iter().enumerate() {
            let key = if multi {
                format!("{}#{}", path, index)
            } else {
                path.to_string()
            };
            let file = classify(&doc).map_err(|e| format!("document {}: {}", index, e))?;
            self.files.insert(key, file);
        }
        Ok(())
    }

    pub fn manifests(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().filter_map(|(path, file)| match file {
            RenderedFile::Manifest { content } => Some((path.as_str(), content.as_str())),
            RenderedFile::Hook { .. } => None,
        })
    }

    /// All non-hook documents as one multi-document stream
    pub fn manifest(&self) -> String {
        self.manifests()
            .map(|(path, content)| format!("---\n# Source: {}\n{}\n", path, content))
            .collect()
    }

    pub fn hooks(&self) -> Vec<HookManifest> {
        self.files
            .iter()
            .filter_map(|(path, file)| match file {
                RenderedFile::Hook { content, meta } => Some(HookManifest {
                    path: path.clone(),
                    content: content.clone(),
                    meta: meta.clone(),
                }),
                RenderedFile::Manifest { .. } => None,
            })
            .collect()
    }

    /// Hooks for one event, ordered by weight then name
    pub fn hooks_for(&self, event: HookEvent) -> Vec<HookManifest> {
        let mut hooks: Vec<_> = self
            .hooks()
            .into_iter()
            .filter(|h| h.meta.runs_on(event))
            .collect();
        sort_hooks(&mut hooks);
        hooks
    }
}

/// Order hooks by weight, then name
pub fn sort_hooks(hooks: &mut [HookManifest]) {
    hooks.sort_by(|a, b| {
        a.meta
            .weight
            .cmp(&b.meta.weight)
            .then_with(|| a.meta.name.cmp(&b.meta.name))
    });
}

#[derive(Deserialize, Default)]
struct DocumentHead {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    metadata: Option<HeadMetadata>,
}

#[derive(Deserialize, Default)]
struct HeadMetadata {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    annotations: BTreeMap<String, serde_yaml::Value>,
}

fn classify(doc: &str) -> Result<RenderedFile, String> {
    let head: DocumentHead =
        serde_yaml::from_str(doc).map_err(|e| format!("rendered output is not valid YAML: {}", e))?;
    let metadata = head.metadata.unwrap_or_default();

    let annotations: BTreeMap<String, String> = metadata
        .annotations
        .into_iter()
        .filter_map(|(k, v)| scalar_to_string(&v).map(|s| (k, s)))
        .collect();

    let name = metadata.name.unwrap_or_default();
    let kind = head.kind.unwrap_or_default();

    Ok(match parse_hook(&name, &kind, &annotations)? {
        Some(meta) => {
            if meta.name.is_empty() {
                return Err("hook has no metadata.name".to_string());
            }
            RenderedFile::Hook {
                content: doc.to_string(),
                meta,
            }
        }
        None => RenderedFile::Manifest {
            content: doc.to_string(),
        },
    })
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
