//! Files API for accessing chart files from templates
//!
//! Templates may read the non-template files of their own chart scope. A
//! subchart sees only its own files, never its parent's or siblings'.
//!
//! # Security
//!
//! - All paths are resolved relative to the chart root
//! - Absolute paths are rejected
//! - `..` components that climb above the chart root are rejected
//!
//! # Example
//!
//! ```jinja2
//! data:
//!   nginx.conf: {{ files.get("config/nginx.conf") | b64encode }}
//!
//! {% for file in files.glob("scripts/*.sh") %}
//!   {{ file.name }}: {{ file.content | b64encode }}
//! {% endfor %}
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::chart::Chart;
use crate::error::{CoreError, Result};

/// Trait for file access providers
pub trait FileProvider: Send + Sync {
    /// Read the contents of a file as bytes
    fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Check if a file exists
    fn exists(&self, path: &str) -> bool;

    /// List files matching a glob pattern, sorted by path
    fn glob(&self, pattern: &str) -> Result<Vec<FileEntry>>;

    /// Read a file as lines
    fn lines(&self, path: &str) -> Result<Vec<String>> {
        let content = self.get_string(path)?;
        Ok(content.lines().map(String::from).collect())
    }

    /// Read the contents of a file as a string (UTF-8)
    fn get_string(&self, path: &str) -> Result<String> {
        let bytes = self.get(path)?;
        String::from_utf8(bytes).map_err(|e| CoreError::FileAccess {
            path: path.to_string(),
            message: format!("file is not valid UTF-8: {}", e),
        })
    }
}

/// A file entry returned by glob operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative path from chart root
    pub path: String,
    /// File name (without directory)
    pub name: String,
    /// File content as string (UTF-8 lossy)
    pub content: String,
    /// File size in bytes
    pub size: usize,
}

/// In-memory provider over one chart's files
#[derive(Debug, Default, Clone)]
pub struct ChartFileProvider {
    files: Arc<BTreeMap<String, Vec<u8>>>,
}

impl ChartFileProvider {
    /// Provider over the files of `chart` (not its subcharts)
    pub fn for_chart(chart: &Chart) -> Self {
        Self {
            files: Arc::new(chart.files.clone()),
        }
    }

    /// Provider over an explicit file set
    pub fn from_files(files: BTreeMap<String, Vec<u8>>) -> Self {
        Self {
            files: Arc::new(files),
        }
    }
}

impl FileProvider for ChartFileProvider {
    fn get(&self, path: &str) -> Result<Vec<u8>> {
        let normalized = normalize_path(path)?;
        self.files
            .get(&normalized)
            .cloned()
            .ok_or_else(|| CoreError::FileAccess {
                path: path.to_string(),
                message: "file not found".to_string(),
            })
    }

    fn exists(&self, path: &str) -> bool {
        normalize_path(path).is_ok_and(|p| self.files.contains_key(&p))
    }

    fn glob(&self, pattern: &str) -> Result<Vec<FileEntry>> {
        if pattern.starts_with('/') || pattern.split('/').any(|c| c == "..") {
            return Err(CoreError::FileAccess {
                path: pattern.to_string(),
                message: "glob patterns must stay inside the chart directory".to_string(),
            });
        }

        let glob_pattern = glob::Pattern::new(pattern).map_err(|e| CoreError::GlobPattern {
            message: format!("invalid glob pattern '{}': {}", pattern, e),
        })?;

        // BTreeMap iteration is already sorted by path
        Ok(self
            .files
            .iter()
            .filter(|(path, _)| glob_pattern.matches(path))
            .map(|(path, content)| FileEntry {
                path: path.clone(),
                name: path.rsplit('/').next().unwrap_or(path).to_string(),
                content: String::from_utf8_lossy(content).to_string(),
                size: content.len(),
            })
            .collect())
    }
}

/// Resolve `.` and `..` lexically, rejecting anything outside the root
fn normalize_path(path: &str) -> Result<String> {
    if path.starts_with('/') || path.starts_with('\\') || path.get(1..2) == Some(":") {
        return Err(CoreError::FileAccess {
            path: path.to_string(),
            message: "absolute paths are not allowed in templates".to_string(),
        });
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in path.split(['/', '\\']) {
        match component {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(CoreError::FileAccess {
                        path: path.to_string(),
                        message: "path escapes chart directory (sandbox violation)".to_string(),
                    });
                }
            }
            other => parts.push(other),
        }
    }
    Ok(parts.join("/"))
}

/// A wrapper that provides the Files API to templates
///
/// This struct is what gets injected into the template context as `files`.
#[derive(Clone)]
pub struct Files {
    provider: Arc<dyn FileProvider>,
}

impl Files {
    /// Create a new Files wrapper from a provider
    pub fn new(provider: impl FileProvider + 'static) -> Self {
        Self {
            provider: Arc::new(provider),
        }
    }

    /// Files scoped to a single chart
    pub fn for_chart(chart: &Chart) -> Self {
        Self::new(ChartFileProvider::for_chart(chart))
    }

    /// Get file contents as string
    pub fn get(&self, path: &str) -> Result<String> {
        self.provider.get_string(path)
    }

    /// Get file contents as bytes
    pub fn get_bytes(&self, path: &str) -> Result<Vec<u8>> {
        self.provider.get(path)
    }

    /// Check if file exists
    pub fn exists(&self, path: &str) -> bool {
        self.provider.exists(path)
    }

    /// Glob for files
    pub fn glob(&self, pattern: &str) -> Result<Vec<FileEntry>> {
        self.provider.glob(pattern)
    }

    /// Read file as lines
    pub fn lines(&self, path: &str) -> Result<Vec<String>> {
        self.provider.lines(path)
    }
}

impl std::fmt::Debug for Files {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Files").finish_non_exhaustive()
    }
}
