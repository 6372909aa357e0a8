//! Storage backends for release history
//!
//! Keel ships two backends:
//! - **Memory**: in-process, with operation counts for assertions
//! - **File**: one compressed JSON file per revision under a base directory
//!
//! Backends are the serialization point for concurrent transitions:
//! [`StorageBackend::create_if_absent`] only admits the next revision of a
//! release with no transition in flight, and status changes can be
//! compare-and-swapped.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::{MemoryStorage, OperationCounts};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ReleaseError, Result};
use crate::release::{ReleaseStatus, Revision};

/// Persistence for release revisions
///
/// Implementations must be Send + Sync for use across async tasks.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// One revision
    async fn get(&self, name: &str, revision: u32) -> Result<Revision>;

    /// All revisions of a release, ascending (empty when unknown)
    async fn list(&self, name: &str) -> Result<Vec<Revision>>;

    /// Record a new revision
    ///
    /// Fails with `ConcurrentModification` when the number is taken, is not
    /// the next one, or another revision of the release is pending.
    async fn create_if_absent(&self, revision: &Revision) -> Result<()>;

    /// Set the status of a revision
    async fn update_status(&self, name: &str, revision: u32, status: ReleaseStatus)
    -> Result<Revision>;

    /// Set the status only if it is still `expected`
    ///
    /// Entering a pending status additionally requires the revision to be the
    /// latest and no other revision to be pending.
    async fn compare_and_set_status(
        &self,
        name: &str,
        revision: u32,
        expected: &ReleaseStatus,
        status: ReleaseStatus,
    ) -> Result<Revision>;

    /// Remove one revision
    async fn delete(&self, name: &str, revision: u32) -> Result<Revision>;

    /// Remove every revision of a release
    async fn purge(&self, name: &str) -> Result<Vec<Revision>>;

    /// Names of all stored releases, sorted
    async fn list_names(&self) -> Result<Vec<String>>;

    /// Highest-numbered revision
    async fn latest(&self, name: &str) -> Result<Option<Revision>> {
        Ok(self.list(name).await?.pop())
    }
}

/// Admission check shared by backends, run under the backend's lock
pub(crate) fn check_create(existing: &[Revision], revision: &Revision) -> Result<()> {
    let conflict = |reason: String| ReleaseError::conflict(&revision.name, revision.revision, reason);

    if existing.iter().any(|r| r.revision == revision.revision) {
        return Err(conflict(format!("revision {} already exists", revision.revision)));
    }
    if let Some(pending) = existing.iter().find(|r| r.status.is_pending()) {
        return Err(conflict(format!(
            "revision {} is {}",
            pending.revision, pending.status
        )));
    }
    let next = existing.iter().map(|r| r.revision).max().unwrap_or(0) + 1;
    if revision.revision != next {
        return Err(conflict(format!("next revision is {}", next)));
    }
    Ok(())
}

/// Status compare-and-swap check shared by backends, run under the backend's lock
///
/// Entering a pending status is admitted like a create: only for the latest
/// revision, and only while no other revision of the release is pending.
pub(crate) fn check_status_change(
    existing: &[Revision],
    name: &str,
    revision: u32,
    expected: &ReleaseStatus,
    status: &ReleaseStatus,
) -> Result<()> {
    let record = existing
        .iter()
        .find(|r| r.revision == revision)
        .ok_or_else(|| ReleaseError::not_found(name, Some(revision)))?;
    if &record.status != expected {
        return Err(ReleaseError::conflict(
            name,
            revision,
            format!("expected status {}, found {}", expected, record.status),
        ));
    }
    if !status.is_pending() {
        return Ok(());
    }
    if let Some(pending) = existing
        .iter()
        .find(|r| r.revision != revision && r.status.is_pending())
    {
        return Err(ReleaseError::conflict(
            name,
            revision,
            format!("revision {} is {}", pending.revision, pending.status),
        ));
    }
    let latest = existing.iter().map(|r| r.revision).max().unwrap_or(0);
    if revision != latest {
        return Err(ReleaseError::conflict(
            name,
            revision,
            format!("revision {} is newer", latest),
        ));
    }
    Ok(())
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Compression applied to stored revisions
    #[serde(default)]
    pub compression: CompressionMethod,
}

impl StorageConfig {
    pub fn with_compression(mut self, compression: CompressionMethod) -> Self {
        self.compression = compression;
        self
    }
}

/// Compression method for release data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum CompressionMethod {
    /// No compression
    None,

    /// Gzip compression
    Gzip { level: u32 },

    /// Zstd compression (better ratio, faster)
    Zstd { level: i32 },
}

impl Default for CompressionMethod {
    fn default() -> Self {
        Self::Zstd { level: 3 }
    }
}

/// Compress data using the configured method
#[must_use = "compression result should be used"]
pub fn compress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Gzip { level } => {
            use std::io::Write;
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(level));
            encoder
                .write_all(data)
                .map_err(|e| ReleaseError::Compression(e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| ReleaseError::Compression(e.to_string()))
        }
        CompressionMethod::Zstd { level } => zstd::encode_all(std::io::Cursor::new(data), level)
            .map_err(|e| ReleaseError::Compression(e.to_string())),
    }
}

/// Decompress data
#[must_use = "decompression result should be used"]
pub fn decompress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Gzip { .. } => {
            use std::io::Read;
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| ReleaseError::Compression(e.to_string()))?;
            Ok(decompressed)
        }
        CompressionMethod::Zstd { .. } => zstd::decode_all(std::io::Cursor::new(data))
            .map_err(|e| ReleaseError::Compression(e.to_string())),
    }
}

/// Serialize and compress a revision
pub fn encode_revision(revision: &Revision, config: &StorageConfig) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(revision)?;
    compress(&json, config.compression)
}

/// Decompress and deserialize a revision
pub fn decode_revision(data: &[u8], config: &StorageConfig) -> Result<Revision> {
    let json = decompress(data, config.compression)?;
    Ok(serde_json::from_slice(&json)?)
}
