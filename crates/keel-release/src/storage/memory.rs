//! In-memory storage backend
//!
//! Keeps revisions in process memory, useful for tests and embedders that
//! persist history elsewhere.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{StorageBackend, check_create, check_status_change};
use crate::error::{ReleaseError, Result};
use crate::release::{ReleaseStatus, Revision};

type Store = HashMap<String, BTreeMap<u32, Revision>>;

/// In-memory storage backend
#[derive(Clone, Default)]
pub struct MemoryStorage {
    /// name -> revision -> record
    store: Arc<RwLock<Store>>,
    /// Track operation counts for assertions
    operations: Arc<RwLock<OperationCounts>>,
}

/// Counts of operations performed for testing assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OperationCounts {
    pub gets: usize,
    pub lists: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with pre-populated revisions
    pub fn with_revisions(revisions: Vec<Revision>) -> Self {
        let storage = Self::new();
        {
            let mut store = storage.write_store();
            for revision in revisions {
                store
                    .entry(revision.name.clone())
                    .or_default()
                    .insert(revision.revision, revision);
            }
        }
        storage
    }

    /// Get operation counts for assertions
    pub fn operation_counts(&self) -> OperationCounts {
        match self.operations.read() {
            Ok(ops) => ops.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn reset_counts(&self) {
        *self.count() = OperationCounts::default();
    }

    /// Total number of stored revisions
    pub fn revision_count(&self) -> usize {
        self.read_store().values().map(BTreeMap::len).sum()
    }

    fn count(&self) -> RwLockWriteGuard<'_, OperationCounts> {
        match self.operations.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn read_store(&self) -> RwLockReadGuard<'_, Store> {
        match self.store.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_store(&self) -> RwLockWriteGuard<'_, Store> {
        match self.store.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn modify(
        &self,
        name: &str,
        revision: u32,
        apply: impl FnOnce(&mut Revision) -> Result<()>,
    ) -> Result<Revision> {
        self.count().updates += 1;

        let mut store = self.write_store();
        let record = store
            .get_mut(name)
            .and_then(|revisions| revisions.get_mut(&revision))
            .ok_or_else(|| ReleaseError::not_found(name, Some(revision)))?;
        apply(record)?;
        Ok(record.clone())
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn get(&self, name: &str, revision: u32) -> Result<Revision> {
        self.count().gets += 1;

        self.read_store()
            .get(name)
            .and_then(|revisions| revisions.get(&revision))
            .cloned()
            .ok_or_else(|| ReleaseError::not_found(name, Some(revision)))
    }

    async fn list(&self, name: &str) -> Result<Vec<Revision>> {
        self.count().lists += 1;

        Ok(self
            .read_store()
            .get(name)
            .map(|revisions| revisions.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_if_absent(&self, revision: &Revision) -> Result<()> {
        self.count().creates += 1;

        let mut store = self.write_store();
        let revisions = store.entry(revision.name.clone()).or_default();
        let existing: Vec<Revision> = revisions.values().cloned().collect();
        check_create(&existing, revision)?;
        revisions.insert(revision.revision, revision.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        name: &str,
        revision: u32,
        status: ReleaseStatus,
    ) -> Result<Revision> {
        self.modify(name, revision, |record| {
            record.transition(status);
            Ok(())
        })
    }

    async fn compare_and_set_status(
        &self,
        name: &str,
        revision: u32,
        expected: &ReleaseStatus,
        status: ReleaseStatus,
    ) -> Result<Revision> {
        self.count().updates += 1;

        let mut store = self.write_store();
        let revisions = store
            .get_mut(name)
            .ok_or_else(|| ReleaseError::not_found(name, Some(revision)))?;
        let existing: Vec<Revision> = revisions.values().cloned().collect();
        check_status_change(&existing, name, revision, expected, &status)?;
        let record = revisions
            .get_mut(&revision)
            .ok_or_else(|| ReleaseError::not_found(name, Some(revision)))?;
        record.transition(status);
        Ok(record.clone())
    }

    async fn delete(&self, name: &str, revision: u32) -> Result<Revision> {
        self.count().deletes += 1;

        let mut store = self.write_store();
        let removed = store
            .get_mut(name)
            .and_then(|revisions| revisions.remove(&revision))
            .ok_or_else(|| ReleaseError::not_found(name, Some(revision)))?;
        if store.get(name).is_some_and(BTreeMap::is_empty) {
            store.remove(name);
        }
        Ok(removed)
    }

    async fn purge(&self, name: &str) -> Result<Vec<Revision>> {
        self.count().deletes += 1;

        let removed: Vec<Revision> = self
            .write_store()
            .remove(name)
            .map(|revisions| revisions.into_values().collect())
            .unwrap_or_default();
        if removed.is_empty() {
            return Err(ReleaseError::not_found(name, None));
        }
        Ok(removed)
    }

    async fn list_names(&self) -> Result<Vec<String>> {
        self.count().lists += 1;

        let mut names: Vec<String> = self
            .read_store()
            .iter()
            .filter(|(_, revisions)| !revisions.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}
