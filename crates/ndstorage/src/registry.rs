//! Shared-ownership tracking for storages that alias one buffer.
//!
//! Every physical allocation gets a *bucket*: the storage that created it
//! (the root) plus every view derived from it. A view's free only leaves the
//! bucket; the free of the last member deletes the bucket and releases the
//! buffer.
//!
//! *Recording scopes* capture every storage registered while they are active
//! so that temporaries (for example those of a backward pass) can be released
//! in one call:
//!
//! ```
//! use std::sync::Arc;
//! use ndstorage::{Backend, CpuBackend, Registry, Storage};
//!
//! let mut registry = Registry::new();
//! let backend: Arc<dyn Backend> = Arc::new(CpuBackend::new());
//! let kept = Storage::init(&mut registry, &backend, &[2]).unwrap();
//!
//! registry
//!     .with_recording(|registry| {
//!         let scratch = Storage::init(registry, &backend, &[1024])?;
//!         scratch.fill(1.0)
//!     })
//!     .unwrap();
//!
//! // only `kept` is still tracked
//! assert_eq!(registry.len(), 1);
//! # kept.free(&mut registry).unwrap();
//! ```

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::error::TensorError;
use crate::storage::{Storage, StorageSnapshot};

/// Id of a recording scope.
pub type RecordId = u64;

/// One physical allocation and every live storage viewing it.
#[derive(Debug)]
struct Bucket {
    root: StorageSnapshot,
    members: HashMap<Uuid, Storage>,
}

#[derive(Debug, Default)]
struct Record {
    active: bool,
    captured: HashSet<Uuid>,
}

/// Tracks buckets of aliasing storages and recording scopes.
///
/// A plain value: create one per session (or per test) and pass it to every
/// storage operation that creates or frees storages.
#[derive(Debug, Default)]
pub struct Registry {
    buckets: HashMap<Uuid, Bucket>,
    /// member id -> bucket key (the root id)
    owners: HashMap<Uuid, Uuid>,
    records: HashMap<RecordId, Record>,
    next_record: RecordId,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `storage`, as a new bucket root or as a view of `parent`.
    ///
    /// Registering an id that is already tracked is a no-op. The new member
    /// is mirrored into every active recording scope.
    ///
    /// # Errors
    ///
    /// `ParentNotRegistered` if `parent` is not tracked.
    pub fn register(
        &mut self,
        storage: &Storage,
        parent: Option<&Storage>,
    ) -> Result<(), TensorError> {
        let id = storage.id();
        if self.owners.contains_key(&id) {
            return Ok(());
        }

        match parent {
            None => {
                let mut members = HashMap::new();
                members.insert(id, storage.alias()?);
                self.buckets.insert(
                    id,
                    Bucket {
                        root: storage.snapshot(),
                        members,
                    },
                );
                self.owners.insert(id, id);
            }
            Some(parent) => {
                let key = *self
                    .owners
                    .get(&parent.id())
                    .ok_or(TensorError::ParentNotRegistered(parent.id()))?;
                let handle = storage.alias()?;
                if let Some(bucket) = self.buckets.get_mut(&key) {
                    bucket.members.insert(id, handle);
                }
                self.owners.insert(id, key);
            }
        }

        for record in self.records.values_mut().filter(|r| r.active) {
            record.captured.insert(id);
        }
        tracing::trace!(%id, parent = ?parent.map(Storage::id), "registry_register");
        Ok(())
    }

    /// Remove `storage` from its bucket and from every recording scope.
    ///
    /// Does not release the buffer. A bucket emptied by this call is deleted.
    ///
    /// # Errors
    ///
    /// `NotRegistered` if `storage` is not tracked.
    pub fn deregister(&mut self, storage: &Storage) -> Result<(), TensorError> {
        self.remove_member(storage.id()).map(drop)
    }

    /// Remove `storage` and delete its bucket, which must hold nothing else.
    ///
    /// This is the path for freeing the last member of a bucket. On error the
    /// registry is left unchanged.
    ///
    /// # Errors
    ///
    /// `NotRegistered` if `storage` is not tracked, `BucketNotEmpty` if other
    /// members remain.
    pub fn deregister_and_delete_bucket(&mut self, storage: &Storage) -> Result<(), TensorError> {
        let id = storage.id();
        let size = self.bucket_size_of(id);
        if size == 0 {
            return Err(TensorError::NotRegistered(id));
        }
        if size > 1 {
            return Err(TensorError::BucketNotEmpty {
                remaining: size - 1,
            });
        }
        self.remove_member(id).map(drop)
    }

    /// Snapshot of the root of `storage`'s bucket.
    pub fn root(&self, storage: &Storage) -> Option<&StorageSnapshot> {
        let key = self.owners.get(&storage.id())?;
        self.buckets.get(key).map(|bucket| &bucket.root)
    }

    /// Number of live members in `storage`'s bucket (0 if not tracked).
    pub fn bucket_size(&self, storage: &Storage) -> usize {
        self.bucket_size_of(storage.id())
    }

    /// Whether `storage` is tracked.
    pub fn is_registered(&self, storage: &Storage) -> bool {
        self.owners.contains_key(&storage.id())
    }

    /// Number of tracked storages across all buckets.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    /// Check if no storage is tracked.
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Number of buckets (distinct physical allocations).
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Open a recording scope. Scopes may nest and overlap.
    pub fn start_recording(&mut self) -> RecordId {
        let id = self.next_record;
        self.next_record += 1;
        self.records.insert(
            id,
            Record {
                active: true,
                captured: HashSet::new(),
            },
        );
        tracing::trace!(record = id, "recording_start");
        id
    }

    /// Freeze a scope's captured set; it is kept for a later bulk free.
    ///
    /// # Errors
    ///
    /// `RecordNotFound` for an unknown id.
    pub fn stop_recording(&mut self, record: RecordId) -> Result<(), TensorError> {
        let entry = self
            .records
            .get_mut(&record)
            .ok_or(TensorError::RecordNotFound(record))?;
        entry.active = false;
        Ok(())
    }

    /// Number of storages captured by a scope and still tracked.
    pub fn record_len(&self, record: RecordId) -> Result<usize, TensorError> {
        self.records
            .get(&record)
            .map(|r| r.captured.len())
            .ok_or(TensorError::RecordNotFound(record))
    }

    /// Free every storage a scope captured and drop the scope.
    ///
    /// Keeps going past individual failures and returns the first error.
    ///
    /// # Errors
    ///
    /// `RecordNotFound` for an unknown id, otherwise the first release error.
    pub fn free_all_from_record(&mut self, record: RecordId) -> Result<(), TensorError> {
        let entry = self
            .records
            .remove(&record)
            .ok_or(TensorError::RecordNotFound(record))?;

        let mut first_error = None;
        let mut freed = 0usize;
        for id in entry.captured {
            match self.release(id) {
                Ok(()) => freed += 1,
                Err(err) => {
                    tracing::debug!(%id, error = %err, "record_free_failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        tracing::debug!(record, freed, "recording_freed");
        first_error.map_or(Ok(()), Err)
    }

    /// Run `f` inside a recording scope and free everything it registered,
    /// whether `f` succeeds or not.
    ///
    /// A storage created inside `f` cannot outlive the scope: returning it
    /// hands back a released handle that fails with `NotInitialized`. Write
    /// results into a destination created before the call, or return plain
    /// values such as `f32` or `Vec<f32>`.
    ///
    /// An error from `f` takes precedence over a release error.
    pub fn with_recording<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, TensorError>,
    ) -> Result<T, TensorError> {
        let record = self.start_recording();
        let result = f(self);
        let stopped = self.stop_recording(record);
        let freed = self.free_all_from_record(record);
        let value = result?;
        stopped?;
        freed?;
        Ok(value)
    }

    fn bucket_size_of(&self, id: Uuid) -> usize {
        self.owners
            .get(&id)
            .and_then(|key| self.buckets.get(key))
            .map_or(0, |bucket| bucket.members.len())
    }

    /// Remove a member and return its registry handle. Deletes the bucket if
    /// it becomes empty.
    fn remove_member(&mut self, id: Uuid) -> Result<(Storage, bool), TensorError> {
        let key = self.owners.remove(&id).ok_or(TensorError::NotRegistered(id))?;
        for record in self.records.values_mut() {
            record.captured.remove(&id);
        }
        let bucket = self
            .buckets
            .get_mut(&key)
            .ok_or(TensorError::NotRegistered(id))?;
        let handle = bucket
            .members
            .remove(&id)
            .ok_or(TensorError::NotRegistered(id))?;
        let emptied = bucket.members.is_empty();
        if emptied {
            self.buckets.remove(&key);
        }
        tracing::trace!(%id, emptied, "registry_deregister");
        Ok((handle, emptied))
    }

    /// Free path for a member known only by id.
    fn release(&mut self, id: Uuid) -> Result<(), TensorError> {
        let (handle, emptied) = self.remove_member(id)?;
        if emptied {
            handle.backend().free(handle.data())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, CpuBackend};
    use std::sync::Arc;

    fn cpu() -> Arc<dyn Backend> {
        Arc::new(CpuBackend::new())
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = Registry::new();
        let s = Storage::init(&mut registry, &cpu(), &[2]).unwrap();
        registry.register(&s, None).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.bucket_size(&s), 1);
    }

    #[test]
    fn test_register_unknown_parent() {
        let mut registry = Registry::new();
        let mut other = Registry::new();
        let parent = Storage::init(&mut other, &cpu(), &[2]).unwrap();
        let data = parent.backend().shallow_copy(parent.data()).unwrap();
        let child = Storage::from_parts(Arc::clone(parent.backend()), data);
        assert_eq!(
            registry.register(&child, Some(&parent)).unwrap_err(),
            TensorError::ParentNotRegistered(parent.id())
        );
    }

    #[test]
    fn test_delete_bucket_with_members_left() {
        let mut registry = Registry::new();
        let root = Storage::init(&mut registry, &cpu(), &[2]).unwrap();
        let view = root.shallow_copy(&mut registry).unwrap();
        assert_eq!(
            registry.deregister_and_delete_bucket(&root).unwrap_err(),
            TensorError::BucketNotEmpty { remaining: 1 }
        );
        // unchanged on error
        assert_eq!(registry.bucket_size(&view), 2);
    }

    #[test]
    fn test_deregister_removes_from_records() {
        let mut registry = Registry::new();
        let record = registry.start_recording();
        let s = Storage::init(&mut registry, &cpu(), &[2]).unwrap();
        assert_eq!(registry.record_len(record).unwrap(), 1);
        registry.deregister(&s).unwrap();
        assert_eq!(registry.record_len(record).unwrap(), 0);
        assert_eq!(
            registry.deregister(&s).unwrap_err(),
            TensorError::NotRegistered(s.id())
        );
    }

    #[test]
    fn test_nested_records() {
        let mut registry = Registry::new();
        let outer = registry.start_recording();
        let a = Storage::init(&mut registry, &cpu(), &[1]).unwrap();
        let inner = registry.start_recording();
        let b = a.shallow_copy(&mut registry).unwrap();
        registry.stop_recording(inner).unwrap();
        let _c = Storage::init(&mut registry, &cpu(), &[1]).unwrap();
        registry.stop_recording(outer).unwrap();

        assert_eq!(registry.record_len(outer).unwrap(), 3);
        assert_eq!(registry.record_len(inner).unwrap(), 1);

        registry.free_all_from_record(inner).unwrap();
        assert!(!registry.is_registered(&b));
        assert_eq!(registry.record_len(outer).unwrap(), 2);
        registry.free_all_from_record(outer).unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.bucket_count(), 0);
    }

    #[test]
    fn test_stop_unknown_record() {
        let mut registry = Registry::new();
        assert_eq!(
            registry.stop_recording(9).unwrap_err(),
            TensorError::RecordNotFound(9)
        );
        assert_eq!(
            registry.free_all_from_record(9).unwrap_err(),
            TensorError::RecordNotFound(9)
        );
    }

    #[test]
    fn test_with_recording_frees_on_error() {
        let mut registry = Registry::new();
        let backend = cpu();
        let err = registry
            .with_recording(|registry| -> Result<(), TensorError> {
                Storage::init(registry, &backend, &[4])?;
                Storage::init(registry, &backend, &[1; 9])?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, TensorError::RankExceeded { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_root_snapshot_survives_root_free() {
        let mut registry = Registry::new();
        let root = Storage::init(&mut registry, &cpu(), &[3]).unwrap();
        let root_id = root.id();
        let view = root.shallow_copy(&mut registry).unwrap();
        root.free(&mut registry).unwrap();
        let snapshot = registry.root(&view).unwrap();
        assert_eq!(snapshot.id, root_id);
        assert_eq!(snapshot.backend, CpuBackend::NAME);
        assert_eq!(view.to_vec().unwrap(), vec![0.0; 3]);
    }
}
