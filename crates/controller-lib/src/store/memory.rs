//! In-memory overlay store
//!
//! Tracks resource versions for optimistic concurrency and an explicit
//! owner uid -> object names relation so owner deletion can be simulated
//! with [`InMemoryOverlayStore::collect_garbage`].

use super::{LabelSelector, OverlayObject, OverlayStore, StoreError};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;
use tracing::debug;

/// A write recorded by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOperation {
    Create(String),
    Update(String),
    Delete(String),
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<String, OverlayObject>,
    owned: HashMap<String, BTreeSet<String>>,
    next_version: u64,
    operations: Vec<StoreOperation>,
}

impl Inner {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn link_owners(&mut self, overlay: &OverlayObject) {
        for owner in &overlay.owners {
            self.owned
                .entry(owner.uid.clone())
                .or_default()
                .insert(overlay.name.clone());
        }
    }

    fn unlink(&mut self, name: &str) {
        for names in self.owned.values_mut() {
            names.remove(name);
        }
        self.owned.retain(|_, names| !names.is_empty());
    }
}

/// Thread-safe in-memory [`OverlayStore`]
#[derive(Default)]
pub struct InMemoryOverlayStore {
    inner: RwLock<Inner>,
}

impl InMemoryOverlayStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object directly, bypassing the operation log
    pub fn seed(&self, mut overlay: OverlayObject) -> OverlayObject {
        let mut inner = self.write();
        overlay.resource_version = Some(inner.bump());
        inner.link_owners(&overlay);
        inner.objects.insert(overlay.name.clone(), overlay.clone());
        overlay
    }

    /// Delete every object owned by `owner_uid`, as the cluster garbage
    /// collector does when the owner disappears. Returns the deleted names.
    pub fn collect_garbage(&self, owner_uid: &str) -> Vec<String> {
        let mut inner = self.write();
        let names: Vec<String> = inner
            .owned
            .remove(owner_uid)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        for name in &names {
            if let Some(obj) = inner.objects.get_mut(name) {
                obj.owners.retain(|o| o.uid != owner_uid);
                // Objects with no remaining owners are collected
                if obj.owners.is_empty() {
                    inner.objects.remove(name);
                }
            }
        }
        debug!(owner_uid = %owner_uid, collected = names.len(), "Collected owned overlays");
        names
    }

    /// Names of objects currently owned by `owner_uid`
    pub fn owned_by(&self, owner_uid: &str) -> Vec<String> {
        self.read()
            .owned
            .get(owner_uid)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().objects.is_empty()
    }

    pub fn snapshot(&self) -> Vec<OverlayObject> {
        self.read().objects.values().cloned().collect()
    }

    /// Writes performed since creation or the last [`Self::take_operations`]
    pub fn take_operations(&self) -> Vec<StoreOperation> {
        std::mem::take(&mut self.write().operations)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl OverlayStore for InMemoryOverlayStore {
    async fn get(&self, name: &str) -> Result<Option<OverlayObject>, StoreError> {
        Ok(self.read().objects.get(name).cloned())
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<OverlayObject>, StoreError> {
        Ok(self
            .read()
            .objects
            .values()
            .filter(|o| o.matches(selector))
            .cloned()
            .collect())
    }

    async fn create(&self, overlay: &OverlayObject) -> Result<OverlayObject, StoreError> {
        let mut inner = self.write();
        if inner.objects.contains_key(&overlay.name) {
            return Err(StoreError::AlreadyExists(overlay.name.clone()));
        }

        let mut stored = overlay.clone();
        stored.resource_version = Some(inner.bump());
        inner.link_owners(&stored);
        inner.objects.insert(stored.name.clone(), stored.clone());
        inner
            .operations
            .push(StoreOperation::Create(stored.name.clone()));
        Ok(stored)
    }

    async fn update(&self, overlay: &OverlayObject) -> Result<OverlayObject, StoreError> {
        let mut inner = self.write();
        let current = inner
            .objects
            .get(&overlay.name)
            .ok_or_else(|| StoreError::NotFound(overlay.name.clone()))?;

        if current.resource_version != overlay.resource_version {
            return Err(StoreError::Conflict {
                name: overlay.name.clone(),
                expected: overlay.resource_version.clone(),
            });
        }

        let mut stored = overlay.clone();
        stored.resource_version = Some(inner.bump());
        inner.unlink(&stored.name);
        inner.link_owners(&stored);
        inner.objects.insert(stored.name.clone(), stored.clone());
        inner
            .operations
            .push(StoreOperation::Update(stored.name.clone()));
        Ok(stored)
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.write();
        if inner.objects.remove(name).is_none() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        inner.unlink(name);
        inner.operations.push(StoreOperation::Delete(name.to_string()));
        Ok(())
    }
}
