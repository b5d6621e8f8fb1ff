//! Object store abstraction for overlay objects
//!
//! The reconciler only needs label-filtered listing and per-object
//! create/update/delete with an optimistic-concurrency token. Two backends
//! are provided: the Kubernetes API (`NodeOverlay` objects) and an
//! in-memory store used by tests and dry runs.

mod kube;
mod memory;

pub use self::kube::{KubeOverlayStore, NodeOverlay, NodeOverlaySpec, OverlayRequirement};
pub use memory::{InMemoryOverlayStore, StoreOperation};

use crate::generator::GeneratedOverlay;
use crate::models::{OwnerRef, Requirement};
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

/// Label equality selector
pub type LabelSelector = BTreeMap<String, String>;

/// An overlay as held by the store
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayObject {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub owners: Vec<OwnerRef>,
    /// Optimistic-concurrency token; `None` for objects not yet stored
    pub resource_version: Option<String>,
    pub requirements: Vec<Requirement>,
    pub weight: i32,
    pub price_adjustment: String,
}

impl OverlayObject {
    /// Build the object to write for a generated overlay
    pub fn from_generated(overlay: &GeneratedOverlay) -> Self {
        Self {
            name: overlay.name.clone(),
            labels: overlay.labels.clone(),
            owners: overlay.owners.clone(),
            resource_version: None,
            requirements: overlay.requirements.clone(),
            weight: overlay.weight,
            price_adjustment: overlay.price_adjustment.clone(),
        }
    }

    pub fn matches(&self, selector: &LabelSelector) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).map(|l| l == v).unwrap_or(false))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("overlay '{0}' not found")]
    NotFound(String),

    #[error("overlay '{0}' already exists")]
    AlreadyExists(String),

    #[error("overlay '{name}' was modified concurrently (resource version {expected:?})")]
    Conflict {
        name: String,
        expected: Option<String>,
    },

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Conflicts resolve themselves on the next read-modify-write cycle
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Verbs the reconciler issues against the backing store
#[async_trait]
pub trait OverlayStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<OverlayObject>, StoreError>;

    /// List overlays carrying every label in `selector`
    async fn list(&self, selector: &LabelSelector) -> Result<Vec<OverlayObject>, StoreError>;

    async fn create(&self, overlay: &OverlayObject) -> Result<OverlayObject, StoreError>;

    /// Replace an overlay; `overlay.resource_version` must match the stored one
    async fn update(&self, overlay: &OverlayObject) -> Result<OverlayObject, StoreError>;

    async fn delete(&self, name: &str) -> Result<(), StoreError>;
}
