//! Reconciliation of desired overlays against the object store
//!
//! A pass lists the managed overlays of one [`OwnershipScope`], diffs them
//! against the desired set and applies each create/update/delete on its
//! own. Only the list can fail a pass; per-object failures are counted and
//! logged while the rest of the batch proceeds.

use crate::generator::GeneratedOverlay;
use crate::models::{OverlayType, OwnerRef, MANAGED_BY_LABEL, MANAGED_BY_VALUE, SOURCE_LABEL, TYPE_LABEL};
use crate::observability::{MetricsSink, StructuredLogger};
use crate::store::{LabelSelector, OverlayObject, OverlayStore, StoreError};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// The subset of managed overlays one pass is responsible for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipScope {
    pub overlay_type: OverlayType,
    /// Restricts the scope to one source label value; `None` spans all
    pub source: Option<String>,
}

impl OwnershipScope {
    pub fn new(overlay_type: OverlayType, source: Option<String>) -> Self {
        Self {
            overlay_type,
            source,
        }
    }

    /// Preference overlays of one NodePool
    pub fn nodepool(name: impl Into<String>) -> Self {
        Self::new(OverlayType::Preference, Some(name.into()))
    }

    /// Label selector for the scope
    pub fn selector(&self) -> LabelSelector {
        let mut selector = LabelSelector::new();
        selector.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        selector.insert(TYPE_LABEL.to_string(), self.overlay_type.as_label().to_string());
        if let Some(source) = &self.source {
            selector.insert(SOURCE_LABEL.to_string(), source.clone());
        }
        selector
    }
}

impl fmt::Display for OwnershipScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}/{}", self.overlay_type, source),
            None => write!(f, "{}/*", self.overlay_type),
        }
    }
}

/// Store verb issued by a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconcileOp {
    Create,
    Update,
    Delete,
}

impl ReconcileOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOp::Create => "create",
            ReconcileOp::Update => "update",
            ReconcileOp::Delete => "delete",
        }
    }
}

/// Outcome counts of one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileCounts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub errors: usize,
}

impl ReconcileCounts {
    pub fn changes(&self) -> usize {
        self.created + self.updated + self.deleted
    }

    /// `success`, `partial` or `failed`, as exported on the pass counter
    pub fn result(&self) -> &'static str {
        match (self.errors, self.changes()) {
            (0, _) => "success",
            (_, 0) => "failed",
            _ => "partial",
        }
    }

    pub fn merge(&mut self, other: ReconcileCounts) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.unchanged += other.unchanged;
        self.errors += other.errors;
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to list overlays for {scope}: {source}")]
    List {
        scope: String,
        #[source]
        source: StoreError,
    },
}

/// True when `existing` must be rewritten to match `desired`.
///
/// Requirements (including order), weight and price adjustment must be
/// equal; desired labels must be present with the same value, while extra
/// labels on the existing object are ignored. Every desired owner must be
/// referenced by uid.
pub fn overlay_differs(desired: &GeneratedOverlay, existing: &OverlayObject) -> bool {
    if desired.requirements != existing.requirements
        || desired.weight != existing.weight
        || desired.price_adjustment != existing.price_adjustment
    {
        return true;
    }

    let labels_missing = desired
        .labels
        .iter()
        .any(|(k, v)| existing.labels.get(k) != Some(v));
    if labels_missing {
        return true;
    }

    let existing_owners: BTreeSet<&str> = existing.owners.iter().map(|o| o.uid.as_str()).collect();
    desired
        .owners
        .iter()
        .any(|o| !existing_owners.contains(o.uid.as_str()))
}

fn is_managed(obj: &OverlayObject) -> bool {
    obj.labels.get(MANAGED_BY_LABEL).map(String::as_str) == Some(MANAGED_BY_VALUE)
}

/// Operations needed to move the store to the desired state
#[derive(Debug, Clone, Default)]
pub struct ReconciliationPlan {
    pub creates: Vec<GeneratedOverlay>,
    /// Desired overlay with the stored object it replaces
    pub updates: Vec<(GeneratedOverlay, OverlayObject)>,
    pub deletes: Vec<OverlayObject>,
    pub unchanged: usize,
}

impl ReconciliationPlan {
    /// Diff by name. Existing objects without the managed-by marker are
    /// never deleted; a repeated desired name keeps its first occurrence.
    pub fn compute(desired: &[GeneratedOverlay], existing: &[OverlayObject]) -> Self {
        let existing_by_name: BTreeMap<&str, &OverlayObject> =
            existing.iter().map(|o| (o.name.as_str(), o)).collect();
        let mut plan = Self::default();
        let mut seen = BTreeSet::new();

        for overlay in desired {
            if !seen.insert(overlay.name.as_str()) {
                debug!(overlay = %overlay.name, "Ignoring repeated desired overlay");
                continue;
            }
            match existing_by_name.get(overlay.name.as_str()) {
                None => plan.creates.push(overlay.clone()),
                Some(current) if overlay_differs(overlay, current) => {
                    plan.updates.push((overlay.clone(), (*current).clone()))
                }
                Some(_) => plan.unchanged += 1,
            }
        }

        plan.deletes = existing
            .iter()
            .filter(|o| !seen.contains(o.name.as_str()) && is_managed(o))
            .cloned()
            .collect();

        plan
    }

    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Applies reconciliation plans against an [`OverlayStore`]
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn OverlayStore>,
    metrics: Arc<dyn MetricsSink>,
    logger: StructuredLogger,
    controller_owner: Option<OwnerRef>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn OverlayStore>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            store,
            metrics,
            logger: StructuredLogger::new("reconciler"),
            controller_owner: None,
        }
    }

    /// Attach an extra owner reference (the controller Deployment) to
    /// every overlay written
    pub fn with_controller_owner(mut self, owner: Option<OwnerRef>) -> Self {
        self.controller_owner = owner;
        self
    }

    pub fn store(&self) -> &Arc<dyn OverlayStore> {
        &self.store
    }

    /// List the managed overlays of a scope
    pub async fn list_managed(
        &self,
        scope: &OwnershipScope,
    ) -> Result<Vec<OverlayObject>, ReconcileError> {
        self.store
            .list(&scope.selector())
            .await
            .map_err(|source| ReconcileError::List {
                scope: scope.to_string(),
                source,
            })
    }

    /// Run one pass for `scope`
    pub async fn reconcile(
        &self,
        scope: &OwnershipScope,
        mut desired: Vec<GeneratedOverlay>,
    ) -> Result<ReconcileCounts, ReconcileError> {
        let existing = match self.list_managed(scope).await {
            Ok(existing) => existing,
            Err(e) => {
                self.metrics.record_pass(scope.overlay_type, "failed");
                return Err(e);
            }
        };

        if let Some(owner) = &self.controller_owner {
            for overlay in &mut desired {
                if !overlay.owners.iter().any(|o| o.uid == owner.uid) {
                    overlay.owners.push(owner.clone());
                }
            }
        }

        let plan = ReconciliationPlan::compute(&desired, &existing);
        let counts = self.apply(scope.overlay_type, plan).await;

        self.metrics.record_pass(scope.overlay_type, counts.result());
        self.logger
            .log_reconcile(scope.overlay_type, scope.source.as_deref(), &counts);
        Ok(counts)
    }

    /// Apply a plan; each operation succeeds or fails on its own
    pub async fn apply(&self, origin: OverlayType, plan: ReconciliationPlan) -> ReconcileCounts {
        let mut counts = ReconcileCounts {
            unchanged: plan.unchanged,
            ..Default::default()
        };

        for overlay in &plan.creates {
            let result = match overlay.validate() {
                Ok(()) => self
                    .store
                    .create(&OverlayObject::from_generated(overlay))
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            self.record(origin, ReconcileOp::Create, &overlay.name, result, &mut counts);
        }

        for (overlay, current) in &plan.updates {
            let result = match overlay.validate() {
                Ok(()) => {
                    let mut object = OverlayObject::from_generated(overlay);
                    let mut labels = current.labels.clone();
                    labels.extend(object.labels);
                    object.labels = labels;
                    object.resource_version = current.resource_version.clone();
                    match self.store.update(&object).await {
                        Err(e) if e.is_conflict() => {
                            info!(overlay = %overlay.name, "Overlay changed concurrently, retrying next pass");
                            Err(e.to_string())
                        }
                        other => other.map_err(|e| e.to_string()),
                    }
                }
                Err(e) => Err(e.to_string()),
            };
            self.record(origin, ReconcileOp::Update, &overlay.name, result, &mut counts);
        }

        for object in &plan.deletes {
            let result = match self.store.delete(&object.name).await {
                // Already gone: the desired end state holds
                Err(StoreError::NotFound(_)) => Ok(()),
                other => other.map_err(|e| e.to_string()),
            };
            self.record(origin, ReconcileOp::Delete, &object.name, result, &mut counts);
        }

        counts
    }

    fn record<T>(
        &self,
        origin: OverlayType,
        op: ReconcileOp,
        name: &str,
        result: Result<T, String>,
        counts: &mut ReconcileCounts,
    ) {
        match result {
            Ok(_) => {
                debug!(overlay = %name, operation = op.as_str(), "Applied overlay operation");
                self.metrics.record_operation(origin, op, true);
                match op {
                    ReconcileOp::Create => counts.created += 1,
                    ReconcileOp::Update => counts.updated += 1,
                    ReconcileOp::Delete => counts.deleted += 1,
                }
            }
            Err(error) => {
                self.metrics.record_operation(origin, op, false);
                self.logger.log_operation_failed(op, name, &error);
                counts.errors += 1;
            }
        }
    }
}
