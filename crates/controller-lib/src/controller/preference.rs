//! NodePool preference reconciliation
//!
//! Every NodePool owns the preference overlays rendered from its own
//! annotations. A NodePool event reconciles only that NodePool's scope; a
//! full resync additionally removes overlays whose NodePool is gone.

use crate::generator::{GeneratedOverlay, OverlayGenerator};
use crate::models::{NodePoolRef, OverlayType, OwnerRef, SOURCE_LABEL};
use crate::observability::{MetricsSink, StructuredLogger};
use crate::preference::{parse_nodepool, AnnotationError};
use crate::reconcile::{
    OwnershipScope, ReconcileCounts, ReconcileError, ReconciliationPlan, Reconciler,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// A change to the set of NodePools
#[derive(Debug, Clone, PartialEq)]
pub enum NodePoolEvent {
    Applied(NodePoolRef),
    Deleted(NodePoolRef),
    /// Full listing after a (re)start of the watch
    Restarted(Vec<NodePoolRef>),
}

pub struct PreferenceController {
    reconciler: Reconciler,
    generator: OverlayGenerator,
    metrics: Arc<dyn MetricsSink>,
    logger: StructuredLogger,
    /// Desired overlay count per NodePool, summed into the desired gauge
    desired_counts: Mutex<BTreeMap<String, usize>>,
}

impl PreferenceController {
    pub fn new(
        reconciler: Reconciler,
        generator: OverlayGenerator,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            reconciler,
            generator,
            metrics,
            logger: StructuredLogger::new("preference-watcher"),
            desired_counts: Mutex::new(BTreeMap::new()),
        }
    }

    /// Apply `update` to the per-NodePool counts and publish their total
    fn update_desired_counts(&self, update: impl FnOnce(&mut BTreeMap<String, usize>)) {
        let mut counts = self.desired_counts.lock().unwrap_or_else(|e| e.into_inner());
        update(&mut counts);
        self.metrics
            .set_desired_overlays(OverlayType::Preference, counts.values().sum());
    }

    /// Render the overlays a NodePool asks for, plus its rejected annotations
    pub fn desired_overlays(
        &self,
        nodepool: &NodePoolRef,
    ) -> (Vec<GeneratedOverlay>, Vec<AnnotationError>) {
        let parsed = parse_nodepool(nodepool);
        let overlays = parsed
            .preferences
            .iter()
            .map(|pref| {
                let mut overlay = self.generator.from_preference(pref);
                if let Some(uid) = &nodepool.uid {
                    overlay
                        .owners
                        .push(OwnerRef::nodepool(nodepool.name.clone(), uid.clone()));
                }
                overlay
            })
            .collect();
        (overlays, parsed.errors)
    }

    /// Bring one NodePool's preference overlays in line with its annotations
    pub async fn reconcile_nodepool(
        &self,
        nodepool: &NodePoolRef,
    ) -> Result<ReconcileCounts, ReconcileError> {
        let (desired, errors) = self.desired_overlays(nodepool);
        if !errors.is_empty() {
            self.logger.log_parse_errors(&nodepool.name, &errors);
            self.metrics.record_parse_errors(&nodepool.name, errors.len());
        }
        if nodepool.uid.is_none() {
            debug!(nodepool = %nodepool.name, "NodePool has no uid, overlays will not be garbage collected");
        }
        self.update_desired_counts(|counts| {
            counts.insert(nodepool.name.clone(), desired.len());
        });

        self.reconciler
            .reconcile(&OwnershipScope::nodepool(nodepool.name.clone()), desired)
            .await
    }

    /// Remove every preference overlay of a deleted NodePool
    pub async fn cleanup_nodepool(&self, name: &str) -> Result<ReconcileCounts, ReconcileError> {
        info!(nodepool = %name, "Cleaning up preference overlays of deleted NodePool");
        self.update_desired_counts(|counts| {
            counts.remove(name);
        });
        self.reconciler
            .reconcile(&OwnershipScope::nodepool(name), Vec::new())
            .await
    }

    /// Delete preference overlays whose source NodePool is not in `live`
    pub async fn cleanup_orphans(
        &self,
        live: &BTreeSet<String>,
    ) -> Result<ReconcileCounts, ReconcileError> {
        let scope = OwnershipScope::new(OverlayType::Preference, None);
        let existing = self.reconciler.list_managed(&scope).await?;

        let deletes: Vec<_> = existing
            .into_iter()
            .filter(|o| {
                o.labels
                    .get(SOURCE_LABEL)
                    .map(|source| !live.contains(source))
                    .unwrap_or(true)
            })
            .collect();
        if deletes.is_empty() {
            return Ok(ReconcileCounts::default());
        }

        info!(orphans = deletes.len(), "Removing orphaned preference overlays");
        let plan = ReconciliationPlan {
            deletes,
            ..Default::default()
        };
        Ok(self.reconciler.apply(OverlayType::Preference, plan).await)
    }

    /// Reconcile the overlays affected by one NodePool event
    pub async fn handle_event(&self, event: NodePoolEvent) -> Result<ReconcileCounts, ReconcileError> {
        match event {
            NodePoolEvent::Applied(nodepool) => self.reconcile_nodepool(&nodepool).await,
            NodePoolEvent::Deleted(nodepool) => self.cleanup_nodepool(&nodepool.name).await,
            NodePoolEvent::Restarted(nodepools) => self.resync(&nodepools).await,
        }
    }

    /// Reconcile every NodePool, then remove orphans. Per-NodePool
    /// failures are logged and counted; a failed orphan listing is returned.
    pub async fn resync(&self, nodepools: &[NodePoolRef]) -> Result<ReconcileCounts, ReconcileError> {
        let mut total = ReconcileCounts::default();
        for nodepool in nodepools {
            match self.reconcile_nodepool(nodepool).await {
                Ok(counts) => total.merge(counts),
                Err(e) => {
                    warn!(nodepool = %nodepool.name, error = %e, "NodePool reconcile failed");
                    total.errors += 1;
                }
            }
        }

        let live: BTreeSet<String> = nodepools.iter().map(|n| n.name.clone()).collect();
        self.update_desired_counts(|counts| counts.retain(|name, _| live.contains(name)));
        total.merge(self.cleanup_orphans(&live).await?);
        Ok(total)
    }
}
