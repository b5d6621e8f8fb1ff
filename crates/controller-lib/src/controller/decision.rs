//! Periodic cost-decision loop
//!
//! Each cycle checks data freshness per family, analyzes every capacity
//! type whose data is complete, and reconciles one ownership scope per
//! analyzed capacity type. Capacity types that could not be analyzed keep
//! their existing overlays until a later cycle succeeds.

use crate::aggregator::{aggregate_reserved_instances, aggregate_savings_plans};
use crate::config::{DecisionConfig, FreshnessConfig};
use crate::decision::{Decision, DecisionEngine};
use crate::generator::{GeneratedOverlay, OverlayGenerator};
use crate::health::{components, HealthRegistry};
use crate::models::{CapacityKind, CapacityType, OverlayType};
use crate::observability::{MetricsSink, NoopMetrics, StructuredLogger};
use crate::reconcile::{OwnershipScope, ReconcileCounts, Reconciler};
use crate::source::{CapacitySource, DataFamily, SourceError};
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default time between decision cycles
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);

/// Analysis that did not run this cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedAnalysis {
    pub family: DataFamily,
    /// `None` when the whole family was skipped
    pub capacity_type: Option<CapacityType>,
    pub reason: String,
}

/// Result of analyzing the current capacity data
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisReport {
    pub decisions: Vec<Decision>,
    /// Capacity types with complete data; only these are reconciled
    pub analyzed: Vec<CapacityType>,
    pub skipped: Vec<SkippedAnalysis>,
    pub data_ages: Vec<(DataFamily, Duration)>,
}

impl AnalysisReport {
    /// Overlays wanted for one capacity type
    pub fn wanted(&self, capacity_type: CapacityType) -> impl Iterator<Item = &Decision> {
        self.decisions
            .iter()
            .filter(move |d| d.capacity_type == capacity_type && d.should_exist)
    }
}

/// Outcome of one decision cycle
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub analysis: AnalysisReport,
    pub counts: ReconcileCounts,
    /// Scopes whose reconcile pass could not list existing overlays
    pub failed_scopes: Vec<String>,
    pub duration: Duration,
}

/// Read-only half of the decision path: freshness gating and analysis
#[derive(Clone)]
pub struct DecisionAnalyzer {
    source: Arc<dyn CapacitySource>,
    engine: DecisionEngine,
    freshness: FreshnessConfig,
    metrics: Arc<dyn MetricsSink>,
    logger: StructuredLogger,
}

impl DecisionAnalyzer {
    pub fn new(
        source: Arc<dyn CapacitySource>,
        engine: DecisionEngine,
        freshness: FreshnessConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            source,
            engine,
            freshness,
            metrics,
            logger: StructuredLogger::new("decision-loop"),
        }
    }

    pub async fn analyze(&self) -> AnalysisReport {
        let mut report = AnalysisReport::default();

        if self.is_fresh(DataFamily::SavingsPlans, &mut report).await {
            for (kind, capacity_type) in [
                (CapacityKind::Global, CapacityType::ComputeSavingsPlan),
                (CapacityKind::Regional, CapacityType::Ec2InstanceSavingsPlan),
            ] {
                match self.savings_plan_decisions(kind).await {
                    Ok(decisions) => {
                        report.analyzed.push(capacity_type);
                        report.decisions.extend(decisions);
                    }
                    Err(e) => self.skip(
                        &mut report,
                        DataFamily::SavingsPlans,
                        Some(capacity_type),
                        "query_failed",
                        format!("{} query failed: {}", capacity_type, e),
                    ),
                }
            }
        }

        if self.is_fresh(DataFamily::ReservedInstances, &mut report).await {
            match self.source.reserved_instances().await {
                Ok(samples) => {
                    report.analyzed.push(CapacityType::ReservedInstance);
                    report.decisions.extend(
                        aggregate_reserved_instances(&samples)
                            .iter()
                            .map(|(key, count)| self.engine.analyze_reserved(key, *count)),
                    );
                }
                Err(e) => self.skip(
                    &mut report,
                    DataFamily::ReservedInstances,
                    Some(CapacityType::ReservedInstance),
                    "query_failed",
                    format!("reserved instance query failed: {}", e),
                ),
            }
        }

        // Only this pass's decisions are exported
        self.metrics.reset_decisions();
        for decision in &report.decisions {
            self.metrics.record_decision(decision);
            self.logger.log_decision(decision);
        }

        report
    }

    async fn savings_plan_decisions(&self, kind: CapacityKind) -> Result<Vec<Decision>, SourceError> {
        let capacity = self.source.savings_plan_capacity(kind).await?;
        let utilization = self.source.savings_plan_utilization(kind).await?;
        debug!(
            kind = kind.series_type(),
            capacity_series = capacity.len(),
            utilization_series = utilization.len(),
            "Fetched savings plan data"
        );

        Ok(aggregate_savings_plans(kind, &capacity, &utilization)
            .iter()
            .map(|(key, agg)| self.engine.analyze_regional(key, agg))
            .collect())
    }

    /// Gate a family on its data age; unknown age counts as stale
    async fn is_fresh(&self, family: DataFamily, report: &mut AnalysisReport) -> bool {
        let max_age = self.freshness.max_age(family);
        match self.source.data_age(family).await {
            Ok(age) => {
                self.metrics.set_data_age(family, age);
                report.data_ages.push((family, age));
                if age > max_age {
                    self.skip(
                        report,
                        family,
                        None,
                        "stale",
                        format!(
                            "data age {}s exceeds maximum {}s",
                            age.as_secs(),
                            max_age.as_secs()
                        ),
                    );
                    return false;
                }
                true
            }
            Err(e) => {
                self.skip(
                    report,
                    family,
                    None,
                    "freshness_unavailable",
                    format!("freshness check failed: {}", e),
                );
                false
            }
        }
    }

    fn skip(
        &self,
        report: &mut AnalysisReport,
        family: DataFamily,
        capacity_type: Option<CapacityType>,
        metric_reason: &str,
        reason: String,
    ) {
        self.metrics.record_skip(family, metric_reason);
        self.logger.log_analysis_skipped(family, &reason);
        report.skipped.push(SkippedAnalysis {
            family,
            capacity_type,
            reason,
        });
    }
}

/// Periodic loop turning capacity data into cost-decision overlays
pub struct CostDecisionController {
    analyzer: DecisionAnalyzer,
    reconciler: Reconciler,
    generator: OverlayGenerator,
    metrics: Arc<dyn MetricsSink>,
    health: Option<HealthRegistry>,
    interval: Duration,
}

impl CostDecisionController {
    pub fn builder() -> CostDecisionControllerBuilder {
        CostDecisionControllerBuilder::new()
    }

    pub fn analyzer(&self) -> &DecisionAnalyzer {
        &self.analyzer
    }

    /// Run one analysis and reconcile every analyzed capacity type
    pub async fn run_cycle(&self) -> CycleReport {
        let start = Instant::now();
        let analysis = self.analyzer.analyze().await;
        let mut report = CycleReport::default();
        let mut desired_total = 0;

        for capacity_type in &analysis.analyzed {
            let desired: Vec<GeneratedOverlay> = analysis
                .wanted(*capacity_type)
                .map(|d| self.generator.from_decision(d))
                .collect();
            desired_total += desired.len();

            let scope = OwnershipScope::new(
                OverlayType::CostDecision,
                Some(capacity_type.as_str().to_string()),
            );
            match self.reconciler.reconcile(&scope, desired).await {
                Ok(counts) => report.counts.merge(counts),
                Err(e) => {
                    warn!(scope = %scope, error = %e, "Decision reconcile pass failed");
                    report.failed_scopes.push(scope.to_string());
                }
            }
        }

        self.metrics
            .set_desired_overlays(OverlayType::CostDecision, desired_total);
        report.analysis = analysis;
        report.duration = start.elapsed();
        self.metrics.observe_cycle_duration(report.duration);
        self.update_health(&report).await;

        info!(
            decisions = report.analysis.decisions.len(),
            skipped = report.analysis.skipped.len(),
            created = report.counts.created,
            updated = report.counts.updated,
            deleted = report.counts.deleted,
            errors = report.counts.errors,
            elapsed_ms = report.duration.as_millis() as u64,
            "Decision cycle complete"
        );
        report
    }

    async fn update_health(&self, report: &CycleReport) {
        let Some(health) = &self.health else {
            return;
        };

        if report.analysis.skipped.is_empty() {
            health.set_healthy(components::CAPACITY_SOURCE).await;
        } else {
            let reasons: Vec<&str> = report
                .analysis
                .skipped
                .iter()
                .map(|s| s.reason.as_str())
                .collect();
            health
                .set_degraded(components::CAPACITY_SOURCE, reasons.join("; "))
                .await;
        }

        if report.failed_scopes.is_empty() {
            health.set_healthy(components::OVERLAY_STORE).await;
        } else {
            health
                .set_degraded(
                    components::OVERLAY_STORE,
                    format!("list failed for {}", report.failed_scopes.join(", ")),
                )
                .await;
        }

        health.set_healthy(components::DECISION_LOOP).await;
        health.record_cycle().await;
    }

    /// Run cycles until shutdown. The first cycle starts immediately; a
    /// slow cycle delays the next tick instead of queueing ticks.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting decision loop"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = self.run_cycle() => {}
                        _ = shutdown.recv() => {
                            info!("Shutting down decision loop, abandoning in-flight cycle");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down decision loop");
                    break;
                }
            }
        }
    }
}

/// Builder for [`CostDecisionController`]
pub struct CostDecisionControllerBuilder {
    source: Option<Arc<dyn CapacitySource>>,
    reconciler: Option<Reconciler>,
    metrics: Arc<dyn MetricsSink>,
    health: Option<HealthRegistry>,
    decision: DecisionConfig,
    freshness: FreshnessConfig,
    disabled: bool,
    interval: Duration,
}

impl CostDecisionControllerBuilder {
    pub fn new() -> Self {
        Self {
            source: None,
            reconciler: None,
            metrics: Arc::new(NoopMetrics),
            health: None,
            decision: DecisionConfig::default(),
            freshness: FreshnessConfig::default(),
            disabled: false,
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn source(mut self, source: Arc<dyn CapacitySource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn reconciler(mut self, reconciler: Reconciler) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn decision(mut self, decision: DecisionConfig) -> Self {
        self.decision = decision;
        self
    }

    pub fn freshness(mut self, freshness: FreshnessConfig) -> Self {
        self.freshness = freshness;
        self
    }

    /// Render overlays with the unsatisfiable disabled requirement
    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn build(self) -> Result<CostDecisionController> {
        let source = self
            .source
            .ok_or_else(|| anyhow::anyhow!("Capacity source is required"))?;
        let reconciler = self
            .reconciler
            .ok_or_else(|| anyhow::anyhow!("Reconciler is required"))?;
        if self.interval.is_zero() {
            anyhow::bail!("Decision interval must be greater than zero");
        }

        Ok(CostDecisionController {
            analyzer: DecisionAnalyzer::new(
                source,
                DecisionEngine::new(self.decision),
                self.freshness,
                self.metrics.clone(),
            ),
            reconciler,
            generator: OverlayGenerator::new(self.disabled),
            metrics: self.metrics,
            health: self.health,
            interval: self.interval,
        })
    }
}

impl Default for CostDecisionControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
