//! Observability infrastructure for the overlay controller
//!
//! Provides:
//! - A [`MetricsSink`] trait injected into every component, with a
//!   Prometheus implementation bound to a caller-owned registry
//! - Structured JSON logging with tracing

use crate::decision::Decision;
use crate::models::OverlayType;
use crate::preference::AnnotationError;
use crate::reconcile::{ReconcileCounts, ReconcileOp};
use crate::source::DataFamily;
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry,
};
use std::time::Duration;
use tracing::{info, warn};

/// Buckets for reconcile cycle durations (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Sink for controller metrics
pub trait MetricsSink: Send + Sync {
    /// One create/update/delete attempt against the overlay store
    fn record_operation(&self, origin: OverlayType, op: ReconcileOp, success: bool);

    /// A completed reconcile pass; `result` is `success`, `partial` or `failed`
    fn record_pass(&self, origin: OverlayType, result: &str);

    /// A data family or analysis skipped for one cycle
    fn record_skip(&self, family: DataFamily, reason: &str);

    fn record_parse_errors(&self, nodepool: &str, count: usize);

    fn record_decision(&self, decision: &Decision);

    /// Forget every decision recorded so far
    fn reset_decisions(&self);

    fn set_data_age(&self, family: DataFamily, age: Duration);

    fn set_desired_overlays(&self, origin: OverlayType, count: usize);

    fn observe_cycle_duration(&self, duration: Duration);
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_operation(&self, _: OverlayType, _: ReconcileOp, _: bool) {}
    fn record_pass(&self, _: OverlayType, _: &str) {}
    fn record_skip(&self, _: DataFamily, _: &str) {}
    fn record_parse_errors(&self, _: &str, _: usize) {}
    fn record_decision(&self, _: &Decision) {}
    fn reset_decisions(&self) {}
    fn set_data_age(&self, _: DataFamily, _: Duration) {}
    fn set_desired_overlays(&self, _: OverlayType, _: usize) {}
    fn observe_cycle_duration(&self, _: Duration) {}
}

/// Prometheus-backed [`MetricsSink`]
#[derive(Clone)]
pub struct ControllerMetrics {
    operations: IntCounterVec,
    passes: IntCounterVec,
    skips: IntCounterVec,
    parse_errors: IntCounterVec,
    decisions: IntGaugeVec,
    data_age_seconds: GaugeVec,
    desired_overlays: IntGaugeVec,
    cycle_duration_seconds: Histogram,
}

impl ControllerMetrics {
    /// Create the metrics and register them with `registry`
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let operations = IntCounterVec::new(
            Opts::new(
                "capacity_overlay_operations_total",
                "Overlay store writes by origin, operation and outcome",
            ),
            &["origin", "operation", "outcome"],
        )?;
        let passes = IntCounterVec::new(
            Opts::new(
                "capacity_overlay_reconcile_passes_total",
                "Reconcile passes by origin and result",
            ),
            &["origin", "result"],
        )?;
        let skips = IntCounterVec::new(
            Opts::new(
                "capacity_overlay_analysis_skipped_total",
                "Data families skipped for a cycle, by reason",
            ),
            &["family", "reason"],
        )?;
        let parse_errors = IntCounterVec::new(
            Opts::new(
                "capacity_overlay_preference_parse_errors_total",
                "Rejected preference annotations per NodePool",
            ),
            &["nodepool"],
        )?;
        let decisions = IntGaugeVec::new(
            Opts::new(
                "capacity_overlay_decision_should_exist",
                "Latest decision per overlay (1 = overlay wanted)",
            ),
            &["name", "capacity_type"],
        )?;
        let data_age_seconds = GaugeVec::new(
            Opts::new(
                "capacity_overlay_data_age_seconds",
                "Age of the capacity data family at the last check",
            ),
            &["family"],
        )?;
        let desired_overlays = IntGaugeVec::new(
            Opts::new(
                "capacity_overlay_desired_overlays",
                "Overlays currently desired per origin",
            ),
            &["origin"],
        )?;
        let cycle_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "capacity_overlay_cycle_duration_seconds",
                "Duration of a decision cycle",
            )
            .buckets(CYCLE_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(operations.clone()))?;
        registry.register(Box::new(passes.clone()))?;
        registry.register(Box::new(skips.clone()))?;
        registry.register(Box::new(parse_errors.clone()))?;
        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(data_age_seconds.clone()))?;
        registry.register(Box::new(desired_overlays.clone()))?;
        registry.register(Box::new(cycle_duration_seconds.clone()))?;

        Ok(Self {
            operations,
            passes,
            skips,
            parse_errors,
            decisions,
            data_age_seconds,
            desired_overlays,
            cycle_duration_seconds,
        })
    }
}

impl MetricsSink for ControllerMetrics {
    fn record_operation(&self, origin: OverlayType, op: ReconcileOp, success: bool) {
        let outcome = if success { "success" } else { "error" };
        self.operations
            .with_label_values(&[origin.as_label(), op.as_str(), outcome])
            .inc();
    }

    fn record_pass(&self, origin: OverlayType, result: &str) {
        self.passes
            .with_label_values(&[origin.as_label(), result])
            .inc();
    }

    fn record_skip(&self, family: DataFamily, reason: &str) {
        self.skips
            .with_label_values(&[family.as_str(), reason])
            .inc();
    }

    fn record_parse_errors(&self, nodepool: &str, count: usize) {
        self.parse_errors
            .with_label_values(&[nodepool])
            .inc_by(count as u64);
    }

    fn record_decision(&self, decision: &Decision) {
        self.decisions
            .with_label_values(&[decision.name.as_str(), decision.capacity_type.as_str()])
            .set(i64::from(decision.should_exist));
    }

    fn reset_decisions(&self) {
        self.decisions.reset();
    }

    fn set_data_age(&self, family: DataFamily, age: Duration) {
        self.data_age_seconds
            .with_label_values(&[family.as_str()])
            .set(age.as_secs_f64());
    }

    fn set_desired_overlays(&self, origin: OverlayType, count: usize) {
        self.desired_overlays
            .with_label_values(&[origin.as_label()])
            .set(count as i64);
    }

    fn observe_cycle_duration(&self, duration: Duration) {
        self.cycle_duration_seconds.observe(duration.as_secs_f64());
    }
}

/// Structured logger for controller events
///
/// Provides consistent JSON-formatted records for decisions, reconcile
/// passes and other significant events.
#[derive(Clone)]
pub struct StructuredLogger {
    component: String,
}

impl StructuredLogger {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn log_startup(&self, version: &str, disabled: bool, dry_run: bool) {
        info!(
            event = "controller_started",
            component = %self.component,
            version = %version,
            disabled = disabled,
            dry_run = dry_run,
            "Capacity overlay controller started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            component = %self.component,
            reason = %reason,
            "Capacity overlay controller shutting down"
        );
    }

    pub fn log_decision(&self, decision: &Decision) {
        info!(
            event = "capacity_decision",
            component = %self.component,
            overlay = %decision.name,
            capacity_type = %decision.capacity_type,
            should_exist = decision.should_exist,
            weight = decision.weight,
            reason = %decision.reason,
            "Capacity decision"
        );
    }

    /// Log the summary of one reconcile pass
    pub fn log_reconcile(&self, origin: OverlayType, source: Option<&str>, counts: &ReconcileCounts) {
        if counts.errors > 0 {
            warn!(
                event = "reconcile_pass",
                component = %self.component,
                origin = %origin,
                source = ?source,
                created = counts.created,
                updated = counts.updated,
                deleted = counts.deleted,
                unchanged = counts.unchanged,
                errors = counts.errors,
                "Reconcile pass finished with errors"
            );
        } else {
            info!(
                event = "reconcile_pass",
                component = %self.component,
                origin = %origin,
                source = ?source,
                created = counts.created,
                updated = counts.updated,
                deleted = counts.deleted,
                unchanged = counts.unchanged,
                "Reconcile pass finished"
            );
        }
    }

    pub fn log_operation_failed(&self, op: ReconcileOp, overlay: &str, error: &dyn std::fmt::Display) {
        warn!(
            event = "overlay_operation_failed",
            component = %self.component,
            operation = %op.as_str(),
            overlay = %overlay,
            error = %error,
            "Overlay operation failed"
        );
    }

    pub fn log_analysis_skipped(&self, family: DataFamily, reason: &str) {
        info!(
            event = "analysis_skipped",
            component = %self.component,
            family = %family,
            reason = %reason,
            "Skipping analysis for this cycle"
        );
    }

    pub fn log_parse_errors(&self, nodepool: &str, errors: &[AnnotationError]) {
        for error in errors {
            warn!(
                event = "preference_rejected",
                component = %self.component,
                nodepool = %nodepool,
                annotation = %error.annotation,
                error = %error.error,
                "Rejected preference annotation"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::DecisionEngine;
    use crate::aggregator::AggregatedCapacity;

    fn counter_value(registry: &Registry, name: &str) -> f64 {
        registry
            .gather()
            .iter()
            .filter(|mf| mf.get_name() == name)
            .flat_map(|mf| mf.get_metric().iter())
            .map(|m| m.get_counter().get_value())
            .sum()
    }

    fn series_count(registry: &Registry, name: &str) -> usize {
        registry
            .gather()
            .iter()
            .filter(|mf| mf.get_name() == name)
            .map(|mf| mf.get_metric().len())
            .sum()
    }

    #[test]
    fn test_metrics_register_into_owned_registry() {
        let registry = Registry::new();
        let metrics = ControllerMetrics::new(&registry).unwrap();

        metrics.record_operation(OverlayType::Preference, ReconcileOp::Create, true);
        metrics.record_operation(OverlayType::Preference, ReconcileOp::Delete, false);
        metrics.record_skip(DataFamily::SavingsPlans, "stale");
        metrics.record_parse_errors("general", 2);

        assert_eq!(counter_value(&registry, "capacity_overlay_operations_total"), 2.0);
        assert_eq!(counter_value(&registry, "capacity_overlay_analysis_skipped_total"), 1.0);
        assert_eq!(
            counter_value(&registry, "capacity_overlay_preference_parse_errors_total"),
            2.0
        );
    }

    #[test]
    fn test_separate_registries_do_not_collide() {
        // Each registry owns its own metric set
        assert!(ControllerMetrics::new(&Registry::new()).is_ok());
        assert!(ControllerMetrics::new(&Registry::new()).is_ok());

        let registry = Registry::new();
        ControllerMetrics::new(&registry).unwrap();
        assert!(ControllerMetrics::new(&registry).is_err());
    }

    #[test]
    fn test_gauges_and_histogram() {
        let registry = Registry::new();
        let metrics = ControllerMetrics::new(&registry).unwrap();
        let decision = DecisionEngine::default().analyze_global(&AggregatedCapacity {
            remaining_capacity: 1.0,
            utilization_percent: 10.0,
        });

        metrics.record_decision(&decision);
        metrics.set_data_age(DataFamily::ReservedInstances, Duration::from_secs(30));
        metrics.set_desired_overlays(OverlayType::CostDecision, 3);
        metrics.observe_cycle_duration(Duration::from_millis(120));

        let families = registry.gather();
        let names: Vec<&str> = families.iter().map(|mf| mf.get_name()).collect();
        assert!(names.contains(&"capacity_overlay_decision_should_exist"));
        assert!(names.contains(&"capacity_overlay_data_age_seconds"));
        assert!(names.contains(&"capacity_overlay_cycle_duration_seconds"));
    }

    #[test]
    fn test_reset_drops_stale_decision_series() {
        let registry = Registry::new();
        let metrics = ControllerMetrics::new(&registry).unwrap();
        let decision = DecisionEngine::default().analyze_global(&AggregatedCapacity {
            remaining_capacity: 1.0,
            utilization_percent: 10.0,
        });

        metrics.record_decision(&decision);
        assert_eq!(series_count(&registry, "capacity_overlay_decision_should_exist"), 1);

        metrics.reset_decisions();
        assert_eq!(series_count(&registry, "capacity_overlay_decision_should_exist"), 0);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("decision-loop");
        assert_eq!(logger.component, "decision-loop");
    }
}
