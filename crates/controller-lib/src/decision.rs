//! Threshold-based capacity decisions
//!
//! Turns aggregated pre-paid capacity into a verdict on whether a
//! price-adjustment overlay for that capacity should exist.

use crate::aggregator::{AggregatedCapacity, CapacityKey, ReservedKey};
use crate::config::DecisionConfig;
use crate::models::{sanitize_name, CapacityType};
use serde::{Deserialize, Serialize};

/// Price adjustment carried by every decision overlay. Pre-paid capacity
/// has no marginal cost, so covered instances are priced at zero.
pub const PLACEHOLDER_PRICE_ADJUSTMENT: &str = "-100%";

/// What a decision covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionScope {
    Global,
    Family { family: String, region: String },
    InstanceType { instance_type: String, region: String },
}

/// Verdict for one capacity key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub name: String,
    pub capacity_type: CapacityType,
    pub scope: DecisionScope,
    pub should_exist: bool,
    pub reason: String,
    pub weight: i32,
    pub price_adjustment: String,
}

/// Derive the overlay name for a Savings Plan key
pub fn savings_plan_name(key: &CapacityKey) -> String {
    match key {
        CapacityKey::Global => "savings-plan-global".to_string(),
        CapacityKey::Regional { family, region } => {
            sanitize_name(&format!("savings-plan-{}-{}", family, region))
        }
    }
}

/// Derive the overlay name for a Reserved Instance key
pub fn reserved_instance_name(key: &ReservedKey) -> String {
    sanitize_name(&format!(
        "reserved-instance-{}-{}",
        key.instance_type, key.region
    ))
}

/// Decision engine parameterized by threshold and weights
#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionEngine {
    config: DecisionConfig,
}

impl DecisionEngine {
    pub fn new(config: DecisionConfig) -> Self {
        Self { config }
    }

    pub fn threshold(&self) -> f64 {
        self.config.utilization_threshold
    }

    /// Analyze Compute Savings Plan capacity
    pub fn analyze_global(&self, agg: &AggregatedCapacity) -> Decision {
        self.threshold_decision(
            savings_plan_name(&CapacityKey::Global),
            CapacityType::ComputeSavingsPlan,
            DecisionScope::Global,
            agg,
        )
    }

    /// Analyze EC2 Instance Savings Plan capacity for one family and region.
    /// A `Global` key is analyzed as global capacity.
    pub fn analyze_regional(&self, key: &CapacityKey, agg: &AggregatedCapacity) -> Decision {
        match key {
            CapacityKey::Global => self.analyze_global(agg),
            CapacityKey::Regional { family, region } => self.threshold_decision(
                savings_plan_name(key),
                CapacityType::Ec2InstanceSavingsPlan,
                DecisionScope::Family {
                    family: family.clone(),
                    region: region.clone(),
                },
                agg,
            ),
        }
    }

    /// Analyze a Reserved Instance count; there is no utilization signal
    pub fn analyze_reserved(&self, key: &ReservedKey, count: u64) -> Decision {
        let should_exist = count > 0;
        let reason = if should_exist {
            format!("{} reserved instances available", count)
        } else {
            "no reserved instances available".to_string()
        };

        Decision {
            name: reserved_instance_name(key),
            capacity_type: CapacityType::ReservedInstance,
            scope: DecisionScope::InstanceType {
                instance_type: key.instance_type.clone(),
                region: key.region.clone(),
            },
            should_exist,
            reason,
            weight: self.config.weights.for_type(CapacityType::ReservedInstance),
            price_adjustment: PLACEHOLDER_PRICE_ADJUSTMENT.to_string(),
        }
    }

    fn threshold_decision(
        &self,
        name: String,
        capacity_type: CapacityType,
        scope: DecisionScope,
        agg: &AggregatedCapacity,
    ) -> Decision {
        let threshold = self.config.utilization_threshold;
        let utilization = agg.utilization_percent;

        // Threshold is inclusive on the delete side; negative remaining
        // capacity is treated as none.
        let (should_exist, reason) = if utilization >= threshold {
            (
                false,
                format!(
                    "utilization {:.1}% at/above threshold {:.1}%",
                    utilization, threshold
                ),
            )
        } else if agg.remaining_capacity <= 0.0 {
            (false, "no remaining capacity".to_string())
        } else {
            (
                true,
                format!(
                    "utilization {:.1}% below threshold {:.1}%, capacity available",
                    utilization, threshold
                ),
            )
        };

        Decision {
            name,
            capacity_type,
            scope,
            should_exist,
            reason,
            weight: self.config.weights.for_type(capacity_type),
            price_adjustment: PLACEHOLDER_PRICE_ADJUSTMENT.to_string(),
        }
    }
}
