//! Tunables consumed by the decision engine and the freshness gate

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::CapacityType;
use crate::source::DataFamily;

/// Default utilization threshold (percent)
pub const DEFAULT_UTILIZATION_THRESHOLD: f64 = 95.0;

/// Default maximum data age for every family (2 hours)
pub const DEFAULT_MAX_DATA_AGE_SECS: u64 = 2 * 60 * 60;

/// Overlay weight per capacity type; more specific commitments win
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightConfig {
    #[serde(default = "default_compute_weight")]
    pub compute_savings_plan: i32,
    #[serde(default = "default_ec2_instance_weight")]
    pub ec2_instance_savings_plan: i32,
    #[serde(default = "default_reserved_weight")]
    pub reserved_instance: i32,
}

fn default_compute_weight() -> i32 {
    10
}

fn default_ec2_instance_weight() -> i32 {
    20
}

fn default_reserved_weight() -> i32 {
    30
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            compute_savings_plan: default_compute_weight(),
            ec2_instance_savings_plan: default_ec2_instance_weight(),
            reserved_instance: default_reserved_weight(),
        }
    }
}

impl WeightConfig {
    pub fn for_type(&self, capacity_type: CapacityType) -> i32 {
        match capacity_type {
            CapacityType::ComputeSavingsPlan => self.compute_savings_plan,
            CapacityType::Ec2InstanceSavingsPlan => self.ec2_instance_savings_plan,
            CapacityType::ReservedInstance => self.reserved_instance,
        }
    }
}

/// Decision engine configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecisionConfig {
    /// Utilization percent at or above which capacity counts as exhausted
    #[serde(default = "default_threshold")]
    pub utilization_threshold: f64,
    #[serde(default)]
    pub weights: WeightConfig,
}

fn default_threshold() -> f64 {
    DEFAULT_UTILIZATION_THRESHOLD
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            utilization_threshold: DEFAULT_UTILIZATION_THRESHOLD,
            weights: WeightConfig::default(),
        }
    }
}

/// Per-family freshness ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessConfig {
    #[serde(default = "default_max_age")]
    pub savings_plans_max_age_secs: u64,
    #[serde(default = "default_max_age")]
    pub reserved_instances_max_age_secs: u64,
}

fn default_max_age() -> u64 {
    DEFAULT_MAX_DATA_AGE_SECS
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            savings_plans_max_age_secs: DEFAULT_MAX_DATA_AGE_SECS,
            reserved_instances_max_age_secs: DEFAULT_MAX_DATA_AGE_SECS,
        }
    }
}

impl FreshnessConfig {
    pub fn max_age(&self, family: DataFamily) -> Duration {
        match family {
            DataFamily::SavingsPlans => Duration::from_secs(self.savings_plans_max_age_secs),
            DataFamily::ReservedInstances => {
                Duration::from_secs(self.reserved_instances_max_age_secs)
            }
        }
    }
}
