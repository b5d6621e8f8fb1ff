//! Capacity aggregation
//!
//! Groups raw per-commitment samples into one summary row per logical
//! capacity key. Remaining capacity and instance counts are summed; the
//! utilization of a key comes from its own utilization series.

use crate::models::{CapacityKind, CapacitySample, ReservedInstanceSample};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Grouping key for Savings Plan capacity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CapacityKey {
    Global,
    Regional { family: String, region: String },
}

impl fmt::Display for CapacityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapacityKey::Global => f.write_str("global"),
            CapacityKey::Regional { family, region } => write!(f, "{}/{}", family, region),
        }
    }
}

/// Grouping key for Reserved Instance counts
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReservedKey {
    pub instance_type: String,
    pub region: String,
}

impl fmt::Display for ReservedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instance_type, self.region)
    }
}

/// Summary of one capacity key
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedCapacity {
    /// Sum of remaining capacity ($/hour); negative when over-committed
    pub remaining_capacity: f64,
    /// Utilization percent; above 100 means spill-over to on-demand
    pub utilization_percent: f64,
}

fn capacity_key(kind: CapacityKind, sample: &CapacitySample) -> Option<CapacityKey> {
    match kind {
        CapacityKind::Global => Some(CapacityKey::Global),
        CapacityKind::Regional => match (&sample.instance_family, &sample.region) {
            (Some(family), Some(region)) if !family.is_empty() && !region.is_empty() => {
                Some(CapacityKey::Regional {
                    family: family.clone(),
                    region: region.clone(),
                })
            }
            _ => {
                debug!(?sample, "Skipping regional sample without family or region");
                None
            }
        },
    }
}

/// Aggregate Savings Plan samples of one kind.
///
/// Samples of the other kind are ignored. Keys seen only in `utilization`
/// get zero remaining capacity; keys seen only in `capacity` get zero
/// utilization.
pub fn aggregate_savings_plans(
    kind: CapacityKind,
    capacity: &[CapacitySample],
    utilization: &[CapacitySample],
) -> BTreeMap<CapacityKey, AggregatedCapacity> {
    let mut out: BTreeMap<CapacityKey, AggregatedCapacity> = BTreeMap::new();

    for sample in capacity.iter().filter(|s| s.kind == kind) {
        if let Some(key) = capacity_key(kind, sample) {
            out.entry(key).or_default().remaining_capacity += sample.value;
        }
    }

    // One utilization series exists per key; the last sample wins
    for sample in utilization.iter().filter(|s| s.kind == kind) {
        if let Some(key) = capacity_key(kind, sample) {
            out.entry(key).or_default().utilization_percent = sample.value;
        }
    }

    out
}

/// Sum Reserved Instance counts per instance type and region
pub fn aggregate_reserved_instances(
    samples: &[ReservedInstanceSample],
) -> BTreeMap<ReservedKey, u64> {
    let mut out: BTreeMap<ReservedKey, u64> = BTreeMap::new();

    for sample in samples {
        if sample.instance_type.is_empty() || sample.region.is_empty() {
            debug!(?sample, "Skipping reserved instance sample without type or region");
            continue;
        }
        let count = if sample.count.is_finite() && sample.count > 0.0 {
            sample.count.round() as u64
        } else {
            0
        };
        *out.entry(ReservedKey {
            instance_type: sample.instance_type.clone(),
            region: sample.region.clone(),
        })
        .or_default() += count;
    }

    out
}
