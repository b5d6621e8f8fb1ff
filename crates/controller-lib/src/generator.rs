//! Rendering of decisions and preferences into overlay objects

use crate::decision::{Decision, DecisionScope};
use crate::models::{
    well_known, CapacityType, OverlayType, OwnerRef, Requirement, RequirementOperator,
    DISABLED_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE, PREFERENCE_NUMBER_LABEL, SOURCE_LABEL,
    TYPE_LABEL,
};
use crate::preference::Preference;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Where a generated overlay came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverlayOrigin {
    Decision { capacity_type: CapacityType },
    Preference { nodepool: String, number: u32 },
}

impl OverlayOrigin {
    pub fn overlay_type(&self) -> OverlayType {
        match self {
            OverlayOrigin::Decision { .. } => OverlayType::CostDecision,
            OverlayOrigin::Preference { .. } => OverlayType::Preference,
        }
    }

    /// Value of the source label: the capacity type or the NodePool name
    pub fn source(&self) -> &str {
        match self {
            OverlayOrigin::Decision { capacity_type } => capacity_type.as_str(),
            OverlayOrigin::Preference { nodepool, .. } => nodepool,
        }
    }
}

/// A fully rendered overlay, ready for reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedOverlay {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub requirements: Vec<Requirement>,
    pub weight: i32,
    pub price_adjustment: String,
    pub origin: OverlayOrigin,
    pub owners: Vec<OwnerRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OverlayError {
    #[error("overlay name is empty")]
    EmptyName,

    #[error("overlay '{0}' has no requirements")]
    NoRequirements(String),

    #[error("overlay '{name}' requirement on '{key}' is invalid: {reason}")]
    InvalidRequirement {
        name: String,
        key: String,
        reason: String,
    },

    #[error("overlay '{name}' has malformed price adjustment '{value}'")]
    InvalidPriceAdjustment { name: String, value: String },
}

fn valid_price_adjustment(value: &str) -> bool {
    let Some(body) = value.strip_suffix('%') else {
        return false;
    };
    let magnitude = body.strip_prefix(['+', '-']).unwrap_or(body);
    !magnitude.is_empty()
        && !magnitude.starts_with('.')
        && !magnitude.ends_with('.')
        && magnitude.bytes().all(|b| b.is_ascii_digit() || b == b'.')
        && magnitude.bytes().filter(|b| *b == b'.').count() <= 1
}

impl GeneratedOverlay {
    /// Check the overlay before it is written to the store
    pub fn validate(&self) -> Result<(), OverlayError> {
        if self.name.is_empty() {
            return Err(OverlayError::EmptyName);
        }
        if self.requirements.is_empty() {
            return Err(OverlayError::NoRequirements(self.name.clone()));
        }

        for req in &self.requirements {
            let invalid = |reason: &str| OverlayError::InvalidRequirement {
                name: self.name.clone(),
                key: req.key.clone(),
                reason: reason.to_string(),
            };
            if req.key.is_empty() {
                return Err(invalid("empty key"));
            }
            match &req.operator {
                RequirementOperator::In | RequirementOperator::NotIn => {
                    if req.values.is_empty() {
                        return Err(invalid("at least one value is required"));
                    }
                }
                RequirementOperator::Gt | RequirementOperator::Lt => {
                    if req.values.len() != 1 || req.values[0].parse::<i64>().is_err() {
                        return Err(invalid("exactly one integer value is required"));
                    }
                }
                RequirementOperator::Exists | RequirementOperator::DoesNotExist => {
                    if !req.values.is_empty() {
                        return Err(invalid("values must be empty"));
                    }
                }
                RequirementOperator::Unknown(operator) => {
                    return Err(invalid(&format!("unsupported operator '{}'", operator)));
                }
            }
        }

        if !valid_price_adjustment(&self.price_adjustment) {
            return Err(OverlayError::InvalidPriceAdjustment {
                name: self.name.clone(),
                value: self.price_adjustment.clone(),
            });
        }

        Ok(())
    }

    pub fn overlay_type(&self) -> OverlayType {
        self.origin.overlay_type()
    }
}

/// Name of the overlay generated for a preference
pub fn preference_overlay_name(nodepool: &str, number: u32) -> String {
    crate::models::sanitize_name(&format!("{}-preference-{}", nodepool, number))
}

/// Renders overlays, applying disabled mode uniformly to both paths
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlayGenerator {
    disabled: bool,
}

impl OverlayGenerator {
    pub fn new(disabled: bool) -> Self {
        Self { disabled }
    }

    pub fn disabled(&self) -> bool {
        self.disabled
    }

    /// Render a decision. Capacity-type scoping keeps decision overlays on
    /// on-demand capacity; the scope adds family/region or type/region.
    pub fn from_decision(&self, decision: &Decision) -> GeneratedOverlay {
        let mut requirements = vec![Requirement::is_in(
            well_known::CAPACITY_TYPE,
            well_known::ON_DEMAND,
        )];
        match &decision.scope {
            DecisionScope::Global => {}
            DecisionScope::Family { family, region } => {
                requirements.push(Requirement::is_in(well_known::INSTANCE_FAMILY, family));
                requirements.push(Requirement::is_in(well_known::REGION, region));
            }
            DecisionScope::InstanceType {
                instance_type,
                region,
            } => {
                requirements.push(Requirement::is_in(well_known::INSTANCE_TYPE, instance_type));
                requirements.push(Requirement::is_in(well_known::REGION, region));
            }
        }

        self.finish(GeneratedOverlay {
            name: decision.name.clone(),
            labels: BTreeMap::new(),
            requirements,
            weight: decision.weight,
            price_adjustment: decision.price_adjustment.clone(),
            origin: OverlayOrigin::Decision {
                capacity_type: decision.capacity_type,
            },
            owners: Vec::new(),
        })
    }

    /// Render a preference, scoped to its owning NodePool
    pub fn from_preference(&self, preference: &Preference) -> GeneratedOverlay {
        let mut requirements = Vec::with_capacity(preference.matchers.len() + 1);
        requirements.push(Requirement::is_in(
            well_known::NODEPOOL,
            preference.nodepool.clone(),
        ));
        requirements.extend(preference.matchers.iter().map(|m| {
            Requirement::new(m.key.clone(), m.operator.to_requirement(), m.values.clone())
        }));

        let mut overlay = GeneratedOverlay {
            name: preference_overlay_name(&preference.nodepool, preference.number),
            labels: BTreeMap::new(),
            requirements,
            weight: i32::try_from(preference.number).unwrap_or(i32::MAX),
            price_adjustment: preference.adjustment.render(),
            origin: OverlayOrigin::Preference {
                nodepool: preference.nodepool.clone(),
                number: preference.number,
            },
            owners: Vec::new(),
        };
        overlay.labels.insert(
            PREFERENCE_NUMBER_LABEL.to_string(),
            preference.number.to_string(),
        );
        self.finish(overlay)
    }

    fn finish(&self, mut overlay: GeneratedOverlay) -> GeneratedOverlay {
        overlay
            .labels
            .insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        overlay.labels.insert(
            TYPE_LABEL.to_string(),
            overlay.origin.overlay_type().as_label().to_string(),
        );
        overlay
            .labels
            .insert(SOURCE_LABEL.to_string(), overlay.origin.source().to_string());

        if self.disabled {
            overlay
                .requirements
                .insert(0, Requirement::is_in(DISABLED_LABEL, "true"));
            overlay
                .labels
                .insert(DISABLED_LABEL.to_string(), "true".to_string());
        }

        overlay
    }
}
