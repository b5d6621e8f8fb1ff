//! Core data models shared by the decision and preference paths

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Label marking objects owned by this controller
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Value of [`MANAGED_BY_LABEL`] on every object we create
pub const MANAGED_BY_VALUE: &str = "capacity-overlay-controller";
/// Label distinguishing cost-decision overlays from preference overlays
pub const TYPE_LABEL: &str = "capacity-overlay.dev/type";
/// Label naming the capacity type or NodePool an overlay was derived from
pub const SOURCE_LABEL: &str = "capacity-overlay.dev/source";
/// Label carrying the preference ordinal
pub const PREFERENCE_NUMBER_LABEL: &str = "capacity-overlay.dev/preference-number";
/// Label (and requirement key) set in disabled mode
pub const DISABLED_LABEL: &str = "capacity-overlay.dev/disabled";

/// Well-known instance labels used when rendering requirements
pub mod well_known {
    pub const NODEPOOL: &str = "karpenter.sh/nodepool";
    pub const CAPACITY_TYPE: &str = "karpenter.sh/capacity-type";
    pub const INSTANCE_FAMILY: &str = "karpenter.k8s.aws/instance-family";
    pub const INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";
    pub const REGION: &str = "topology.kubernetes.io/region";
    pub const ON_DEMAND: &str = "on-demand";
}

/// Scope of a Savings Plan capacity sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityKind {
    /// Compute Savings Plans, applicable to every family and region
    Global,
    /// EC2 Instance Savings Plans, scoped to one family in one region
    Regional,
}

impl CapacityKind {
    /// Value of the `type` label on Savings Plan series
    pub fn series_type(&self) -> &'static str {
        match self {
            CapacityKind::Global => "compute",
            CapacityKind::Regional => "ec2_instance",
        }
    }
}

/// One observed Savings Plan data point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacitySample {
    pub kind: CapacityKind,
    pub instance_family: Option<String>,
    pub region: Option<String>,
    /// Remaining capacity ($/hour) or utilization percent, depending on the series
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// One observed Reserved Instance data point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservedInstanceSample {
    pub instance_type: String,
    pub region: String,
    pub count: f64,
    pub timestamp: DateTime<Utc>,
}

/// Kind of pre-paid capacity a decision was made for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapacityType {
    ComputeSavingsPlan,
    Ec2InstanceSavingsPlan,
    ReservedInstance,
}

impl CapacityType {
    pub const ALL: [CapacityType; 3] = [
        CapacityType::ComputeSavingsPlan,
        CapacityType::Ec2InstanceSavingsPlan,
        CapacityType::ReservedInstance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CapacityType::ComputeSavingsPlan => "compute-savings-plan",
            CapacityType::Ec2InstanceSavingsPlan => "ec2-instance-savings-plan",
            CapacityType::ReservedInstance => "reserved-instance",
        }
    }
}

impl fmt::Display for CapacityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Origin tag of a managed overlay, serialized into [`TYPE_LABEL`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlayType {
    CostDecision,
    Preference,
}

impl OverlayType {
    pub fn as_label(&self) -> &'static str {
        match self {
            OverlayType::CostDecision => "cost-decision",
            OverlayType::Preference => "preference",
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "cost-decision" => Some(OverlayType::CostDecision),
            "preference" => Some(OverlayType::Preference),
            _ => None,
        }
    }
}

impl fmt::Display for OverlayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Operator of an overlay requirement.
///
/// The generator only emits `In`, `NotIn`, `Gt` and `Lt`; the remaining
/// variants exist so objects read back from the cluster keep every
/// requirement they carry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequirementOperator {
    In,
    NotIn,
    Gt,
    Lt,
    Exists,
    DoesNotExist,
    /// Anything else found on a stored object
    Unknown(String),
}

impl RequirementOperator {
    pub fn as_str(&self) -> &str {
        match self {
            RequirementOperator::In => "In",
            RequirementOperator::NotIn => "NotIn",
            RequirementOperator::Gt => "Gt",
            RequirementOperator::Lt => "Lt",
            RequirementOperator::Exists => "Exists",
            RequirementOperator::DoesNotExist => "DoesNotExist",
            RequirementOperator::Unknown(value) => value,
        }
    }

    /// Parse a wire operator; unrecognized values are kept as `Unknown`
    pub fn parse(value: &str) -> Self {
        match value {
            "In" => RequirementOperator::In,
            "NotIn" => RequirementOperator::NotIn,
            "Gt" => RequirementOperator::Gt,
            "Lt" => RequirementOperator::Lt,
            "Exists" => RequirementOperator::Exists,
            "DoesNotExist" => RequirementOperator::DoesNotExist,
            other => RequirementOperator::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for RequirementOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A (key, operator, values) match requirement on an overlay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub key: String,
    pub operator: RequirementOperator,
    pub values: Vec<String>,
}

impl Requirement {
    pub fn new(key: impl Into<String>, operator: RequirementOperator, values: Vec<String>) -> Self {
        Self {
            key: key.into(),
            operator,
            values,
        }
    }

    pub fn is_in(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(key, RequirementOperator::In, vec![value.into()])
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [{}]", self.key, self.operator, self.values.join(","))
    }
}

/// Reference from an overlay to the object that owns it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    /// Marks the managing controller reference
    pub controller: bool,
}

impl OwnerRef {
    pub fn nodepool(name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            api_version: "karpenter.sh/v1".to_string(),
            kind: "NodePool".to_string(),
            name: name.into(),
            uid: uid.into(),
            controller: true,
        }
    }

    pub fn deployment(name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            name: name.into(),
            uid: uid.into(),
            controller: false,
        }
    }
}

/// The subset of a NodePool the preference path needs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodePoolRef {
    pub name: String,
    pub uid: Option<String>,
    pub annotations: BTreeMap<String, String>,
}

/// Make a string safe for use as part of a Kubernetes object name
pub fn sanitize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
            out.push(c);
        } else {
            out.push('-');
        }
    }
    out.trim_matches(|c| c == '-' || c == '.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("M5.XLarge"), "m5.xlarge");
        assert_eq!(sanitize_name("us_west 2"), "us-west-2");
        assert_eq!(sanitize_name("-edge-"), "edge");
    }

    #[test]
    fn test_overlay_type_label_round_trip() {
        for t in [OverlayType::CostDecision, OverlayType::Preference] {
            assert_eq!(OverlayType::from_label(t.as_label()), Some(t));
        }
        assert_eq!(OverlayType::from_label("other"), None);
    }

    #[test]
    fn test_requirement_display() {
        let req = Requirement::new(
            well_known::INSTANCE_FAMILY,
            RequirementOperator::NotIn,
            vec!["t3".into(), "t3a".into()],
        );
        assert_eq!(
            req.to_string(),
            "karpenter.k8s.aws/instance-family NotIn [t3,t3a]"
        );
    }
}
