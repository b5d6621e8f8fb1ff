//! Instance-type preferences declared as NodePool annotations
//!
//! Each `capacity-overlay.dev/preference.<N>` annotation holds a small
//! expression such as
//! `karpenter.k8s.aws/instance-family=m7i,m7a adjust=-10%`.
//! Annotations are parsed independently; one bad annotation never hides
//! the others.

mod parser;

pub use parser::parse_preference;

use crate::models::{NodePoolRef, RequirementOperator};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Prefix of preference annotation keys; followed by the ordinal
pub const ANNOTATION_PREFIX: &str = "capacity-overlay.dev/preference.";

/// Instance labels a preference may match on
pub const ALLOWED_KEYS: &[&str] = &[
    "karpenter.k8s.aws/instance-family",
    "karpenter.k8s.aws/instance-category",
    "karpenter.k8s.aws/instance-generation",
    "karpenter.k8s.aws/instance-size",
    "karpenter.k8s.aws/instance-cpu",
    "karpenter.k8s.aws/instance-memory",
    "karpenter.k8s.aws/instance-hypervisor",
    "karpenter.k8s.aws/instance-gpu-count",
    "karpenter.k8s.aws/instance-gpu-manufacturer",
    "karpenter.k8s.aws/instance-gpu-name",
    "karpenter.k8s.aws/instance-local-nvme",
    "karpenter.k8s.aws/instance-network-bandwidth",
    "node.kubernetes.io/instance-type",
    "kubernetes.io/arch",
    "kubernetes.io/os",
    "karpenter.sh/capacity-type",
    "topology.kubernetes.io/zone",
    "topology.kubernetes.io/region",
];

/// Operator of a preference matcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchOperator {
    /// `=`
    In,
    /// `!=`
    NotIn,
    /// `>`
    Gt,
    /// `<`
    Lt,
}

impl MatchOperator {
    pub fn symbol(&self) -> &'static str {
        match self {
            MatchOperator::In => "=",
            MatchOperator::NotIn => "!=",
            MatchOperator::Gt => ">",
            MatchOperator::Lt => "<",
        }
    }

    pub fn to_requirement(self) -> RequirementOperator {
        match self {
            MatchOperator::In => RequirementOperator::In,
            MatchOperator::NotIn => RequirementOperator::NotIn,
            MatchOperator::Gt => RequirementOperator::Gt,
            MatchOperator::Lt => RequirementOperator::Lt,
        }
    }
}

impl fmt::Display for MatchOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// One `key<op>value[,value...]` term
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMatcher {
    pub key: String,
    pub operator: MatchOperator,
    pub values: Vec<String>,
}

impl fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.key, self.operator, self.values.join(","))
    }
}

/// Signed percentage price adjustment
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    percent: f64,
}

impl Adjustment {
    pub fn new(percent: f64) -> Self {
        Self { percent }
    }

    pub fn percent(&self) -> f64 {
        self.percent
    }

    /// Render as `+N%`, `-N%`, or `0%`
    pub fn render(&self) -> String {
        if self.percent > 0.0 {
            format!("+{}%", self.percent)
        } else if self.percent < 0.0 {
            format!("{}%", self.percent)
        } else {
            "0%".to_string()
        }
    }
}

/// A parsed preference annotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preference {
    /// Ordinal from the annotation key; also the overlay weight
    pub number: u32,
    pub nodepool: String,
    /// ANDed, in annotation order
    pub matchers: Vec<LabelMatcher>,
    pub adjustment: Adjustment,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("annotation value is empty")]
    Empty,

    #[error("malformed token '{0}'")]
    MalformedToken(String),

    #[error("unsupported operator '{operator}' in '{token}' (use >, <, =, !=)")]
    UnsupportedOperator { token: String, operator: String },

    #[error("unknown key '{0}'")]
    UnknownKey(String),

    #[error("empty value in '{0}'")]
    EmptyValue(String),

    #[error("'{key}{operator}' takes exactly one value, got {count}")]
    WrongValueCount {
        key: String,
        operator: MatchOperator,
        count: usize,
    },

    #[error("'{key}' comparison value '{value}' is not an integer")]
    NonNumericValue { key: String, value: String },

    #[error("malformed adjustment '{0}' (expected adjust=[+-]N%)")]
    MalformedAdjustment(String),

    #[error("missing adjust=[+-]N% token")]
    MissingAdjustment,

    #[error("adjust given more than once")]
    DuplicateAdjustment,

    #[error("at least one matcher is required")]
    NoMatchers,

    #[error("invalid preference annotation key '{0}' (expected capacity-overlay.dev/preference.<N>, N >= 1)")]
    InvalidAnnotationKey(String),

    #[error("preference number {0} declared more than once")]
    DuplicateNumber(u32),
}

/// A parse failure tied to the annotation that produced it
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{annotation}: {error}")]
pub struct AnnotationError {
    pub annotation: String,
    pub error: ParseError,
}

/// Result of parsing every preference annotation of one NodePool
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPreferences {
    /// Sorted ascending by number
    pub preferences: Vec<Preference>,
    pub errors: Vec<AnnotationError>,
}

/// Extract the ordinal from a preference annotation key.
///
/// Returns `None` for unrelated annotations.
pub fn annotation_number(key: &str) -> Option<Result<u32, ParseError>> {
    let suffix = key.strip_prefix(ANNOTATION_PREFIX)?;
    let invalid = || ParseError::InvalidAnnotationKey(key.to_string());

    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return Some(Err(invalid()));
    }
    Some(match suffix.parse::<u32>() {
        Ok(0) | Err(_) => Err(invalid()),
        Ok(n) => Ok(n),
    })
}

/// Parse every preference annotation on a NodePool
pub fn parse_annotations(nodepool: &str, annotations: &BTreeMap<String, String>) -> ParsedPreferences {
    let mut by_number: BTreeMap<u32, Preference> = BTreeMap::new();
    let mut errors = Vec::new();

    for (key, value) in annotations {
        let number = match annotation_number(key) {
            None => continue,
            Some(Ok(n)) => n,
            Some(Err(error)) => {
                errors.push(AnnotationError {
                    annotation: key.clone(),
                    error,
                });
                continue;
            }
        };

        if by_number.contains_key(&number) {
            errors.push(AnnotationError {
                annotation: key.clone(),
                error: ParseError::DuplicateNumber(number),
            });
            continue;
        }

        match parse_preference(nodepool, number, value) {
            Ok(pref) => {
                by_number.insert(number, pref);
            }
            Err(error) => errors.push(AnnotationError {
                annotation: key.clone(),
                error,
            }),
        }
    }

    ParsedPreferences {
        preferences: by_number.into_values().collect(),
        errors,
    }
}

/// Parse the preferences of a NodePool
pub fn parse_nodepool(nodepool: &NodePoolRef) -> ParsedPreferences {
    parse_annotations(&nodepool.name, &nodepool.annotations)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_output_sorted_by_number() {
        let ann = annotations(&[
            (
                "capacity-overlay.dev/preference.5",
                "karpenter.k8s.aws/instance-family=m5 adjust=-5%",
            ),
            (
                "capacity-overlay.dev/preference.2",
                "karpenter.k8s.aws/instance-family=c5 adjust=-2%",
            ),
            (
                "capacity-overlay.dev/preference.10",
                "karpenter.k8s.aws/instance-family=r5 adjust=+10%",
            ),
        ]);

        let parsed = parse_annotations("default", &ann);

        assert!(parsed.errors.is_empty());
        let numbers: Vec<u32> = parsed.preferences.iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![2, 5, 10]);
        assert!(parsed.preferences.iter().all(|p| p.nodepool == "default"));
    }

    #[test]
    fn test_bad_annotation_does_not_block_others() {
        let ann = annotations(&[
            (
                "capacity-overlay.dev/preference.1",
                "karpenter.k8s.aws/instance-family=m5 adjust=-5%",
            ),
            ("capacity-overlay.dev/preference.2", "bogus-key=1 adjust=-5%"),
            (
                "capacity-overlay.dev/preference.3",
                "kubernetes.io/arch=arm64 adjust=+15%",
            ),
            ("unrelated.io/annotation", "ignored"),
        ]);

        let parsed = parse_annotations("default", &ann);

        assert_eq!(parsed.preferences.len(), 2);
        assert_eq!(parsed.errors.len(), 1);
        assert_eq!(parsed.errors[0].annotation, "capacity-overlay.dev/preference.2");
        assert_eq!(
            parsed.errors[0].error,
            ParseError::UnknownKey("bogus-key".to_string())
        );
    }

    #[test]
    fn test_invalid_annotation_numbers() {
        assert_eq!(annotation_number("other/key"), None);
        assert_eq!(annotation_number("capacity-overlay.dev/preference.7"), Some(Ok(7)));
        for bad in [
            "capacity-overlay.dev/preference.0",
            "capacity-overlay.dev/preference.",
            "capacity-overlay.dev/preference.x",
            "capacity-overlay.dev/preference.-1",
        ] {
            assert!(matches!(annotation_number(bad), Some(Err(_))), "{}", bad);
        }
    }

    #[test]
    fn test_duplicate_numbers_reported() {
        let ann = annotations(&[
            (
                "capacity-overlay.dev/preference.01",
                "kubernetes.io/arch=arm64 adjust=-1%",
            ),
            (
                "capacity-overlay.dev/preference.1",
                "kubernetes.io/arch=amd64 adjust=-1%",
            ),
        ]);

        let parsed = parse_annotations("default", &ann);

        assert_eq!(parsed.preferences.len(), 1);
        assert_eq!(parsed.errors[0].error, ParseError::DuplicateNumber(1));
    }

    #[test]
    fn test_matcher_display() {
        let matcher = LabelMatcher {
            key: "karpenter.k8s.aws/instance-cpu".to_string(),
            operator: MatchOperator::Lt,
            values: vec!["16".to_string()],
        };
        assert_eq!(matcher.to_string(), "karpenter.k8s.aws/instance-cpu<16");
    }
}
