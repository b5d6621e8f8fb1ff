//! Sources of pre-paid capacity data
//!
//! The decision path reads Savings Plan capacity and utilization, Reserved
//! Instance counts, and the age of each data family through
//! [`CapacitySource`]. [`PrometheusSource`] is the production backend;
//! [`StaticSource`] serves fixed data.

mod prometheus;

pub use self::prometheus::PrometheusSource;

use crate::models::{CapacityKind, CapacitySample, ReservedInstanceSample};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Independently refreshed family of capacity data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFamily {
    SavingsPlans,
    ReservedInstances,
}

impl DataFamily {
    pub const ALL: [DataFamily; 2] = [DataFamily::SavingsPlans, DataFamily::ReservedInstances];

    /// Value of the `data_type` label on freshness series
    pub fn as_str(&self) -> &'static str {
        match self {
            DataFamily::SavingsPlans => "savings_plans",
            DataFamily::ReservedInstances => "reserved_instances",
        }
    }
}

impl fmt::Display for DataFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid metrics source url '{0}'")]
    InvalidUrl(String),

    #[error("metrics request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("metrics source returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("query '{query}' failed: {message}")]
    Query { query: String, message: String },

    #[error("no data returned for '{0}'")]
    NoData(String),
}

/// Read access to capacity data
#[async_trait]
pub trait CapacitySource: Send + Sync {
    /// Remaining Savings Plan capacity ($/hour) per series
    async fn savings_plan_capacity(
        &self,
        kind: CapacityKind,
    ) -> Result<Vec<CapacitySample>, SourceError>;

    /// Savings Plan utilization percent per series
    async fn savings_plan_utilization(
        &self,
        kind: CapacityKind,
    ) -> Result<Vec<CapacitySample>, SourceError>;

    async fn reserved_instances(&self) -> Result<Vec<ReservedInstanceSample>, SourceError>;

    /// Time since the family was last refreshed upstream
    async fn data_age(&self, family: DataFamily) -> Result<Duration, SourceError>;
}

/// A query [`StaticSource`] can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceQuery {
    Capacity(CapacityKind),
    Utilization(CapacityKind),
    ReservedInstances,
    DataAge(DataFamily),
}

/// Fixed capacity data, for dry analysis and tests
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    pub capacity: Vec<CapacitySample>,
    pub utilization: Vec<CapacitySample>,
    pub reserved: Vec<ReservedInstanceSample>,
    /// Families without an entry report [`SourceError::NoData`]
    pub ages: HashMap<DataFamily, Duration>,
    pub failing: Vec<SourceQuery>,
}

impl StaticSource {
    /// A source whose every family is fresh
    pub fn fresh() -> Self {
        Self {
            ages: DataFamily::ALL
                .iter()
                .map(|f| (*f, Duration::from_secs(60)))
                .collect(),
            ..Default::default()
        }
    }

    fn check(&self, query: SourceQuery) -> Result<(), SourceError> {
        if self.failing.contains(&query) {
            return Err(SourceError::Query {
                query: format!("{:?}", query),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CapacitySource for StaticSource {
    async fn savings_plan_capacity(
        &self,
        kind: CapacityKind,
    ) -> Result<Vec<CapacitySample>, SourceError> {
        self.check(SourceQuery::Capacity(kind))?;
        Ok(self
            .capacity
            .iter()
            .filter(|s| s.kind == kind)
            .cloned()
            .collect())
    }

    async fn savings_plan_utilization(
        &self,
        kind: CapacityKind,
    ) -> Result<Vec<CapacitySample>, SourceError> {
        self.check(SourceQuery::Utilization(kind))?;
        Ok(self
            .utilization
            .iter()
            .filter(|s| s.kind == kind)
            .cloned()
            .collect())
    }

    async fn reserved_instances(&self) -> Result<Vec<ReservedInstanceSample>, SourceError> {
        self.check(SourceQuery::ReservedInstances)?;
        Ok(self.reserved.clone())
    }

    async fn data_age(&self, family: DataFamily) -> Result<Duration, SourceError> {
        self.check(SourceQuery::DataAge(family))?;
        self.ages
            .get(&family)
            .copied()
            .ok_or_else(|| SourceError::NoData(family.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(kind: CapacityKind, value: f64) -> CapacitySample {
        CapacitySample {
            kind,
            instance_family: None,
            region: None,
            value,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_static_source_filters_by_kind() {
        let source = StaticSource {
            capacity: vec![
                sample(CapacityKind::Global, 1.0),
                sample(CapacityKind::Regional, 2.0),
            ],
            ..StaticSource::fresh()
        };

        let global = source
            .savings_plan_capacity(CapacityKind::Global)
            .await
            .unwrap();
        assert_eq!(global.len(), 1);
        assert_eq!(global[0].value, 1.0);
    }

    #[tokio::test]
    async fn test_static_source_failures_and_missing_age() {
        let source = StaticSource {
            failing: vec![SourceQuery::ReservedInstances],
            ..Default::default()
        };

        assert!(source.reserved_instances().await.is_err());
        assert!(matches!(
            source.data_age(DataFamily::SavingsPlans).await,
            Err(SourceError::NoData(_))
        ));
    }
}
