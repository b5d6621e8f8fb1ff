//! Prometheus instant-query backend

use super::{CapacitySource, DataFamily, SourceError};
use crate::models::{CapacityKind, CapacitySample, ReservedInstanceSample};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const REMAINING_CAPACITY: &str = "savings_plan_remaining_capacity";
const UTILIZATION: &str = "savings_plan_utilization_percent";
const RESERVED_COUNT: &str = "ec2_reserved_instance_count";
const FRESHNESS: &str = "data_freshness_seconds";

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<VectorSample>,
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    /// `[unix_seconds, "value"]`
    value: (f64, String),
}

/// Sample timestamps outside chrono's range are rejected rather than clamped
fn sample_time(ts: f64) -> Option<DateTime<Utc>> {
    if !ts.is_finite() || ts.abs() >= i64::MAX as f64 {
        return None;
    }
    let secs = ts.floor();
    let nanos = ((ts - secs) * 1e9) as u32;
    DateTime::from_timestamp(secs as i64, nanos.min(999_999_999))
}

/// Escape a PromQL label value for use inside double quotes
fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}

impl VectorSample {
    fn parsed(&self) -> Option<(f64, DateTime<Utc>)> {
        let value = self.value.1.parse::<f64>().ok().filter(|v| v.is_finite())?;
        Some((value, sample_time(self.value.0)?))
    }

    fn label(&self, name: &str) -> Option<String> {
        self.metric.get(name).filter(|v| !v.is_empty()).cloned()
    }
}

/// [`CapacitySource`] reading the exported cost metrics from Prometheus
#[derive(Clone)]
pub struct PrometheusSource {
    client: Client,
    query_url: Url,
    account_id: Option<String>,
}

impl PrometheusSource {
    pub fn new(
        base_url: &str,
        account_id: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let mut base =
            Url::parse(base_url).map_err(|_| SourceError::InvalidUrl(base_url.to_string()))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let query_url = base
            .join("api/v1/query")
            .map_err(|_| SourceError::InvalidUrl(base_url.to_string()))?;

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            query_url,
            account_id: account_id.filter(|a| !a.is_empty()),
        })
    }

    /// Build `metric{labels}` with the account filter appended
    fn selector(&self, metric: &str, labels: &[(&str, &str)]) -> String {
        let mut matchers: Vec<String> = labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
            .collect();
        if let Some(account) = &self.account_id {
            matchers.push(format!("account_id=\"{}\"", escape_label_value(account)));
        }
        format!("{}{{{}}}", metric, matchers.join(","))
    }

    async fn query(&self, query: &str) -> Result<Vec<VectorSample>, SourceError> {
        debug!(query = %query, "Querying metrics source");

        let response = self
            .client
            .get(self.query_url.clone())
            .query(&[("query", query)])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Status { status, body });
        }

        let body: QueryResponse = response.json().await?;
        if body.status != "success" {
            return Err(SourceError::Query {
                query: query.to_string(),
                message: body.error.unwrap_or_else(|| body.status.clone()),
            });
        }

        Ok(body.data.map(|d| d.result).unwrap_or_default())
    }

    async fn savings_plan_series(
        &self,
        metric: &str,
        kind: CapacityKind,
    ) -> Result<Vec<CapacitySample>, SourceError> {
        let query = self.selector(metric, &[("type", kind.series_type())]);
        let samples = self.query(&query).await?;

        Ok(samples
            .iter()
            .filter_map(|s| {
                let Some((value, timestamp)) = s.parsed() else {
                    warn!(query = %query, raw = %s.value.1, "Skipping sample with unparseable value");
                    return None;
                };
                Some(CapacitySample {
                    kind,
                    instance_family: s.label("instance_family"),
                    region: s.label("region"),
                    value,
                    timestamp,
                })
            })
            .collect())
    }
}

#[async_trait]
impl CapacitySource for PrometheusSource {
    async fn savings_plan_capacity(
        &self,
        kind: CapacityKind,
    ) -> Result<Vec<CapacitySample>, SourceError> {
        self.savings_plan_series(REMAINING_CAPACITY, kind).await
    }

    async fn savings_plan_utilization(
        &self,
        kind: CapacityKind,
    ) -> Result<Vec<CapacitySample>, SourceError> {
        self.savings_plan_series(UTILIZATION, kind).await
    }

    async fn reserved_instances(&self) -> Result<Vec<ReservedInstanceSample>, SourceError> {
        let query = self.selector(RESERVED_COUNT, &[]);
        let samples = self.query(&query).await?;

        Ok(samples
            .iter()
            .filter_map(|s| {
                let (count, timestamp) = s.parsed()?;
                match (s.label("instance_type"), s.label("region")) {
                    (Some(instance_type), Some(region)) => Some(ReservedInstanceSample {
                        instance_type,
                        region,
                        count,
                        timestamp,
                    }),
                    _ => {
                        warn!(labels = ?s.metric, "Skipping reserved instance series without instance_type/region");
                        None
                    }
                }
            })
            .collect())
    }

    async fn data_age(&self, family: DataFamily) -> Result<Duration, SourceError> {
        let query = self.selector(FRESHNESS, &[("data_type", family.as_str())]);
        let samples = self.query(&query).await?;

        // Several exporters may report the same family; the stalest wins
        let age = samples
            .iter()
            .filter_map(|s| s.parsed().map(|(v, _)| v))
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
            .ok_or_else(|| SourceError::NoData(query.clone()))?;

        Duration::try_from_secs_f64(age.max(0.0)).map_err(|_| SourceError::Query {
            query,
            message: format!("data age {} is out of range", age),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn vector(results: &str) -> String {
        format!(
            r#"{{"status":"success","data":{{"resultType":"vector","result":[{}]}}}}"#,
            results
        )
    }

    fn source(server: &Server, account: Option<&str>) -> PrometheusSource {
        PrometheusSource::new(
            &server.url(),
            account.map(String::from),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_selector_includes_account_filter() {
        let source = PrometheusSource::new(
            "http://prometheus:9090",
            Some("123456789012".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(
            source.selector(REMAINING_CAPACITY, &[("type", "compute")]),
            r#"savings_plan_remaining_capacity{type="compute",account_id="123456789012"}"#
        );

        let unfiltered =
            PrometheusSource::new("http://prometheus:9090", None, Duration::from_secs(5)).unwrap();
        assert_eq!(
            unfiltered.selector(RESERVED_COUNT, &[]),
            "ec2_reserved_instance_count{}"
        );
    }

    #[test]
    fn test_selector_escapes_label_values() {
        let source = PrometheusSource::new(
            "http://prometheus:9090",
            Some("a\"b\\c".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(
            source.selector(RESERVED_COUNT, &[("region", "us-east-1\n")]),
            r#"ec2_reserved_instance_count{region="us-east-1\n",account_id="a\"b\\c"}"#
        );
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(matches!(
            PrometheusSource::new("not a url", None, Duration::from_secs(5)),
            Err(SourceError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_regional_capacity_decoded() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/query")
            .match_query(Matcher::UrlEncoded(
                "query".into(),
                r#"savings_plan_remaining_capacity{type="ec2_instance"}"#.into(),
            ))
            .with_status(200)
            .with_body(vector(
                r#"{"metric":{"instance_family":"m5","region":"us-west-2"},"value":[1700000000.5,"12.25"]},
                   {"metric":{"instance_family":"c5","region":"us-west-2"},"value":[1700000000,"NaN"]}"#,
            ))
            .create_async()
            .await;

        let samples = source(&server, None)
            .savings_plan_capacity(CapacityKind::Regional)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].instance_family.as_deref(), Some("m5"));
        assert_eq!(samples[0].region.as_deref(), Some("us-west-2"));
        assert_eq!(samples[0].value, 12.25);
        assert_eq!(samples[0].timestamp.timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_reserved_instances_require_labels() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/v1/query")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(vector(
                r#"{"metric":{"instance_type":"m5.xlarge","region":"us-east-1"},"value":[1700000000,"4"]},
                   {"metric":{"region":"us-east-1"},"value":[1700000000,"2"]}"#,
            ))
            .create_async()
            .await;

        let samples = source(&server, Some("42")).reserved_instances().await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].instance_type, "m5.xlarge");
        assert_eq!(samples[0].count, 4.0);
    }

    #[tokio::test]
    async fn test_data_age_takes_stalest_series() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/v1/query")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(vector(
                r#"{"metric":{"data_type":"savings_plans"},"value":[1700000000,"120"]},
                   {"metric":{"data_type":"savings_plans"},"value":[1700000000,"900"]}"#,
            ))
            .create_async()
            .await;

        let age = source(&server, None)
            .data_age(DataFamily::SavingsPlans)
            .await
            .unwrap();
        assert_eq!(age, Duration::from_secs(900));
    }

    #[tokio::test]
    async fn test_oversized_data_age_is_an_error() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/v1/query")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(vector(
                r#"{"metric":{"data_type":"savings_plans"},"value":[1700000000,"1e20"]}"#,
            ))
            .create_async()
            .await;

        let err = source(&server, None)
            .data_age(DataFamily::SavingsPlans)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Query { .. }));
    }

    #[test]
    fn test_sample_time_bounds() {
        assert_eq!(
            sample_time(1700000000.5),
            DateTime::from_timestamp(1700000000, 500_000_000)
        );
        assert!(sample_time(1e300).is_none());
        assert!(sample_time(f64::NAN).is_none());
    }

    #[tokio::test]
    async fn test_samples_with_unrepresentable_timestamp_skipped() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/v1/query")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(vector(
                r#"{"metric":{"data_type":"savings_plans"},"value":[1e300,"50"]},
                   {"metric":{"data_type":"savings_plans"},"value":[1700000000,"30"]}"#,
            ))
            .create_async()
            .await;

        let age = source(&server, None)
            .data_age(DataFamily::SavingsPlans)
            .await
            .unwrap();
        assert_eq!(age, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_empty_freshness_is_no_data() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/v1/query")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(vector(""))
            .create_async()
            .await;

        let result = source(&server, None)
            .data_age(DataFamily::ReservedInstances)
            .await;
        assert!(matches!(result, Err(SourceError::NoData(_))));
    }

    #[tokio::test]
    async fn test_error_status_and_failed_query() {
        let mut server = Server::new_async().await;
        let _unavailable = server
            .mock("GET", "/api/v1/query")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("unavailable")
            .create_async()
            .await;

        let result = source(&server, None).reserved_instances().await;
        assert!(matches!(
            result,
            Err(SourceError::Status { status: 503, .. })
        ));

        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/v1/query")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#)
            .create_async()
            .await;

        let result = source(&server, None)
            .savings_plan_utilization(CapacityKind::Global)
            .await;
        assert!(matches!(result, Err(SourceError::Query { message, .. }) if message == "parse error"));
    }
}
