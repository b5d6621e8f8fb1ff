//! Controller configuration

use anyhow::{Context, Result};
use controller_lib::config::{DecisionConfig, FreshnessConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the optional configuration file
pub const CONFIG_FILE_ENV: &str = "OVERLAY_CONFIG_FILE";

/// Configuration file read when [`CONFIG_FILE_ENV`] is unset
pub const DEFAULT_CONFIG_FILE: &str = "/etc/capacity-overlay/config.toml";

/// Controller configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Prometheus base URL serving the cost metrics
    #[serde(default = "default_prometheus_url")]
    pub prometheus_url: String,

    /// Restrict every metrics query to one AWS account
    #[serde(default)]
    pub account_id: Option<String>,

    /// Seconds between decision cycles
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,

    /// Keep overlays but make them match nothing
    #[serde(default)]
    pub disabled: bool,

    #[serde(default)]
    pub decision: DecisionConfig,

    #[serde(default)]
    pub freshness: FreshnessConfig,

    /// Namespace and name of our own Deployment, used as an extra owner
    #[serde(default)]
    pub controller_namespace: Option<String>,
    #[serde(default)]
    pub controller_deployment: Option<String>,

    /// Write to an in-memory store instead of the cluster
    #[serde(default)]
    pub dry_run: bool,
}

fn default_api_port() -> u16 {
    8080
}

fn default_prometheus_url() -> String {
    "http://prometheus-server.monitoring:9090".to_string()
}

fn default_reconcile_interval() -> u64 {
    300
}

fn default_query_timeout() -> u64 {
    30
}

impl ControllerConfig {
    /// Load configuration from the config file (if present) and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_FILE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::load_from(Some(&path))
    }

    /// Load with an explicit file; `OVERLAY_*` variables take precedence
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("OVERLAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read controller configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Invalid controller configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let threshold = self.decision.utilization_threshold;
        if !threshold.is_finite() || threshold <= 0.0 {
            anyhow::bail!(
                "decision.utilization_threshold must be greater than 0, got {}",
                threshold
            );
        }
        if self.reconcile_interval_secs == 0 {
            anyhow::bail!("reconcile_interval_secs must be greater than 0");
        }
        if self.query_timeout_secs == 0 {
            anyhow::bail!("query_timeout_secs must be greater than 0");
        }
        Ok(())
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    /// Namespace and name of the controller Deployment, when both are set
    pub fn controller_deployment_ref(&self) -> Option<(&str, &str)> {
        match (&self.controller_namespace, &self.controller_deployment) {
            (Some(ns), Some(name)) if !ns.is_empty() && !name.is_empty() => {
                Some((ns.as_str(), name.as_str()))
            }
            _ => None,
        }
    }
}
