//! Read-only preview of the cost decision path

use anyhow::{ensure, Context, Result};
use colored::Colorize;
use controller_lib::config::{DecisionConfig, FreshnessConfig};
use controller_lib::controller::{AnalysisReport, DecisionAnalyzer};
use controller_lib::decision::DecisionEngine;
use controller_lib::source::PrometheusSource;
use controller_lib::NoopMetrics;
use std::sync::Arc;
use std::time::Duration;
use tabled::Tabled;

use crate::output::{
    color_verdict, format_age, print_heading, print_info, print_json, print_table,
    print_warning, OutputFormat,
};

/// Flags of `ovc analyze`
#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    pub prometheus_url: String,
    pub threshold: Option<f64>,
    pub account_id: Option<String>,
    pub max_data_age_secs: Option<u64>,
    pub timeout_secs: u64,
}

impl AnalyzeOptions {
    fn decision_config(&self) -> Result<DecisionConfig> {
        let mut config = DecisionConfig::default();
        if let Some(threshold) = self.threshold {
            ensure!(
                threshold.is_finite() && threshold > 0.0,
                "threshold must be greater than 0, got {}",
                threshold
            );
            config.utilization_threshold = threshold;
        }
        Ok(config)
    }

    fn freshness_config(&self) -> FreshnessConfig {
        match self.max_data_age_secs {
            Some(secs) => FreshnessConfig {
                savings_plans_max_age_secs: secs,
                reserved_instances_max_age_secs: secs,
            },
            None => FreshnessConfig::default(),
        }
    }
}

#[derive(Tabled)]
struct DecisionRow {
    #[tabled(rename = "Overlay")]
    name: String,
    #[tabled(rename = "Capacity Type")]
    capacity_type: String,
    #[tabled(rename = "Wanted")]
    wanted: String,
    #[tabled(rename = "Weight")]
    weight: i32,
    #[tabled(rename = "Reason")]
    reason: String,
}

#[derive(Tabled)]
struct SkipRow {
    #[tabled(rename = "Family")]
    family: String,
    #[tabled(rename = "Capacity Type")]
    capacity_type: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Run one analysis against Prometheus and print the decisions
pub async fn run_analysis(options: AnalyzeOptions, format: OutputFormat) -> Result<()> {
    let decision = options.decision_config()?;
    let source = PrometheusSource::new(
        &options.prometheus_url,
        options.account_id.clone(),
        Duration::from_secs(options.timeout_secs),
    )
    .context("Failed to create metrics source")?;

    let analyzer = DecisionAnalyzer::new(
        Arc::new(source),
        DecisionEngine::new(decision),
        options.freshness_config(),
        Arc::new(NoopMetrics),
    );
    let report = analyzer.analyze().await;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => print_report(&report, decision.utilization_threshold),
    }

    Ok(())
}

fn print_report(report: &AnalysisReport, threshold: f64) {
    print_heading("Data Freshness");
    for (family, age) in &report.data_ages {
        println!("{:<24}{}", family.to_string(), format_age(age.as_secs()).cyan());
    }
    println!();

    print_heading(&format!("Decisions (threshold {}%)", threshold));
    let rows: Vec<DecisionRow> = report
        .decisions
        .iter()
        .map(|d| DecisionRow {
            name: d.name.clone(),
            capacity_type: d.capacity_type.to_string(),
            wanted: color_verdict(d.should_exist),
            weight: d.weight,
            reason: d.reason.clone(),
        })
        .collect();
    print_table(&rows, "No capacity found");

    if !report.skipped.is_empty() {
        println!();
        print_warning("Some data was not analyzed; existing overlays for it stay untouched");
        let rows: Vec<SkipRow> = report
            .skipped
            .iter()
            .map(|s| SkipRow {
                family: s.family.to_string(),
                capacity_type: s
                    .capacity_type
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "all".to_string()),
                reason: s.reason.clone(),
            })
            .collect();
        print_table(&rows, "");
    }

    let wanted = report.decisions.iter().filter(|d| d.should_exist).count();
    println!();
    print_info(&format!(
        "{} of {} overlay(s) would exist",
        wanted,
        report.decisions.len()
    ));
}
