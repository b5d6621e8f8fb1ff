//! Offline check of preference annotations

use anyhow::Result;
use colored::Colorize;
use controller_lib::generator::{GeneratedOverlay, OverlayGenerator};
use controller_lib::preference::{parse_annotations, Preference, ANNOTATION_PREFIX};
use serde::Serialize;
use std::collections::BTreeMap;
use tabled::Tabled;

use crate::output::{print_error, print_heading, print_json, print_success, print_table, OutputFormat};

const SHORT_PREFIX: &str = "preference.";

#[derive(Tabled)]
struct PreferenceRow {
    #[tabled(rename = "#")]
    number: u32,
    #[tabled(rename = "Matchers")]
    matchers: String,
    #[tabled(rename = "Adjust")]
    adjustment: String,
    #[tabled(rename = "Overlay")]
    overlay: String,
    #[tabled(rename = "Weight")]
    weight: i32,
}

#[derive(Debug, Serialize)]
struct LintedPreference {
    preference: Preference,
    overlay: GeneratedOverlay,
}

#[derive(Debug, Serialize)]
struct LintReport {
    nodepool: String,
    preferences: Vec<LintedPreference>,
    errors: Vec<String>,
}

/// Expand `preference.N` to the full annotation key
fn normalize_key(key: &str) -> Option<String> {
    if key.starts_with(ANNOTATION_PREFIX) {
        Some(key.to_string())
    } else {
        key.strip_prefix(SHORT_PREFIX)
            .map(|suffix| format!("{}{}", ANNOTATION_PREFIX, suffix))
    }
}

/// Split `key=value` arguments into an annotation map. Arguments that are
/// not preference annotations are reported instead.
fn collect_annotations(args: &[String]) -> (BTreeMap<String, String>, Vec<String>) {
    let mut annotations = BTreeMap::new();
    let mut errors = Vec::new();

    for arg in args {
        let Some((key, value)) = arg.split_once('=') else {
            errors.push(format!("'{}': expected key=value", arg));
            continue;
        };
        let Some(key) = normalize_key(key.trim()) else {
            errors.push(format!(
                "'{}': not a preference annotation (use {}N or {}N)",
                key, ANNOTATION_PREFIX, SHORT_PREFIX
            ));
            continue;
        };
        if annotations.insert(key.clone(), value.to_string()).is_some() {
            errors.push(format!("{}: given more than once", key));
        }
    }

    (annotations, errors)
}

fn build_report(nodepool: &str, args: &[String]) -> LintReport {
    let (annotations, mut errors) = collect_annotations(args);
    let parsed = parse_annotations(nodepool, &annotations);
    errors.extend(parsed.errors.iter().map(|e| e.to_string()));

    let generator = OverlayGenerator::new(false);
    let preferences = parsed
        .preferences
        .into_iter()
        .map(|preference| LintedPreference {
            overlay: generator.from_preference(&preference),
            preference,
        })
        .collect();

    LintReport {
        nodepool: nodepool.to_string(),
        preferences,
        errors,
    }
}

/// Lint annotations; returns whether every annotation parsed
pub fn lint_annotations(nodepool: &str, args: &[String], format: OutputFormat) -> Result<bool> {
    let report = build_report(nodepool, args);
    let clean = report.errors.is_empty();

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            print_heading(&format!("Preferences for NodePool {}", nodepool.cyan()));
            let rows: Vec<PreferenceRow> = report
                .preferences
                .iter()
                .map(|linted| PreferenceRow {
                    number: linted.preference.number,
                    matchers: linted
                        .preference
                        .matchers
                        .iter()
                        .map(|m| m.to_string())
                        .collect::<Vec<_>>()
                        .join(" "),
                    adjustment: linted.overlay.price_adjustment.clone(),
                    overlay: linted.overlay.name.clone(),
                    weight: linted.overlay.weight,
                })
                .collect();
            print_table(&rows, "No valid preferences");

            for linted in &report.preferences {
                println!();
                println!("{}", linted.overlay.name.bold());
                for requirement in &linted.overlay.requirements {
                    println!("  {}", requirement);
                }
            }

            println!();
            if clean {
                print_success(&format!("{} annotation(s) valid", report.preferences.len()));
            } else {
                for error in &report.errors {
                    print_error(error);
                }
            }
        }
    }

    Ok(clean)
}
