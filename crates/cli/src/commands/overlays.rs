//! Listing of managed overlays in the cluster

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use controller_lib::reconcile::OwnershipScope;
use controller_lib::store::{KubeOverlayStore, LabelSelector, OverlayObject, OverlayStore};
use controller_lib::{OverlayType, MANAGED_BY_LABEL, MANAGED_BY_VALUE, SOURCE_LABEL, TYPE_LABEL};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{print_json, print_table, OutputFormat};

/// Overlay origin as given on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Origin {
    Decision,
    Preference,
}

impl Origin {
    fn overlay_type(self) -> OverlayType {
        match self {
            Origin::Decision => OverlayType::CostDecision,
            Origin::Preference => OverlayType::Preference,
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct OverlayRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    overlay_type: String,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Weight")]
    weight: i32,
    #[tabled(rename = "Price")]
    price_adjustment: String,
    #[tabled(rename = "Requirements")]
    requirements: String,
}

impl From<&OverlayObject> for OverlayRow {
    fn from(overlay: &OverlayObject) -> Self {
        let label = |key: &str| overlay.labels.get(key).cloned().unwrap_or_default();
        Self {
            name: overlay.name.clone(),
            overlay_type: label(TYPE_LABEL),
            source: label(SOURCE_LABEL),
            weight: overlay.weight,
            price_adjustment: overlay.price_adjustment.clone(),
            requirements: overlay
                .requirements
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Label selector for the requested slice of managed overlays
fn selector_for(origin: Option<Origin>, nodepool: Option<String>) -> Result<LabelSelector> {
    match (origin, nodepool) {
        (Some(Origin::Decision), Some(_)) => {
            bail!("--nodepool only applies to preference overlays")
        }
        (_, Some(nodepool)) => Ok(OwnershipScope::nodepool(nodepool).selector()),
        (Some(origin), None) => Ok(OwnershipScope::new(origin.overlay_type(), None).selector()),
        (None, None) => Ok(LabelSelector::from([(
            MANAGED_BY_LABEL.to_string(),
            MANAGED_BY_VALUE.to_string(),
        )])),
    }
}

/// Highest weight first, then by name
fn sort_rows(rows: &mut [OverlayRow]) {
    rows.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.name.cmp(&b.name)));
}

/// List managed overlays through the cluster's NodeOverlay API
pub async fn list_overlays(
    origin: Option<Origin>,
    nodepool: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let selector = selector_for(origin, nodepool)?;

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let store = KubeOverlayStore::new(client);
    let overlays = store
        .list(&selector)
        .await
        .context("Failed to list NodeOverlays")?;

    let mut rows: Vec<OverlayRow> = overlays.iter().map(OverlayRow::from).collect();
    sort_rows(&mut rows);

    match format {
        OutputFormat::Json => print_json(&rows)?,
        OutputFormat::Table => print_table(&rows, "No managed overlays found"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use controller_lib::Requirement;
    use std::collections::BTreeMap;

    #[test]
    fn test_selectors() {
        let all = selector_for(None, None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[MANAGED_BY_LABEL], MANAGED_BY_VALUE);

        let decisions = selector_for(Some(Origin::Decision), None).unwrap();
        assert_eq!(decisions[TYPE_LABEL], "cost-decision");
        assert!(!decisions.contains_key(SOURCE_LABEL));

        let pool = selector_for(None, Some("general".to_string())).unwrap();
        assert_eq!(pool[TYPE_LABEL], "preference");
        assert_eq!(pool[SOURCE_LABEL], "general");

        assert!(selector_for(Some(Origin::Decision), Some("general".to_string())).is_err());
    }

    #[test]
    fn test_rows_sorted_by_weight() {
        let overlay = |name: &str, weight: i32| OverlayObject {
            name: name.to_string(),
            labels: BTreeMap::from([(SOURCE_LABEL.to_string(), "general".to_string())]),
            owners: Vec::new(),
            resource_version: None,
            requirements: vec![Requirement::is_in("kubernetes.io/arch", "arm64")],
            weight,
            price_adjustment: "-10%".to_string(),
        };

        let mut rows: Vec<OverlayRow> = [overlay("b", 1), overlay("a", 1), overlay("c", 20)]
            .iter()
            .map(OverlayRow::from)
            .collect();
        sort_rows(&mut rows);

        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
        assert_eq!(rows[0].source, "general");
        assert_eq!(rows[0].overlay_type, "");
    }
}
