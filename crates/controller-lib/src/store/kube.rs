//! Kubernetes-backed overlay store over Karpenter `NodeOverlay` objects

use super::{LabelSelector, OverlayObject, OverlayStore, StoreError};
use crate::models::{OwnerRef, Requirement, RequirementOperator};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// NodeOverlay adjusts the price the autoscaler assumes for matching
/// instance types
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "karpenter.sh",
    version = "v1alpha1",
    kind = "NodeOverlay",
    plural = "nodeoverlays"
)]
#[serde(rename_all = "camelCase")]
pub struct NodeOverlaySpec {
    /// Instance-type requirements; all must match
    #[serde(default)]
    pub requirements: Vec<OverlayRequirement>,

    /// Signed percentage, e.g. "-10%"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_adjustment: Option<String>,

    /// Higher weight wins when several overlays match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct OverlayRequirement {
    pub key: String,
    pub operator: String,
    #[serde(default)]
    pub values: Vec<String>,
}

fn to_owner_reference(owner: &OwnerRef) -> OwnerReference {
    OwnerReference {
        api_version: owner.api_version.clone(),
        kind: owner.kind.clone(),
        name: owner.name.clone(),
        uid: owner.uid.clone(),
        controller: Some(owner.controller),
        block_owner_deletion: None,
    }
}

fn from_owner_reference(owner: &OwnerReference) -> OwnerRef {
    OwnerRef {
        api_version: owner.api_version.clone(),
        kind: owner.kind.clone(),
        name: owner.name.clone(),
        uid: owner.uid.clone(),
        controller: owner.controller.unwrap_or(false),
    }
}

impl From<&OverlayObject> for NodeOverlay {
    fn from(obj: &OverlayObject) -> Self {
        let spec = NodeOverlaySpec {
            requirements: obj
                .requirements
                .iter()
                .map(|r| OverlayRequirement {
                    key: r.key.clone(),
                    operator: r.operator.as_str().to_string(),
                    values: r.values.clone(),
                })
                .collect(),
            price_adjustment: Some(obj.price_adjustment.clone()),
            weight: Some(obj.weight),
        };

        let mut overlay = NodeOverlay::new(&obj.name, spec);
        overlay.metadata = ObjectMeta {
            name: Some(obj.name.clone()),
            labels: Some(obj.labels.clone()),
            owner_references: if obj.owners.is_empty() {
                None
            } else {
                Some(obj.owners.iter().map(to_owner_reference).collect())
            },
            resource_version: obj.resource_version.clone(),
            ..Default::default()
        };
        overlay
    }
}

impl From<&NodeOverlay> for OverlayObject {
    fn from(overlay: &NodeOverlay) -> Self {
        let name = overlay.name_any();
        let requirements = overlay
            .spec
            .requirements
            .iter()
            .map(|r| {
                let operator = RequirementOperator::parse(&r.operator);
                if let RequirementOperator::Unknown(value) = &operator {
                    warn!(overlay = %name, operator = %value, "Requirement with unsupported operator");
                }
                Requirement::new(r.key.clone(), operator, r.values.clone())
            })
            .collect();

        OverlayObject {
            name: name.clone(),
            labels: overlay.labels().clone(),
            owners: overlay
                .owner_references()
                .iter()
                .map(from_owner_reference)
                .collect(),
            resource_version: overlay.resource_version(),
            requirements,
            weight: overlay.spec.weight.unwrap_or_default(),
            price_adjustment: overlay.spec.price_adjustment.clone().unwrap_or_default(),
        }
    }
}

fn map_kube_error(name: &str, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(name.to_string()),
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            StoreError::AlreadyExists(name.to_string())
        }
        kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict {
            name: name.to_string(),
            expected: None,
        },
        other => StoreError::Backend(other.to_string()),
    }
}

/// Render a selector as `k1=v1,k2=v2`
pub fn selector_string(selector: &LabelSelector) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// [`OverlayStore`] over the cluster-scoped `NodeOverlay` API
#[derive(Clone)]
pub struct KubeOverlayStore {
    api: Api<NodeOverlay>,
}

impl KubeOverlayStore {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl OverlayStore for KubeOverlayStore {
    async fn get(&self, name: &str) -> Result<Option<OverlayObject>, StoreError> {
        let overlay = self
            .api
            .get_opt(name)
            .await
            .map_err(|e| map_kube_error(name, e))?;
        Ok(overlay.as_ref().map(OverlayObject::from))
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<OverlayObject>, StoreError> {
        let selector = selector_string(selector);
        let params = ListParams::default().labels(&selector);
        let list = self
            .api
            .list(&params)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        debug!(selector = %selector, count = list.items.len(), "Listed overlays");
        Ok(list.items.iter().map(OverlayObject::from).collect())
    }

    async fn create(&self, overlay: &OverlayObject) -> Result<OverlayObject, StoreError> {
        let mut obj = NodeOverlay::from(overlay);
        obj.metadata.resource_version = None;
        let created = self
            .api
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_kube_error(&overlay.name, e))?;
        Ok(OverlayObject::from(&created))
    }

    async fn update(&self, overlay: &OverlayObject) -> Result<OverlayObject, StoreError> {
        let obj = NodeOverlay::from(overlay);
        let replaced = self
            .api
            .replace(&overlay.name, &PostParams::default(), &obj)
            .await
            .map_err(|e| match map_kube_error(&overlay.name, e) {
                StoreError::Conflict { name, .. } => StoreError::Conflict {
                    name,
                    expected: overlay.resource_version.clone(),
                },
                other => other,
            })?;
        Ok(OverlayObject::from(&replaced))
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_error(name, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn object() -> OverlayObject {
        OverlayObject {
            name: "general-preference-1".to_string(),
            labels: BTreeMap::from([("a".to_string(), "b".to_string())]),
            owners: vec![OwnerRef::nodepool("general", "uid-1")],
            resource_version: Some("42".to_string()),
            requirements: vec![
                Requirement::is_in("karpenter.sh/nodepool", "general"),
                Requirement::new(
                    "karpenter.k8s.aws/instance-cpu",
                    RequirementOperator::Lt,
                    vec!["16".to_string()],
                ),
            ],
            weight: 1,
            price_adjustment: "-10%".to_string(),
        }
    }

    #[test]
    fn test_conversion_preserves_fields() {
        let original = object();
        let overlay = NodeOverlay::from(&original);

        assert_eq!(overlay.spec.weight, Some(1));
        assert_eq!(overlay.spec.requirements[1].operator, "Lt");
        assert_eq!(
            overlay.metadata.owner_references.as_ref().unwrap()[0].kind,
            "NodePool"
        );

        assert_eq!(OverlayObject::from(&overlay), original);
    }

    #[test]
    fn test_spec_serializes_camel_case() {
        let overlay = NodeOverlay::from(&object());
        let json = serde_json::to_value(&overlay.spec).unwrap();
        assert_eq!(json["priceAdjustment"], "-10%");
        assert_eq!(json["requirements"][0]["operator"], "In");
    }

    #[test]
    fn test_foreign_operators_are_kept() {
        let mut overlay = NodeOverlay::from(&object());
        for operator in ["Exists", "Matches"] {
            overlay.spec.requirements.push(OverlayRequirement {
                key: "x".into(),
                operator: operator.into(),
                values: vec![],
            });
        }

        let read = OverlayObject::from(&overlay);
        assert_eq!(read.requirements.len(), 4);
        assert_eq!(read.requirements[2].operator, RequirementOperator::Exists);
        assert_eq!(
            read.requirements[3].operator,
            RequirementOperator::Unknown("Matches".into())
        );

        // Written back unchanged
        let written = NodeOverlay::from(&read);
        assert_eq!(written.spec.requirements, overlay.spec.requirements);
    }

    #[test]
    fn test_selector_string() {
        let selector = LabelSelector::from([
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ]);
        assert_eq!(selector_string(&selector), "a=1,b=2");
    }
}
