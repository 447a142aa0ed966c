//! Cluster-side inventory: the durable record of applied identities.
//!
//! The record is a ConfigMap whose data keys are serialized identities
//! (values are reserved). The membership hash rides along as an annotation
//! for cheap change detection.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use rekon_cluster::{ApplyParams, ClusterClient, ClusterError, DryRun, PropagationPolicy};
use rekon_core::annotations::{owning_inventory, INVENTORY_ID_LABEL};
use rekon_core::{unstructured, ObjMeta, ObjMetaSet, ParseError};

pub const INVENTORY_HASH_ANNOTATION: &str = "cli-utils.sigs.k8s.io/inventory-hash";

const INVENTORY_FIELD_MANAGER: &str = "rekon-inventory";

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("invalid inventory entry: {0}")]
    Entry(#[from] ParseError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error("inventory object {0} is malformed: {1}")]
    Malformed(String, String),
}

/// Locates one inventory record. The id is the user-facing stable
/// identifier carried in the inventory-id label; name/namespace address the
/// backing ConfigMap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryInfo {
    pub name: String,
    pub namespace: String,
    pub id: String,
}

impl InventoryInfo {
    fn obj_meta(&self) -> ObjMeta {
        ObjMeta {
            group: String::new(),
            kind: "ConfigMap".to_string(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

/// How to treat live objects owned by someone else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InventoryPolicy {
    /// Refuse to touch objects carrying a different inventory id.
    #[default]
    Strict,
    /// Overtake ownership of foreign or unowned objects.
    Adopt,
}

/// Per-object ownership decision on apply. Unowned live objects are adopted
/// under both policies; a foreign owner is a conflict under strict.
pub fn can_apply(
    inv_id: &str,
    live: Option<&Value>,
    policy: InventoryPolicy,
) -> Result<(), String> {
    let Some(live) = live else { return Ok(()) };
    match owning_inventory(live) {
        None => Ok(()),
        Some(owner) if owner == inv_id => Ok(()),
        Some(owner) => match policy {
            InventoryPolicy::Adopt => Ok(()),
            InventoryPolicy::Strict => Err(format!(
                "object owned by inventory {owner:?}, expected {inv_id:?}"
            )),
        },
    }
}

/// Per-object ownership decision on prune: only delete what we own.
pub fn can_prune(inv_id: &str, live: &Value) -> bool {
    owning_inventory(live) == Some(inv_id)
}

/// Read/write access to the persisted inventory record.
#[async_trait]
pub trait InventoryClient: Send + Sync {
    /// Load the membership; None when no record exists yet.
    async fn load(&self, inv: &InventoryInfo) -> Result<Option<ObjMetaSet>, InventoryError>;

    /// Create or replace the record with the given membership.
    async fn write(&self, inv: &InventoryInfo, membership: &ObjMetaSet)
        -> Result<(), InventoryError>;

    /// Remove the record entirely (destroy flow, after membership drains).
    async fn delete(&self, inv: &InventoryInfo) -> Result<(), InventoryError>;
}

/// ConfigMap-backed inventory store.
pub struct ConfigMapInventory {
    cluster: Arc<dyn ClusterClient>,
}

impl ConfigMapInventory {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl InventoryClient for ConfigMapInventory {
    async fn load(&self, inv: &InventoryInfo) -> Result<Option<ObjMetaSet>, InventoryError> {
        let Some(obj) = self.cluster.get(&inv.obj_meta(), Some("v1")).await? else {
            debug!(inventory = %inv.id, "no inventory record in cluster");
            return Ok(None);
        };
        let mut membership = ObjMetaSet::new();
        if let Some(data) = obj.get("data").and_then(|d| d.as_object()) {
            for key in data.keys() {
                membership.insert(ObjMeta::parse(key)?);
            }
        }
        info!(inventory = %inv.id, members = membership.len(), "inventory loaded");
        Ok(Some(membership))
    }

    async fn write(
        &self,
        inv: &InventoryInfo,
        membership: &ObjMetaSet,
    ) -> Result<(), InventoryError> {
        let obj = inventory_object(inv, membership);
        // Server-side apply so dropped members leave the record; a merge
        // patch would keep stale keys around.
        let params = ApplyParams {
            server_side: true,
            force_conflicts: true,
            field_manager: INVENTORY_FIELD_MANAGER.to_string(),
            dry_run: DryRun::None,
        };
        self.cluster.apply(&obj, &params).await?;
        info!(inventory = %inv.id, members = membership.len(), hash = %membership.hash(), "inventory written");
        Ok(())
    }

    async fn delete(&self, inv: &InventoryInfo) -> Result<(), InventoryError> {
        self.cluster.delete(&inv.obj_meta(), PropagationPolicy::Background, false).await?;
        info!(inventory = %inv.id, "inventory deleted");
        Ok(())
    }
}

/// Build the inventory ConfigMap for a membership set.
pub fn inventory_object(inv: &InventoryInfo, membership: &ObjMetaSet) -> Value {
    let data: BTreeMap<String, String> =
        membership.iter().map(|id| (id.to_string(), String::new())).collect();
    let cm = ConfigMap {
        metadata: ObjectMeta {
            name: Some(inv.name.clone()),
            namespace: Some(inv.namespace.clone()),
            labels: Some(BTreeMap::from([(INVENTORY_ID_LABEL.to_string(), inv.id.clone())])),
            annotations: Some(BTreeMap::from([(
                INVENTORY_HASH_ANNOTATION.to_string(),
                membership.hash(),
            )])),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    };
    let mut obj = serde_json::to_value(&cm).unwrap_or_default();
    // k8s-openapi types omit apiVersion/kind when serialized standalone.
    obj["apiVersion"] = Value::String("v1".to_string());
    obj["kind"] = Value::String("ConfigMap".to_string());
    obj
}

/// An empty inventory template, as emitted by `rekon init`.
pub fn inventory_template(inv: &InventoryInfo) -> Value {
    inventory_object(inv, &ObjMetaSet::new())
}

/// Recognize the inventory template among loaded manifests by its label.
pub fn find_inventory_info(obj: &Value) -> Option<InventoryInfo> {
    if unstructured::kind(obj) != "ConfigMap" {
        return None;
    }
    let id = unstructured::label(obj, INVENTORY_ID_LABEL)?;
    let namespace = unstructured::namespace(obj);
    Some(InventoryInfo {
        name: unstructured::name(obj).to_string(),
        namespace: if namespace.is_empty() { "default".to_string() } else { namespace.to_string() },
        id: id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekon_cluster::mock::MockCluster;
    use serde_json::json;

    fn inv() -> InventoryInfo {
        InventoryInfo { name: "inventory".into(), namespace: "default".into(), id: "inv-1".into() }
    }

    fn members() -> ObjMetaSet {
        vec![
            ObjMeta::new("apps", "Deployment", "test-namespace", "foo").unwrap(),
            ObjMeta::new("", "Secret", "test-namespace", "secret").unwrap(),
        ]
        .into()
    }

    #[tokio::test]
    async fn write_then_load_round_trips_membership() {
        let cluster = Arc::new(MockCluster::new());
        let store = ConfigMapInventory::new(cluster);
        assert_eq!(store.load(&inv()).await.unwrap(), None);

        store.write(&inv(), &members()).await.unwrap();
        let loaded = store.load(&inv()).await.unwrap().unwrap();
        assert!(loaded.set_equals(&members()));
    }

    #[tokio::test]
    async fn delete_removes_the_record() {
        let cluster = Arc::new(MockCluster::new());
        let store = ConfigMapInventory::new(cluster);
        store.write(&inv(), &members()).await.unwrap();
        store.delete(&inv()).await.unwrap();
        assert_eq!(store.load(&inv()).await.unwrap(), None);
    }

    #[test]
    fn inventory_object_carries_label_and_hash() {
        let obj = inventory_object(&inv(), &members());
        assert_eq!(unstructured::label(&obj, INVENTORY_ID_LABEL), Some("inv-1"));
        assert_eq!(
            unstructured::annotation(&obj, INVENTORY_HASH_ANNOTATION),
            Some(members().hash().as_str())
        );
        let found = find_inventory_info(&obj).unwrap();
        assert_eq!(found, inv());
    }

    #[test]
    fn ownership_rules() {
        let unowned = json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p"}});
        let mine = json!({"apiVersion": "v1", "kind": "Pod", "metadata": {
            "name": "p", "annotations": {"config.k8s.io/owning-inventory": "inv-1"}}});
        let theirs = json!({"apiVersion": "v1", "kind": "Pod", "metadata": {
            "name": "p", "annotations": {"config.k8s.io/owning-inventory": "other"}}});

        assert!(can_apply("inv-1", None, InventoryPolicy::Strict).is_ok());
        assert!(can_apply("inv-1", Some(&unowned), InventoryPolicy::Strict).is_ok());
        assert!(can_apply("inv-1", Some(&mine), InventoryPolicy::Strict).is_ok());
        assert!(can_apply("inv-1", Some(&theirs), InventoryPolicy::Strict).is_err());
        assert!(can_apply("inv-1", Some(&theirs), InventoryPolicy::Adopt).is_ok());

        assert!(can_prune("inv-1", &mine));
        assert!(!can_prune("inv-1", &theirs));
        assert!(!can_prune("inv-1", &unowned));
    }
}
