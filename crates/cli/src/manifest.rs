//! Manifest loading: a package directory of YAML files plus its inventory
//! template.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;

use rekon_inventory::{find_inventory_info, InventoryInfo};

pub struct Package {
    pub objects: Vec<Value>,
    pub inventory: Option<InventoryInfo>,
}

/// Read every `.yaml`/`.yml` file in the directory (sorted by name,
/// multi-document aware). The inventory template is recognized by its
/// inventory-id label and split out of the object set.
pub fn load_dir(dir: &Path) -> Result<Package> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("reading package directory {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    paths.sort();

    let mut objects = Vec::new();
    let mut inventory: Option<InventoryInfo> = None;
    for path in paths {
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        for doc in serde_yaml::Deserializer::from_str(&text) {
            let value = serde_yaml::Value::deserialize(doc)
                .with_context(|| format!("parsing manifest {}", path.display()))?;
            if value.is_null() {
                continue;
            }
            let json: Value = serde_json::to_value(value)
                .with_context(|| format!("converting manifest {}", path.display()))?;
            if json.get("apiVersion").and_then(|v| v.as_str()).is_none()
                || json.get("kind").and_then(|v| v.as_str()).is_none()
            {
                return Err(anyhow!(
                    "document in {} is missing apiVersion or kind",
                    path.display()
                ));
            }
            match find_inventory_info(&json) {
                Some(info) => inventory = Some(info),
                None => objects.push(json),
            }
        }
    }
    Ok(Package { objects, inventory })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_multi_doc_manifests_and_splits_inventory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("app.yaml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  namespace: ns\n---\napiVersion: v1\nkind: Secret\nmetadata:\n  name: s\n  namespace: ns\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("inventory-template.yaml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: inventory\n  namespace: default\n  labels:\n    cli-utils.sigs.k8s.io/inventory-id: inv-1\n",
        )
        .unwrap();

        let pkg = load_dir(dir.path()).unwrap();
        assert_eq!(pkg.objects.len(), 2);
        let inv = pkg.inventory.unwrap();
        assert_eq!(inv.id, "inv-1");
        assert_eq!(inv.name, "inventory");
        assert_eq!(inv.namespace, "default");
    }

    #[test]
    fn rejects_documents_without_type_info() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.yaml"), "just: data\n").unwrap();
        assert!(load_dir(dir.path()).is_err());
    }

    #[test]
    fn empty_directory_is_an_empty_package() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = load_dir(dir.path()).unwrap();
        assert!(pkg.objects.is_empty());
        assert!(pkg.inventory.is_none());
    }
}
