//! Engine annotations: depends-on, apply-time-mutation, inventory ownership.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::unstructured;
use crate::{ObjMeta, ObjMetaSet, ParseError};

pub const DEPENDS_ON_ANNOTATION: &str = "config.kubernetes.io/depends-on";
pub const MUTATION_ANNOTATION: &str = "config.kubernetes.io/apply-time-mutation";
pub const OWNING_INVENTORY_ANNOTATION: &str = "config.k8s.io/owning-inventory";
pub const ON_REMOVE_ANNOTATION: &str = "cli-utils.sigs.k8s.io/on-remove";
pub const ON_REMOVE_KEEP: &str = "keep";
pub const INVENTORY_ID_LABEL: &str = "cli-utils.sigs.k8s.io/inventory-id";

#[derive(Debug, thiserror::Error)]
pub enum AnnotationError {
    #[error("invalid depends-on reference {0:?}: expected group/kind/name or group/namespaces/namespace/kind/name")]
    InvalidDependsOn(String),
    #[error("invalid apply-time-mutation annotation: {0}")]
    InvalidMutation(String),
    #[error(transparent)]
    Identity(#[from] ParseError),
}

/// Parse one depends-on item.
///
/// Cluster-scoped: `${group}/${kind}/${name}`
/// Namespaced:     `${group}/namespaces/${namespace}/${kind}/${name}`
pub fn parse_depends_on_item(item: &str) -> Result<ObjMeta, AnnotationError> {
    let parts: Vec<&str> = item.trim().split('/').collect();
    match parts.as_slice() {
        [group, kind, name] => Ok(ObjMeta::new(*group, *kind, "", *name)?),
        [group, "namespaces", namespace, kind, name] => {
            Ok(ObjMeta::new(*group, *kind, *namespace, *name)?)
        }
        _ => Err(AnnotationError::InvalidDependsOn(item.to_string())),
    }
}

/// Parse the comma-separated depends-on annotation value.
pub fn parse_depends_on(value: &str) -> Result<ObjMetaSet, AnnotationError> {
    let mut out = ObjMetaSet::new();
    for item in value.split(',') {
        if item.trim().is_empty() {
            continue;
        }
        out.insert(parse_depends_on_item(item)?);
    }
    Ok(out)
}

pub fn format_depends_on_item(id: &ObjMeta) -> String {
    if id.namespace.is_empty() {
        format!("{}/{}/{}", id.group, id.kind, id.name)
    } else {
        format!("{}/namespaces/{}/{}/{}", id.group, id.namespace, id.kind, id.name)
    }
}

pub fn format_depends_on(set: &ObjMetaSet) -> String {
    set.iter().map(format_depends_on_item).collect::<Vec<_>>().join(",")
}

/// Read the depends-on annotation off an object, if present.
pub fn read_depends_on(obj: &Value) -> Result<ObjMetaSet, AnnotationError> {
    match unstructured::annotation(obj, DEPENDS_ON_ANNOTATION) {
        Some(v) => parse_depends_on(v),
        None => Ok(ObjMetaSet::new()),
    }
}

/// Reference to a substitution source object. Either `apiVersion` or `group`
/// may be set; the version, when present, is a lookup hint only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceReference {
    pub group: String,
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl ResourceReference {
    pub fn group(&self) -> &str {
        if !self.group.is_empty() {
            return &self.group;
        }
        match self.api_version.split_once('/') {
            Some((g, _)) => g,
            None => "",
        }
    }

    /// The version half of `apiVersion`, when one was given.
    pub fn version(&self) -> Option<&str> {
        if self.api_version.is_empty() {
            return None;
        }
        match self.api_version.split_once('/') {
            Some((_, v)) => Some(v),
            None => Some(self.api_version.as_str()),
        }
    }

    pub fn to_obj_meta(&self) -> Result<ObjMeta, ParseError> {
        ObjMeta::new(self.group(), self.kind.clone(), self.namespace.clone(), self.name.clone())
    }
}

/// One apply-time substitution: copy the value at `source_path` of the source
/// object into `target_path` of the annotated object. With a `token`, the
/// target value must be a string and every token occurrence is replaced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Substitution {
    pub source_ref: ResourceReference,
    pub source_path: String,
    pub target_path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub token: String,
}

pub fn has_mutation(obj: &Value) -> bool {
    unstructured::annotation(obj, MUTATION_ANNOTATION).is_some()
}

/// Read and parse the apply-time-mutation annotation (a YAML list of
/// substitution records).
pub fn read_mutation(obj: &Value) -> Result<Vec<Substitution>, AnnotationError> {
    let Some(raw) = unstructured::annotation(obj, MUTATION_ANNOTATION) else {
        return Ok(Vec::new());
    };
    serde_yaml::from_str(raw).map_err(|e| AnnotationError::InvalidMutation(e.to_string()))
}

pub fn owning_inventory(obj: &Value) -> Option<&str> {
    unstructured::annotation(obj, OWNING_INVENTORY_ANNOTATION)
}

pub fn set_owning_inventory(obj: &mut Value, inv_id: &str) {
    unstructured::set_annotation(obj, OWNING_INVENTORY_ANNOTATION, inv_id);
}

/// True when the object asks to be preserved on prune.
pub fn is_on_remove_keep(obj: &Value) -> bool {
    unstructured::annotation(obj, ON_REMOVE_ANNOTATION) == Some(ON_REMOVE_KEEP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn depends_on_cluster_scoped() {
        let id = parse_depends_on_item("apiextensions.k8s.io/CustomResourceDefinition/crontabs.stable.example.com")
            .unwrap();
        assert_eq!(id.group, "apiextensions.k8s.io");
        assert_eq!(id.kind, "CustomResourceDefinition");
        assert!(id.namespace.is_empty());
    }

    #[test]
    fn depends_on_namespaced_round_trip() {
        let raw = "apps/namespaces/test-namespace/Deployment/foo";
        let id = parse_depends_on_item(raw).unwrap();
        assert_eq!(id.namespace, "test-namespace");
        assert_eq!(format_depends_on_item(&id), raw);
    }

    #[test]
    fn depends_on_list_dedupes() {
        let set = parse_depends_on("/Secret/a, /Secret/a, /ConfigMap/b").unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn depends_on_rejects_garbage() {
        assert!(parse_depends_on_item("just-a-name").is_err());
        assert!(parse_depends_on_item("a/b/c/d").is_err());
    }

    #[test]
    fn mutation_annotation_parses() {
        let obj = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cm",
                "namespace": "ns",
                "annotations": {
                    (MUTATION_ANNOTATION): "- sourceRef:\n    kind: Pod\n    name: test-pod\n    namespace: test-namespace\n  sourcePath: .spec.secret\n  targetPath: .spec.url\n  token: ${SECRET}\n"
                }
            }
        });
        let subs = read_mutation(&obj).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].source_ref.kind, "Pod");
        assert_eq!(subs[0].source_path, ".spec.secret");
        assert_eq!(subs[0].token, "${SECRET}");
    }

    #[test]
    fn resource_reference_group_from_api_version() {
        let r = ResourceReference { api_version: "apps/v1".into(), kind: "Deployment".into(), name: "foo".into(), ..Default::default() };
        assert_eq!(r.group(), "apps");
        assert_eq!(r.version(), Some("v1"));
        let core = ResourceReference { api_version: "v1".into(), kind: "Pod".into(), name: "p".into(), ..Default::default() };
        assert_eq!(core.group(), "");
        assert_eq!(core.version(), Some("v1"));
    }

    #[test]
    fn owning_inventory_set_and_get() {
        let mut obj = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cm"}});
        assert!(owning_inventory(&obj).is_none());
        set_owning_inventory(&mut obj, "inv-1");
        assert_eq!(owning_inventory(&obj), Some("inv-1"));
    }
}
