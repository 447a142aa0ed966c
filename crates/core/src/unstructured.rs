//! Accessors over unstructured objects (`serde_json::Value` trees).

use serde_json::Value;

use crate::{ObjMeta, ParseError};

pub fn name(obj: &Value) -> &str {
    obj.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str()).unwrap_or("")
}

pub fn namespace(obj: &Value) -> &str {
    obj.get("metadata").and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).unwrap_or("")
}

pub fn api_version(obj: &Value) -> &str {
    obj.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("")
}

pub fn kind(obj: &Value) -> &str {
    obj.get("kind").and_then(|v| v.as_str()).unwrap_or("")
}

/// Split apiVersion into (group, version). Core kinds have an empty group.
pub fn group_version(obj: &Value) -> (&str, &str) {
    match api_version(obj).split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version(obj)),
    }
}

pub fn uid(obj: &Value) -> &str {
    obj.get("metadata").and_then(|m| m.get("uid")).and_then(|v| v.as_str()).unwrap_or("")
}

pub fn generation(obj: &Value) -> i64 {
    obj.get("metadata").and_then(|m| m.get("generation")).and_then(|v| v.as_i64()).unwrap_or(0)
}

pub fn deletion_timestamp(obj: &Value) -> Option<&str> {
    obj.get("metadata").and_then(|m| m.get("deletionTimestamp")).and_then(|v| v.as_str())
}

pub fn annotation<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.get("metadata")
        .and_then(|m| m.get("annotations"))
        .and_then(|a| a.get(key))
        .and_then(|v| v.as_str())
}

pub fn label<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(|l| l.get(key))
        .and_then(|v| v.as_str())
}

/// Set an annotation, creating metadata/annotations maps as needed.
pub fn set_annotation(obj: &mut Value, key: &str, value: &str) {
    let Some(root) = obj.as_object_mut() else { return };
    let meta = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if let Some(meta) = meta.as_object_mut() {
        let annotations = meta
            .entry("annotations")
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Some(annotations) = annotations.as_object_mut() {
            annotations.insert(key.to_string(), Value::String(value.to_string()));
        }
    }
}

/// The engine identity of an unstructured object.
pub fn obj_meta(obj: &Value) -> Result<ObjMeta, ParseError> {
    let (group, _version) = group_version(obj);
    ObjMeta::new(group, kind(obj), namespace(obj), name(obj))
}

pub fn is_namespace(obj: &Value) -> bool {
    let (group, _) = group_version(obj);
    group.is_empty() && kind(obj) == "Namespace"
}

pub fn is_crd(obj: &Value) -> bool {
    let (group, _) = group_version(obj);
    group == "apiextensions.k8s.io" && kind(obj) == "CustomResourceDefinition"
}

pub fn is_api_service(obj: &Value) -> bool {
    let (group, _) = group_version(obj);
    group == "apiregistration.k8s.io" && kind(obj) == "APIService"
}

/// The (group, kind) a CRD serves, read from its spec.
pub fn crd_group_kind(crd: &Value) -> Option<(&str, &str)> {
    let spec = crd.get("spec")?;
    let group = spec.get("group")?.as_str()?;
    let kind = spec.get("names")?.get("kind")?.as_str()?;
    Some((group, kind))
}
