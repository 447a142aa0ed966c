//! Per-kind status interpretation, dispatched on GroupKind via a registered
//! table rather than runtime type inspection.

use rustc_hash::FxHashMap;
use serde_json::Value;

use rekon_core::unstructured;

use crate::Status;

type StatusFn = fn(&Value) -> (Status, String);

/// Maps a live object to a computed status. Kind-specific interpreters are
/// registered up front; everything else gets the generic rules.
pub struct StatusEngine {
    table: FxHashMap<(String, String), StatusFn>,
}

impl Default for StatusEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusEngine {
    pub fn new() -> Self {
        let mut engine = Self { table: FxHashMap::default() };
        engine.register("apps", "Deployment", deployment_status);
        engine.register("apps", "StatefulSet", stateful_set_status);
        engine.register("apps", "ReplicaSet", replica_set_status);
        engine.register("batch", "Job", job_status);
        engine.register("", "Pod", pod_status);
        engine.register("", "Service", service_status);
        engine.register("", "PersistentVolumeClaim", pvc_status);
        engine
    }

    pub fn register(&mut self, group: &str, kind: &str, f: StatusFn) {
        self.table.insert((group.to_string(), kind.to_string()), f);
    }

    /// Compute the status of a live object.
    pub fn compute(&self, obj: &Value) -> (Status, String) {
        if unstructured::deletion_timestamp(obj).is_some() {
            return (Status::Terminating, "object is being deleted".to_string());
        }
        let (group, _) = unstructured::group_version(obj);
        let key = (group.to_string(), unstructured::kind(obj).to_string());
        match self.table.get(&key) {
            Some(f) => f(obj),
            None => generic_status(obj),
        }
    }
}

fn int_at(obj: &Value, path: &[&str]) -> i64 {
    let mut cur = obj;
    for seg in path {
        match cur.get(seg) {
            Some(next) => cur = next,
            None => return 0,
        }
    }
    cur.as_i64().unwrap_or(0)
}

fn condition<'a>(obj: &'a Value, cond_type: &str) -> Option<&'a Value> {
    obj.get("status")?
        .get("conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some(cond_type))
}

fn condition_true(obj: &Value, cond_type: &str) -> Option<bool> {
    condition(obj, cond_type)
        .and_then(|c| c.get("status"))
        .and_then(|s| s.as_str())
        .map(|s| s == "True")
}

fn observed_generation_lags(obj: &Value) -> bool {
    let generation = unstructured::generation(obj);
    let observed = int_at(obj, &["status", "observedGeneration"]);
    generation > 0 && observed < generation
}

fn deployment_status(obj: &Value) -> (Status, String) {
    if observed_generation_lags(obj) {
        return (Status::InProgress, "observed generation behind".to_string());
    }
    if let Some(cond) = condition(obj, "Progressing") {
        let reason = cond.get("reason").and_then(|r| r.as_str()).unwrap_or("");
        if reason == "ProgressDeadlineExceeded" {
            return (Status::Failed, "progress deadline exceeded".to_string());
        }
    }
    let specified = obj
        .get("spec")
        .and_then(|s| s.get("replicas"))
        .and_then(|r| r.as_i64())
        .unwrap_or(1);
    let updated = int_at(obj, &["status", "updatedReplicas"]);
    let available = int_at(obj, &["status", "availableReplicas"]);
    if updated < specified {
        return (Status::InProgress, format!("updated: {updated}/{specified}"));
    }
    if available < specified {
        return (Status::InProgress, format!("available: {available}/{specified}"));
    }
    (Status::Current, format!("deployment available ({available}/{specified})"))
}

fn stateful_set_status(obj: &Value) -> (Status, String) {
    if observed_generation_lags(obj) {
        return (Status::InProgress, "observed generation behind".to_string());
    }
    let specified = obj
        .get("spec")
        .and_then(|s| s.get("replicas"))
        .and_then(|r| r.as_i64())
        .unwrap_or(1);
    let ready = int_at(obj, &["status", "readyReplicas"]);
    if ready < specified {
        return (Status::InProgress, format!("ready: {ready}/{specified}"));
    }
    (Status::Current, format!("all replicas ready ({ready}/{specified})"))
}

fn replica_set_status(obj: &Value) -> (Status, String) {
    let specified = obj
        .get("spec")
        .and_then(|s| s.get("replicas"))
        .and_then(|r| r.as_i64())
        .unwrap_or(1);
    let ready = int_at(obj, &["status", "readyReplicas"]);
    if ready < specified {
        return (Status::InProgress, format!("ready: {ready}/{specified}"));
    }
    (Status::Current, format!("all replicas ready ({ready}/{specified})"))
}

fn job_status(obj: &Value) -> (Status, String) {
    if condition_true(obj, "Failed") == Some(true) {
        return (Status::Failed, "job failed".to_string());
    }
    if condition_true(obj, "Complete") == Some(true) {
        return (Status::Current, "job completed".to_string());
    }
    (Status::InProgress, format!("active pods: {}", int_at(obj, &["status", "active"])))
}

fn pod_status(obj: &Value) -> (Status, String) {
    let phase =
        obj.get("status").and_then(|s| s.get("phase")).and_then(|p| p.as_str()).unwrap_or("");
    match phase {
        "Succeeded" => (Status::Current, "pod succeeded".to_string()),
        "Failed" => (Status::Failed, "pod failed".to_string()),
        "Running" => {
            if condition_true(obj, "Ready") == Some(true) {
                (Status::Current, "pod running and ready".to_string())
            } else {
                (Status::InProgress, "pod running, not ready".to_string())
            }
        }
        "Pending" => (Status::InProgress, "pod pending".to_string()),
        _ => (Status::Unknown, format!("unknown pod phase {phase:?}")),
    }
}

fn service_status(obj: &Value) -> (Status, String) {
    let svc_type =
        obj.get("spec").and_then(|s| s.get("type")).and_then(|t| t.as_str()).unwrap_or("ClusterIP");
    if svc_type == "LoadBalancer" {
        let has_ingress = obj
            .get("status")
            .and_then(|s| s.get("loadBalancer"))
            .and_then(|lb| lb.get("ingress"))
            .and_then(|i| i.as_array())
            .map(|i| !i.is_empty())
            .unwrap_or(false);
        if !has_ingress {
            return (Status::InProgress, "waiting for load balancer ingress".to_string());
        }
    }
    (Status::Current, "service ready".to_string())
}

fn pvc_status(obj: &Value) -> (Status, String) {
    let phase =
        obj.get("status").and_then(|s| s.get("phase")).and_then(|p| p.as_str()).unwrap_or("");
    if phase == "Bound" {
        (Status::Current, "claim bound".to_string())
    } else {
        (Status::InProgress, format!("claim phase {phase:?}"))
    }
}

/// Fallback rules for kinds without a registered interpreter.
fn generic_status(obj: &Value) -> (Status, String) {
    if observed_generation_lags(obj) {
        return (Status::InProgress, "observed generation behind".to_string());
    }
    for cond_type in ["Ready", "Available"] {
        match condition_true(obj, cond_type) {
            Some(true) => return (Status::Current, format!("{cond_type} condition true")),
            Some(false) => return (Status::InProgress, format!("{cond_type} condition false")),
            None => {}
        }
    }
    // No status subresource to wait on.
    (Status::Current, "resource is current".to_string())
}
