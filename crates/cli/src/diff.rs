//! Local-vs-live diff summaries.

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use rekon_cluster::ClusterClient;
use rekon_core::unstructured;

use crate::Output;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

/// Drop server-populated noise before comparing.
fn strip_noisy(mut v: Value) -> Value {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        meta.remove("uid");
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Walk target against base counting added, changed, and removed fields.
pub fn diff_summary(target: &Value, base: &Value) -> DiffSummary {
    fn walk(a: &Value, b: &Value, out: &mut DiffSummary) {
        match (a, b) {
            (Value::Object(ao), Value::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, out),
                        None => out.adds += 1,
                    }
                }
                for k in bo.keys() {
                    if !ao.contains_key(k) {
                        out.removes += 1;
                    }
                }
            }
            (Value::Array(aa), Value::Array(bb)) => {
                for i in 0..aa.len().min(bb.len()) {
                    if aa[i] != bb[i] {
                        out.updates += 1;
                    }
                }
                if aa.len() > bb.len() {
                    out.adds += aa.len() - bb.len();
                }
                if bb.len() > aa.len() {
                    out.removes += bb.len() - aa.len();
                }
            }
            (av, bv) => {
                if av != bv {
                    out.updates += 1;
                }
            }
        }
    }
    let mut out = DiffSummary::default();
    walk(target, base, &mut out);
    out
}

/// Print a per-object summary of what an apply would change.
pub async fn run(cluster: Arc<dyn ClusterClient>, objects: &[Value], output: Output) -> Result<i32> {
    let mut rows = Vec::new();
    for obj in objects {
        let id = unstructured::obj_meta(obj)?;
        let (_, version) = unstructured::group_version(obj);
        let live = cluster.get(&id, Some(version)).await?;
        let target = strip_noisy(obj.clone());
        let row = match live {
            Some(live) => {
                let summary = diff_summary(&target, &strip_noisy(live));
                (id, Some(summary))
            }
            None => (id, None),
        };
        rows.push(row);
    }
    match output {
        Output::Json => {
            #[derive(serde::Serialize)]
            struct Row {
                id: String,
                exists: bool,
                #[serde(skip_serializing_if = "Option::is_none")]
                summary: Option<DiffSummary>,
            }
            let json_rows: Vec<Row> = rows
                .iter()
                .map(|(id, summary)| Row {
                    id: id.to_string(),
                    exists: summary.is_some(),
                    summary: *summary,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json_rows)?);
        }
        Output::Human => {
            for (id, summary) in &rows {
                match summary {
                    Some(s) if s == &DiffSummary::default() => {
                        println!("{id}: no changes");
                    }
                    Some(s) => println!(
                        "{id}: +{} ~{} -{}",
                        s.adds, s.updates, s.removes
                    ),
                    None => println!("{id}: not found (would create)"),
                }
            }
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn diff_counts_adds_updates_removes() {
        let base = json!({"a": 1, "b": {"x": 1}, "c": [1, 2, 3]});
        let target = json!({"a": 2, "b": {"x": 1, "y": 2}, "c": [1, 9], "d": true});
        let s = diff_summary(&target, &base);
        assert_eq!(s.adds, 2); // b.y and d
        assert_eq!(s.updates, 2); // a and c[1]
        assert_eq!(s.removes, 1); // array shrank by one
    }

    #[test]
    fn strip_noisy_removes_server_fields() {
        let v = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "managedFields": [{}],
                "resourceVersion": "1",
                "uid": "u",
                "creationTimestamp": "t"
            },
            "status": {"ready": true}
        });
        let stripped = strip_noisy(v);
        let meta = stripped.get("metadata").unwrap().as_object().unwrap();
        assert!(!meta.contains_key("managedFields"));
        assert!(!meta.contains_key("uid"));
        assert!(stripped.get("status").is_none());
    }
}
