//! Apply-time mutation: field substitutions resolved just before dispatch.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use rekon_cluster::ClusterClient;
use rekon_core::annotations::{self, Substitution};
use rekon_core::{pathexp, unstructured, ObjMeta};

use crate::cache::ResourceCache;
use crate::error::MutationError;

/// The closed set of mutators an apply task may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutator {
    ApplyTime,
}

impl Mutator {
    pub fn name(&self) -> &'static str {
        match self {
            Mutator::ApplyTime => "ApplyTimeMutator",
        }
    }

    /// Mutate the target in place. Returns true when a substitution ran.
    pub async fn mutate(
        &self,
        obj: &mut Value,
        cluster: &Arc<dyn ClusterClient>,
        cache: &ResourceCache,
    ) -> Result<bool, MutationError> {
        match self {
            Mutator::ApplyTime => apply_time_mutate(obj, cluster, cache).await,
        }
    }
}

async fn apply_time_mutate(
    obj: &mut Value,
    cluster: &Arc<dyn ClusterClient>,
    cache: &ResourceCache,
) -> Result<bool, MutationError> {
    let subs = annotations::read_mutation(obj)?;
    if subs.is_empty() {
        return Ok(false);
    }
    let target_id = unstructured::obj_meta(obj)?;

    // Validate all references before touching anything.
    for sub in &subs {
        let source_id = sub.source_ref.to_obj_meta()?;
        if source_id == target_id {
            return Err(MutationError::SelfReference(source_id));
        }
    }

    for sub in &subs {
        let source_id = sub.source_ref.to_obj_meta()?;
        let source = get_source(cluster, cache, &source_id, sub.source_ref.version()).await?;

        let source_value = pathexp::get(&source, &sub.source_path)?.ok_or_else(|| {
            MutationError::SourceFieldMissing {
                id: source_id.clone(),
                path: sub.source_path.clone(),
            }
        })?;
        let target_value = pathexp::get(obj, &sub.target_path)?;

        let new_value = substitute(sub, &source_value, target_value.as_ref())?;
        debug!(target = %target_id, source = %source_id, path = %sub.target_path, "apply-time substitution");
        pathexp::set(obj, &sub.target_path, new_value)?;
    }
    Ok(true)
}

fn substitute(
    sub: &Substitution,
    source_value: &Value,
    target_value: Option<&Value>,
) -> Result<Value, MutationError> {
    if sub.token.is_empty() {
        // No token: the source value replaces the entire target value.
        return Ok(source_value.clone());
    }
    let target_str = match target_value {
        Some(Value::String(s)) => s.as_str(),
        Some(other) => {
            return Err(MutationError::TargetTypeMismatch { found: json_type(other) })
        }
        None => return Err(MutationError::TargetTypeMismatch { found: "null" }),
    };
    // Token absent from the target is a no-op; common on re-apply, after the
    // previous run already substituted.
    Ok(Value::String(target_str.replace(&sub.token, &stringify(source_value))))
}

/// Render a source value for token substitution: strings pass through,
/// scalars format plainly, containers marshal as JSON.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => "null".to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

async fn get_source(
    cluster: &Arc<dyn ClusterClient>,
    cache: &ResourceCache,
    id: &ObjMeta,
    version: Option<&str>,
) -> Result<Value, MutationError> {
    if let Some(obj) = cache.get(id) {
        return Ok(obj);
    }
    let obj = cluster
        .get(id, version)
        .await
        .map_err(|e| MutationError::SourceFetch { id: id.clone(), reason: e.to_string() })?
        .ok_or_else(|| MutationError::SourceNotFound(id.clone()))?;
    cache.put(id.clone(), obj.clone());
    Ok(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekon_cluster::mock::MockCluster;
    use rekon_core::annotations::MUTATION_ANNOTATION;
    use serde_json::json;

    fn source_pod() -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "test-pod", "namespace": "test-namespace"},
            "spec": {"secret": "XYZ", "replicas": 3}
        })
    }

    fn target_with(annotation: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cm",
                "namespace": "test-namespace",
                "annotations": {(MUTATION_ANNOTATION): annotation}
            },
            "spec": {"url": "https://${SECRET}/path"}
        })
    }

    const TOKEN_SUB: &str = "- sourceRef:\n    kind: Pod\n    name: test-pod\n    namespace: test-namespace\n  sourcePath: .spec.secret\n  targetPath: .spec.url\n  token: ${SECRET}\n";

    #[tokio::test]
    async fn token_substitution_rewrites_target() {
        let cluster: Arc<dyn ClusterClient> =
            Arc::new(MockCluster::with_objects([source_pod()]));
        let cache = ResourceCache::new();
        let mut target = target_with(TOKEN_SUB);
        let mutated = Mutator::ApplyTime.mutate(&mut target, &cluster, &cache).await.unwrap();
        assert!(mutated);
        assert_eq!(target["spec"]["url"], json!("https://XYZ/path"));
    }

    #[tokio::test]
    async fn whole_value_replacement_without_token() {
        let sub = "- sourceRef:\n    kind: Pod\n    name: test-pod\n    namespace: test-namespace\n  sourcePath: .spec.replicas\n  targetPath: .spec.count\n";
        let cluster: Arc<dyn ClusterClient> =
            Arc::new(MockCluster::with_objects([source_pod()]));
        let cache = ResourceCache::new();
        let mut target = target_with(sub);
        Mutator::ApplyTime.mutate(&mut target, &cluster, &cache).await.unwrap();
        assert_eq!(target["spec"]["count"], json!(3));
    }

    #[tokio::test]
    async fn source_fetches_hit_the_cache_once() {
        let mock = Arc::new(MockCluster::with_objects([source_pod()]));
        let cluster: Arc<dyn ClusterClient> = mock.clone();
        let cache = ResourceCache::new();
        let mut a = target_with(TOKEN_SUB);
        let mut b = target_with(TOKEN_SUB);
        b["metadata"]["name"] = json!("cm2");
        Mutator::ApplyTime.mutate(&mut a, &cluster, &cache).await.unwrap();
        Mutator::ApplyTime.mutate(&mut b, &cluster, &cache).await.unwrap();
        assert_eq!(mock.get_count(), 1, "second mutation must be served from the cache");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn self_reference_is_refused() {
        let sub = "- sourceRef:\n    kind: ConfigMap\n    name: cm\n    namespace: test-namespace\n  sourcePath: .spec.a\n  targetPath: .spec.b\n";
        let cluster: Arc<dyn ClusterClient> = Arc::new(MockCluster::new());
        let cache = ResourceCache::new();
        let mut target = target_with(sub);
        let err = Mutator::ApplyTime.mutate(&mut target, &cluster, &cache).await.unwrap_err();
        assert!(matches!(err, MutationError::SelfReference(_)));
    }

    #[tokio::test]
    async fn missing_source_field_fails() {
        let sub = "- sourceRef:\n    kind: Pod\n    name: test-pod\n    namespace: test-namespace\n  sourcePath: .spec.missing\n  targetPath: .spec.url\n";
        let cluster: Arc<dyn ClusterClient> =
            Arc::new(MockCluster::with_objects([source_pod()]));
        let cache = ResourceCache::new();
        let mut target = target_with(sub);
        let err = Mutator::ApplyTime.mutate(&mut target, &cluster, &cache).await.unwrap_err();
        assert!(matches!(err, MutationError::SourceFieldMissing { .. }));
    }

    #[tokio::test]
    async fn tokenized_non_string_target_fails() {
        let sub = "- sourceRef:\n    kind: Pod\n    name: test-pod\n    namespace: test-namespace\n  sourcePath: .spec.secret\n  targetPath: .spec.count\n  token: ${SECRET}\n";
        let cluster: Arc<dyn ClusterClient> =
            Arc::new(MockCluster::with_objects([source_pod()]));
        let cache = ResourceCache::new();
        let mut target = target_with(sub);
        target["spec"]["count"] = json!(7);
        let err = Mutator::ApplyTime.mutate(&mut target, &cluster, &cache).await.unwrap_err();
        assert!(matches!(err, MutationError::TargetTypeMismatch { found: "number" }));
    }

    #[tokio::test]
    async fn dollar_rooted_paths_are_rejected() {
        let sub = "- sourceRef:\n    kind: Pod\n    name: test-pod\n    namespace: test-namespace\n  sourcePath: $.spec.secret\n  targetPath: .spec.url\n  token: ${SECRET}\n";
        let cluster: Arc<dyn ClusterClient> =
            Arc::new(MockCluster::with_objects([source_pod()]));
        let cache = ResourceCache::new();
        let mut target = target_with(sub);
        let err = Mutator::ApplyTime.mutate(&mut target, &cluster, &cache).await.unwrap_err();
        assert!(matches!(err, MutationError::Path(_)));
    }
}
