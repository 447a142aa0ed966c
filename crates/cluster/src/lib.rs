//! Cluster capability interface: discovery-cached dynamic GET/APPLY/DELETE.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use rekon_core::{unstructured, ObjMeta};

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("unknown resource type: {0}")]
    UnknownType(String),
    #[error("cluster config: {0}")]
    Config(String),
    #[error("api: {0}")]
    Api(String),
}

/// Dry-run strategy for mutating calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DryRun {
    #[default]
    None,
    /// No cluster mutation at all; outcomes derived from live lookups.
    Client,
    /// The request is sent with the server dry-run option.
    Server,
}

impl DryRun {
    pub fn is_dry(&self) -> bool {
        !matches!(self, DryRun::None)
    }
}

/// Options threaded into every apply dispatch.
#[derive(Debug, Clone)]
pub struct ApplyParams {
    pub server_side: bool,
    pub force_conflicts: bool,
    pub field_manager: String,
    pub dry_run: DryRun,
}

impl Default for ApplyParams {
    fn default() -> Self {
        Self {
            server_side: false,
            force_conflicts: false,
            field_manager: "rekon".to_string(),
            dry_run: DryRun::None,
        }
    }
}

/// Deletion propagation, defaulting to background cascading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropagationPolicy {
    #[default]
    Background,
    Foreground,
    Orphan,
}

impl PropagationPolicy {
    fn to_kube(self) -> kube::api::PropagationPolicy {
        match self {
            PropagationPolicy::Background => kube::api::PropagationPolicy::Background,
            PropagationPolicy::Foreground => kube::api::PropagationPolicy::Foreground,
            PropagationPolicy::Orphan => kube::api::PropagationPolicy::Orphan,
        }
    }
}

/// The narrow cluster surface the engine consumes. One implementation talks
/// to a real API server; tests swap in a mock.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch a live object, or None when it does not exist.
    async fn get(&self, id: &ObjMeta, version: Option<&str>) -> Result<Option<Value>, ClusterError>;

    /// Reconcile one object: server-side apply when configured, otherwise a
    /// create-or-merge against the live state. Returns the live result.
    async fn apply(&self, obj: &Value, params: &ApplyParams) -> Result<Value, ClusterError>;

    /// Delete an object. Returns false when it was already gone.
    async fn delete(
        &self,
        id: &ObjMeta,
        propagation: PropagationPolicy,
        dry_run: bool,
    ) -> Result<bool, ClusterError>;
}

// Reuse a single kube Client across calls to avoid repeated TLS/config setup.
static KUBE_CLIENT: OnceCell<Client> = OnceCell::const_new();

async fn get_kube_client() -> Result<Client, ClusterError> {
    KUBE_CLIENT
        .get_or_try_init(|| async {
            Client::try_default().await.map_err(|e| ClusterError::Config(e.to_string()))
        })
        .await
        .map(|c| c.clone())
}

// Discovery cache: "group/Kind" -> (ApiResource, namespaced)
static DISCOVERY_CACHE: Lazy<RwLock<HashMap<String, (ApiResource, bool)>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn cache_key(group: &str, kind: &str) -> String {
    format!("{group}/{kind}")
}

async fn find_api_resource(
    client: Client,
    group: &str,
    kind: &str,
) -> Result<(ApiResource, bool), ClusterError> {
    let key = cache_key(group, kind);
    if let Some((ar, ns)) = DISCOVERY_CACHE.read().unwrap().get(&key).cloned() {
        return Ok((ar, ns));
    }
    info!(group, kind, "discovery cache miss; running discovery");
    let discovery = Discovery::new(client)
        .run()
        .await
        .map_err(|e| ClusterError::Api(e.to_string()))?;
    {
        let mut cache = DISCOVERY_CACHE.write().unwrap();
        for g in discovery.groups() {
            for (ar, caps) in g.recommended_resources() {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                cache.insert(cache_key(&ar.group, &ar.kind), (ar.clone(), namespaced));
            }
        }
    }
    DISCOVERY_CACHE
        .read()
        .unwrap()
        .get(&key)
        .cloned()
        .ok_or_else(|| ClusterError::UnknownType(format!("{group}/{kind}")))
}

/// Kube-backed implementation of the capability interface.
#[derive(Debug, Default)]
pub struct KubeCluster;

impl KubeCluster {
    pub fn new() -> Self {
        Self
    }

    async fn mapping(
        &self,
        group: &str,
        kind: &str,
        version: Option<&str>,
    ) -> Result<(ApiResource, bool), ClusterError> {
        let client = get_kube_client().await?;
        let (ar, namespaced) = find_api_resource(client, group, kind).await?;
        match version {
            Some(v) if v != ar.version => {
                // Pin a non-preferred version; scope carries over.
                let gvk = GroupVersionKind {
                    group: group.to_string(),
                    version: v.to_string(),
                    kind: kind.to_string(),
                };
                Ok((ApiResource::from_gvk(&gvk), namespaced))
            }
            _ => Ok((ar, namespaced)),
        }
    }

    async fn dynamic_api(
        &self,
        group: &str,
        kind: &str,
        version: Option<&str>,
        namespace: &str,
    ) -> Result<Api<DynamicObject>, ClusterError> {
        let client = get_kube_client().await?;
        let (ar, namespaced) = self.mapping(group, kind, version).await?;
        let api = if namespaced && !namespace.is_empty() {
            Api::namespaced_with(client, namespace, &ar)
        } else {
            Api::all_with(client, &ar)
        };
        Ok(api)
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get(&self, id: &ObjMeta, version: Option<&str>) -> Result<Option<Value>, ClusterError> {
        let api = self.dynamic_api(&id.group, &id.kind, version, &id.namespace).await?;
        counter!("cluster_get_total", 1u64);
        let obj = api.get_opt(&id.name).await.map_err(|e| ClusterError::Api(e.to_string()))?;
        match obj {
            Some(o) => {
                let v = serde_json::to_value(&o).map_err(|e| ClusterError::Api(e.to_string()))?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }

    async fn apply(&self, obj: &Value, params: &ApplyParams) -> Result<Value, ClusterError> {
        let (group, version) = unstructured::group_version(obj);
        let name = unstructured::name(obj).to_string();
        let api = self
            .dynamic_api(group, unstructured::kind(obj), Some(version), unstructured::namespace(obj))
            .await?;
        let server_dry = matches!(params.dry_run, DryRun::Server);

        if params.server_side {
            let pp = PatchParams {
                dry_run: server_dry,
                force: params.force_conflicts,
                field_manager: Some(params.field_manager.clone()),
                ..Default::default()
            };
            debug!(name = %name, dry_run = server_dry, "server-side apply");
            let live = api
                .patch(&name, &pp, &Patch::Apply(obj))
                .await
                .map_err(|e| ClusterError::Api(e.to_string()))?;
            counter!("cluster_apply_total", 1u64);
            return serde_json::to_value(&live).map_err(|e| ClusterError::Api(e.to_string()));
        }

        // Client-side path: create when absent, merge-patch over live state.
        let existing =
            api.get_opt(&name).await.map_err(|e| ClusterError::Api(e.to_string()))?;
        let live = match existing {
            None => {
                let pp = PostParams {
                    dry_run: server_dry,
                    field_manager: Some(params.field_manager.clone()),
                };
                let dyn_obj: DynamicObject = serde_json::from_value(obj.clone())
                    .map_err(|e| ClusterError::Api(format!("invalid object: {e}")))?;
                debug!(name = %name, dry_run = server_dry, "create");
                api.create(&pp, &dyn_obj).await.map_err(|e| ClusterError::Api(e.to_string()))?
            }
            Some(_) => {
                let pp = PatchParams {
                    dry_run: server_dry,
                    field_manager: Some(params.field_manager.clone()),
                    ..Default::default()
                };
                debug!(name = %name, dry_run = server_dry, "merge patch");
                api.patch(&name, &pp, &Patch::Merge(obj))
                    .await
                    .map_err(|e| ClusterError::Api(e.to_string()))?
            }
        };
        counter!("cluster_apply_total", 1u64);
        serde_json::to_value(&live).map_err(|e| ClusterError::Api(e.to_string()))
    }

    async fn delete(
        &self,
        id: &ObjMeta,
        propagation: PropagationPolicy,
        dry_run: bool,
    ) -> Result<bool, ClusterError> {
        let api = self.dynamic_api(&id.group, &id.kind, None, &id.namespace).await?;
        let dp = DeleteParams {
            dry_run,
            propagation_policy: Some(propagation.to_kube()),
            ..Default::default()
        };
        match api.delete(&id.name, &dp).await {
            Ok(_) => {
                counter!("cluster_delete_total", 1u64);
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(id = %id, "delete target already gone");
                Ok(false)
            }
            Err(e) => {
                warn!(id = %id, error = %e, "delete failed");
                Err(ClusterError::Api(e.to_string()))
            }
        }
    }
}

pub mod mock {
    //! In-memory cluster for tests.

    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct MockState {
        objects: HashMap<ObjMeta, Value>,
        get_count: usize,
        applied: Vec<ObjMeta>,
        deleted: Vec<ObjMeta>,
    }

    /// A `ClusterClient` over a guarded map. Applied objects get a synthetic
    /// uid and a bumped generation, like an API server would.
    #[derive(Default)]
    pub struct MockCluster {
        state: Mutex<MockState>,
    }

    impl MockCluster {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_objects(objs: impl IntoIterator<Item = Value>) -> Self {
            let mock = Self::new();
            for obj in objs {
                mock.seed(obj);
            }
            mock
        }

        pub fn seed(&self, obj: Value) {
            let id = unstructured::obj_meta(&obj).unwrap();
            self.state.lock().unwrap().objects.insert(id, obj);
        }

        pub fn get_count(&self) -> usize {
            self.state.lock().unwrap().get_count
        }

        pub fn applied_ids(&self) -> Vec<ObjMeta> {
            self.state.lock().unwrap().applied.clone()
        }

        pub fn deleted_ids(&self) -> Vec<ObjMeta> {
            self.state.lock().unwrap().deleted.clone()
        }

        pub fn live(&self, id: &ObjMeta) -> Option<Value> {
            self.state.lock().unwrap().objects.get(id).cloned()
        }
    }

    #[async_trait]
    impl ClusterClient for MockCluster {
        async fn get(
            &self,
            id: &ObjMeta,
            _version: Option<&str>,
        ) -> Result<Option<Value>, ClusterError> {
            let mut state = self.state.lock().unwrap();
            state.get_count += 1;
            Ok(state.objects.get(id).cloned())
        }

        async fn apply(&self, obj: &Value, params: &ApplyParams) -> Result<Value, ClusterError> {
            let id = unstructured::obj_meta(obj)
                .map_err(|e| ClusterError::Api(e.to_string()))?;
            let mut state = self.state.lock().unwrap();
            let prev_generation =
                state.objects.get(&id).map(unstructured::generation).unwrap_or(0);
            let mut live = obj.clone();
            if let Some(meta) = live.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                meta.entry("uid".to_string())
                    .or_insert_with(|| Value::String(format!("uid-{}", id.name)));
                meta.insert("generation".to_string(), Value::from(prev_generation + 1));
            }
            if !matches!(params.dry_run, DryRun::Server) {
                state.objects.insert(id.clone(), live.clone());
            }
            state.applied.push(id);
            Ok(live)
        }

        async fn delete(
            &self,
            id: &ObjMeta,
            _propagation: PropagationPolicy,
            dry_run: bool,
        ) -> Result<bool, ClusterError> {
            let mut state = self.state.lock().unwrap();
            let existed = state.objects.contains_key(id);
            if !dry_run {
                state.objects.remove(id);
            }
            if existed {
                state.deleted.push(id.clone());
            }
            Ok(existed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockCluster;
    use super::*;
    use serde_json::json;

    fn pod(name: &str) -> Value {
        json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": name, "namespace": "ns"}})
    }

    #[tokio::test]
    async fn mock_apply_assigns_uid_and_generation() {
        let mock = MockCluster::new();
        let live = mock.apply(&pod("a"), &ApplyParams::default()).await.unwrap();
        assert_eq!(unstructured::uid(&live), "uid-a");
        assert_eq!(unstructured::generation(&live), 1);
        let live = mock.apply(&pod("a"), &ApplyParams::default()).await.unwrap();
        assert_eq!(unstructured::generation(&live), 2);
    }

    #[tokio::test]
    async fn mock_server_dry_run_does_not_persist() {
        let mock = MockCluster::new();
        let params = ApplyParams { dry_run: DryRun::Server, ..Default::default() };
        mock.apply(&pod("a"), &params).await.unwrap();
        let id = ObjMeta::new("", "Pod", "ns", "a").unwrap();
        assert!(mock.get(&id, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mock_delete_reports_missing() {
        let mock = MockCluster::with_objects([pod("a")]);
        let id = ObjMeta::new("", "Pod", "ns", "a").unwrap();
        assert!(mock.delete(&id, PropagationPolicy::Background, false).await.unwrap());
        assert!(!mock.delete(&id, PropagationPolicy::Background, false).await.unwrap());
    }
}
