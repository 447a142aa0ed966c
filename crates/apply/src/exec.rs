//! Task executors: per-object apply and prune against the cluster client.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use rekon_cluster::{ApplyParams, ClusterClient, ClusterError, DryRun, PropagationPolicy};
use rekon_core::annotations::set_owning_inventory;
use rekon_core::{unstructured, ObjMeta};
use rekon_inventory::{InventoryClient, InventoryInfo};

use crate::cache::ResourceCache;
use crate::error::{ApplyError, EngineError};
use crate::event::{ApplyEvent, ApplyOp, Event, InventoryEvent, InventoryOp, PruneEvent, PruneOp};
use crate::task::{AppliedInfo, ApplyTaskSpec, PruneTaskSpec, Task};

/// Everything a task needs to talk to the outside world.
#[derive(Clone)]
pub struct ExecDeps {
    pub cluster: Arc<dyn ClusterClient>,
    pub inventory: Arc<dyn InventoryClient>,
    pub inv: InventoryInfo,
    pub apply_params: ApplyParams,
    pub propagation: PropagationPolicy,
    pub cache: Arc<ResourceCache>,
}

/// Results surfaced back to the runner over the completion channel.
#[derive(Debug, Default)]
pub struct TaskOutcome {
    pub applied: Vec<(ObjMeta, AppliedInfo)>,
    pub apply_skipped: Vec<ObjMeta>,
    pub apply_failed: Vec<ObjMeta>,
    pub pruned: Vec<ObjMeta>,
    pub prune_skipped: Vec<ObjMeta>,
    pub prune_failed: Vec<ObjMeta>,
    pub fatal: Option<EngineError>,
}

pub async fn run_task(task: Task, deps: ExecDeps, events: mpsc::Sender<Event>) -> TaskOutcome {
    match task {
        Task::Apply(spec) => run_apply_task(spec, deps, events).await,
        Task::Prune(spec) => run_prune_task(spec, deps, events).await,
        Task::InventoryAdd { members, .. } => {
            let mut outcome = TaskOutcome::default();
            match deps.inventory.write(&deps.inv, &members).await {
                Ok(()) => {
                    let ev = Event::InventoryUpdate(InventoryEvent {
                        op: InventoryOp::Claimed { members: members.len() },
                    });
                    let _ = events.send(ev).await;
                }
                Err(e) => outcome.fatal = Some(e.into()),
            }
            outcome
        }
        Task::InventoryUpdate { members, .. } => {
            let mut outcome = TaskOutcome::default();
            match deps.inventory.write(&deps.inv, &members).await {
                Ok(()) => {
                    let ev = Event::InventoryUpdate(InventoryEvent {
                        op: InventoryOp::Updated { members: members.len() },
                    });
                    let _ = events.send(ev).await;
                }
                Err(e) => outcome.fatal = Some(e.into()),
            }
            outcome
        }
        Task::InventoryDelete { .. } => {
            let mut outcome = TaskOutcome::default();
            match deps.inventory.delete(&deps.inv).await {
                Ok(()) => {
                    let ev =
                        Event::InventoryUpdate(InventoryEvent { op: InventoryOp::Deleted });
                    let _ = events.send(ev).await;
                }
                Err(e) => outcome.fatal = Some(e.into()),
            }
            outcome
        }
        // Wait tasks never reach the executor; the runner evaluates them
        // against the status stream in its own loop.
        Task::Wait(_) => TaskOutcome::default(),
    }
}

async fn run_apply_task(
    spec: ApplyTaskSpec,
    deps: ExecDeps,
    events: mpsc::Sender<Event>,
) -> TaskOutcome {
    let mut outcome = TaskOutcome::default();
    debug!(task = %spec.name, objects = spec.objects.len(), "apply task starting");
    for mut obj in spec.objects.clone() {
        let id = match unstructured::obj_meta(&obj) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "object with unparseable identity");
                continue;
            }
        };
        match apply_object(&spec, &deps, &mut obj, &id, &mut outcome).await {
            Ok(op) => {
                let _ = events
                    .send(Event::Apply(ApplyEvent { group: spec.name.clone(), id, op }))
                    .await;
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                outcome.apply_failed.push(id.clone());
                let op = ApplyOp::Failed { error: e.to_string() };
                let _ = events
                    .send(Event::Apply(ApplyEvent { group: spec.name.clone(), id, op }))
                    .await;
            }
        }
    }
    outcome
}

async fn apply_object(
    spec: &ApplyTaskSpec,
    deps: &ExecDeps,
    obj: &mut Value,
    id: &ObjMeta,
    outcome: &mut TaskOutcome,
) -> Result<ApplyOp, ApplyError> {
    let t0 = Instant::now();
    let (_, version) = unstructured::group_version(obj);
    let version = version.to_string();
    let live = deps
        .cluster
        .get(id, Some(&version))
        .await
        .map_err(|e| classify_cluster_error(e))?;

    for filter in &spec.filters {
        if let Some(reason) = filter.filter(id, live.as_ref())? {
            debug!(id = %id, filter = filter.name(), reason = %reason, "apply filtered");
            outcome.apply_skipped.push(id.clone());
            return Ok(ApplyOp::Unchanged { reason });
        }
    }

    for mutator in &spec.mutators {
        mutator.mutate(obj, &deps.cluster, &deps.cache).await?;
    }

    set_owning_inventory(obj, &deps.inv.id);

    if matches!(deps.apply_params.dry_run, DryRun::Client) {
        // No cluster mutation; derive the outcome from the live lookup.
        return Ok(if live.is_some() { ApplyOp::Configured } else { ApplyOp::Created });
    }

    let result = match deps.cluster.apply(obj, &deps.apply_params).await {
        Ok(result) => result,
        Err(e) if deps.apply_params.server_side
            && unstructured::is_api_service(obj)
            && is_stream_error(&e) =>
        {
            // Server-side apply cannot handle APIService before k8s 1.21;
            // fall back to the client-side path.
            warn!(id = %id, "server-side apply stream error on APIService; retrying client-side");
            let params = ApplyParams { server_side: false, ..deps.apply_params.clone() };
            deps.cluster.apply(obj, &params).await.map_err(classify_cluster_error)?
        }
        Err(e) => return Err(classify_cluster_error(e)),
    };

    let info = AppliedInfo {
        uid: unstructured::uid(&result).to_string(),
        generation: unstructured::generation(&result),
    };
    outcome.applied.push((id.clone(), info));
    counter!("apply_ok", 1u64);
    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    Ok(if live.is_some() { ApplyOp::Configured } else { ApplyOp::Created })
}

async fn run_prune_task(
    spec: PruneTaskSpec,
    deps: ExecDeps,
    events: mpsc::Sender<Event>,
) -> TaskOutcome {
    let mut outcome = TaskOutcome::default();
    debug!(task = %spec.name, objects = spec.ids.len(), "prune task starting");
    for id in spec.ids.iter() {
        let op = prune_object(&spec, &deps, id, &mut outcome).await;
        if matches!(op, PruneOp::Failed { .. }) {
            counter!("prune_err", 1u64);
        }
        let _ = events
            .send(Event::Prune(PruneEvent { group: spec.name.clone(), id: id.clone(), op }))
            .await;
    }
    outcome
}

async fn prune_object(
    spec: &PruneTaskSpec,
    deps: &ExecDeps,
    id: &ObjMeta,
    outcome: &mut TaskOutcome,
) -> PruneOp {
    let live = match deps.cluster.get(id, None).await {
        Ok(live) => live,
        Err(e) => {
            outcome.prune_failed.push(id.clone());
            return PruneOp::Failed { error: e.to_string() };
        }
    };
    let Some(live) = live else {
        outcome.prune_skipped.push(id.clone());
        return PruneOp::Skipped { reason: "object not found".to_string() };
    };

    for filter in &spec.filters {
        match filter.filter(id, Some(&live)) {
            Ok(Some(reason)) => {
                debug!(id = %id, filter = filter.name(), reason = %reason, "prune filtered");
                outcome.prune_skipped.push(id.clone());
                return PruneOp::Skipped { reason };
            }
            Ok(None) => {}
            Err(e) => {
                outcome.prune_failed.push(id.clone());
                return PruneOp::Failed { error: e.to_string() };
            }
        }
    }

    if deps.apply_params.dry_run.is_dry() {
        outcome.pruned.push(id.clone());
        return PruneOp::Pruned;
    }

    match deps.cluster.delete(id, deps.propagation, false).await {
        Ok(true) => {
            counter!("prune_ok", 1u64);
            outcome.pruned.push(id.clone());
            PruneOp::Pruned
        }
        Ok(false) => {
            outcome.prune_skipped.push(id.clone());
            PruneOp::Skipped { reason: "object not found".to_string() }
        }
        Err(e) => {
            outcome.prune_failed.push(id.clone());
            PruneOp::Failed { error: e.to_string() }
        }
    }
}

fn classify_cluster_error(e: ClusterError) -> ApplyError {
    match e {
        ClusterError::UnknownType(t) => ApplyError::UnknownType(t),
        ClusterError::Config(c) => ApplyError::InitializeApplyOption(c),
        ClusterError::Api(a) => ApplyError::ApplyRun(a),
    }
}

/// The wrapped stream error cannot be matched by type; the substring is the
/// contract.
fn is_stream_error(e: &ClusterError) -> bool {
    e.to_string().contains("stream error: stream ID ")
}
