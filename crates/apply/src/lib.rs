//! The declarative apply engine: resolve waves, build the task queue, run
//! it against the cluster, and stream progress events to the caller.

#![forbid(unsafe_code)]

pub mod cache;
pub mod error;
pub mod event;
pub mod exec;
pub mod filter;
pub mod mutator;
pub mod runner;
pub mod solver;
pub mod task;

pub use error::{ApplyError, EngineError, MutationError};
pub use event::{Event, InitEvent};
pub use runner::RunnerOptions;
pub use solver::{SolverOptions, TaskQueueBuilder};

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use rekon_cluster::{ApplyParams, ClusterClient, DryRun, PropagationPolicy};
use rekon_core::{unstructured, ObjMetaSet};
use rekon_inventory::{InventoryClient, InventoryInfo, InventoryPolicy};
use rekon_status::StatusPoller;

use crate::cache::ResourceCache;
use crate::event::{ErrorEvent, InitEvent as Init};
use crate::exec::ExecDeps;
use crate::task::TaskContext;

fn queue_cap() -> usize {
    std::env::var("REKON_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(2048)
}

/// Options for one engine run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub policy: InventoryPolicy,
    pub server_side: bool,
    pub force_conflicts: bool,
    pub field_manager: String,
    pub dry_run: DryRun,
    pub poll_period: Duration,
    /// Zero disables reconcile waits after apply waves.
    pub reconcile_timeout: Duration,
    /// Zero disables waits after prune waves.
    pub prune_timeout: Duration,
    pub prune_propagation: PropagationPolicy,
    pub emit_status_events: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            policy: InventoryPolicy::Strict,
            server_side: false,
            force_conflicts: false,
            field_manager: "rekon".to_string(),
            dry_run: DryRun::None,
            poll_period: Duration::from_secs(2),
            reconcile_timeout: Duration::from_secs(60),
            prune_timeout: Duration::from_secs(60),
            prune_propagation: PropagationPolicy::Background,
            emit_status_events: true,
        }
    }
}

impl RunOptions {
    fn apply_params(&self) -> ApplyParams {
        ApplyParams {
            server_side: self.server_side,
            force_conflicts: self.force_conflicts,
            field_manager: self.field_manager.clone(),
            dry_run: self.dry_run,
        }
    }

    fn solver(&self) -> SolverOptions {
        SolverOptions {
            dry_run: self.dry_run,
            policy: self.policy,
            reconcile_timeout: self.reconcile_timeout,
            prune_timeout: self.prune_timeout,
        }
    }
}

/// Drives the apply flow: reconcile the desired objects, prune dropped
/// inventory members, persist the new membership.
pub struct Applier {
    cluster: Arc<dyn ClusterClient>,
    inventory: Arc<dyn InventoryClient>,
}

impl Applier {
    pub fn new(cluster: Arc<dyn ClusterClient>, inventory: Arc<dyn InventoryClient>) -> Self {
        Self { cluster, inventory }
    }

    /// Start a run. Progress arrives on the returned channel, which closes
    /// exactly once when the run completes or is cancelled.
    pub fn run(
        &self,
        inv: InventoryInfo,
        objects: Vec<Value>,
        opts: RunOptions,
        cancel: watch::Receiver<bool>,
    ) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(queue_cap());
        let cluster = Arc::clone(&self.cluster);
        let inventory = Arc::clone(&self.inventory);
        tokio::spawn(async move {
            if let Err(e) = drive_apply(cluster, inventory, inv, objects, opts, cancel, &tx).await
            {
                warn!(error = %e, "apply run aborted");
                let _ = tx.send(Event::Error(ErrorEvent { error: e.to_string() })).await;
            }
        });
        rx
    }
}

/// Drives the destroy flow: prune every inventory member in reverse
/// dependency order, then delete the record.
pub struct Destroyer {
    cluster: Arc<dyn ClusterClient>,
    inventory: Arc<dyn InventoryClient>,
}

impl Destroyer {
    pub fn new(cluster: Arc<dyn ClusterClient>, inventory: Arc<dyn InventoryClient>) -> Self {
        Self { cluster, inventory }
    }

    pub fn run(
        &self,
        inv: InventoryInfo,
        opts: RunOptions,
        cancel: watch::Receiver<bool>,
    ) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(queue_cap());
        let cluster = Arc::clone(&self.cluster);
        let inventory = Arc::clone(&self.inventory);
        tokio::spawn(async move {
            if let Err(e) = drive_destroy(cluster, inventory, inv, opts, cancel, &tx).await {
                warn!(error = %e, "destroy run aborted");
                let _ = tx.send(Event::Error(ErrorEvent { error: e.to_string() })).await;
            }
        });
        rx
    }
}

async fn drive_apply(
    cluster: Arc<dyn ClusterClient>,
    inventory: Arc<dyn InventoryClient>,
    inv: InventoryInfo,
    objects: Vec<Value>,
    opts: RunOptions,
    cancel: watch::Receiver<bool>,
    tx: &mpsc::Sender<Event>,
) -> Result<(), EngineError> {
    let mut desired = ObjMetaSet::new();
    for obj in &objects {
        let id = unstructured::obj_meta(obj)?;
        if desired.contains(&id) {
            return Err(EngineError::DuplicateObject(id));
        }
        desired.insert(id);
    }

    let previous = inventory.load(&inv).await?.unwrap_or_default();
    let (apply_waves, external) = rekon_graph::sort_objs(&objects)?;
    for (i, deps) in external.iter().enumerate() {
        if !deps.is_empty() {
            info!(wave = i, external = deps.len(), "waves carry external dependencies");
        }
    }

    let prune_ids = previous.diff(&desired);
    let prune_waves = live_prune_waves(&cluster, &prune_ids).await?;

    let builder = TaskQueueBuilder { inv_id: inv.id.clone(), opts: opts.solver() };
    let tasks = builder.build_apply(apply_waves, prune_waves, &previous, &desired);
    let _ = tx
        .send(Event::Init(Init { action_groups: tasks.iter().map(|t| t.action_group()).collect() }))
        .await;

    let poller = StatusPoller::new(Arc::clone(&cluster), opts.poll_period);
    let status_rx = poller.poll(desired.union(&prune_ids), cancel.clone());

    let mut ctx = TaskContext::new(tx.clone());
    let deps = ExecDeps {
        cluster,
        inventory,
        inv,
        apply_params: opts.apply_params(),
        propagation: opts.prune_propagation,
        cache: Arc::new(ResourceCache::new()),
    };
    runner::run_queue(
        tasks,
        deps,
        status_rx,
        cancel,
        &mut ctx,
        RunnerOptions { emit_status_events: opts.emit_status_events },
    )
    .await?;
    info!(failures = ctx.failure_count(), pruned = ctx.prune_count(), "apply run complete");
    Ok(())
}

async fn drive_destroy(
    cluster: Arc<dyn ClusterClient>,
    inventory: Arc<dyn InventoryClient>,
    inv: InventoryInfo,
    opts: RunOptions,
    cancel: watch::Receiver<bool>,
    tx: &mpsc::Sender<Event>,
) -> Result<(), EngineError> {
    let previous = inventory.load(&inv).await?.unwrap_or_default();
    let prune_waves = live_prune_waves(&cluster, &previous).await?;

    let builder = TaskQueueBuilder { inv_id: inv.id.clone(), opts: opts.solver() };
    let tasks = builder.build_destroy(prune_waves);
    let _ = tx
        .send(Event::Init(Init { action_groups: tasks.iter().map(|t| t.action_group()).collect() }))
        .await;

    let poller = StatusPoller::new(Arc::clone(&cluster), opts.poll_period);
    let status_rx = poller.poll(previous.clone(), cancel.clone());

    let mut ctx = TaskContext::new(tx.clone());
    let deps = ExecDeps {
        cluster,
        inventory,
        inv,
        apply_params: opts.apply_params(),
        propagation: opts.prune_propagation,
        cache: Arc::new(ResourceCache::new()),
    };
    runner::run_queue(
        tasks,
        deps,
        status_rx,
        cancel,
        &mut ctx,
        RunnerOptions { emit_status_events: opts.emit_status_events },
    )
    .await?;
    info!(failures = ctx.failure_count(), pruned = ctx.prune_count(), "destroy run complete");
    Ok(())
}

/// Deletion order comes from the live objects: fetch what still exists and
/// reverse-sort it, so dependents go before their dependencies.
async fn live_prune_waves(
    cluster: &Arc<dyn ClusterClient>,
    prune_ids: &ObjMetaSet,
) -> Result<Vec<ObjMetaSet>, EngineError> {
    let mut live = Vec::new();
    for id in prune_ids.iter() {
        match cluster.get(id, None).await? {
            Some(obj) => live.push(obj),
            None => info!(id = %id, "prune target already gone"),
        }
    }
    let (waves, _) = rekon_graph::reverse_sort_objs(&live)?;
    Ok(waves
        .into_iter()
        .map(|wave| wave.iter().filter_map(|o| unstructured::obj_meta(o).ok()).collect())
        .collect())
}
