//! The closed set of task kinds and the per-run context they report into.

use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tokio::sync::mpsc;

use rekon_core::{unstructured, ObjMeta, ObjMetaSet};
use rekon_status::ResourceStatus;

use crate::event::{ActionGroup, Event, ResourceAction};
use crate::filter::ApplyFilter;
use crate::mutator::Mutator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    AllCurrent,
    AllNotFound,
}

#[derive(Debug, Clone)]
pub struct ApplyTaskSpec {
    pub name: String,
    pub objects: Vec<Value>,
    pub filters: Vec<ApplyFilter>,
    pub mutators: Vec<Mutator>,
}

#[derive(Debug, Clone)]
pub struct WaitTaskSpec {
    pub name: String,
    pub ids: ObjMetaSet,
    pub condition: WaitCondition,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PruneTaskSpec {
    pub name: String,
    pub ids: ObjMetaSet,
    pub filters: Vec<ApplyFilter>,
}

/// One unit of the ordered queue. Kinds are fixed; this is not a general
/// workflow engine.
#[derive(Debug, Clone)]
pub enum Task {
    Apply(ApplyTaskSpec),
    Wait(WaitTaskSpec),
    Prune(PruneTaskSpec),
    InventoryAdd { name: String, members: ObjMetaSet },
    InventoryUpdate { name: String, members: ObjMetaSet },
    InventoryDelete { name: String },
}

impl Task {
    pub fn name(&self) -> &str {
        match self {
            Task::Apply(s) => &s.name,
            Task::Wait(s) => &s.name,
            Task::Prune(s) => &s.name,
            Task::InventoryAdd { name, .. } => name,
            Task::InventoryUpdate { name, .. } => name,
            Task::InventoryDelete { name } => name,
        }
    }

    pub fn action(&self) -> ResourceAction {
        match self {
            Task::Apply(_) => ResourceAction::Apply,
            Task::Wait(_) => ResourceAction::Wait,
            Task::Prune(_) => ResourceAction::Prune,
            _ => ResourceAction::Inventory,
        }
    }

    pub fn ids(&self) -> ObjMetaSet {
        match self {
            Task::Apply(s) => {
                s.objects.iter().filter_map(|o| unstructured::obj_meta(o).ok()).collect()
            }
            Task::Wait(s) => s.ids.clone(),
            Task::Prune(s) => s.ids.clone(),
            Task::InventoryAdd { members, .. } => members.clone(),
            Task::InventoryUpdate { members, .. } => members.clone(),
            Task::InventoryDelete { .. } => ObjMetaSet::new(),
        }
    }

    pub fn action_group(&self) -> ActionGroup {
        ActionGroup { name: self.name().to_string(), action: self.action(), ids: self.ids() }
    }
}

/// Recorded result of a successful apply readback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedInfo {
    pub uid: String,
    pub generation: i64,
}

/// Per-run state owned by the runner: outcome records per id, plus the
/// latest observed status per id as fed by the poller stream. Mutated only
/// from the runner's loop; background tasks report via completion channels.
pub struct TaskContext {
    event_tx: mpsc::Sender<Event>,
    applied: FxHashMap<ObjMeta, AppliedInfo>,
    apply_skips: FxHashSet<ObjMeta>,
    apply_failures: FxHashSet<ObjMeta>,
    pruned: FxHashSet<ObjMeta>,
    prune_skipped: FxHashSet<ObjMeta>,
    prune_failures: FxHashSet<ObjMeta>,
    statuses: FxHashMap<ObjMeta, ResourceStatus>,
}

impl TaskContext {
    pub fn new(event_tx: mpsc::Sender<Event>) -> Self {
        Self {
            event_tx,
            applied: FxHashMap::default(),
            apply_skips: FxHashSet::default(),
            apply_failures: FxHashSet::default(),
            pruned: FxHashSet::default(),
            prune_skipped: FxHashSet::default(),
            prune_failures: FxHashSet::default(),
            statuses: FxHashMap::default(),
        }
    }

    pub fn event_tx(&self) -> mpsc::Sender<Event> {
        self.event_tx.clone()
    }

    pub async fn send_event(&self, event: Event) {
        let _ = self.event_tx.send(event).await;
    }

    pub fn resource_applied(&mut self, id: ObjMeta, info: AppliedInfo) {
        self.apply_failures.remove(&id);
        self.applied.insert(id, info);
    }

    pub fn resource_apply_skipped(&mut self, id: ObjMeta) {
        self.apply_skips.insert(id);
    }

    pub fn resource_apply_failed(&mut self, id: ObjMeta) {
        self.apply_failures.insert(id);
    }

    pub fn resource_pruned(&mut self, id: ObjMeta) {
        self.pruned.insert(id);
    }

    pub fn resource_prune_skipped(&mut self, id: ObjMeta) {
        self.prune_skipped.insert(id);
    }

    pub fn resource_prune_failed(&mut self, id: ObjMeta) {
        self.prune_failures.insert(id);
    }

    pub fn applied_info(&self, id: &ObjMeta) -> Option<&AppliedInfo> {
        self.applied.get(id)
    }

    pub fn apply_skipped(&self, id: &ObjMeta) -> bool {
        self.apply_skips.contains(id)
    }

    pub fn apply_failed(&self, id: &ObjMeta) -> bool {
        self.apply_failures.contains(id)
    }

    pub fn prune_failed(&self, id: &ObjMeta) -> bool {
        self.prune_failures.contains(id)
    }

    pub fn prune_skipped(&self, id: &ObjMeta) -> bool {
        self.prune_skipped.contains(id)
    }

    pub fn observe(&mut self, status: ResourceStatus) {
        self.statuses.insert(status.id.clone(), status);
    }

    pub fn latest_status(&self, id: &ObjMeta) -> Option<&ResourceStatus> {
        self.statuses.get(id)
    }

    pub fn prune_count(&self) -> usize {
        self.pruned.len()
    }

    pub fn failure_count(&self) -> usize {
        self.apply_failures.len() + self.prune_failures.len()
    }
}
