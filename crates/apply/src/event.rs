//! Typed events on the engine's outbound channel.
//!
//! The channel closes exactly once, at run completion. Per-object ordering is
//! apply/prune outcome first, then status observations, then wait outcomes.

use serde::Serialize;

use rekon_core::{ObjMeta, ObjMetaSet};
use rekon_status::ResourceStatus;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    Init(InitEvent),
    Apply(ApplyEvent),
    Prune(PruneEvent),
    Status(StatusEvent),
    Wait(WaitEvent),
    InventoryUpdate(InventoryEvent),
    Error(ErrorEvent),
}

/// Which kind of work a task performs, for plan rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceAction {
    Apply,
    Wait,
    Prune,
    Inventory,
}

/// One entry of the announced plan: a named task and the ids it covers.
#[derive(Debug, Clone, Serialize)]
pub struct ActionGroup {
    pub name: String,
    pub action: ResourceAction,
    pub ids: ObjMetaSet,
}

/// Announces the full task plan before any work starts.
#[derive(Debug, Clone, Serialize)]
pub struct InitEvent {
    pub action_groups: Vec<ActionGroup>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ApplyOp {
    Created,
    Configured,
    Unchanged { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyEvent {
    pub group: String,
    pub id: ObjMeta,
    pub op: ApplyOp,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PruneOp {
    Pruned,
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PruneEvent {
    pub group: String,
    pub id: ObjMeta,
    pub op: PruneOp,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub resource: ResourceStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WaitOp {
    Started,
    /// One watched object reached the wait condition.
    Reconciled { id: ObjMeta },
    /// The timeout lapsed with these ids still pending; the run proceeds.
    Timeout { pending: ObjMetaSet },
    /// The whole group was skipped (cancellation or dry-run drain).
    Skipped,
    Finished,
}

#[derive(Debug, Clone, Serialize)]
pub struct WaitEvent {
    pub group: String,
    pub op: WaitOp,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum InventoryOp {
    /// Desired ids claimed before the first mutation.
    Claimed { members: usize },
    /// Final membership written after the run.
    Updated { members: usize },
    Deleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct InventoryEvent {
    pub op: InventoryOp,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub error: String,
}
