//! Single-consumer cooperative task scheduler.
//!
//! Exactly one task is active at a time. Apply/prune/inventory tasks run in
//! a background execution context and signal completion over a oneshot
//! channel; while awaiting, the runner keeps routing status observations
//! into the task context so wait tasks can re-evaluate as events arrive.

use std::time::Duration;

use rustc_hash::FxHashSet;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use rekon_core::ObjMeta;
use rekon_status::{PollEvent, Status};

use crate::error::EngineError;
use crate::event::{ApplyEvent, ApplyOp, Event, PruneEvent, PruneOp, StatusEvent, WaitEvent, WaitOp};
use crate::exec::{self, ExecDeps, TaskOutcome};
use crate::task::{Task, TaskContext, WaitCondition, WaitTaskSpec};

#[derive(Debug, Clone, Copy, Default)]
pub struct RunnerOptions {
    pub emit_status_events: bool,
}

enum TaskEnd {
    Completed,
    Cancelled,
    Fatal(EngineError),
}

/// Drain the queue in order. Returns an error only for engine-fatal
/// conditions; per-object failures are recorded in the context and events.
pub async fn run_queue(
    tasks: Vec<Task>,
    deps: ExecDeps,
    mut status_rx: mpsc::Receiver<PollEvent>,
    mut cancel: watch::Receiver<bool>,
    ctx: &mut TaskContext,
    opts: RunnerOptions,
) -> Result<(), EngineError> {
    let mut fatal: Option<EngineError> = None;
    let mut cancelled = false;
    let mut poller_done = false;

    for task in tasks {
        if fatal.is_some() || cancelled || *cancel.borrow() {
            skip_task(&task, ctx).await;
            continue;
        }
        debug!(task = %task.name(), "task starting");
        let end = match task {
            Task::Wait(spec) => {
                run_wait(&spec, ctx, &mut status_rx, &mut cancel, &mut poller_done, opts).await
            }
            other => {
                run_background(other, &deps, ctx, &mut status_rx, &mut cancel, &mut poller_done, opts)
                    .await
            }
        };
        match end {
            TaskEnd::Completed => {}
            TaskEnd::Cancelled => {
                warn!("run cancelled; draining remaining tasks as skipped");
                cancelled = true;
            }
            TaskEnd::Fatal(e) => {
                warn!(error = %e, "engine-fatal task failure");
                fatal = Some(e);
            }
        }
    }
    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn skip_task(task: &Task, ctx: &TaskContext) {
    match task {
        Task::Wait(spec) => {
            ctx.send_event(Event::Wait(WaitEvent {
                group: spec.name.clone(),
                op: WaitOp::Skipped,
            }))
            .await;
        }
        Task::Apply(spec) => {
            for id in spec.objects.iter().filter_map(|o| rekon_core::unstructured::obj_meta(o).ok())
            {
                ctx.send_event(Event::Apply(ApplyEvent {
                    group: spec.name.clone(),
                    id,
                    op: ApplyOp::Unchanged { reason: "run cancelled".to_string() },
                }))
                .await;
            }
        }
        Task::Prune(spec) => {
            for id in spec.ids.iter() {
                ctx.send_event(Event::Prune(PruneEvent {
                    group: spec.name.clone(),
                    id: id.clone(),
                    op: PruneOp::Skipped { reason: "run cancelled".to_string() },
                }))
                .await;
            }
        }
        _ => {}
    }
}

async fn run_background(
    task: Task,
    deps: &ExecDeps,
    ctx: &mut TaskContext,
    status_rx: &mut mpsc::Receiver<PollEvent>,
    cancel: &mut watch::Receiver<bool>,
    poller_done: &mut bool,
    opts: RunnerOptions,
) -> TaskEnd {
    let (done_tx, mut done_rx) = oneshot::channel::<TaskOutcome>();
    let task_deps = deps.clone();
    let events = ctx.event_tx();
    let handle = tokio::spawn(async move {
        let outcome = exec::run_task(task, task_deps, events).await;
        let _ = done_tx.send(outcome);
    });

    let mut cancel_closed = false;
    loop {
        tokio::select! {
            res = &mut done_rx => {
                return match res {
                    Ok(outcome) => merge_outcome(ctx, outcome),
                    Err(_) => TaskEnd::Completed, // executor dropped without result
                };
            }
            ev = status_rx.recv(), if !*poller_done => {
                match ev {
                    Some(ev) => {
                        if let Some(fatal) = route_status(ctx, ev, opts).await {
                            handle.abort();
                            return TaskEnd::Fatal(fatal);
                        }
                    }
                    None => *poller_done = true,
                }
            }
            changed = cancel.changed(), if !cancel_closed => {
                if changed.is_err() {
                    cancel_closed = true;
                } else if *cancel.borrow() {
                    handle.abort();
                    return TaskEnd::Cancelled;
                }
            }
        }
    }
}

fn merge_outcome(ctx: &mut TaskContext, outcome: TaskOutcome) -> TaskEnd {
    for (id, info) in outcome.applied {
        ctx.resource_applied(id, info);
    }
    for id in outcome.apply_skipped {
        ctx.resource_apply_skipped(id);
    }
    for id in outcome.apply_failed {
        ctx.resource_apply_failed(id);
    }
    for id in outcome.pruned {
        ctx.resource_pruned(id);
    }
    for id in outcome.prune_skipped {
        ctx.resource_prune_skipped(id);
    }
    for id in outcome.prune_failed {
        ctx.resource_prune_failed(id);
    }
    match outcome.fatal {
        Some(e) => TaskEnd::Fatal(e),
        None => TaskEnd::Completed,
    }
}

/// Record an observation and forward it to the caller when enabled. Returns
/// the fatal error for a poller `Error` event.
async fn route_status(
    ctx: &mut TaskContext,
    ev: PollEvent,
    opts: RunnerOptions,
) -> Option<EngineError> {
    match ev {
        PollEvent::ResourceUpdate(rs) => {
            ctx.observe(rs.clone());
            if opts.emit_status_events {
                ctx.send_event(Event::Status(StatusEvent { resource: rs })).await;
            }
            None
        }
        PollEvent::Error(e) => Some(EngineError::Poller(e)),
    }
}

async fn run_wait(
    spec: &WaitTaskSpec,
    ctx: &mut TaskContext,
    status_rx: &mut mpsc::Receiver<PollEvent>,
    cancel: &mut watch::Receiver<bool>,
    poller_done: &mut bool,
    opts: RunnerOptions,
) -> TaskEnd {
    ctx.send_event(Event::Wait(WaitEvent { group: spec.name.clone(), op: WaitOp::Started }))
        .await;
    let mut reconciled: FxHashSet<ObjMeta> = FxHashSet::default();

    // Observations routed during the preceding task count immediately.
    if check_wait(spec, ctx, &mut reconciled).await {
        ctx.send_event(Event::Wait(WaitEvent { group: spec.name.clone(), op: WaitOp::Finished }))
            .await;
        return TaskEnd::Completed;
    }

    let deadline = tokio::time::Instant::now() + effective_timeout(spec.timeout);
    let mut cancel_closed = false;
    loop {
        tokio::select! {
            ev = status_rx.recv(), if !*poller_done => {
                match ev {
                    Some(ev) => {
                        if let Some(fatal) = route_status(ctx, ev, opts).await {
                            return TaskEnd::Fatal(fatal);
                        }
                        if check_wait(spec, ctx, &mut reconciled).await {
                            ctx.send_event(Event::Wait(WaitEvent {
                                group: spec.name.clone(),
                                op: WaitOp::Finished,
                            }))
                            .await;
                            return TaskEnd::Completed;
                        }
                    }
                    None => *poller_done = true,
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                let pending = pending_ids(spec, ctx, &reconciled);
                info!(task = %spec.name, pending = pending.len(), "wait timed out; proceeding");
                ctx.send_event(Event::Wait(WaitEvent {
                    group: spec.name.clone(),
                    op: WaitOp::Timeout { pending },
                }))
                .await;
                return TaskEnd::Completed;
            }
            changed = cancel.changed(), if !cancel_closed => {
                if changed.is_err() {
                    cancel_closed = true;
                } else if *cancel.borrow() {
                    ctx.send_event(Event::Wait(WaitEvent {
                        group: spec.name.clone(),
                        op: WaitOp::Skipped,
                    }))
                    .await;
                    return TaskEnd::Cancelled;
                }
            }
        }
    }
}

fn effective_timeout(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        // Treated as "no deadline"; one hour is far beyond any poll cycle.
        Duration::from_secs(3600)
    } else {
        timeout
    }
}

/// An id drops out of the wait set when its own apply/prune step already
/// failed or was skipped; waiting on it would always time out.
fn excluded(spec: &WaitTaskSpec, ctx: &TaskContext, id: &ObjMeta) -> bool {
    match spec.condition {
        WaitCondition::AllCurrent => ctx.apply_failed(id) || ctx.apply_skipped(id),
        WaitCondition::AllNotFound => ctx.prune_failed(id) || ctx.prune_skipped(id),
    }
}

fn condition_met(spec: &WaitTaskSpec, ctx: &TaskContext, id: &ObjMeta) -> bool {
    let Some(observed) = ctx.latest_status(id) else { return false };
    match spec.condition {
        WaitCondition::AllCurrent => {
            if observed.status != Status::Current {
                return false;
            }
            // Guard against a stale Current from before this apply.
            match ctx.applied_info(id) {
                Some(info) if info.generation > 0 => observed.generation >= info.generation,
                _ => true,
            }
        }
        WaitCondition::AllNotFound => observed.status == Status::NotFound,
    }
}

async fn check_wait(
    spec: &WaitTaskSpec,
    ctx: &mut TaskContext,
    reconciled: &mut FxHashSet<ObjMeta>,
) -> bool {
    let mut done = true;
    let mut newly: Vec<ObjMeta> = Vec::new();
    for id in spec.ids.iter() {
        if excluded(spec, ctx, id) || reconciled.contains(id) {
            continue;
        }
        if condition_met(spec, ctx, id) {
            reconciled.insert(id.clone());
            newly.push(id.clone());
        } else {
            done = false;
        }
    }
    for id in newly {
        ctx.send_event(Event::Wait(WaitEvent {
            group: spec.name.clone(),
            op: WaitOp::Reconciled { id },
        }))
        .await;
    }
    done
}

fn pending_ids(
    spec: &WaitTaskSpec,
    ctx: &TaskContext,
    reconciled: &FxHashSet<ObjMeta>,
) -> rekon_core::ObjMetaSet {
    spec.ids
        .iter()
        .filter(|id| !excluded(spec, ctx, id) && !reconciled.contains(*id))
        .cloned()
        .collect()
}
