//! Event rendering: per-event lines while the run progresses, then a
//! tabular summary with the exit decision.

use tokio::sync::mpsc;

use rekon_apply::event::{
    ApplyOp, Event, InventoryOp, PruneOp, WaitOp,
};
use rekon_core::ObjMeta;

use crate::Output;

#[derive(Debug, Default)]
pub struct Summary {
    pub created: usize,
    pub configured: usize,
    pub unchanged: usize,
    pub apply_failed: usize,
    pub pruned: usize,
    pub prune_skipped: usize,
    pub prune_failed: usize,
    pub reconciled: usize,
    pub timed_out: usize,
    pub fatal: bool,
}

impl Summary {
    pub fn failed(&self) -> bool {
        self.apply_failed > 0 || self.prune_failed > 0 || self.fatal
    }
}

/// Human form of an identity: `kind[.group] name` with the namespace prefix
/// when present.
fn resource_line(id: &ObjMeta) -> String {
    let kind = if id.group.is_empty() {
        id.kind.to_lowercase()
    } else {
        format!("{}.{}", id.kind.to_lowercase(), id.group)
    };
    if id.namespace.is_empty() {
        format!("{kind}/{}", id.name)
    } else {
        format!("{kind}/{} (ns: {})", id.name, id.namespace)
    }
}

/// Drain the engine's event channel, printing progress and tallying the
/// summary.
pub async fn consume(mut rx: mpsc::Receiver<Event>, output: Output) -> Summary {
    let mut summary = Summary::default();
    while let Some(ev) = rx.recv().await {
        if output == Output::Json {
            if let Ok(line) = serde_json::to_string(&ev) {
                println!("{line}");
            }
            tally(&ev, &mut summary);
            continue;
        }
        match &ev {
            Event::Init(init) => {
                println!("plan: {} action group(s)", init.action_groups.len());
                for group in &init.action_groups {
                    println!("  {} ({} object(s))", group.name, group.ids.len());
                }
            }
            Event::Apply(apply) => match &apply.op {
                ApplyOp::Created => println!("{} created", resource_line(&apply.id)),
                ApplyOp::Configured => println!("{} configured", resource_line(&apply.id)),
                ApplyOp::Unchanged { reason } => {
                    println!("{} unchanged ({reason})", resource_line(&apply.id))
                }
                ApplyOp::Failed { error } => {
                    eprintln!("{} apply failed: {error}", resource_line(&apply.id))
                }
            },
            Event::Prune(prune) => match &prune.op {
                PruneOp::Pruned => println!("{} pruned", resource_line(&prune.id)),
                PruneOp::Skipped { reason } => {
                    println!("{} prune skipped ({reason})", resource_line(&prune.id))
                }
                PruneOp::Failed { error } => {
                    eprintln!("{} prune failed: {error}", resource_line(&prune.id))
                }
            },
            Event::Status(status) => {
                println!(
                    "{} is {}: {}",
                    resource_line(&status.resource.id),
                    status.resource.status,
                    status.resource.message
                );
            }
            Event::Wait(wait) => match &wait.op {
                WaitOp::Started => println!("{}: waiting for reconciliation", wait.group),
                WaitOp::Reconciled { id } => println!("{} reconciled", resource_line(id)),
                WaitOp::Timeout { pending } => {
                    eprintln!("{}: timed out waiting for {} object(s)", wait.group, pending.len())
                }
                WaitOp::Skipped => println!("{}: wait skipped", wait.group),
                WaitOp::Finished => println!("{}: all objects reconciled", wait.group),
            },
            Event::InventoryUpdate(update) => match &update.op {
                InventoryOp::Claimed { members } => {
                    println!("inventory: claimed {members} object(s)")
                }
                InventoryOp::Updated { members } => {
                    println!("inventory: recorded {members} object(s)")
                }
                InventoryOp::Deleted => println!("inventory: record deleted"),
            },
            Event::Error(err) => eprintln!("error: {}", err.error),
        }
        tally(&ev, &mut summary);
    }
    summary
}

fn tally(ev: &Event, summary: &mut Summary) {
    match ev {
        Event::Apply(apply) => match apply.op {
            ApplyOp::Created => summary.created += 1,
            ApplyOp::Configured => summary.configured += 1,
            ApplyOp::Unchanged { .. } => summary.unchanged += 1,
            ApplyOp::Failed { .. } => summary.apply_failed += 1,
        },
        Event::Prune(prune) => match prune.op {
            PruneOp::Pruned => summary.pruned += 1,
            PruneOp::Skipped { .. } => summary.prune_skipped += 1,
            PruneOp::Failed { .. } => summary.prune_failed += 1,
        },
        Event::Wait(wait) => match wait.op {
            WaitOp::Reconciled { .. } => summary.reconciled += 1,
            WaitOp::Timeout { .. } => summary.timed_out += 1,
            _ => {}
        },
        Event::Error(_) => summary.fatal = true,
        _ => {}
    }
}

pub fn print_summary(summary: &Summary, output: Output) {
    if output == Output::Json {
        return;
    }
    println!();
    println!(
        "applied: {} created, {} configured, {} unchanged, {} failed",
        summary.created, summary.configured, summary.unchanged, summary.apply_failed
    );
    println!(
        "pruned: {} deleted, {} skipped, {} failed",
        summary.pruned, summary.prune_skipped, summary.prune_failed
    );
    if summary.timed_out > 0 {
        println!("reconcile: {} object(s) timed out", summary.timed_out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekon_apply::event::{ApplyEvent, PruneEvent};

    fn id() -> ObjMeta {
        ObjMeta::new("apps", "Deployment", "ns", "foo").unwrap()
    }

    #[test]
    fn summary_counts_failures() {
        let mut summary = Summary::default();
        tally(
            &Event::Apply(ApplyEvent {
                group: "apply-0".into(),
                id: id(),
                op: ApplyOp::Failed { error: "boom".into() },
            }),
            &mut summary,
        );
        assert!(summary.failed());

        let mut ok = Summary::default();
        tally(
            &Event::Prune(PruneEvent {
                group: "prune-0".into(),
                id: id(),
                op: PruneOp::Skipped { reason: "kept".into() },
            }),
            &mut ok,
        );
        assert!(!ok.failed());
        assert_eq!(ok.prune_skipped, 1);
    }

    #[test]
    fn resource_lines_read_like_kubectl() {
        assert_eq!(resource_line(&id()), "deployment.apps/foo (ns: ns)");
        let ns = ObjMeta::new("", "Namespace", "", "test").unwrap();
        assert_eq!(resource_line(&ns), "namespace/test");
    }
}
