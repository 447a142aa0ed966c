//! Translates dependency waves and the inventory diff into the task queue.

use std::collections::BTreeSet;
use std::time::Duration;

use serde_json::Value;

use rekon_cluster::DryRun;
use rekon_core::{unstructured, ObjMetaSet};
use rekon_inventory::InventoryPolicy;

use crate::filter::ApplyFilter;
use crate::mutator::Mutator;
use crate::task::{ApplyTaskSpec, PruneTaskSpec, Task, WaitCondition, WaitTaskSpec};

#[derive(Debug, Clone)]
pub struct SolverOptions {
    pub dry_run: DryRun,
    pub policy: InventoryPolicy,
    /// Zero disables reconcile waits after apply waves.
    pub reconcile_timeout: Duration,
    /// Zero disables waits after prune waves.
    pub prune_timeout: Duration,
}

pub struct TaskQueueBuilder {
    pub inv_id: String,
    pub opts: SolverOptions,
}

impl TaskQueueBuilder {
    /// The apply flow: claim all desired ids before any mutation, apply wave
    /// by wave (waiting for reconciliation in between), prune dropped
    /// objects in reverse depth order, then persist the final membership.
    pub fn build_apply(
        &self,
        apply_waves: Vec<Vec<Value>>,
        prune_waves: Vec<ObjMetaSet>,
        previous: &ObjMetaSet,
        desired: &ObjMetaSet,
    ) -> Vec<Task> {
        let dry = self.opts.dry_run.is_dry();
        let mut tasks = Vec::new();
        if !dry {
            tasks.push(Task::InventoryAdd {
                name: "inventory-add-0".to_string(),
                members: previous.union(desired),
            });
        }
        for (i, wave) in apply_waves.into_iter().enumerate() {
            if wave.is_empty() {
                continue;
            }
            let ids: ObjMetaSet =
                wave.iter().filter_map(|o| unstructured::obj_meta(o).ok()).collect();
            tasks.push(Task::Apply(ApplyTaskSpec {
                name: format!("apply-{i}"),
                objects: wave,
                filters: vec![ApplyFilter::InventoryPolicy {
                    inv_id: self.inv_id.clone(),
                    policy: self.opts.policy,
                    prune: false,
                }],
                mutators: vec![Mutator::ApplyTime],
            }));
            if !dry && !self.opts.reconcile_timeout.is_zero() {
                tasks.push(Task::Wait(WaitTaskSpec {
                    name: format!("wait-{i}"),
                    ids,
                    condition: WaitCondition::AllCurrent,
                    timeout: self.opts.reconcile_timeout,
                }));
            }
        }
        let local_namespaces: BTreeSet<String> = desired
            .iter()
            .filter(|id| !id.namespace.is_empty())
            .map(|id| id.namespace.clone())
            .collect();
        self.append_prune_tasks(&mut tasks, prune_waves, local_namespaces);
        if !dry {
            tasks.push(Task::InventoryUpdate {
                name: "inventory-set-0".to_string(),
                members: desired.clone(),
            });
        }
        tasks
    }

    /// The destroy flow: prune every inventory member in reverse depth
    /// order, then drop the emptied record.
    pub fn build_destroy(&self, prune_waves: Vec<ObjMetaSet>) -> Vec<Task> {
        let mut tasks = Vec::new();
        self.append_prune_tasks(&mut tasks, prune_waves, BTreeSet::new());
        if !self.opts.dry_run.is_dry() {
            tasks.push(Task::InventoryDelete { name: "inventory-delete-0".to_string() });
        }
        tasks
    }

    fn append_prune_tasks(
        &self,
        tasks: &mut Vec<Task>,
        prune_waves: Vec<ObjMetaSet>,
        local_namespaces: BTreeSet<String>,
    ) {
        let dry = self.opts.dry_run.is_dry();
        for (i, ids) in prune_waves.into_iter().enumerate() {
            if ids.is_empty() {
                continue;
            }
            tasks.push(Task::Prune(PruneTaskSpec {
                name: format!("prune-{i}"),
                ids: ids.clone(),
                filters: vec![
                    ApplyFilter::PreventRemove,
                    ApplyFilter::InventoryPolicy {
                        inv_id: self.inv_id.clone(),
                        policy: self.opts.policy,
                        prune: true,
                    },
                    ApplyFilter::LocalNamespaces { namespaces: local_namespaces.clone() },
                ],
            }));
            if !dry && !self.opts.prune_timeout.is_zero() {
                tasks.push(Task::Wait(WaitTaskSpec {
                    name: format!("wait-prune-{i}"),
                    ids,
                    condition: WaitCondition::AllNotFound,
                    timeout: self.opts.prune_timeout,
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekon_core::ObjMeta;
    use serde_json::json;

    fn opts(dry_run: DryRun) -> SolverOptions {
        SolverOptions {
            dry_run,
            policy: InventoryPolicy::Strict,
            reconcile_timeout: Duration::from_secs(60),
            prune_timeout: Duration::from_secs(60),
        }
    }

    fn obj(kind: &str, name: &str, ns: &str) -> Value {
        json!({"apiVersion": "v1", "kind": kind, "metadata": {"name": name, "namespace": ns}})
    }

    fn id(kind: &str, name: &str, ns: &str) -> ObjMeta {
        ObjMeta::new("", kind, ns, name).unwrap()
    }

    #[test]
    fn apply_flow_task_ordering() {
        let builder = TaskQueueBuilder { inv_id: "inv-1".into(), opts: opts(DryRun::None) };
        let waves = vec![vec![obj("Namespace", "ns", "")], vec![obj("ConfigMap", "cm", "ns")]];
        let desired: ObjMetaSet =
            vec![id("Namespace", "ns", ""), id("ConfigMap", "cm", "ns")].into();
        let previous: ObjMetaSet = vec![id("Secret", "old", "ns")].into();
        let prune_waves = vec![previous.diff(&desired)];

        let tasks = builder.build_apply(waves, prune_waves, &previous, &desired);
        let names: Vec<&str> = tasks.iter().map(|t| t.name()).collect();
        assert_eq!(
            names,
            vec![
                "inventory-add-0",
                "apply-0",
                "wait-0",
                "apply-1",
                "wait-1",
                "prune-0",
                "wait-prune-0",
                "inventory-set-0"
            ]
        );

        // the claim covers previous and desired ids alike
        match &tasks[0] {
            Task::InventoryAdd { members, .. } => {
                assert_eq!(members.len(), 3);
                assert!(members.contains(&id("Secret", "old", "ns")));
            }
            other => panic!("expected inventory add, got {other:?}"),
        }
        // final membership is exactly the desired set
        match tasks.last().unwrap() {
            Task::InventoryUpdate { members, .. } => assert!(members.set_equals(&desired)),
            other => panic!("expected inventory update, got {other:?}"),
        }
    }

    #[test]
    fn dry_run_skips_waits_and_inventory() {
        let builder = TaskQueueBuilder { inv_id: "inv-1".into(), opts: opts(DryRun::Client) };
        let waves = vec![vec![obj("ConfigMap", "cm", "ns")]];
        let desired: ObjMetaSet = vec![id("ConfigMap", "cm", "ns")].into();
        let tasks = builder.build_apply(waves, Vec::new(), &ObjMetaSet::new(), &desired);
        let names: Vec<&str> = tasks.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["apply-0"]);
    }

    #[test]
    fn zero_reconcile_timeout_disables_waits() {
        let mut o = opts(DryRun::None);
        o.reconcile_timeout = Duration::ZERO;
        let builder = TaskQueueBuilder { inv_id: "inv-1".into(), opts: o };
        let waves = vec![vec![obj("ConfigMap", "cm", "ns")]];
        let desired: ObjMetaSet = vec![id("ConfigMap", "cm", "ns")].into();
        let tasks = builder.build_apply(waves, Vec::new(), &ObjMetaSet::new(), &desired);
        let names: Vec<&str> = tasks.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["inventory-add-0", "apply-0", "inventory-set-0"]);
    }

    #[test]
    fn destroy_flow_ends_with_inventory_delete() {
        let builder = TaskQueueBuilder { inv_id: "inv-1".into(), opts: opts(DryRun::None) };
        let waves = vec![
            vec![id("ConfigMap", "cm", "ns")].into(),
            vec![id("Namespace", "ns", "")].into(),
        ];
        let tasks = builder.build_destroy(waves);
        let names: Vec<&str> = tasks.iter().map(|t| t.name()).collect();
        assert_eq!(
            names,
            vec!["prune-0", "wait-prune-0", "prune-1", "wait-prune-1", "inventory-delete-0"]
        );
    }
}
