//! Validation filters run before apply and prune dispatch.
//!
//! The filter set is closed; filters are not user-extensible at runtime.

use std::collections::BTreeSet;

use serde_json::Value;

use rekon_core::annotations;
use rekon_core::ObjMeta;
use rekon_inventory::{can_apply, can_prune, InventoryPolicy};

use crate::error::ApplyError;

#[derive(Debug, Clone)]
pub enum ApplyFilter {
    /// Ownership check against the owning-inventory annotation. On apply a
    /// strict conflict is an error; on prune a foreign owner is a skip.
    InventoryPolicy { inv_id: String, policy: InventoryPolicy, prune: bool },
    /// Skip pruning objects annotated `on-remove: keep`.
    PreventRemove,
    /// Skip pruning namespaces still hosting desired objects.
    LocalNamespaces { namespaces: BTreeSet<String> },
}

impl ApplyFilter {
    pub fn name(&self) -> &'static str {
        match self {
            ApplyFilter::InventoryPolicy { .. } => "InventoryPolicyFilter",
            ApplyFilter::PreventRemove => "PreventRemoveFilter",
            ApplyFilter::LocalNamespaces { .. } => "LocalNamespacesFilter",
        }
    }

    /// Returns `Ok(Some(reason))` when the object must be skipped, `Err` when
    /// the object must be failed.
    pub fn filter(
        &self,
        id: &ObjMeta,
        live: Option<&Value>,
    ) -> Result<Option<String>, ApplyError> {
        match self {
            ApplyFilter::InventoryPolicy { inv_id, policy, prune: false } => {
                match can_apply(inv_id, live, *policy) {
                    Ok(()) => Ok(None),
                    Err(reason) => Err(ApplyError::InventoryConflict(reason)),
                }
            }
            ApplyFilter::InventoryPolicy { inv_id, prune: true, .. } => match live {
                Some(live) if !can_prune(inv_id, live) => {
                    Ok(Some("object not owned by this inventory".to_string()))
                }
                _ => Ok(None),
            },
            ApplyFilter::PreventRemove => match live {
                Some(live) if annotations::is_on_remove_keep(live) => {
                    Ok(Some("object preserved by on-remove annotation".to_string()))
                }
                _ => Ok(None),
            },
            ApplyFilter::LocalNamespaces { namespaces } => {
                if id.group.is_empty()
                    && id.kind == "Namespace"
                    && namespaces.contains(&id.name)
                {
                    Ok(Some("namespace still in use by desired objects".to_string()))
                } else {
                    Ok(None)
                }
            }
        }
    }
}
