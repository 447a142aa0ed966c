//! Builds the dependency graph from a set of desired objects.
//!
//! Four edge sources feed the same graph: explicit depends-on annotations,
//! apply-time-mutation source references, namespace containment, and
//! CRD-defines-kind. Referenced identities outside the input set become
//! external dependencies: they still sort into waves, but are reported in a
//! wave's external set instead of its object set.

use rekon_core::annotations;
use rekon_core::unstructured;
use rekon_core::{ObjMeta, ObjMetaSet, ParseError};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::debug;

use crate::{CyclicDependencyError, Graph, SelfLoopError};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    Annotation(#[from] annotations::AnnotationError),
    #[error(transparent)]
    Identity(#[from] ParseError),
    #[error(transparent)]
    SelfLoop(#[from] SelfLoopError),
    #[error(transparent)]
    Cycle(#[from] CyclicDependencyError),
}

/// Sort objects into apply waves. Returns one object set per wave plus the
/// external dependencies (referenced but not in the input) at each depth.
pub fn sort_objs(objs: &[Value]) -> Result<(Vec<Vec<Value>>, Vec<ObjMetaSet>), ResolveError> {
    layer_objs(objs, false)
}

/// Same waves in reverse dependency order, for deletion.
pub fn reverse_sort_objs(
    objs: &[Value],
) -> Result<(Vec<Vec<Value>>, Vec<ObjMetaSet>), ResolveError> {
    layer_objs(objs, true)
}

fn layer_objs(
    objs: &[Value],
    reverse: bool,
) -> Result<(Vec<Vec<Value>>, Vec<ObjMetaSet>), ResolveError> {
    if objs.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }

    let mut by_id: FxHashMap<ObjMeta, &Value> = FxHashMap::default();
    let mut graph = Graph::new();
    for obj in objs {
        let id = unstructured::obj_meta(obj)?;
        graph.add_vertex(id.clone());
        by_id.insert(id, obj);
    }

    add_depends_on_edges(&mut graph, objs)?;
    add_mutation_edges(&mut graph, objs)?;
    add_namespace_edges(&mut graph, objs)?;
    add_crd_edges(&mut graph, objs)?;

    let id_waves = if reverse { graph.reverse_sort()? } else { graph.sort()? };
    debug!(objects = objs.len(), waves = id_waves.len(), "resolved dependency waves");

    let mut obj_waves: Vec<Vec<Value>> = Vec::with_capacity(id_waves.len());
    let mut external: Vec<ObjMetaSet> = Vec::with_capacity(id_waves.len());
    for wave in id_waves {
        let mut objects = Vec::new();
        let mut deps = ObjMetaSet::new();
        for id in wave {
            match by_id.get(&id) {
                Some(obj) => objects.push((*obj).clone()),
                None => deps.insert(id),
            }
        }
        obj_waves.push(objects);
        external.push(deps);
    }
    Ok((obj_waves, external))
}

/// Pass 1: explicit depends-on annotations.
fn add_depends_on_edges(graph: &mut Graph, objs: &[Value]) -> Result<(), ResolveError> {
    for obj in objs {
        let deps = annotations::read_depends_on(obj)?;
        if deps.is_empty() {
            continue;
        }
        let from = unstructured::obj_meta(obj)?;
        for to in deps {
            graph.add_edge(from.clone(), to)?;
        }
    }
    Ok(())
}

/// Pass 2: apply-time-mutation source references. Edge construction reads
/// only the source refs; paths are evaluated later, at apply time.
fn add_mutation_edges(graph: &mut Graph, objs: &[Value]) -> Result<(), ResolveError> {
    for obj in objs {
        let subs = annotations::read_mutation(obj)?;
        if subs.is_empty() {
            continue;
        }
        let from = unstructured::obj_meta(obj)?;
        for sub in subs {
            let to = sub.source_ref.to_obj_meta()?;
            graph.add_edge(from.clone(), to)?;
        }
    }
    Ok(())
}

/// Pass 3: a namespaced object depends on its Namespace when that Namespace
/// is part of the input set.
fn add_namespace_edges(graph: &mut Graph, objs: &[Value]) -> Result<(), ResolveError> {
    let mut namespaces: FxHashMap<&str, ObjMeta> = FxHashMap::default();
    for obj in objs {
        if unstructured::is_namespace(obj) {
            namespaces.insert(unstructured::name(obj), unstructured::obj_meta(obj)?);
        }
    }
    for obj in objs {
        let ns = unstructured::namespace(obj);
        if ns.is_empty() {
            continue;
        }
        if let Some(ns_id) = namespaces.get(ns) {
            graph.add_edge(unstructured::obj_meta(obj)?, ns_id.clone())?;
        }
    }
    Ok(())
}

/// Pass 4: a custom resource depends on the CRD that defines its kind when
/// that CRD is part of the input set.
fn add_crd_edges(graph: &mut Graph, objs: &[Value]) -> Result<(), ResolveError> {
    let mut crds: FxHashMap<(String, String), ObjMeta> = FxHashMap::default();
    for obj in objs {
        if unstructured::is_crd(obj) {
            if let Some((group, kind)) = unstructured::crd_group_kind(obj) {
                crds.insert((group.to_string(), kind.to_string()), unstructured::obj_meta(obj)?);
            }
        }
    }
    if crds.is_empty() {
        return Ok(());
    }
    for obj in objs {
        let (group, _) = unstructured::group_version(obj);
        let key = (group.to_string(), unstructured::kind(obj).to_string());
        if let Some(crd_id) = crds.get(&key) {
            graph.add_edge(unstructured::obj_meta(obj)?, crd_id.clone())?;
        }
    }
    Ok(())
}
