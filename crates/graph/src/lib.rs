//! Dependency graph over object identities with topological wave sorting.

#![forbid(unsafe_code)]

mod resolver;

pub use resolver::{reverse_sort_objs, sort_objs, ResolveError};

use rekon_core::ObjMeta;
use rustc_hash::{FxHashMap, FxHashSet};

#[derive(Debug, thiserror::Error)]
#[error("self-loop edge rejected: {0}")]
pub struct SelfLoopError(pub ObjMeta);

/// Raised when iterated leaf removal cannot consume the whole graph. The
/// remaining vertices contain at least one directed cycle.
#[derive(Debug, thiserror::Error)]
pub struct CyclicDependencyError {
    pub remaining: Vec<ObjMeta>,
}

impl std::fmt::Display for CyclicDependencyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<String> = self.remaining.iter().map(|id| id.to_string()).collect();
        write!(f, "cyclic dependency among: {}", ids.join(", "))
    }
}

/// Directed graph of identities. An edge `a -> b` means "a depends on b":
/// b must be realized before a.
#[derive(Debug, Default)]
pub struct Graph {
    // Insertion order of vertices keeps wave output stable.
    vertices: Vec<ObjMeta>,
    edges: FxHashMap<ObjMeta, FxHashSet<ObjMeta>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vertex if not already present.
    pub fn add_vertex(&mut self, id: ObjMeta) {
        if !self.edges.contains_key(&id) {
            self.edges.insert(id.clone(), FxHashSet::default());
            self.vertices.push(id);
        }
    }

    /// Add a directed dependency edge. Idempotent; self-loops are rejected.
    pub fn add_edge(&mut self, from: ObjMeta, to: ObjMeta) -> Result<(), SelfLoopError> {
        if from == to {
            return Err(SelfLoopError(from));
        }
        self.add_vertex(from.clone());
        self.add_vertex(to.clone());
        if let Some(tos) = self.edges.get_mut(&from) {
            tos.insert(to);
        }
        Ok(())
    }

    pub fn contains(&self, id: &ObjMeta) -> bool {
        self.edges.contains_key(id)
    }

    pub fn edge_list(&self) -> Vec<(ObjMeta, ObjMeta)> {
        let mut out = Vec::new();
        for from in &self.vertices {
            if let Some(tos) = self.edges.get(from) {
                for to in tos {
                    out.push((from.clone(), to.clone()));
                }
            }
        }
        out
    }

    /// Topologically layer the graph into waves of increasing dependency
    /// depth: wave 0 has no outgoing edges, wave k+1 points only into waves
    /// <= k. Vertices within a wave keep insertion order.
    pub fn sort(&self) -> Result<Vec<Vec<ObjMeta>>, CyclicDependencyError> {
        let mut waves: Vec<Vec<ObjMeta>> = Vec::new();
        let mut done: FxHashSet<ObjMeta> = FxHashSet::default();
        while done.len() < self.vertices.len() {
            let wave: Vec<ObjMeta> = self
                .vertices
                .iter()
                .filter(|id| !done.contains(*id))
                .filter(|id| {
                    self.edges
                        .get(*id)
                        .map(|tos| tos.iter().all(|to| done.contains(to)))
                        .unwrap_or(true)
                })
                .cloned()
                .collect();
            if wave.is_empty() {
                let remaining: Vec<ObjMeta> =
                    self.vertices.iter().filter(|id| !done.contains(*id)).cloned().collect();
                return Err(CyclicDependencyError { remaining });
            }
            for id in &wave {
                done.insert(id.clone());
            }
            waves.push(wave);
        }
        Ok(waves)
    }

    /// Waves in reverse dependency order, for deletion.
    pub fn reverse_sort(&self) -> Result<Vec<Vec<ObjMeta>>, CyclicDependencyError> {
        let mut waves = self.sort()?;
        waves.reverse();
        Ok(waves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> ObjMeta {
        ObjMeta::new("", "ConfigMap", "ns", name).unwrap()
    }

    #[test]
    fn sort_empty_graph() {
        let g = Graph::new();
        assert!(g.sort().unwrap().is_empty());
    }

    #[test]
    fn isolated_vertices_share_the_leaf_wave() {
        let mut g = Graph::new();
        g.add_vertex(id("a"));
        g.add_vertex(id("b"));
        let waves = g.sort().unwrap();
        assert_eq!(waves, vec![vec![id("a"), id("b")]]);
    }

    #[test]
    fn chain_produces_one_wave_per_depth() {
        let mut g = Graph::new();
        g.add_edge(id("a"), id("b")).unwrap();
        g.add_edge(id("b"), id("c")).unwrap();
        let waves = g.sort().unwrap();
        assert_eq!(waves, vec![vec![id("c")], vec![id("b")], vec![id("a")]]);

        let reversed = g.reverse_sort().unwrap();
        assert_eq!(reversed, vec![vec![id("a")], vec![id("b")], vec![id("c")]]);
    }

    #[test]
    fn duplicate_edges_are_deduplicated() {
        let mut g = Graph::new();
        g.add_edge(id("a"), id("b")).unwrap();
        g.add_edge(id("a"), id("b")).unwrap();
        assert_eq!(g.edge_list().len(), 1);
    }

    #[test]
    fn self_loop_is_rejected() {
        let mut g = Graph::new();
        assert!(g.add_edge(id("a"), id("a")).is_err());
    }

    #[test]
    fn cycle_reports_residual_set() {
        let mut g = Graph::new();
        g.add_edge(id("a"), id("b")).unwrap();
        g.add_edge(id("b"), id("a")).unwrap();
        g.add_vertex(id("c"));
        let err = g.sort().unwrap_err();
        assert_eq!(err.remaining.len(), 2);
        assert!(err.remaining.contains(&id("a")));
        assert!(err.remaining.contains(&id("b")));
    }

    #[test]
    fn edge_ordering_invariant() {
        // for every edge a -> b, wave(b) < wave(a)
        let mut g = Graph::new();
        g.add_edge(id("a"), id("b")).unwrap();
        g.add_edge(id("a"), id("c")).unwrap();
        g.add_edge(id("d"), id("c")).unwrap();
        let waves = g.sort().unwrap();
        let wave_of = |x: &ObjMeta| waves.iter().position(|w| w.contains(x)).unwrap();
        for (from, to) in g.edge_list() {
            assert!(wave_of(&to) < wave_of(&from), "{to} must sort before {from}");
        }
    }
}
