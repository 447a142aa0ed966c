//! Error kinds and their propagation classes.
//!
//! `EngineError` aborts the run before or during task execution;
//! `ApplyError`/`MutationError` fail a single object and let the run
//! continue.

use rekon_core::pathexp::PathError;
use rekon_core::{ObjMeta, ParseError};

/// Fatal errors: the run stops and the remaining queue is skipped.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Resolve(#[from] rekon_graph::ResolveError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Annotation(#[from] rekon_core::annotations::AnnotationError),
    #[error(transparent)]
    Inventory(#[from] rekon_inventory::InventoryError),
    #[error(transparent)]
    Cluster(#[from] rekon_cluster::ClusterError),
    #[error("status poller: {0}")]
    Poller(String),
    #[error("duplicate object in input set: {0}")]
    DuplicateObject(ObjMeta),
}

/// Per-object apply failures, classified for the event payload.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("unknown resource type: {0}")]
    UnknownType(String),
    #[error("applying object: {0}")]
    ApplyRun(String),
    #[error("initializing apply options: {0}")]
    InitializeApplyOption(String),
    #[error("inventory conflict: {0}")]
    InventoryConflict(String),
    #[error(transparent)]
    Mutation(#[from] MutationError),
}

/// Failures of the apply-time mutator; always per-object.
#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("invalid self-reference ({0})")]
    SelfReference(ObjMeta),
    #[error("failed to get source resource ({id}): {reason}")]
    SourceFetch { id: ObjMeta, reason: String },
    #[error("source resource not found in cluster ({0})")]
    SourceNotFound(ObjMeta),
    #[error("source field {path:?} not present in source resource ({id})")]
    SourceFieldMissing { id: ObjMeta, path: String },
    #[error("token is specified, but target field value is {found}, expected string")]
    TargetTypeMismatch { found: &'static str },
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Annotation(#[from] rekon_core::annotations::AnnotationError),
    #[error(transparent)]
    Identity(#[from] ParseError),
}
