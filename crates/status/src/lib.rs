//! Resource status observation: poller, per-kind engine, collector.

#![forbid(unsafe_code)]

pub mod engine;
mod poller;

pub use engine::StatusEngine;
pub use poller::StatusPoller;

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use rekon_core::ObjMeta;

/// Computed state of one cluster object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    InProgress,
    Current,
    Failed,
    Terminating,
    NotFound,
    Unknown,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::InProgress => "InProgress",
            Status::Current => "Current",
            Status::Failed => "Failed",
            Status::Terminating => "Terminating",
            Status::NotFound => "NotFound",
            Status::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// One observation of one object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub id: ObjMeta,
    pub status: Status,
    pub generation: i64,
    pub message: String,
    pub observed_at: DateTime<Utc>,
}

impl ResourceStatus {
    pub fn new(id: ObjMeta, status: Status, generation: i64, message: impl Into<String>) -> Self {
        Self { id, status, generation, message: message.into(), observed_at: Utc::now() }
    }
}

/// Events on the poller stream. `Error` is fatal: the stream closes after.
#[derive(Debug, Clone)]
pub enum PollEvent {
    ResourceUpdate(ResourceStatus),
    Error(String),
}

/// Snapshot of the latest observation per watched id, in identity order.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub resource_statuses: Vec<ResourceStatus>,
    pub error: Option<String>,
}

impl Observation {
    pub fn status_of(&self, id: &ObjMeta) -> Option<Status> {
        self.resource_statuses.iter().find(|rs| &rs.id == id).map(|rs| rs.status)
    }

    pub fn all_current(&self, ids: &[ObjMeta]) -> bool {
        ids.iter().all(|id| self.status_of(id) == Some(Status::Current))
    }
}

/// Completion signal for a collector; carries the fatal error, if any.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub error: Option<String>,
}

/// Aggregates a poll stream, keeping the latest event per identity. Readers
/// snapshot lock-free via an atomically swapped `Observation`.
pub struct Collector {
    latest: Arc<ArcSwap<Observation>>,
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector {
    pub fn new() -> Self {
        Self { latest: Arc::new(ArcSwap::from_pointee(Observation::default())) }
    }

    /// Consume the stream until it closes. The returned channel resolves once
    /// with the completion; a fatal stream error is carried in it.
    pub fn listen(&self, mut rx: mpsc::Receiver<PollEvent>) -> oneshot::Receiver<Completion> {
        let latest = Arc::clone(&self.latest);
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut by_id: FxHashMap<ObjMeta, ResourceStatus> = FxHashMap::default();
            let mut error: Option<String> = None;
            while let Some(ev) = rx.recv().await {
                match ev {
                    PollEvent::ResourceUpdate(rs) => {
                        by_id.insert(rs.id.clone(), rs);
                    }
                    PollEvent::Error(e) => {
                        debug!(error = %e, "collector observed fatal poller error");
                        error = Some(e);
                    }
                }
                let mut statuses: Vec<ResourceStatus> = by_id.values().cloned().collect();
                statuses.sort_by(|a, b| a.id.cmp(&b.id));
                latest.store(Arc::new(Observation {
                    resource_statuses: statuses,
                    error: error.clone(),
                }));
            }
            let _ = done_tx.send(Completion { error });
        });
        done_rx
    }

    pub fn latest_observation(&self) -> Arc<Observation> {
        self.latest.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(kind: &str, name: &str) -> ObjMeta {
        ObjMeta::new(if kind == "Deployment" { "apps" } else { "" }, kind, "default", name)
            .unwrap()
    }

    fn update(kind: &str, name: &str, status: Status, generation: i64) -> PollEvent {
        PollEvent::ResourceUpdate(ResourceStatus::new(id(kind, name), status, generation, ""))
    }

    #[tokio::test]
    async fn collector_keeps_latest_event_per_id() {
        let collector = Collector::new();
        let (tx, rx) = mpsc::channel(16);
        let done = collector.listen(rx);

        tx.send(update("Deployment", "Foo", Status::InProgress, 1)).await.unwrap();
        tx.send(update("StatefulSet", "Bar", Status::InProgress, 1)).await.unwrap();
        tx.send(update("Deployment", "Foo", Status::Current, 2)).await.unwrap();
        drop(tx);
        done.await.unwrap();

        let obs = collector.latest_observation();
        assert_eq!(obs.resource_statuses.len(), 2);
        let dep = obs
            .resource_statuses
            .iter()
            .find(|rs| rs.id == id("Deployment", "Foo"))
            .unwrap();
        assert_eq!(dep.status, Status::Current);
        assert_eq!(dep.generation, 2);
    }

    #[tokio::test]
    async fn collector_observation_is_sorted() {
        let collector = Collector::new();
        let (tx, rx) = mpsc::channel(16);
        let done = collector.listen(rx);
        tx.send(update("StatefulSet", "zz", Status::Current, 1)).await.unwrap();
        tx.send(update("ConfigMap", "aa", Status::Current, 1)).await.unwrap();
        drop(tx);
        done.await.unwrap();

        let obs = collector.latest_observation();
        let ids: Vec<&ObjMeta> = obs.resource_statuses.iter().map(|rs| &rs.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn collector_completion_carries_fatal_error() {
        let collector = Collector::new();
        let (tx, rx) = mpsc::channel(16);
        let done = collector.listen(rx);
        tx.send(PollEvent::Error("this is a test error".into())).await.unwrap();
        drop(tx);
        let completion = done.await.unwrap();
        assert_eq!(completion.error.as_deref(), Some("this is a test error"));
    }

    #[tokio::test]
    async fn collector_completes_on_stream_close() {
        let collector = Collector::new();
        let (tx, rx) = mpsc::channel::<PollEvent>(1);
        let done = collector.listen(rx);
        drop(tx);
        let completion = done.await.unwrap();
        assert!(completion.error.is_none());
    }
}
