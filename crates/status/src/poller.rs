//! Long-running status observation stream for a fixed id set.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use rekon_cluster::{ClusterClient, ClusterError};
use rekon_core::{unstructured, ObjMeta, ObjMetaSet};

use crate::engine::StatusEngine;
use crate::{PollEvent, ResourceStatus, Status};

fn queue_cap() -> usize {
    std::env::var("REKON_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(2048)
}

fn backoff_max_secs() -> u64 {
    std::env::var("REKON_POLL_BACKOFF_MAX_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(30)
}

/// Periodically observes every id in the watched set and emits a
/// `ResourceUpdate` whenever an object's computed status or generation
/// changes. Transient cluster errors back off with a bounded delay; an
/// unmappable resource is fatal and closes the stream with an `Error` event.
pub struct StatusPoller {
    cluster: Arc<dyn ClusterClient>,
    engine: Arc<StatusEngine>,
    period: Duration,
}

impl StatusPoller {
    pub fn new(cluster: Arc<dyn ClusterClient>, period: Duration) -> Self {
        Self { cluster, engine: Arc::new(StatusEngine::new()), period }
    }

    pub fn with_engine(mut self, engine: Arc<StatusEngine>) -> Self {
        self.engine = engine;
        self
    }

    /// Start polling. The stream runs until cancelled or a fatal error.
    pub fn poll(&self, ids: ObjMetaSet, mut cancel: watch::Receiver<bool>) -> mpsc::Receiver<PollEvent> {
        let (tx, rx) = mpsc::channel(queue_cap());
        let cluster = Arc::clone(&self.cluster);
        let engine = Arc::clone(&self.engine);
        let period = self.period;
        tokio::spawn(async move {
            info!(ids = ids.len(), period_ms = period.as_millis() as u64, "status poller starting");
            let mut last_seen: FxHashMap<ObjMeta, (Status, i64)> = FxHashMap::default();
            let mut backoff: u64 = 1;
            loop {
                if *cancel.borrow() {
                    break;
                }
                let mut transient_error = false;
                for id in ids.iter() {
                    let observed = match cluster.get(id, None).await {
                        Ok(Some(obj)) => {
                            let (status, message) = engine.compute(&obj);
                            ResourceStatus::new(
                                id.clone(),
                                status,
                                unstructured::generation(&obj),
                                message,
                            )
                        }
                        Ok(None) => ResourceStatus::new(
                            id.clone(),
                            Status::NotFound,
                            0,
                            "object not found",
                        ),
                        Err(ClusterError::UnknownType(t)) => {
                            warn!(id = %id, "resource not mappable; poller stopping");
                            let _ = tx
                                .send(PollEvent::Error(format!("resource not mappable: {t}")))
                                .await;
                            return;
                        }
                        Err(e) => {
                            debug!(id = %id, error = %e, "transient poll error");
                            counter!("poll_errors_total", 1u64);
                            transient_error = true;
                            continue;
                        }
                    };
                    let key = (observed.status, observed.generation);
                    if last_seen.get(id) != Some(&key) {
                        last_seen.insert(id.clone(), key);
                        if tx.send(PollEvent::ResourceUpdate(observed)).await.is_err() {
                            info!("status channel closed; poller stopping");
                            return;
                        }
                    }
                }
                counter!("poll_cycles_total", 1u64);

                let sleep_for = if transient_error {
                    let dur = Duration::from_secs(backoff.min(backoff_max_secs()));
                    backoff = (backoff * 2).min(backoff_max_secs()).max(1);
                    period + dur
                } else {
                    backoff = 1;
                    period
                };
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    changed = cancel.changed() => {
                        // a dropped sender never cancels; keep to the timer
                        if changed.is_ok() && *cancel.borrow() { break; }
                        if changed.is_err() { tokio::time::sleep(sleep_for).await; }
                    }
                }
            }
            info!("status poller stopped");
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekon_cluster::mock::MockCluster;
    use serde_json::json;

    fn cm(name: &str) -> serde_json::Value {
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": "ns"}})
    }

    #[tokio::test]
    async fn poller_emits_current_then_not_found() {
        let cluster = Arc::new(MockCluster::with_objects([cm("a")]));
        let poller = StatusPoller::new(cluster.clone(), Duration::from_millis(5));
        let id = ObjMeta::new("", "ConfigMap", "ns", "a").unwrap();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut rx = poller.poll(vec![id.clone()].into(), cancel_rx);

        let first = rx.recv().await.unwrap();
        match first {
            PollEvent::ResourceUpdate(rs) => assert_eq!(rs.status, Status::Current),
            other => panic!("unexpected event {other:?}"),
        }

        // deleting the object flips the next distinct observation
        cluster.delete(&id, rekon_cluster::PropagationPolicy::Background, false).await.unwrap();
        let next = rx.recv().await.unwrap();
        match next {
            PollEvent::ResourceUpdate(rs) => assert_eq!(rs.status, Status::NotFound),
            other => panic!("unexpected event {other:?}"),
        }
        let _ = cancel_tx.send(true);
    }

    #[tokio::test]
    async fn poller_stops_on_cancel() {
        let cluster = Arc::new(MockCluster::new());
        let poller = StatusPoller::new(cluster, Duration::from_millis(5));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut rx = poller.poll(ObjMetaSet::new(), cancel_rx);
        let _ = cancel_tx.send(true);
        // channel closes once the loop observes the cancel flag
        assert!(rx.recv().await.is_none());
    }
}
