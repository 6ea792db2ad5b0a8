//! Cluster status oracle.
//!
//! A single task owns the cluster view. Probes push status transitions in,
//! connection handlers ask for a writer or a reader; every mutation and
//! read is serialized through one channel, so there is no shared mutable
//! state and replies are linearized with concurrent updates.

use std::collections::VecDeque;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Opaque backend identifier: the DSN text the backend was configured with.
pub type BackendId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    /// Initial probe state, never published.
    Unknown,
    /// Could not connect or the probe query failed.
    Down,
    /// Connected, but the recovery row could not be read.
    Broken,
    Master,
    Replica,
}

#[derive(Debug)]
pub struct StatusEvent {
    pub backend: BackendId,
    pub status: BackendStatus,
}

enum OracleRequest {
    Writer { reply: oneshot::Sender<Option<BackendId>> },
    Reader { reply: oneshot::Sender<Option<BackendId>> },
    Apply(StatusEvent),
}

#[derive(Clone)]
pub struct OracleHandle {
    tx: mpsc::Sender<OracleRequest>,
}

impl OracleHandle {
    /// The current master, if any probe has reported one.
    pub async fn request_writer(&self) -> Option<BackendId> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(OracleRequest::Writer { reply }).await.ok()?;
        rx.await.ok()?
    }

    /// The next replica in round-robin order, if any are up.
    pub async fn request_reader(&self) -> Option<BackendId> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(OracleRequest::Reader { reply }).await.ok()?;
        rx.await.ok()?
    }

    pub async fn update(&self, event: StatusEvent) {
        // The oracle task outlives every caller; a failed send can only
        // happen during shutdown.
        let _ = self.tx.send(OracleRequest::Apply(event)).await;
    }
}

/// Spawn the oracle task and return a handle to it.
pub fn spawn() -> OracleHandle {
    let (tx, mut rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut view = ClusterView::default();
        while let Some(request) = rx.recv().await {
            match request {
                OracleRequest::Writer { reply } => {
                    debug!("writer requested");
                    let _ = reply.send(view.writer());
                }
                OracleRequest::Reader { reply } => {
                    debug!("reader requested");
                    let _ = reply.send(view.next_reader());
                }
                OracleRequest::Apply(event) => view.apply(event),
            }
        }
    });
    OracleHandle { tx }
}

/// The oracle's private view of the cluster: at most one master, plus a
/// ring of replicas with a rotating cursor.
#[derive(Default)]
struct ClusterView {
    master: Option<BackendId>,
    replicas: VecDeque<BackendId>,
}

impl ClusterView {
    fn writer(&self) -> Option<BackendId> {
        self.master.clone()
    }

    /// Rotate the ring one step and hand out the backend now at the front,
    /// so consecutive readers land on distinct replicas until the ring
    /// wraps.
    fn next_reader(&mut self) -> Option<BackendId> {
        let next = self.replicas.pop_front()?;
        self.replicas.push_back(next.clone());
        Some(next)
    }

    fn apply(&mut self, StatusEvent { backend, status }: StatusEvent) {
        match status {
            BackendStatus::Master => {
                // Last writer wins when probes disagree about the master.
                self.replicas.retain(|b| *b != backend);
                self.master = Some(backend);
            }
            BackendStatus::Replica => {
                if self.master.as_ref() == Some(&backend) {
                    self.master = None;
                }
                // Remove first so a repeated announcement keeps the ring
                // free of duplicates.
                self.replicas.retain(|b| *b != backend);
                self.replicas.push_back(backend);
            }
            _ => {
                if self.master.as_ref() == Some(&backend) {
                    self.master = None;
                }
                self.replicas.retain(|b| *b != backend);
            }
        }

        info!(
            master = self.master.as_deref().unwrap_or("-none-"),
            replicas = self.replicas.len(),
            "cluster view updated"
        );
    }
}
