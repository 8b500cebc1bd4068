//! Per-room persistence writer.
//!
//! The room actor never awaits storage. It hands encoded payloads to a
//! [`PersistWriter`], whose task applies them strictly in submission order
//! and retries failures with the configured [`RetryPolicy`]. A flush job is
//! acknowledged with `true` only if everything since the last successful
//! snapshot reached the store.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::{Persistence, RetryPolicy};

/// Work items processed by the writer task
#[derive(Debug)]
pub enum PersistJob {
    /// Append one encoded update to the room's tail
    Append(Bytes),
    /// Replace the room's snapshot and drop its tail
    Snapshot(Bytes),
    /// Flush the store, then report whether every write so far succeeded
    Flush(oneshot::Sender<bool>),
}

/// Handle to a room's writer task
#[derive(Debug, Clone)]
pub struct PersistWriter {
    tx: mpsc::UnboundedSender<PersistJob>,
}

impl PersistWriter {
    /// Spawn the writer task; it exits once every handle is dropped
    pub fn spawn(
        room_id: impl Into<String>,
        store: Arc<dyn Persistence>,
        policy: RetryPolicy,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_writer(room_id.into(), store, policy, rx));
        (Self { tx }, handle)
    }

    pub fn append(&self, update: Bytes) {
        self.submit(PersistJob::Append(update));
    }

    pub fn snapshot(&self, snapshot: Bytes) {
        self.submit(PersistJob::Snapshot(snapshot));
    }

    /// Queue a flush; the receiver yields `false` if any write failed
    pub fn flush(&self) -> oneshot::Receiver<bool> {
        let (ack, rx) = oneshot::channel();
        self.submit(PersistJob::Flush(ack));
        rx
    }

    fn submit(&self, job: PersistJob) {
        if self.tx.send(job).is_err() {
            error!("Persistence writer has stopped; dropping job");
        }
    }
}

async fn run_writer(
    room_id: String,
    store: Arc<dyn Persistence>,
    policy: RetryPolicy,
    mut rx: mpsc::UnboundedReceiver<PersistJob>,
) {
    // Set when a write was given up on; cleared by the next good snapshot
    let mut failed = false;

    while let Some(job) = rx.recv().await {
        match job {
            PersistJob::Append(update) => {
                let result = policy
                    .run("append update", || store.append_update(&room_id, &update))
                    .await;
                if let Err(e) = result {
                    error!("Giving up on update for room {}: {}", room_id, e);
                    failed = true;
                }
            }
            PersistJob::Snapshot(snapshot) => {
                let result = policy
                    .run("save snapshot", || store.save_snapshot(&room_id, &snapshot))
                    .await;
                match result {
                    Ok(()) => {
                        debug!("Saved snapshot for room {} ({} bytes)", room_id, snapshot.len());
                        failed = false;
                    }
                    Err(e) => {
                        error!("Giving up on snapshot for room {}: {}", room_id, e);
                        failed = true;
                    }
                }
            }
            PersistJob::Flush(ack) => {
                let flushed = policy.run("flush", || store.flush()).await.is_ok();
                let _ = ack.send(flushed && !failed);
            }
        }
    }

    debug!("Persistence writer for room {} stopped", room_id);
}
