//! The bounded asynchronous write queue from §5: callers that don't want to
//! wait on a persistence round trip can hand a sealed interaction to
//! [`WriteQueue`] instead of calling `PersistenceAdapter::commit` directly.
//! A background task drains the queue and commits each job in turn.
//!
//! Capacity is fixed at 1000 jobs. A `tracing::warn!` fires once the queue
//! is 80% full; beyond capacity, `enqueue` drops the job, bumps an in-memory
//! counter, and returns `false` so the caller can decide whether to retry or
//! surface the drop — this crate never blocks a caller on a full queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use super::{CipherBlob, InteractionHeader, PersistenceAdapter};

/// One unit of work for the background drain task: a sealed interaction's
/// header and every one of its cipher-blob rows, ready to commit as one
/// transaction.
pub struct WriteJob {
    pub header: InteractionHeader,
    pub blobs: Vec<CipherBlob>,
}

async fn apply(store: &dyn PersistenceAdapter, job: WriteJob) -> Result<(), crate::key_store::StoreError> {
    let mut tx = store.begin_tx().await?;
    store.insert_header(&mut tx, job.header).await?;
    for blob in job.blobs {
        store.insert_blob(&mut tx, blob).await?;
    }
    store.commit(tx).await
}

pub struct WriteQueue {
    sender: mpsc::Sender<WriteJob>,
    dropped: Arc<AtomicU64>,
    drain_handle: JoinHandle<()>,
}

impl WriteQueue {
    pub const CAPACITY: usize = 1000;
    const WARN_THRESHOLD: usize = (Self::CAPACITY * 8) / 10;

    /// Spawn the background drain task over `store`. The task runs until
    /// `shutdown` drops the sender and the channel empties.
    pub fn spawn(store: Arc<dyn PersistenceAdapter>) -> Self {
        let (sender, mut receiver) = mpsc::channel(Self::CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));

        let drain_handle = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                if let Err(err) = apply(store.as_ref(), job).await {
                    warn!(error = %err, "write queue job failed to commit");
                }
            }
        });

        Self { sender, dropped, drain_handle }
    }

    /// Enqueue a job without waiting for it to commit. Returns `false` if
    /// the queue was full and the job was dropped.
    pub fn enqueue(&self, job: WriteJob) -> bool {
        let depth = Self::CAPACITY - self.sender.capacity();
        if depth >= Self::WARN_THRESHOLD {
            warn!(depth, capacity = Self::CAPACITY, "write queue nearing capacity");
        }

        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Number of jobs dropped since this queue was spawned, due to overflow.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue and wait for every already-enqueued job to commit.
    pub async fn shutdown(self) {
        drop(self.sender);
        let _ = self.drain_handle.await;
    }
}
