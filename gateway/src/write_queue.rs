//! Batched persistence.
//!
//! Writes from the index pipeline are gathered in a [`Batcher`] and
//! committed to the [`MediaStore`] in two calls per flush: every `add` in
//! one call, then every `update` merged per row id in a second. A failed
//! commit is logged and its batch is discarded.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::{BatchPolicy, Batcher, FlushTimer, Pushed};
use crate::error::{Error, Result};
use crate::store::MediaStore;
use crate::types::{MediaUnit, MediaUnitUpdate};

/// A queued storage write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Add(MediaUnit),
    Update(MediaUnitUpdate),
}

enum Command {
    Write(WriteOp),
    FlushDue(u64),
    Flush(oneshot::Sender<()>),
}

/// Handle to the write queue task. Cheap to clone.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::UnboundedSender<Command>,
}

impl WriteQueue {
    /// Start the queue task. It commits what is left and exits when
    /// `cancel` fires or every handle is dropped.
    pub fn spawn(
        store: Arc<dyn MediaStore>,
        policy: BatchPolicy,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let timer_tx = tx.downgrade();
        let handle = tokio::spawn(run(store, policy, rx, timer_tx, cancel));
        (Self { tx }, handle)
    }

    pub fn add(&self, unit: MediaUnit) {
        self.push(WriteOp::Add(unit));
    }

    pub fn update(&self, update: MediaUnitUpdate) {
        self.push(WriteOp::Update(update));
    }

    pub fn push(&self, op: WriteOp) {
        if self.tx.send(Command::Write(op)).is_err() {
            warn!("write queue stopped, write dropped");
        }
    }

    /// Commit everything queued so far and wait for it.
    pub async fn flush(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Command::Flush(done))
            .map_err(|_| Error::ShuttingDown)?;
        wait.await.map_err(|_| Error::ShuttingDown)
    }
}

async fn run(
    store: Arc<dyn MediaStore>,
    policy: BatchPolicy,
    mut rx: mpsc::UnboundedReceiver<Command>,
    timer_tx: mpsc::WeakUnboundedSender<Command>,
    cancel: CancellationToken,
) {
    let mut buffer: Batcher<WriteOp> = Batcher::new(policy);
    debug!(
        flush_count = policy.max_batch_size.saturating_sub(1),
        flush_latency_ms = policy.max_latency.as_millis() as u64,
        "write queue started"
    );

    loop {
        let cmd = tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };

        match cmd {
            Command::Write(op) => {
                let timer_tx = timer_tx.clone();
                let pushed = buffer.push(op, move |epoch, after| {
                    FlushTimer::spawn(after, move || {
                        if let Some(tx) = timer_tx.upgrade() {
                            let _ = tx.send(Command::FlushDue(epoch));
                        }
                    })
                });
                if pushed == Pushed::FlushNow {
                    commit(store.as_ref(), buffer.take()).await;
                }
            }
            Command::FlushDue(epoch) => {
                if buffer.expire(epoch) {
                    commit(store.as_ref(), buffer.take()).await;
                }
            }
            Command::Flush(done) => {
                commit(store.as_ref(), buffer.take()).await;
                let _ = done.send(());
            }
        }
    }

    // Writes still sitting in the channel belong to the final batch.
    let mut remaining = buffer.take();
    while let Ok(cmd) = rx.try_recv() {
        match cmd {
            Command::Write(op) => remaining.push(op),
            Command::Flush(done) => {
                let _ = done.send(());
            }
            Command::FlushDue(_) => {}
        }
    }
    if !remaining.is_empty() {
        info!(entries = remaining.len(), "committing write queue before shutdown");
    }
    commit(store.as_ref(), remaining).await;
}

/// Split a drained batch into adds (in order) and updates merged per id,
/// field by field, in order of first appearance.
pub fn coalesce(ops: Vec<WriteOp>) -> (Vec<MediaUnit>, Vec<MediaUnitUpdate>) {
    let mut adds = Vec::new();
    let mut updates: Vec<MediaUnitUpdate> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for op in ops {
        match op {
            WriteOp::Add(unit) => adds.push(unit),
            WriteOp::Update(update) => match positions.get(&update.id) {
                Some(&pos) => updates[pos].merge(update),
                None => {
                    positions.insert(update.id.clone(), updates.len());
                    updates.push(update);
                }
            },
        }
    }
    (adds, updates)
}

/// Commit one batch. Adds first so updates can find their rows.
async fn commit(store: &dyn MediaStore, ops: Vec<WriteOp>) {
    if ops.is_empty() {
        return;
    }
    let (adds, updates) = coalesce(ops);
    debug!(adds = adds.len(), updates = updates.len(), "write queue flush");

    if !adds.is_empty() {
        let n = adds.len();
        if let Err(e) = store.add(adds).await {
            warn!(rows = n, "media unit add failed, batch dropped: {}", e);
        }
    }
    if !updates.is_empty() {
        let n = updates.len();
        if let Err(e) = store.update(updates).await {
            warn!(rows = n, "media unit update failed, batch dropped: {}", e);
        }
    }
}
