//! Job correlation table.
//!
//! Maps a job id to the continuation waiting for its result. Each entry
//! leaves the table exactly once: on its result, on its deadline, or when
//! the worker it was sent to (or the tenant waiting for it) disconnects.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::types::{ConnectionId, JobOutput};

/// What to do with a job's output.
pub enum Continuation {
    /// In-process callback.
    Local(Box<dyn FnOnce(JobOutput) + Send>),
    /// Forward the output to a tenant connection as
    /// `{type: result_type, id: request_id, ...}`.
    Remote {
        connection: ConnectionId,
        request_id: String,
        result_type: String,
    },
}

impl Continuation {
    pub fn local<F>(f: F) -> Self
    where
        F: FnOnce(JobOutput) + Send + 'static,
    {
        Continuation::Local(Box::new(f))
    }

    /// A local continuation whose output is delivered to the returned
    /// [`JobReply`].
    pub fn reply(category: &str) -> (Self, JobReply) {
        let (tx, rx) = oneshot::channel();
        let cont = Continuation::local(move |output| {
            let _ = tx.send(output);
        });
        (
            cont,
            JobReply {
                category: category.to_string(),
                rx,
            },
        )
    }

    /// The tenant connection this continuation answers, if any.
    pub fn remote_connection(&self) -> Option<&ConnectionId> {
        match self {
            Continuation::Remote { connection, .. } => Some(connection),
            Continuation::Local(_) => None,
        }
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Continuation::Local(_) => f.write_str("Local(..)"),
            Continuation::Remote {
                connection,
                request_id,
                result_type,
            } => f
                .debug_struct("Remote")
                .field("connection", connection)
                .field("request_id", request_id)
                .field("result_type", result_type)
                .finish(),
        }
    }
}

/// Pending output of a job dispatched with [`Continuation::reply`].
#[derive(Debug)]
pub struct JobReply {
    category: String,
    rx: oneshot::Receiver<JobOutput>,
}

impl JobReply {
    /// Wait for the output. Fails with [`Error::JobAbandoned`] if the job
    /// was dropped before a result arrived.
    pub async fn wait(self) -> Result<JobOutput> {
        let category = self.category;
        self.rx
            .await
            .map_err(|_| Error::JobAbandoned { category })
    }
}

/// A job awaiting its result.
#[derive(Debug)]
pub struct PendingJob {
    pub category: String,
    pub worker: ConnectionId,
    pub deadline: Instant,
    pub continuation: Continuation,
}

/// Job id to pending job.
#[derive(Debug, Default)]
pub struct JobTable {
    pending: HashMap<String, PendingJob>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.pending.contains_key(job_id)
    }

    pub fn register(&mut self, job_id: String, job: PendingJob) {
        self.pending.insert(job_id, job);
    }

    /// Remove and return the entry. A second call for the same id returns
    /// `None`.
    pub fn take(&mut self, job_id: &str) -> Option<PendingJob> {
        self.pending.remove(job_id)
    }

    /// Remove every entry whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<(String, PendingJob)> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, job)| job.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|job| (id, job)))
            .collect()
    }

    /// Remove entries sent to `conn` as a worker or awaited by `conn` as a
    /// tenant.
    pub fn drop_for_connection(&mut self, conn: &ConnectionId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, job| {
            &job.worker != conn && job.continuation.remote_connection() != Some(conn)
        });
        before - self.pending.len()
    }
}
