//! Worker selection and result routing.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;
use tracing::{debug, warn};
use zapdos_wire::{ForwardedResult, WorkerResult};

use crate::jobs::{Continuation, JobTable};
use crate::registry::Registry;
use crate::types::{ConnectionId, JobOutput};

/// Picks the worker a job of `category` is sent to.
pub trait WorkerSelector: Send + Sync {
    fn select(&self, registry: &Registry, category: &str) -> Option<ConnectionId>;
}

/// First open worker subscribed to the category, in registration order.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstMatch;

impl WorkerSelector for FirstMatch {
    fn select(&self, registry: &Registry, category: &str) -> Option<ConnectionId> {
        registry.workers_for(category).into_iter().next()
    }
}

/// Rotates over the open workers of a category.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next_index: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkerSelector for RoundRobin {
    fn select(&self, registry: &Registry, category: &str) -> Option<ConnectionId> {
        let mut candidates = registry.workers_for(category);
        if candidates.is_empty() {
            return None;
        }
        let idx = self.next_index.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates.swap_remove(idx))
    }
}

/// Counters for one routed result message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouteStats {
    pub resolved: usize,
    pub missing_id: usize,
    pub unknown: usize,
    /// Resolved entries that arrived under another category or from a
    /// worker other than the one the job was sent to.
    pub mismatched: usize,
}

/// Resolve the continuations of every output entry in `result`, sent by
/// the worker connection `sender`.
///
/// Entries without an `id`, or whose id is not pending, are logged and
/// skipped. Each pending job is removed before its continuation runs. A
/// job answered under the wrong category or by the wrong worker is still
/// resolved, with a warning.
pub fn route(
    table: &mut JobTable,
    registry: &Registry,
    sender: &ConnectionId,
    result: WorkerResult,
) -> RouteStats {
    let mut stats = RouteStats::default();
    let WorkerResult { category, output } = result;

    for entry in output {
        let Value::Object(entry) = entry else {
            warn!(category = %category, "non-object output entry skipped");
            stats.missing_id += 1;
            continue;
        };
        let Some(job_id) = entry.get("id").and_then(Value::as_str).map(str::to_string) else {
            warn!(category = %category, "output entry without id skipped");
            stats.missing_id += 1;
            continue;
        };
        let Some(job) = table.take(&job_id) else {
            warn!(category = %category, job = %job_id, "result for unknown job dropped");
            stats.unknown += 1;
            continue;
        };

        if job.category != category || &job.worker != sender {
            warn!(
                job = %job_id,
                expected_category = %job.category,
                category = %category,
                expected_worker = %job.worker,
                worker = %sender,
                "result does not match its job"
            );
            stats.mismatched += 1;
        }
        resume(registry, job.continuation, entry);
        stats.resolved += 1;
    }
    stats
}

fn resume(registry: &Registry, continuation: Continuation, output: JobOutput) {
    match continuation {
        Continuation::Local(f) => f(output),
        Continuation::Remote {
            connection,
            request_id,
            result_type,
        } => {
            let mut fields = output;
            // Header keys belong to the forwarded message, not the worker.
            fields.remove("id");
            fields.remove("type");
            let msg = ForwardedResult {
                kind: result_type,
                id: request_id,
                fields,
            };
            match zapdos_wire::encode(&msg) {
                Ok(text) => {
                    if !registry.send(&connection, text) {
                        debug!(connection = %connection, "tenant gone, result dropped");
                    }
                }
                Err(e) => warn!("failed to encode forwarded result: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use crate::batch::BatchPolicy;
    use crate::jobs::PendingJob;
    use crate::registry::{Outbound, WorkerState};

    fn worker(reg: &mut Registry, name: &str, category: &str) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::from(name);
        reg.insert(id.clone(), tx);
        reg.register_worker(
            &id,
            WorkerState::new(
                vec![category.to_string()],
                BatchPolicy::new(8, Duration::from_secs(1)),
            ),
        );
        rx
    }

    fn pending(continuation: Continuation) -> PendingJob {
        PendingJob {
            category: "embedding".into(),
            worker: ConnectionId::from("w"),
            deadline: Instant::now() + Duration::from_secs(60),
            continuation,
        }
    }

    #[test]
    fn test_first_match_and_round_robin() {
        let mut reg = Registry::new();
        let _a = worker(&mut reg, "a", "embedding");
        let _b = worker(&mut reg, "b", "embedding");

        let first = FirstMatch;
        assert_eq!(first.select(&reg, "embedding"), Some(ConnectionId::from("a")));
        assert_eq!(first.select(&reg, "embedding"), Some(ConnectionId::from("a")));
        assert_eq!(first.select(&reg, "qa_vlm"), None);

        let rr = RoundRobin::new();
        assert_eq!(rr.select(&reg, "embedding"), Some(ConnectionId::from("a")));
        assert_eq!(rr.select(&reg, "embedding"), Some(ConnectionId::from("b")));
        assert_eq!(rr.select(&reg, "embedding"), Some(ConnectionId::from("a")));
    }

    #[test]
    fn test_route_resolves_once_and_skips_misses() {
        let reg = Registry::new();
        let mut table = JobTable::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        table.register(
            "j1".into(),
            pending(Continuation::local(move |out| {
                sink.lock().unwrap().push(out["embedding"].clone());
            })),
        );

        let stats = route(
            &mut table,
            &reg,
            &ConnectionId::from("w"),
            WorkerResult {
                category: "embedding".into(),
                output: vec![
                    json!({"id": "j1", "embedding": [1.0]}),
                    json!({"id": "j1", "embedding": [2.0]}),
                    json!({"embedding": [3.0]}),
                    json!({"id": "zzz"}),
                ],
            },
        );

        assert_eq!(
            stats,
            RouteStats {
                resolved: 1,
                missing_id: 1,
                unknown: 2,
                mismatched: 0,
            }
        );
        assert_eq!(*seen.lock().unwrap(), vec![json!([1.0])]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_remote_result_drops_worker_header_keys() {
        let mut reg = Registry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tenant = ConnectionId::from("tenant");
        reg.insert(tenant.clone(), tx);
        reg.authenticate_tenant(&tenant, "t".into());

        let mut table = JobTable::new();
        table.register(
            "job".into(),
            pending(Continuation::Remote {
                connection: tenant,
                request_id: "req-7".into(),
                result_type: "summarize_result".into(),
            }),
        );

        route(
            &mut table,
            &reg,
            &ConnectionId::from("w"),
            WorkerResult {
                category: "summarize".into(),
                output: vec![json!({"id": "job", "type": "answer", "summary": "two cats"})],
            },
        );

        let Outbound::Text(text) = rx.try_recv().unwrap() else {
            panic!("expected text");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"type": "summarize_result", "id": "req-7", "summary": "two cats"})
        );
    }

    #[test]
    fn test_mismatched_result_still_resolves() {
        let reg = Registry::new();
        let mut table = JobTable::new();
        let hits = Arc::new(Mutex::new(0));
        for id in ["j1", "j2"] {
            let hits = Arc::clone(&hits);
            table.register(
                id.into(),
                pending(Continuation::local(move |_| *hits.lock().unwrap() += 1)),
            );
        }

        let stats = route(
            &mut table,
            &reg,
            &ConnectionId::from("w"),
            WorkerResult {
                category: "qa_vlm".into(),
                output: vec![json!({"id": "j1"})],
            },
        );
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.mismatched, 1);

        let stats = route(
            &mut table,
            &reg,
            &ConnectionId::from("intruder"),
            WorkerResult {
                category: "embedding".into(),
                output: vec![json!({"id": "j2"})],
            },
        );
        assert_eq!(stats.mismatched, 1);
        assert_eq!(*hits.lock().unwrap(), 2);
        assert!(table.is_empty());
    }
}
