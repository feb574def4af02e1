//! The gateway event loop.
//!
//! One task owns the [`Registry`], every worker's batch and the
//! [`JobTable`]. Socket tasks, flush timers, REST handlers and the index
//! pipeline talk to it through a [`GatewayHandle`], which posts [`Event`]s
//! onto a single channel processed strictly in order.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use zapdos_wire::{
    Authenticated, DispatchBatch, IndexRequest, Inbound, SummarizeRequest, TenantHello,
    WorkerHello,
};

use crate::auth::{Authenticator, worker_secret_matches};
use crate::batch::{BatchPolicy, FlushTimer, Pushed};
use crate::blob::BlobStore;
use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::jobs::{Continuation, JobTable, PendingJob};
use crate::registry::{CLOSE_POLICY_VIOLATION, Outbound, Registry, WorkerState};
use crate::router::{self, FirstMatch, WorkerSelector};
use crate::types::{ConnectionId, JobOutput, MediaUnit, MediaUnitUpdate, new_job_id};
use crate::write_queue::WriteQueue;

/// Close code sent when the gateway itself fails.
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Input to the event loop.
#[derive(Debug)]
pub enum Event {
    /// A socket was accepted. `outbound` feeds its writer task.
    Open {
        id: ConnectionId,
        outbound: mpsc::UnboundedSender<Outbound>,
    },
    /// A decoded message arrived on a socket.
    Message { id: ConnectionId, message: Inbound },
    /// A socket closed.
    Close { id: ConnectionId },
    /// A worker's flush timer fired.
    FlushDue { id: ConnectionId, epoch: u64 },
    /// Send a job to a worker of `category`.
    Dispatch {
        category: String,
        payload: Map<String, Value>,
        continuation: Option<Continuation>,
    },
    /// Best-effort text message to every tenant.
    Broadcast { text: String },
    /// Report counters.
    Stats(oneshot::Sender<GatewayStats>),
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    pub connections: usize,
    pub workers: usize,
    pub pending_jobs: usize,
}

/// Cloneable entry point into a running [`Gateway`].
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl GatewayHandle {
    fn post(&self, event: Event) -> Result<()> {
        self.tx.send(event).map_err(|_| Error::ShuttingDown)
    }

    pub fn open(&self, id: ConnectionId, outbound: mpsc::UnboundedSender<Outbound>) -> Result<()> {
        self.post(Event::Open { id, outbound })
    }

    pub fn message(&self, id: ConnectionId, message: Inbound) -> Result<()> {
        self.post(Event::Message { id, message })
    }

    pub fn close(&self, id: ConnectionId) -> Result<()> {
        self.post(Event::Close { id })
    }

    /// Queue a job. A job with no matching worker is dropped along with
    /// its continuation.
    pub fn dispatch(
        &self,
        category: impl Into<String>,
        payload: Map<String, Value>,
        continuation: Option<Continuation>,
    ) -> Result<()> {
        self.post(Event::Dispatch {
            category: category.into(),
            payload,
            continuation,
        })
    }

    /// Queue a job and wait for its output.
    pub async fn request(
        &self,
        category: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Result<JobOutput> {
        let category = category.into();
        let (continuation, reply) = Continuation::reply(&category);
        self.dispatch(category, payload, Some(continuation))?;
        reply.wait().await
    }

    pub fn broadcast(&self, text: impl Into<String>) -> Result<()> {
        self.post(Event::Broadcast { text: text.into() })
    }

    pub async fn stats(&self) -> Result<GatewayStats> {
        let (tx, rx) = oneshot::channel();
        self.post(Event::Stats(tx))?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }
}

/// Collaborators the gateway hands work to.
#[derive(Clone)]
pub struct Services {
    pub auth: Arc<dyn Authenticator>,
    pub blobs: Arc<dyn BlobStore>,
    pub writes: WriteQueue,
}

/// The event loop. Build with [`Gateway::new`], take a handle, then
/// [`Gateway::run`] it on its own task.
pub struct Gateway {
    core: Core,
    rx: mpsc::UnboundedReceiver<Event>,
    cancel: CancellationToken,
}

struct Core {
    config: Arc<GatewayConfig>,
    registry: Registry,
    jobs: JobTable,
    selector: Box<dyn WorkerSelector>,
    services: Services,
    handle: GatewayHandle,
}

impl Gateway {
    pub fn new(config: Arc<GatewayConfig>, services: Services, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            core: Core {
                config,
                registry: Registry::new(),
                jobs: JobTable::new(),
                selector: Box::new(FirstMatch),
                services,
                handle: GatewayHandle { tx },
            },
            rx,
            cancel,
        }
    }

    /// Replace the default [`FirstMatch`] worker selection.
    pub fn with_selector<S: WorkerSelector + 'static>(mut self, selector: S) -> Self {
        self.core.selector = Box::new(selector);
        self
    }

    pub fn handle(&self) -> GatewayHandle {
        self.core.handle.clone()
    }

    /// Process events until `cancel` fires.
    pub async fn run(self) {
        let Gateway {
            mut core,
            mut rx,
            cancel,
        } = self;

        let mut sweep = tokio::time::interval(core.config.jobs.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("gateway event loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sweep.tick() => core.expire_jobs(),
                event = rx.recv() => match event {
                    Some(event) => core.handle_event(event),
                    None => break,
                },
            }
        }

        info!(
            connections = core.registry.len(),
            pending_jobs = core.jobs.len(),
            "gateway event loop stopped"
        );
    }
}

impl Core {
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Open { id, outbound } => {
                debug!(connection = %id, "connection opened");
                self.registry.insert(id, outbound);
            }
            Event::Message { id, message } => self.on_message(&id, message),
            Event::Close { id } => self.on_close(&id),
            Event::FlushDue { id, epoch } => {
                let current = self
                    .registry
                    .get_mut(&id)
                    .and_then(|conn| conn.worker_mut())
                    .is_some_and(|worker| worker.batch.expire(epoch));
                if current {
                    self.flush(&id);
                } else {
                    trace!(connection = %id, epoch, "stale flush timer ignored");
                }
            }
            Event::Dispatch {
                category,
                payload,
                continuation,
            } => self.dispatch(category, payload, continuation),
            Event::Broadcast { text } => {
                let sent = self.registry.broadcast_to_tenants(&text);
                debug!(tenants = sent, "broadcast");
            }
            Event::Stats(reply) => {
                let _ = reply.send(GatewayStats {
                    connections: self.registry.len(),
                    workers: self.registry.worker_count(),
                    pending_jobs: self.jobs.len(),
                });
            }
        }
    }

    fn on_close(&mut self, id: &ConnectionId) {
        let Some(conn) = self.registry.remove(id) else {
            return;
        };
        let dropped = self.jobs.drop_for_connection(id);
        let unsent = conn.worker().map_or(0, |w| w.batch.len());
        info!(
            connection = %id,
            role = conn.role.name(),
            dropped_jobs = dropped,
            unsent,
            "connection closed"
        );
    }

    fn violation(&mut self, id: &ConnectionId, reason: &str) {
        warn!(connection = %id, reason, "protocol violation, closing");
        self.registry.close(id, CLOSE_POLICY_VIOLATION, reason);
    }

    fn on_message(&mut self, id: &ConnectionId, message: Inbound) {
        let Some(conn) = self.registry.get(id) else {
            debug!(connection = %id, "message for unknown connection dropped");
            return;
        };
        if conn.is_closing() {
            return;
        }
        let authenticated = conn.role.is_authenticated();
        let tenant_id = conn.tenant_id().map(str::to_string);
        let is_worker = conn.worker().is_some();

        match message {
            message if authenticated && message.is_handshake() => {
                self.violation(id, "Already authenticated");
            }
            Inbound::IAmWorker(hello) => self.worker_hello(id, hello),
            Inbound::IAmTenant(hello) => self.tenant_hello(id, hello),
            Inbound::MalformedHandshake { kind, reason } => {
                if kind == zapdos_wire::TYPE_I_AM_TENANT {
                    debug!(connection = %id, reason = %reason, "malformed tenant handshake");
                    self.violation(id, "Invalid i_am_tenant message");
                } else {
                    warn!(connection = %id, reason = %reason, "malformed worker handshake ignored");
                }
            }
            message if !authenticated => {
                debug!(connection = %id, kind = message.kind(), "message before handshake");
                self.violation(id, "Unauthenticated");
            }
            Inbound::WorkerResult(result) if is_worker => {
                let category = result.category.clone();
                let stats = router::route(&mut self.jobs, &self.registry, id, result);
                debug!(
                    connection = %id,
                    category = %category,
                    resolved = stats.resolved,
                    missing_id = stats.missing_id,
                    unknown = stats.unknown,
                    mismatched = stats.mismatched,
                    "worker result routed"
                );
            }
            message if is_worker => {
                warn!(connection = %id, kind = message.kind(), "non-result message from worker dropped");
            }
            Inbound::Index(req) => match tenant_id {
                Some(tenant_id) => self.index(tenant_id, req),
                None => debug!(connection = %id, "index from non-tenant dropped"),
            },
            Inbound::Summarize(req) => self.summarize(id, req),
            Inbound::WorkerResult(result) => {
                warn!(connection = %id, category = %result.category, "result message from tenant dropped");
            }
        }
    }

    fn worker_hello(&mut self, id: &ConnectionId, hello: WorkerHello) {
        let spec = hello.worker_config;
        let categories = spec.categories();
        if categories.is_empty() || spec.max_batch_size == Some(0) || spec.max_latency_ms == Some(0) {
            warn!(connection = %id, "malformed worker_config ignored");
            return;
        }
        if !worker_secret_matches(&self.config.worker_secret, &hello.secret) {
            warn!(connection = %id, "invalid worker secret");
            self.registry.close(id, CLOSE_POLICY_VIOLATION, "Invalid WORKER_SECRET");
            return;
        }

        let defaults = &self.config.workers;
        let policy = BatchPolicy::new(
            spec.max_batch_size.unwrap_or(defaults.max_batch_size),
            Duration::from_millis(spec.max_latency_ms.unwrap_or(defaults.max_latency_ms)),
        );
        info!(
            connection = %id,
            categories = ?categories,
            max_batch_size = policy.max_batch_size,
            max_latency_ms = policy.max_latency.as_millis() as u64,
            "worker registered"
        );
        self.registry
            .register_worker(id, WorkerState::new(categories, policy));
    }

    fn tenant_hello(&mut self, id: &ConnectionId, hello: TenantHello) {
        if hello.create_new {
            let tenant_id = uuid::Uuid::new_v4().to_string();
            let token = match self.services.auth.issue(&tenant_id) {
                Ok(token) => token,
                Err(e) => {
                    warn!(connection = %id, "failed to issue tenant token: {}", e);
                    self.registry.close(id, CLOSE_INTERNAL_ERROR, "Token issue failed");
                    return;
                }
            };
            info!(connection = %id, tenant = %tenant_id, "tenant created");
            self.bind_tenant(id, tenant_id, Some(token));
            return;
        }

        match hello.auth_token {
            Some(token) => match self.services.auth.verify(&token) {
                Some(tenant_id) => {
                    info!(connection = %id, tenant = %tenant_id, "tenant authenticated");
                    self.bind_tenant(id, tenant_id, None);
                }
                None => self.violation(id, "Invalid token"),
            },
            None => self.violation(id, "Invalid i_am_tenant message"),
        }
    }

    fn bind_tenant(&mut self, id: &ConnectionId, tenant_id: String, auth_token: Option<String>) {
        let reply = Authenticated {
            tenant_id: tenant_id.clone(),
            auth_token,
        };
        self.registry.authenticate_tenant(id, tenant_id);
        match zapdos_wire::encode(&reply) {
            Ok(text) => {
                self.registry.send(id, text);
            }
            Err(e) => warn!(connection = %id, "failed to encode authenticated reply: {}", e),
        }
    }

    /// Store the frame, queue its row, then fan out one enrichment job per
    /// index category. Blob IO runs off the loop; jobs re-enter as
    /// [`Event::Dispatch`].
    fn index(&mut self, tenant_id: String, req: IndexRequest) {
        let IndexRequest {
            id: unit_id,
            row,
            image,
        } = req;
        let Some(image) = image else {
            warn!(tenant = %tenant_id, media_unit = %unit_id, "index request without image dropped");
            return;
        };
        let services = self.services.clone();
        let handle = self.handle.clone();
        let categories = self.config.categories.index.clone();

        tokio::spawn(async move {
            let path = match services.blobs.put(&unit_id, image).await {
                Ok(path) => path,
                Err(e) => {
                    warn!(tenant = %tenant_id, media_unit = %unit_id, "failed to store frame: {}", e);
                    return;
                }
            };

            services.writes.add(MediaUnit {
                id: unit_id.clone(),
                tenant_id,
                media_id: row.media_id,
                at_time: row.at_time,
                path: path.clone(),
                description: None,
                embedding: None,
            });

            for category in categories {
                let mut payload = Map::new();
                payload.insert("media_unit_id".into(), Value::String(unit_id.clone()));
                payload.insert("path".into(), Value::String(path.clone()));

                let writes = services.writes.clone();
                let target = unit_id.clone();
                let continuation = Continuation::local(move |output| {
                    match MediaUnitUpdate::from_output(&target, &output) {
                        Some(update) => writes.update(update),
                        None => warn!(media_unit = %target, "enrichment result carried no fields"),
                    }
                });
                if handle.dispatch(category, payload, Some(continuation)).is_err() {
                    debug!("gateway stopped before index jobs were dispatched");
                    return;
                }
            }
        });
    }

    fn summarize(&mut self, id: &ConnectionId, req: SummarizeRequest) {
        let mut payload = Map::new();
        payload.insert("passages".into(), json!(req.passages));
        payload.insert("query".into(), Value::String(req.query));

        let continuation = Continuation::Remote {
            connection: id.clone(),
            request_id: req.id,
            result_type: format!("{}{}", zapdos_wire::TYPE_SUMMARIZE, zapdos_wire::RESULT_SUFFIX),
        };
        let category = self.config.categories.summarize.clone();
        self.dispatch(category, payload, Some(continuation));
    }

    fn dispatch(
        &mut self,
        category: String,
        mut payload: Map<String, Value>,
        continuation: Option<Continuation>,
    ) {
        let job_id = new_job_id();
        payload.insert("id".into(), Value::String(job_id.clone()));

        let Some(worker) = self.selector.select(&self.registry, &category) else {
            warn!(category = %category, job = %job_id, "no worker for category, job dropped");
            return;
        };

        if let Some(continuation) = continuation {
            self.jobs.register(
                job_id.clone(),
                PendingJob {
                    category: category.clone(),
                    worker: worker.clone(),
                    deadline: Instant::now() + self.config.jobs.timeout(),
                    continuation,
                },
            );
        }

        let Some(state) = self
            .registry
            .get_mut(&worker)
            .and_then(|conn| conn.worker_mut())
        else {
            self.jobs.take(&job_id);
            return;
        };

        let events = self.handle.tx.clone();
        let timer_worker = worker.clone();
        let pushed = state.batch.push(Value::Object(payload), move |epoch, after| {
            FlushTimer::spawn(after, move || {
                let _ = events.send(Event::FlushDue {
                    id: timer_worker,
                    epoch,
                });
            })
        });
        trace!(category = %category, job = %job_id, worker = %worker, "job queued");

        if pushed == Pushed::FlushNow {
            self.flush(&worker);
        }
    }

    /// Send everything gathered for `id` as one batch. A flush to a closing
    /// or unwritable connection is a no-op; its batch goes with it.
    fn flush(&mut self, id: &ConnectionId) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        if !conn.is_open() {
            trace!(connection = %id, "flush to closed connection skipped");
            return;
        }
        let Some(worker) = conn.worker_mut() else {
            return;
        };
        let inputs = worker.batch.take();
        if inputs.is_empty() {
            return;
        }

        let size = inputs.len();
        match zapdos_wire::encode(&DispatchBatch { inputs }) {
            Ok(text) => {
                if self.registry.send(id, text) {
                    debug!(connection = %id, size, "batch sent");
                }
            }
            Err(e) => warn!(connection = %id, "failed to encode batch: {}", e),
        }
    }

    fn expire_jobs(&mut self) {
        for (job_id, job) in self.jobs.expire(Instant::now()) {
            warn!(
                job = %job_id,
                category = %job.category,
                worker = %job.worker,
                "job timed out, continuation dropped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::HmacAuthenticator;
    use crate::blob::FsBlobStore;
    use crate::store::MemoryStore;

    fn gateway(cancel: &CancellationToken) -> Gateway {
        let config = GatewayConfig {
            worker_secret: "w".into(),
            ..GatewayConfig::default()
        };
        let store = Arc::new(MemoryStore::new());
        let (writes, _) = WriteQueue::spawn(store, config.write_queue.policy(), cancel.clone());
        let services = Services {
            auth: Arc::new(HmacAuthenticator::new("t")),
            blobs: Arc::new(FsBlobStore::new("unused")),
            writes,
        };
        Gateway::new(Arc::new(config), services, cancel.clone())
    }

    fn gathered(core: &Core, id: &ConnectionId) -> usize {
        core.registry
            .get(id)
            .and_then(|conn| conn.worker())
            .map_or(0, |w| w.batch.len())
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_to_dead_writer_leaves_batch_alone() {
        let cancel = CancellationToken::new();
        let mut gateway = gateway(&cancel);
        let id = ConnectionId::from("worker");
        let (tx, rx) = mpsc::unbounded_channel();

        let core = &mut gateway.core;
        core.handle_event(Event::Open {
            id: id.clone(),
            outbound: tx,
        });
        let hello = zapdos_wire::decode_text(
            r#"{"type":"i_am_worker","secret":"w","worker_config":{"subscribed_event_types":["embedding"],"max_batch_size":10,"max_latency_ms":60000}}"#,
        )
        .and_then(Inbound::from_frame)
        .unwrap();
        core.handle_event(Event::Message {
            id: id.clone(),
            message: hello,
        });
        core.handle_event(Event::Dispatch {
            category: "embedding".into(),
            payload: Map::new(),
            continuation: None,
        });
        assert_eq!(gathered(core, &id), 1);

        drop(rx);
        core.flush(&id);
        assert_eq!(gathered(core, &id), 1);
        cancel.cancel();
    }
}
