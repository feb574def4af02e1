//! Job-distribution gateway between capture tenants and inference workers.
//!
//! Tenants stream media frames over WebSocket; workers announce which job
//! categories they serve. The gateway batches jobs per worker, remembers
//! which caller each job belongs to, and routes the batched results back to
//! a tenant connection or an in-process continuation.
//!
//! ## Components
//!
//! - [`Gateway`]: single-task event loop owning the connection
//!   [`Registry`], per-worker [`Batcher`]s and the [`JobTable`]
//! - [`WriteQueue`]: batched persistence into a [`MediaStore`]
//! - [`server::serve`]: WebSocket listener
//! - [`rest::router`]: REST surface (search, pagination, storage)
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use zapdos_gateway::{
//!     FsBlobStore, Gateway, GatewayConfig, HmacAuthenticator, MemoryStore, Services, WriteQueue,
//! };
//!
//! #[tokio::main]
//! async fn main() -> zapdos_gateway::Result<()> {
//!     let config = Arc::new(GatewayConfig::load("gateway.yaml".as_ref())?);
//!     let cancel = CancellationToken::new();
//!
//!     let store = Arc::new(MemoryStore::new());
//!     let (writes, _) = WriteQueue::spawn(store, config.write_queue.policy(), cancel.clone());
//!     let services = Services {
//!         auth: Arc::new(HmacAuthenticator::new(&config.token_secret)),
//!         blobs: Arc::new(FsBlobStore::open(&config.files_dir).await?),
//!         writes,
//!     };
//!
//!     let gateway = Gateway::new(config.clone(), services, cancel.clone());
//!     let handle = gateway.handle();
//!     tokio::spawn(gateway.run());
//!
//!     let listener = tokio::net::TcpListener::bind(&config.ws_addr).await?;
//!     zapdos_gateway::server::serve(listener, handle, cancel).await
//! }
//! ```

mod auth;
mod batch;
mod blob;
mod config;
mod error;
mod gateway;
mod jobs;
mod registry;
pub mod rest;
mod router;
pub mod server;
mod store;
mod types;
mod write_queue;

pub use auth::{worker_secret_matches, Authenticator, HmacAuthenticator};
pub use batch::{BatchPolicy, Batcher, FlushTimer, Pushed};
pub use blob::{BlobStore, FsBlobStore};
pub use config::{
    expand_env, Categories, GatewayConfig, JobConfig, SearchConfig, WorkerDefaults,
    WriteQueueConfig,
};
pub use error::{Error, Result};
pub use gateway::{Event, Gateway, GatewayHandle, GatewayStats, Services};
pub use jobs::{Continuation, JobReply, JobTable, PendingJob};
pub use registry::{Connection, Outbound, Registry, Role, WorkerState, CLOSE_POLICY_VIOLATION};
pub use router::{route, FirstMatch, RoundRobin, RouteStats, WorkerSelector};
pub use store::{MediaStore, MemoryStore, Page};
pub use types::{
    new_job_id, ConnectionId, JobOutput, MaskedMediaUnit, MediaUnit, MediaUnitUpdate,
};
pub use write_queue::{coalesce, WriteOp, WriteQueue};
