//! Typed protocol messages.
//!
//! Inbound headers form a closed union keyed by the `type` field. Any
//! `type` outside the protocol is rejected as a decode error.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DecodeError, Result};
use crate::frame::Frame;

/// Suffix of worker result message types (`embedding_result`, ...).
pub const RESULT_SUFFIX: &str = "_result";

pub const TYPE_I_AM_WORKER: &str = "i_am_worker";
pub const TYPE_I_AM_TENANT: &str = "i_am_tenant";
pub const TYPE_INDEX: &str = "index";
pub const TYPE_SUMMARIZE: &str = "summarize";

/// A message received from a tenant or worker connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Worker registration handshake.
    IAmWorker(WorkerHello),
    /// Tenant authentication handshake.
    IAmTenant(TenantHello),
    /// Tenant submits a media frame for indexing.
    Index(IndexRequest),
    /// Tenant asks for a summary answered over the same connection.
    Summarize(SummarizeRequest),
    /// Worker returns a batch of outputs for one category.
    WorkerResult(WorkerResult),
    /// A handshake `type` whose fields do not match the expected shape.
    /// Kept apart from decode errors so handshake rules still apply.
    MalformedHandshake { kind: String, reason: String },
}

impl Inbound {
    /// Decode a frame into a typed message.
    pub fn from_frame(frame: Frame) -> Result<Self> {
        let kind = frame
            .message_type()
            .ok_or(DecodeError::MissingType)?
            .to_string();
        let Frame { header, payload } = frame;
        let value = Value::Object(header);

        match kind.as_str() {
            TYPE_I_AM_WORKER => Ok(handshake(&kind, value, Inbound::IAmWorker)),
            TYPE_I_AM_TENANT => Ok(handshake(&kind, value, Inbound::IAmTenant)),
            TYPE_INDEX => {
                let mut req: IndexRequest = serde_json::from_value(value)?;
                req.image = payload;
                Ok(Inbound::Index(req))
            }
            TYPE_SUMMARIZE => Ok(Inbound::Summarize(serde_json::from_value(value)?)),
            other => match other.strip_suffix(RESULT_SUFFIX) {
                Some(category) if !category.is_empty() => {
                    let body: ResultBody = serde_json::from_value(value)?;
                    Ok(Inbound::WorkerResult(WorkerResult {
                        category: category.to_string(),
                        output: body.output,
                    }))
                }
                _ => Err(DecodeError::UnknownType(other.to_string())),
            },
        }
    }

    /// Returns true for handshake messages, well-formed or not.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Inbound::IAmWorker(_) | Inbound::IAmTenant(_) | Inbound::MalformedHandshake { .. }
        )
    }

    /// Short name for logging.
    pub fn kind(&self) -> &str {
        match self {
            Inbound::IAmWorker(_) => TYPE_I_AM_WORKER,
            Inbound::IAmTenant(_) => TYPE_I_AM_TENANT,
            Inbound::Index(_) => TYPE_INDEX,
            Inbound::Summarize(_) => TYPE_SUMMARIZE,
            Inbound::WorkerResult(_) => "worker_result",
            Inbound::MalformedHandshake { kind, .. } => kind,
        }
    }
}

fn handshake<T, F>(kind: &str, value: Value, wrap: F) -> Inbound
where
    T: serde::de::DeserializeOwned,
    F: FnOnce(T) -> Inbound,
{
    match serde_json::from_value(value) {
        Ok(hello) => wrap(hello),
        Err(e) => Inbound::MalformedHandshake {
            kind: kind.to_string(),
            reason: e.to_string(),
        },
    }
}

/// `i_am_worker` header.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorkerHello {
    pub worker_config: WorkerConfigSpec,
    /// Shared secret; a missing secret never matches.
    #[serde(default)]
    pub secret: String,
}

/// Worker configuration as announced by the worker.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WorkerConfigSpec {
    #[serde(default)]
    pub subscribed_event_types: Vec<String>,
    #[serde(default)]
    pub worker_type: Option<String>,
    #[serde(default)]
    pub max_batch_size: Option<usize>,
    #[serde(default)]
    pub max_latency_ms: Option<u64>,
}

impl WorkerConfigSpec {
    /// Job categories this worker accepts: `subscribed_event_types` plus
    /// `worker_type`, deduplicated, in announcement order.
    pub fn categories(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let announced = self
            .subscribed_event_types
            .iter()
            .chain(self.worker_type.iter());
        for category in announced {
            let category = category.trim();
            if !category.is_empty() && !out.iter().any(|c| c == category) {
                out.push(category.to_string());
            }
        }
        out
    }
}

/// `i_am_tenant` header.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TenantHello {
    #[serde(default)]
    pub create_new: bool,
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// `index` header plus the image carried in the frame payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IndexRequest {
    pub id: String,
    pub row: IndexRow,
    #[serde(skip)]
    pub image: Option<Bytes>,
}

/// Row metadata of an `index` request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IndexRow {
    pub media_id: String,
    /// Capture time as Unix milliseconds.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub at_time: DateTime<Utc>,
}

/// `summarize` header.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SummarizeRequest {
    pub id: String,
    pub passages: Vec<String>,
    pub query: String,
}

/// `<category>_result` message.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResult {
    pub category: String,
    /// Output entries, each expected to carry the job `id`.
    pub output: Vec<Value>,
}

#[derive(Deserialize)]
struct ResultBody {
    output: Vec<Value>,
}

/// `authenticated` reply sent to a tenant after the handshake.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename = "authenticated")]
pub struct Authenticated {
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

/// Batch of jobs sent to a worker in one message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchBatch {
    pub inputs: Vec<Value>,
}

/// Worker output forwarded to the tenant that asked for it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForwardedResult {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}
