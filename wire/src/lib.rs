//! Wire protocol for the zapdos gateway.
//!
//! Every connection carries either plain JSON text messages or framed binary
//! messages (length-prefixed JSON header followed by an opaque payload). This
//! crate turns raw bytes into typed [`Inbound`] messages and serializes the
//! outbound shapes.
//!
//! ## Example
//!
//! ```
//! use zapdos_wire::{decode_binary, encode_framed, Inbound};
//!
//! let header = serde_json::json!({
//!     "type": "index",
//!     "id": "mu-1",
//!     "row": { "media_id": "cam-1", "at_time": 1700000000000i64 },
//! });
//! let data = encode_framed(&header, b"\xff\xd8jpeg").unwrap();
//!
//! let frame = decode_binary(&data).unwrap();
//! match Inbound::from_frame(frame).unwrap() {
//!     Inbound::Index(req) => assert_eq!(req.image.as_deref(), Some(&b"\xff\xd8jpeg"[..])),
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

mod error;
mod frame;
mod message;

pub use error::{DecodeError, EncodeError, Result};
pub use frame::{decode_binary, decode_text, encode, encode_framed, Frame, LENGTH_PREFIX};
pub use message::{
    Authenticated, DispatchBatch, ForwardedResult, Inbound, IndexRequest, IndexRow,
    SummarizeRequest, TenantHello, WorkerConfigSpec, WorkerHello, WorkerResult, RESULT_SUFFIX,
    TYPE_I_AM_TENANT, TYPE_I_AM_WORKER, TYPE_INDEX, TYPE_SUMMARIZE,
};
