//! Temporal island clustering of vector search hits.
//!
//! A similarity search returns individual frames. Neighbouring frames of the
//! same media stream usually show the same scene, so presenting them one by
//! one buries the signal. This crate groups them into *islands*: maximal runs
//! of hits from one `media_id` whose consecutive capture times are at most a
//! fixed gap apart. Islands are ranked by mean distance.
//!
//! # Usage
//!
//! ```
//! use chrono::{TimeZone, Utc};
//! use zapdos_islands::{cluster, SearchHit, DEFAULT_GAP};
//!
//! let hit = |id: &str, secs: i64, distance: f32| SearchHit {
//!     id: id.into(),
//!     media_id: "cam-1".into(),
//!     at_time: Utc.timestamp_opt(secs, 0).unwrap(),
//!     description: None,
//!     path: String::new(),
//!     distance,
//! };
//!
//! let islands = cluster(vec![hit("a", 0, 0.4), hit("b", 60, 0.2), hit("c", 4000, 0.1)], DEFAULT_GAP);
//! assert_eq!(islands.len(), 2);
//! assert_eq!(islands[0].hits()[0].id, "c");
//! ```

mod island;

pub use island::{cluster, Island, MaskedHit, SearchHit, DEFAULT_GAP};
