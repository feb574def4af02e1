//! Island grouping: time-window clustering of hits per media unit.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Gap above which two hits of the same media stream fall into different islands.
pub const DEFAULT_GAP: Duration = Duration::from_secs(5 * 60);

/// One row returned by a similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub media_id: String,
    pub at_time: DateTime<Utc>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub path: String,
    /// Distance from the query embedding. Lower is more relevant.
    #[serde(rename = "_distance")]
    pub distance: f32,
}

/// A temporally contiguous run of hits from one media stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Island {
    hits: Vec<SearchHit>,
}

/// Presentation view of a hit inside an island.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaskedHit {
    pub id: String,
    pub description: Option<String>,
    pub at_time: DateTime<Utc>,
    pub media_id: String,
    #[serde(rename = "_distance", skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
}

impl Island {
    /// Members ordered by `at_time`.
    pub fn hits(&self) -> &[SearchHit] {
        &self.hits
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Media stream shared by every member.
    pub fn media_id(&self) -> &str {
        self.hits.first().map(|h| h.media_id.as_str()).unwrap_or_default()
    }

    /// Arithmetic mean of member distances.
    pub fn mean_distance(&self) -> f64 {
        if self.hits.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.hits.iter().map(|h| h.distance as f64).sum();
        sum / self.hits.len() as f64
    }

    /// Members reduced to `id`, `description`, `at_time` and `media_id`.
    pub fn masked(&self) -> Vec<MaskedHit> {
        self.hits.iter().map(|h| mask(h, false)).collect()
    }

    /// Like [`Island::masked`], keeping `_distance` for debugging.
    pub fn masked_with_distance(&self) -> Vec<MaskedHit> {
        self.hits.iter().map(|h| mask(h, true)).collect()
    }

    pub fn into_hits(self) -> Vec<SearchHit> {
        self.hits
    }
}

fn mask(hit: &SearchHit, with_distance: bool) -> MaskedHit {
    MaskedHit {
        id: hit.id.clone(),
        description: hit.description.clone(),
        at_time: hit.at_time,
        media_id: hit.media_id.clone(),
        distance: with_distance.then_some(hit.distance),
    }
}

/// Groups search hits into islands, best matches first.
///
/// 1. Partition by `media_id` (partitions keep first-encounter order).
/// 2. Sort each partition by `at_time`.
/// 3. Start a new island when the gap to the previous hit exceeds `gap`;
///    a gap exactly equal to `gap` stays in the same island.
/// 4. Sort all islands by mean distance, ascending. The sort is stable, so
///    ties keep encounter order.
pub fn cluster(hits: Vec<SearchHit>, gap: Duration) -> Vec<Island> {
    let gap = TimeDelta::from_std(gap).unwrap_or(TimeDelta::MAX);

    let mut partitions: Vec<Vec<SearchHit>> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for hit in hits {
        match index.get(&hit.media_id) {
            Some(&i) => partitions[i].push(hit),
            None => {
                index.insert(hit.media_id.clone(), partitions.len());
                partitions.push(vec![hit]);
            }
        }
    }

    let mut islands = Vec::new();
    for mut partition in partitions {
        partition.sort_by_key(|h| h.at_time);

        let mut current: Vec<SearchHit> = Vec::new();
        for hit in partition {
            let split = match current.last() {
                Some(last) => hit.at_time - last.at_time > gap,
                None => false,
            };
            if split {
                islands.push(Island {
                    hits: std::mem::take(&mut current),
                });
            }
            current.push(hit);
        }
        if !current.is_empty() {
            islands.push(Island { hits: current });
        }
    }

    islands.sort_by(|a, b| a.mean_distance().total_cmp(&b.mean_distance()));
    islands
}
