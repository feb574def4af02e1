//! Media unit storage.
//!
//! [`MediaStore`] is the seam to whatever vector database backs the
//! gateway. [`MemoryStore`] keeps everything in process and is used by the
//! binary when no external store is wired in, and by the tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use zapdos_islands::SearchHit;

use crate::error::Result;
use crate::types::{MaskedMediaUnit, MediaUnit, MediaUnitUpdate};

/// One page of a tenant's media units, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
    pub items: Vec<MaskedMediaUnit>,
    pub total: usize,
}

/// Persists media units and answers similarity queries.
///
/// Implementations must be safe for concurrent use.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Insert new rows.
    async fn add(&self, units: Vec<MediaUnit>) -> Result<()>;

    /// Apply partial updates. Ids with no row are ignored.
    async fn update(&self, updates: Vec<MediaUnitUpdate>) -> Result<()>;

    /// Nearest described rows of `tenant_id` to `embedding`, closest
    /// first, at most `limit`.
    async fn search(&self, tenant_id: &str, embedding: &[f32], limit: usize)
    -> Result<Vec<SearchHit>>;

    /// Page `page` (1-based) of `limit` rows.
    async fn page(&self, tenant_id: &str, page: usize, limit: usize) -> Result<Page>;

    /// A single row, scoped to its tenant.
    async fn get(&self, tenant_id: &str, id: &str) -> Result<Option<MediaUnit>>;
}

/// In-memory [`MediaStore`] with brute-force search.
/// Data is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    rows: Vec<MediaUnit>,
    index: HashMap<String, usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MediaStore for MemoryStore {
    async fn add(&self, units: Vec<MediaUnit>) -> Result<()> {
        let mut inner = self.inner.write();
        for unit in units {
            match inner.index.get(&unit.id).copied() {
                Some(pos) => inner.rows[pos] = unit,
                None => {
                    let pos = inner.rows.len();
                    inner.index.insert(unit.id.clone(), pos);
                    inner.rows.push(unit);
                }
            }
        }
        Ok(())
    }

    async fn update(&self, updates: Vec<MediaUnitUpdate>) -> Result<()> {
        let mut inner = self.inner.write();
        for update in updates {
            if let Some(pos) = inner.index.get(&update.id).copied() {
                update.apply(&mut inner.rows[pos]);
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        tenant_id: &str,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let inner = self.inner.read();
        let mut hits: Vec<SearchHit> = inner
            .rows
            .iter()
            .filter(|row| row.tenant_id == tenant_id && row.description.is_some())
            .filter_map(|row| {
                let stored = row.embedding.as_deref()?;
                if stored.len() != embedding.len() {
                    return None;
                }
                Some(SearchHit {
                    id: row.id.clone(),
                    media_id: row.media_id.clone(),
                    at_time: row.at_time,
                    description: row.description.clone(),
                    path: row.path.clone(),
                    distance: squared_l2(stored, embedding),
                })
            })
            .collect();

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn page(&self, tenant_id: &str, page: usize, limit: usize) -> Result<Page> {
        let inner = self.inner.read();
        let mut rows: Vec<&MediaUnit> = inner
            .rows
            .iter()
            .filter(|row| row.tenant_id == tenant_id)
            .collect();
        rows.sort_by(|a, b| b.at_time.cmp(&a.at_time));

        let total = rows.len();
        let offset = page.saturating_sub(1).saturating_mul(limit);
        let items = rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(MaskedMediaUnit::from)
            .collect();
        Ok(Page { items, total })
    }

    async fn get(&self, tenant_id: &str, id: &str) -> Result<Option<MediaUnit>> {
        let inner = self.inner.read();
        Ok(inner
            .index
            .get(id)
            .map(|&pos| &inner.rows[pos])
            .filter(|row| row.tenant_id == tenant_id)
            .cloned())
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn unit(id: &str, tenant: &str, ms: i64, embedding: Option<Vec<f32>>) -> MediaUnit {
        MediaUnit {
            id: id.into(),
            tenant_id: tenant.into(),
            media_id: "cam".into(),
            at_time: Utc.timestamp_millis_opt(ms).unwrap(),
            path: format!("/files/{}.jpg", id),
            description: embedding.as_ref().map(|_| format!("frame {}", id)),
            embedding,
        }
    }

    #[tokio::test]
    async fn test_search_ranks_by_distance_within_tenant() {
        let store = MemoryStore::new();
        store
            .add(vec![
                unit("far", "t", 0, Some(vec![3.0, 0.0])),
                unit("near", "t", 1, Some(vec![1.0, 0.0])),
                unit("other", "u", 2, Some(vec![1.0, 0.0])),
                unit("pending", "t", 3, None),
            ])
            .await
            .unwrap();

        let hits = store.search("t", &[0.0, 0.0], 10).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "far"]);
        assert_eq!(hits[0].distance, 1.0);
        assert_eq!(hits[1].distance, 9.0);

        assert_eq!(store.search("t", &[0.0, 0.0], 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_undescribed_rows_are_not_searchable() {
        let store = MemoryStore::new();
        let mut row = unit("a", "t", 0, Some(vec![0.0]));
        row.description = None;
        store.add(vec![row]).await.unwrap();
        assert!(store.search("t", &[0.0], 10).await.unwrap().is_empty());

        store
            .update(vec![MediaUnitUpdate {
                id: "a".into(),
                description: Some("a dog".into()),
                embedding: None,
            }])
            .await
            .unwrap();
        assert_eq!(store.search("t", &[0.0], 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_ignores_unknown_ids() {
        let store = MemoryStore::new();
        store
            .update(vec![MediaUnitUpdate {
                id: "ghost".into(),
                description: Some("x".into()),
                embedding: None,
            }])
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_page_is_newest_first() {
        let store = MemoryStore::new();
        let rows = (0..5).map(|i| unit(&format!("m{}", i), "t", i, None)).collect();
        store.add(rows).await.unwrap();

        let first = store.page("t", 1, 2).await.unwrap();
        assert_eq!(first.total, 5);
        let ids: Vec<&str> = first.items.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m4", "m3"]);

        let last = store.page("t", 3, 2).await.unwrap();
        assert_eq!(last.items.len(), 1);
        assert!(store.page("t", 4, 2).await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn test_get_is_tenant_scoped() {
        let store = MemoryStore::new();
        store.add(vec![unit("a", "t", 0, None)]).await.unwrap();
        assert!(store.get("t", "a").await.unwrap().is_some());
        assert!(store.get("u", "a").await.unwrap().is_none());
    }
}
