//! Store capability contracts, in-memory implementations, DLQ, and HTTP fetch utilities.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use njff_core::model::{Property, Stage, TimelineEntry, TimelineKind};
use njff_core::address::dedupe_keys_match;

pub mod dlq;
pub mod http;

pub const CRATE_NAME: &str = "njff-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("property {0} not found")]
    NotFound(Uuid),
    #[error("dedupe key already present: {0}")]
    DuplicateKey(String),
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Lookup and persistence for canonical properties. The production backend
/// is an external database; this trait is the seam.
#[async_trait]
pub trait PropertyStore: Send + Sync {
    /// Exact dedupe-key lookup with the Levenshtein ≤ 1 street fallback.
    async fn find_by_dedupe_key(&self, key: &str) -> Result<Option<Property>, StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Property>, StoreError>;
    async fn insert(&self, property: Property) -> Result<(), StoreError>;
    async fn update(&self, property: Property) -> Result<(), StoreError>;
    /// Properties touched at or after the cutoff (alert candidate set).
    async fn updated_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Property>, StoreError>;
    /// Active sheriff-sale/auction events whose sale date has passed.
    async fn active_sales_due(&self, today: NaiveDate) -> Result<Vec<Property>, StoreError>;
    async fn count(&self) -> Result<usize, StoreError>;
}

/// Append-only per-property timeline.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append unless an entry with the same `(property, kind, day)` already
    /// exists. Returns whether the entry was written.
    async fn append(&self, entry: TimelineEntry) -> Result<bool, StoreError>;
    /// Timeline for one property, newest first.
    async fn history(&self, property_id: Uuid) -> Result<Vec<TimelineEntry>, StoreError>;
}

/// Per-dedupe-key mutual exclusion so two upserts never race on one property.
///
/// Same shape as a per-source semaphore map: lazily created entries, shared
/// through an `Arc` so guards outlive the registry lock.
#[derive(Default)]
pub struct KeyLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// In-memory property store used by tests and the CLI dry-run path.
#[derive(Default)]
pub struct MemoryPropertyStore {
    by_id: RwLock<HashMap<Uuid, Property>>,
    key_index: RwLock<HashMap<String, Uuid>>,
}

impl MemoryPropertyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PropertyStore for MemoryPropertyStore {
    async fn find_by_dedupe_key(&self, key: &str) -> Result<Option<Property>, StoreError> {
        let index = self.key_index.read().await;
        let id = match index.get(key) {
            Some(id) => Some(*id),
            None => index
                .iter()
                .find(|(existing, _)| dedupe_keys_match(existing, key))
                .map(|(_, id)| *id),
        };
        drop(index);
        match id {
            Some(id) => Ok(self.by_id.read().await.get(&id).cloned()),
            None => Ok(None),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Property>, StoreError> {
        Ok(self.by_id.read().await.get(&id).cloned())
    }

    async fn insert(&self, property: Property) -> Result<(), StoreError> {
        let mut index = self.key_index.write().await;
        if index.contains_key(&property.dedupe_key) {
            return Err(StoreError::DuplicateKey(property.dedupe_key));
        }
        index.insert(property.dedupe_key.clone(), property.id);
        self.by_id.write().await.insert(property.id, property);
        Ok(())
    }

    async fn update(&self, property: Property) -> Result<(), StoreError> {
        let mut by_id = self.by_id.write().await;
        if !by_id.contains_key(&property.id) {
            return Err(StoreError::NotFound(property.id));
        }
        by_id.insert(property.id, property);
        Ok(())
    }

    async fn updated_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Property>, StoreError> {
        Ok(self
            .by_id
            .read()
            .await
            .values()
            .filter(|p| p.last_updated >= cutoff)
            .cloned()
            .collect())
    }

    async fn active_sales_due(&self, today: NaiveDate) -> Result<Vec<Property>, StoreError> {
        Ok(self
            .by_id
            .read()
            .await
            .values()
            .filter(|p| {
                matches!(p.event.stage, Stage::SheriffSale | Stage::Auction)
                    && p.event.closed_at.is_none()
                    && p.event.sale_date.is_some_and(|d| d <= today)
            })
            .cloned()
            .collect())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.by_id.read().await.len())
    }
}

/// In-memory append-only event log with `(property, kind, day)` idempotence.
#[derive(Default)]
pub struct MemoryEventLog {
    entries: RwLock<Vec<TimelineEntry>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<TimelineEntry> {
        self.entries.read().await.clone()
    }
}

fn idempotence_key(entry: &TimelineEntry) -> (Uuid, TimelineKind, NaiveDate) {
    (entry.property_id, entry.kind, entry.date.date_naive())
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, mut entry: TimelineEntry) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().await;
        let key = idempotence_key(&entry);
        if entries.iter().any(|e| idempotence_key(e) == key) {
            return Ok(false);
        }
        // Timeline timestamps are non-decreasing per property.
        if let Some(last) = entries
            .iter()
            .filter(|e| e.property_id == entry.property_id)
            .map(|e| e.date)
            .max()
        {
            if entry.date < last {
                entry.date = last;
            }
        }
        entries.push(entry);
        Ok(true)
    }

    async fn history(&self, property_id: Uuid) -> Result<Vec<TimelineEntry>, StoreError> {
        let mut out: Vec<TimelineEntry> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| e.property_id == property_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(out)
    }
}
