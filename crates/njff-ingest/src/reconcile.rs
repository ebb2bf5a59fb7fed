//! End-of-day reconciliation: flag listings that vanished from their source.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use njff_core::error::IngestError;
use njff_core::model::{TimelineEntry, TimelineKind};
use njff_storage::{EventLog, PropertyStore};

/// Work item for a future post-sale verification pass. Whether the sale
/// happened or was adjourned is deliberately left undecided here.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationTask {
    pub property_id: Uuid,
    pub dedupe_key: String,
    pub sale_date: NaiveDate,
    pub last_ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileOutcome {
    pub examined: usize,
    pub marked_pending: usize,
    pub tasks: Vec<VerificationTask>,
}

/// Sweep active sheriff-sale/auction events whose sale date has passed but
/// that today's ingestion did not re-observe. Marks them pending
/// verification and appends a `LISTING_REMOVED` entry; never guesses
/// between sold and adjourned.
pub async fn reconcile(
    store: &dyn PropertyStore,
    events: &dyn EventLog,
    today: NaiveDate,
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome, IngestError> {
    let due = store
        .active_sales_due(today)
        .await
        .map_err(|e| IngestError::StoreWrite(e.to_string()))?;

    let mut outcome = ReconcileOutcome {
        examined: due.len(),
        ..ReconcileOutcome::default()
    };

    for mut property in due {
        if property.last_ingested_at.date_naive() >= today {
            continue;
        }
        if property.event.pending_verification {
            continue;
        }
        let Some(sale_date) = property.event.sale_date else {
            continue;
        };

        property.event.pending_verification = true;
        property.last_updated = now;

        events
            .append(TimelineEntry {
                id: Uuid::new_v4(),
                property_id: property.id,
                kind: TimelineKind::ListingRemoved,
                date: now,
                source: "reconciliation".to_string(),
                description: "No longer listed at source; likely sold or adjourned".to_string(),
                payload: json!({
                    "sale_date": sale_date.to_string(),
                    "last_ingested_at": property.last_ingested_at.to_rfc3339(),
                }),
            })
            .await
            .map_err(|e| IngestError::StoreWrite(e.to_string()))?;

        outcome.tasks.push(VerificationTask {
            property_id: property.id,
            dedupe_key: property.dedupe_key.clone(),
            sale_date,
            last_ingested_at: property.last_ingested_at,
        });

        store
            .update(property)
            .await
            .map_err(|e| IngestError::StoreWrite(e.to_string()))?;
        outcome.marked_pending += 1;
    }

    info!(
        examined = outcome.examined,
        marked_pending = outcome.marked_pending,
        "reconciliation sweep complete"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use njff_core::model::{RawListing, SourceType};
    use njff_core::normalize::normalize_raw_listing;
    use njff_storage::{MemoryEventLog, MemoryPropertyStore};

    fn raw(address: &str, sale_date: &str) -> RawListing {
        RawListing {
            address: address.into(),
            status: Some("Scheduled".into()),
            stage_hint: Some("Sheriff Sale".into()),
            sale_date_text: Some(sale_date.into()),
            opening_bid_text: Some("$100,000".into()),
            source_name: "civilview-hudson".into(),
            source_type: SourceType::Scraper,
            ..RawListing::default()
        }
    }

    async fn seed(
        store: &MemoryPropertyStore,
        address: &str,
        sale_date: &str,
        ingested: DateTime<Utc>,
    ) -> Uuid {
        let listing = normalize_raw_listing(&raw(address, sale_date)).unwrap();
        let property = crate::upsert::new_property(&listing, 0.85, ingested);
        let id = property.id;
        store.insert(property).await.unwrap();
        id
    }

    #[tokio::test]
    async fn stale_past_sales_go_pending_verification() {
        let store = MemoryPropertyStore::new();
        let events = MemoryEventLog::new();
        let yesterday = Utc.with_ymd_and_hms(2024, 12, 26, 9, 0, 0).single().unwrap();
        let id = seed(&store, "1 Main St, Newark, NJ 07102", "2024-12-25", yesterday).await;

        let today = NaiveDate::from_ymd_opt(2024, 12, 27).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 12, 27, 18, 0, 0).single().unwrap();
        let outcome = reconcile(&store, &events, today, now).await.unwrap();

        assert_eq!(outcome.marked_pending, 1);
        assert_eq!(outcome.tasks.len(), 1);
        assert_eq!(outcome.tasks[0].property_id, id);

        let property = store.find_by_id(id).await.unwrap().unwrap();
        assert!(property.event.pending_verification);

        let history = events.history(id).await.unwrap();
        let removed = history
            .iter()
            .find(|e| e.kind == TimelineKind::ListingRemoved)
            .expect("removal entry");
        assert!(removed.description.contains("likely sold or adjourned"));
    }

    #[tokio::test]
    async fn reseen_today_is_left_alone() {
        let store = MemoryPropertyStore::new();
        let events = MemoryEventLog::new();
        let this_morning = Utc.with_ymd_and_hms(2024, 12, 27, 8, 0, 0).single().unwrap();
        let id = seed(&store, "1 Main St, Newark, NJ 07102", "2024-12-25", this_morning).await;

        let today = NaiveDate::from_ymd_opt(2024, 12, 27).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 12, 27, 18, 0, 0).single().unwrap();
        let outcome = reconcile(&store, &events, today, now).await.unwrap();

        assert_eq!(outcome.marked_pending, 0);
        let property = store.find_by_id(id).await.unwrap().unwrap();
        assert!(!property.event.pending_verification);
    }

    #[tokio::test]
    async fn future_sales_are_not_swept() {
        let store = MemoryPropertyStore::new();
        let events = MemoryEventLog::new();
        let last_week = Utc.with_ymd_and_hms(2024, 12, 20, 8, 0, 0).single().unwrap();
        seed(&store, "1 Main St, Newark, NJ 07102", "2025-02-01", last_week).await;

        let today = NaiveDate::from_ymd_opt(2024, 12, 27).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 12, 27, 18, 0, 0).single().unwrap();
        let outcome = reconcile(&store, &events, today, now).await.unwrap();

        assert_eq!(outcome.examined, 0);
        assert_eq!(outcome.marked_pending, 0);
    }

    #[tokio::test]
    async fn sweep_is_idempotent_across_days() {
        let store = MemoryPropertyStore::new();
        let events = MemoryEventLog::new();
        let stale = Utc.with_ymd_and_hms(2024, 12, 26, 9, 0, 0).single().unwrap();
        let id = seed(&store, "1 Main St, Newark, NJ 07102", "2024-12-25", stale).await;

        let today = NaiveDate::from_ymd_opt(2024, 12, 27).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 12, 27, 18, 0, 0).single().unwrap();
        reconcile(&store, &events, today, now).await.unwrap();

        let tomorrow = NaiveDate::from_ymd_opt(2024, 12, 28).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 12, 28, 18, 0, 0).single().unwrap();
        let second = reconcile(&store, &events, tomorrow, later).await.unwrap();

        assert_eq!(second.marked_pending, 0);
        assert_eq!(events.history(id).await.unwrap().len(), 1);
    }
}
