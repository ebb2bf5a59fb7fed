//! Reliability-gated upsert with change detection and timeline emission.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use njff_core::error::IngestError;
use njff_core::model::{
    ChangeFlags, ForeclosureEvent, Property, SourceRef, Stage, TimelineEntry, TimelineKind,
};
use njff_core::normalize::NormalizedListing;
use njff_storage::{EventLog, KeyLocks, PropertyStore};

/// Opening-bid movements under this fraction are treated as noise.
pub const PRICE_CHANGE_THRESHOLD: f64 = 0.05;

#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub property_id: Uuid,
    pub created: bool,
    /// Any meaningful change was detected (new records count too).
    pub changed: bool,
    pub entries_appended: usize,
}

/// What changed between the stored record and the incoming observation,
/// computed against the existing record before anything is written.
#[derive(Debug, Default)]
struct ChangeSet {
    price_change_pct: Option<f64>,
    stage_progressed: bool,
    sale_date_change: Option<(Option<NaiveDate>, NaiveDate)>,
    judgment_newly_set: Option<f64>,
}

impl ChangeSet {
    fn any(&self) -> bool {
        self.price_change_pct.is_some()
            || self.stage_progressed
            || self.sale_date_change.is_some()
            || self.judgment_newly_set.is_some()
    }
}

fn detect_changes(existing: &Property, incoming: &NormalizedListing) -> ChangeSet {
    let mut changes = ChangeSet::default();

    if let (Some(old), Some(new)) = (existing.event.opening_bid, incoming.opening_bid) {
        if old > 0.0 {
            let pct = (new - old) / old * 100.0;
            if pct.abs() > PRICE_CHANGE_THRESHOLD * 100.0 {
                changes.price_change_pct = Some(pct);
            }
        }
    }

    if incoming.stage.rank() > existing.event.stage.rank() {
        changes.stage_progressed = true;
    }

    if let Some(new_date) = incoming.sale_date {
        if existing.event.sale_date != Some(new_date) {
            changes.sale_date_change = Some((existing.event.sale_date, new_date));
        }
    }

    if existing.event.judgment_amount.is_none() {
        if let Some(amount) = incoming.judgment_amount {
            changes.judgment_newly_set = Some(amount);
        }
    }

    changes
}

/// Timeline kind announcing a stage, used both for first observations and
/// stage progressions. A REO means the lender took title unless the status
/// text names a third party.
fn stage_entry_kind(stage: Stage, status: Option<&str>) -> TimelineKind {
    match stage {
        Stage::PreForeclosure => TimelineKind::LisPendensFiled,
        Stage::SheriffSale => TimelineKind::SheriffSaleScheduled,
        Stage::Auction | Stage::Unknown => TimelineKind::AuctionListed,
        Stage::Reo => {
            let third_party = status
                .map(|s| s.to_lowercase().contains("third"))
                .unwrap_or(false);
            if third_party {
                TimelineKind::SoldToThirdParty
            } else {
                TimelineKind::SoldToPlaintiff
            }
        }
    }
}

fn entry(
    property_id: Uuid,
    kind: TimelineKind,
    now: DateTime<Utc>,
    source: &str,
    description: String,
    payload: serde_json::Value,
) -> TimelineEntry {
    TimelineEntry {
        id: Uuid::new_v4(),
        property_id,
        kind,
        date: now,
        source: source.to_string(),
        description,
        payload,
    }
}

pub(crate) fn new_property(
    listing: &NormalizedListing,
    reliability: f64,
    now: DateTime<Utc>,
) -> Property {
    Property {
        id: Uuid::new_v4(),
        dedupe_key: listing.dedupe_key.clone(),
        address: listing.address.clone(),
        beds: listing.beds,
        baths: listing.baths,
        lot_size_sqft: listing.lot_size_sqft,
        property_type: listing.property_type.clone(),
        occupancy: listing.occupancy.clone(),
        estimated_value: listing.estimated_value,
        heuristic_band: listing.heuristic_band,
        risk: None,
        ai_summary: None,
        event: ForeclosureEvent {
            stage: listing.stage,
            status: listing.status.clone(),
            sale_date: listing.sale_date,
            opening_bid: listing.opening_bid,
            judgment_amount: listing.judgment_amount,
            plaintiff: listing.plaintiff.clone(),
            defendant: listing.defendant.clone(),
            owner_phone: listing.owner_phone.clone(),
            opened_at: now,
            closed_at: None,
            pending_verification: false,
        },
        source: SourceRef {
            source_type: listing.source_type,
            name: listing.source_name.clone(),
            detail_url: listing.detail_url.clone(),
            reliability,
        },
        ingestion_timestamp: now,
        last_updated: now,
        last_ingested_at: now,
        change_flags: ChangeFlags::default(),
        enrichment_dirty: true,
        related_keys: Vec::new(),
        notes: None,
    }
}

/// Accept incoming values when the incoming source is at least as reliable
/// as the recorded one (ties break toward recency). Incoming `None` never
/// blanks a stored value.
fn merge_fields(existing: &mut Property, listing: &NormalizedListing, reliability: f64) {
    let accept = reliability >= existing.source.reliability;
    if !accept {
        return;
    }

    let event = &mut existing.event;
    if listing.opening_bid.is_some() {
        event.opening_bid = listing.opening_bid;
    }
    if listing.estimated_value.is_some() {
        existing.estimated_value = listing.estimated_value;
    }
    if listing.sale_date.is_some() {
        event.sale_date = listing.sale_date;
    }
    if listing.status.is_some() {
        event.status = listing.status.clone();
    }
    if listing.judgment_amount.is_some() {
        event.judgment_amount = listing.judgment_amount;
    }
    if listing.plaintiff.is_some() {
        event.plaintiff = listing.plaintiff.clone();
    }
    if listing.defendant.is_some() {
        event.defendant = listing.defendant.clone();
    }
    if listing.owner_phone.is_some() {
        event.owner_phone = listing.owner_phone.clone();
    }
    if listing.occupancy.is_some() {
        existing.occupancy = listing.occupancy.clone();
    }
    if listing.beds.is_some() {
        existing.beds = listing.beds;
    }
    if listing.baths.is_some() {
        existing.baths = listing.baths;
    }
    if listing.lot_size_sqft.is_some() {
        existing.lot_size_sqft = listing.lot_size_sqft;
    }
    if listing.property_type.is_some() {
        existing.property_type = listing.property_type.clone();
    }

    existing.source = SourceRef {
        source_type: listing.source_type,
        name: listing.source_name.clone(),
        detail_url: listing.detail_url.clone().or(existing.source.detail_url.take()),
        reliability,
    };
}

async fn append_change_entries(
    events: &dyn EventLog,
    property: &Property,
    listing: &NormalizedListing,
    changes: &ChangeSet,
    now: DateTime<Utc>,
) -> Result<usize, IngestError> {
    let mut appended = 0;
    let source = &listing.source_name;

    if let Some(pct) = changes.price_change_pct {
        let written = events
            .append(entry(
                property.id,
                TimelineKind::PriceChange,
                now,
                source,
                format!("Opening bid moved {pct:+.1}%"),
                json!({
                    "previous_bid": property.event.opening_bid,
                    "new_bid": listing.opening_bid,
                    "change_pct": pct,
                }),
            ))
            .await
            .map_err(|e| IngestError::StoreWrite(e.to_string()))?;
        appended += usize::from(written);
    }

    if let Some((original, new_date)) = changes.sale_date_change {
        let (kind, description, payload) = match original {
            Some(original) => (
                TimelineKind::SheriffSaleAdjourned,
                format!("Sale adjourned to {new_date}"),
                json!({
                    "original_date": original.to_string(),
                    "new_date": new_date.to_string(),
                }),
            ),
            None => (
                TimelineKind::SheriffSaleScheduled,
                format!("Sale scheduled for {new_date}"),
                json!({ "sale_date": new_date.to_string() }),
            ),
        };
        let written = events
            .append(entry(property.id, kind, now, source, description, payload))
            .await
            .map_err(|e| IngestError::StoreWrite(e.to_string()))?;
        appended += usize::from(written);
    }

    if changes.stage_progressed {
        let kind = stage_entry_kind(listing.stage, listing.status.as_deref());
        let written = events
            .append(entry(
                property.id,
                kind,
                now,
                source,
                format!(
                    "Stage moved {} -> {}",
                    property.event.stage.as_str(),
                    listing.stage.as_str()
                ),
                json!({
                    "previous_stage": property.event.stage.as_str(),
                    "new_stage": listing.stage.as_str(),
                }),
            ))
            .await
            .map_err(|e| IngestError::StoreWrite(e.to_string()))?;
        appended += usize::from(written);
    }

    if let Some(amount) = changes.judgment_newly_set {
        let written = events
            .append(entry(
                property.id,
                TimelineKind::FinalJudgment,
                now,
                source,
                format!("Final judgment recorded at ${amount:.0}"),
                json!({ "judgment_amount": amount }),
            ))
            .await
            .map_err(|e| IngestError::StoreWrite(e.to_string()))?;
        appended += usize::from(written);
    }

    Ok(appended)
}

/// One retry on a failed write before the error escalates to the adapter
/// summary.
async fn write_with_retry<F, Fut>(mut write: F) -> Result<(), IngestError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), njff_storage::StoreError>>,
{
    if let Err(first) = write().await {
        debug!(error = %first, "store write failed; retrying once");
        write()
            .await
            .map_err(|e| IngestError::StoreWrite(e.to_string()))?;
    }
    Ok(())
}

/// Upsert one normalized listing, serialized per dedupe key.
pub async fn upsert_listing(
    store: &dyn PropertyStore,
    events: &dyn EventLog,
    locks: &KeyLocks,
    listing: &NormalizedListing,
    reliability: f64,
    now: DateTime<Utc>,
) -> Result<UpsertOutcome, IngestError> {
    let _guard = locks.acquire(&listing.dedupe_key).await;

    let existing = store
        .find_by_dedupe_key(&listing.dedupe_key)
        .await
        .map_err(|e| IngestError::StoreWrite(e.to_string()))?;

    match existing {
        None => {
            let property = new_property(listing, reliability, now);
            let kind = stage_entry_kind(listing.stage, listing.status.as_deref());
            let written = events
                .append(entry(
                    property.id,
                    kind,
                    now,
                    &listing.source_name,
                    format!("First observed as {}", listing.stage.as_str()),
                    json!({
                        "stage": listing.stage.as_str(),
                        "sale_date": listing.sale_date.map(|d| d.to_string()),
                        "opening_bid": listing.opening_bid,
                    }),
                ))
                .await
                .map_err(|e| IngestError::StoreWrite(e.to_string()))?;

            let id = property.id;
            write_with_retry(|| store.insert(property.clone())).await?;

            Ok(UpsertOutcome {
                property_id: id,
                created: true,
                changed: true,
                entries_appended: usize::from(written),
            })
        }
        Some(mut property) => {
            let changes = detect_changes(&property, listing);
            let previous_equity = property.equity_pct();

            let appended =
                append_change_entries(events, &property, listing, &changes, now).await?;

            // A stage progression closes the active event and opens a new
            // one; everything else mutates the active event in place.
            if changes.stage_progressed {
                let closed = ForeclosureEvent {
                    closed_at: Some(now),
                    ..property.event.clone()
                };
                debug!(property = %property.id, from = closed.stage.as_str(), to = listing.stage.as_str(), "closing foreclosure event");
                property.event = ForeclosureEvent {
                    stage: listing.stage,
                    status: listing.status.clone(),
                    sale_date: listing.sale_date,
                    opening_bid: listing.opening_bid.or(closed.opening_bid),
                    judgment_amount: listing.judgment_amount.or(closed.judgment_amount),
                    plaintiff: listing.plaintiff.clone().or(closed.plaintiff),
                    defendant: listing.defendant.clone().or(closed.defendant),
                    owner_phone: listing.owner_phone.clone().or(closed.owner_phone),
                    opened_at: now,
                    closed_at: None,
                    pending_verification: false,
                };
            }

            merge_fields(&mut property, listing, reliability);

            let changed = changes.any();
            property.change_flags = ChangeFlags {
                price_change_pct: changes.price_change_pct,
                stage_progressed: changes.stage_progressed,
                sale_date_changed: changes.sale_date_change.is_some(),
                previous_equity_pct: previous_equity,
                // Set by the enrichment pass, not by ingestion.
                risk_score_delta: None,
            };
            property.heuristic_band = njff_core::normalize::heuristic_band(property.equity_pct());
            property.enrichment_dirty = property.enrichment_dirty || changed;
            property.last_updated = now;
            property.last_ingested_at = now;

            let id = property.id;
            write_with_retry(|| store.update(property.clone())).await?;

            Ok(UpsertOutcome {
                property_id: id,
                created: false,
                changed,
                entries_appended: appended,
            })
        }
    }
}
