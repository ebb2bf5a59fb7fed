//! Buy Box alert engine: match recently-changed properties against saved
//! searches, gate on significance, and emit capped per-user digests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use njff_core::model::{Property, SavedSearch, SearchFilter, Stage};
use njff_storage::PropertyStore;

pub const CRATE_NAME: &str = "njff-alerts";

/// Earth radius in miles for the geospatial filter.
pub const EARTH_RADIUS_MILES: f64 = 3958.8;

pub const SIGNIFICANT_PRICE_DROP_PCT: f64 = 5.0;
pub const AI_SCORE_DRIFT_FLOOR: i16 = 5;
pub const SUPPRESSION_WINDOW_DAYS: i64 = 7;
pub const NEW_LISTING_WINDOW_HOURS: i64 = 24;
pub const DIGEST_CAP: usize = 50;

fn suppression_window() -> Duration {
    Duration::days(SUPPRESSION_WINDOW_DAYS)
}

fn new_listing_window() -> Duration {
    Duration::hours(NEW_LISTING_WINDOW_HOURS)
}

pub fn haversine_miles(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_MILES * a.sqrt().atan2((1.0 - a).sqrt())
}

fn eq_ci(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Conjunctive Buy Box match: every present predicate must hold. A filter
/// on a field the property lacks fails closed.
pub fn matches_filter(property: &Property, filter: &SearchFilter) -> bool {
    let address = &property.address;

    if let Some(zip) = &filter.zip {
        if address.zip != *zip {
            return false;
        }
    }
    if let Some(city) = &filter.city {
        if !eq_ci(&address.city, city) {
            return false;
        }
    }
    if !filter.cities.is_empty() && !filter.cities.iter().any(|c| eq_ci(&address.city, c)) {
        return false;
    }
    if let Some(county) = &filter.county {
        match &address.county {
            Some(have) if eq_ci(have, county) => {}
            _ => return false,
        }
    }
    if !filter.stages.is_empty() && !filter.stages.contains(&property.event.stage) {
        return false;
    }
    if let Some(min_equity) = filter.min_equity_pct {
        match property.equity_pct() {
            Some(equity) if equity >= min_equity => {}
            _ => return false,
        }
    }
    if let Some(max_price) = filter.max_price {
        match property.event.opening_bid {
            Some(bid) if bid <= max_price => {}
            _ => return false,
        }
    }
    if !filter.property_types.is_empty() {
        match &property.property_type {
            Some(have) if filter.property_types.iter().any(|t| eq_ci(have, t)) => {}
            _ => return false,
        }
    }
    if let Some(min) = filter.min_beds {
        if property.beds.map_or(true, |b| b < min) {
            return false;
        }
    }
    if let Some(max) = filter.max_beds {
        if property.beds.map_or(true, |b| b > max) {
            return false;
        }
    }
    if let Some(min) = filter.min_baths {
        if property.baths.map_or(true, |b| b < min) {
            return false;
        }
    }
    if let Some(max) = filter.max_baths {
        if property.baths.map_or(true, |b| b > max) {
            return false;
        }
    }
    if let Some(min) = filter.min_lot_sqft {
        if property.lot_size_sqft.map_or(true, |l| l < min) {
            return false;
        }
    }
    if let Some(max) = filter.max_lot_sqft {
        if property.lot_size_sqft.map_or(true, |l| l > max) {
            return false;
        }
    }
    if let Some(geo) = &filter.geo {
        match (address.lat, address.lng) {
            (Some(lat), Some(lng)) => {
                if haversine_miles(geo.lat, geo.lng, lat, lng) > geo.radius_miles {
                    return false;
                }
            }
            _ => return false,
        }
    }
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertReason {
    NewListing,
    PriceDrop,
    EquityCrossedThreshold,
    StageProgressed,
    SaleDateChanged,
    RiskScoreShift,
}

/// The significance gate. Scraper re-ingestion of identical data, typo
/// fixes, and sub-5-point AI drift all fall through to `None`.
pub fn significance(
    property: &Property,
    filter: &SearchFilter,
    now: DateTime<Utc>,
) -> Option<AlertReason> {
    if now - property.ingestion_timestamp <= new_listing_window() {
        return Some(AlertReason::NewListing);
    }

    let flags = &property.change_flags;

    if flags
        .price_change_pct
        .is_some_and(|pct| pct < -SIGNIFICANT_PRICE_DROP_PCT)
    {
        return Some(AlertReason::PriceDrop);
    }

    if let Some(min_equity) = filter.min_equity_pct {
        let was_below = flags.previous_equity_pct.map_or(true, |prev| prev < min_equity);
        let now_above = property.equity_pct().is_some_and(|cur| cur >= min_equity);
        if was_below && now_above && flags.previous_equity_pct != property.equity_pct() {
            return Some(AlertReason::EquityCrossedThreshold);
        }
    }

    if flags.stage_progressed {
        return Some(AlertReason::StageProgressed);
    }

    // Adjournments only matter to searches with upcoming-auction intent.
    if flags.sale_date_changed {
        let auction_intent = filter
            .stages
            .iter()
            .any(|s| matches!(s, Stage::SheriffSale | Stage::Auction));
        if auction_intent {
            return Some(AlertReason::SaleDateChanged);
        }
    }

    if flags
        .risk_score_delta
        .is_some_and(|delta| delta.abs() >= AI_SCORE_DRIFT_FLOOR)
    {
        return Some(AlertReason::RiskScoreShift);
    }

    None
}

/// Saved-search access as the alert engine sees it.
#[async_trait]
pub trait SavedSearchStore: Send + Sync {
    async fn alerting(&self) -> Vec<SavedSearch>;
    async fn set_alerts_enabled(&self, id: Uuid, enabled: bool) -> bool;
}

#[derive(Default)]
pub struct MemorySavedSearchStore {
    searches: RwLock<Vec<SavedSearch>>,
}

impl MemorySavedSearchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, search: SavedSearch) {
        let mut searches = self.searches.write().await;
        searches.retain(|s| s.id != search.id);
        searches.push(search);
    }

    pub async fn get(&self, id: Uuid) -> Option<SavedSearch> {
        self.searches.read().await.iter().find(|s| s.id == id).cloned()
    }
}

#[async_trait]
impl SavedSearchStore for MemorySavedSearchStore {
    async fn alerting(&self) -> Vec<SavedSearch> {
        self.searches
            .read()
            .await
            .iter()
            .filter(|s| s.alerts_enabled)
            .cloned()
            .collect()
    }

    async fn set_alerts_enabled(&self, id: Uuid, enabled: bool) -> bool {
        let mut searches = self.searches.write().await;
        match searches.iter_mut().find(|s| s.id == id) {
            Some(search) => {
                search.alerts_enabled = enabled;
                true
            }
            None => false,
        }
    }
}

/// `(user, property, sent_at)` history for the cooldown window.
#[async_trait]
pub trait AlertLedger: Send + Sync {
    async fn last_sent(&self, user_id: &str, property_id: Uuid) -> Option<DateTime<Utc>>;
    async fn record(&self, user_id: &str, property_id: Uuid, sent_at: DateTime<Utc>);
}

#[derive(Default)]
pub struct MemoryAlertLedger {
    sent: RwLock<HashMap<(String, Uuid), DateTime<Utc>>>,
}

impl MemoryAlertLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AlertLedger for MemoryAlertLedger {
    async fn last_sent(&self, user_id: &str, property_id: Uuid) -> Option<DateTime<Utc>> {
        self.sent
            .read()
            .await
            .get(&(user_id.to_string(), property_id))
            .copied()
    }

    async fn record(&self, user_id: &str, property_id: Uuid, sent_at: DateTime<Utc>) {
        self.sent
            .write()
            .await
            .insert((user_id.to_string(), property_id), sent_at);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertItem {
    pub property_id: Uuid,
    pub saved_search_id: Uuid,
    pub address: String,
    pub reason: AlertReason,
}

/// One per-user notification batch. Beyond the cap the digest only says
/// how many more matched and suggests tightening the Buy Box.
#[derive(Debug, Clone, Serialize)]
pub struct AlertDigest {
    pub user_id: String,
    pub items: Vec<AlertItem>,
    pub overflow_count: usize,
    pub hint: Option<String>,
}

pub struct AlertEngine<S, L> {
    store: std::sync::Arc<dyn PropertyStore>,
    searches: std::sync::Arc<S>,
    ledger: std::sync::Arc<L>,
    last_run: RwLock<DateTime<Utc>>,
}

impl<S: SavedSearchStore, L: AlertLedger> AlertEngine<S, L> {
    pub fn new(
        store: std::sync::Arc<dyn PropertyStore>,
        searches: std::sync::Arc<S>,
        ledger: std::sync::Arc<L>,
        last_run: DateTime<Utc>,
    ) -> Self {
        Self {
            store,
            searches,
            ledger,
            last_run: RwLock::new(last_run),
        }
    }

    /// One-click unsubscribe: disables exactly the originating saved search.
    pub async fn unsubscribe(&self, saved_search_id: Uuid) -> bool {
        self.searches.set_alerts_enabled(saved_search_id, false).await
    }

    /// Scan candidates against every alerting search and emit digests.
    /// A failure against one search never blocks the others.
    pub async fn run(&self, now: DateTime<Utc>) -> Vec<AlertDigest> {
        let last_run = *self.last_run.read().await;
        let cutoff = std::cmp::min(last_run, now - new_listing_window());
        let candidates = match self.store.updated_since(cutoff).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(error = %err, "alert candidate query failed");
                return Vec::new();
            }
        };

        let searches = self.searches.alerting().await;
        let mut per_user: HashMap<String, Vec<AlertItem>> = HashMap::new();

        for search in &searches {
            for property in &candidates {
                let fresh = property.last_updated >= last_run
                    || now - property.ingestion_timestamp <= new_listing_window();
                if !fresh {
                    continue;
                }
                if !matches_filter(property, &search.filter) {
                    continue;
                }
                let Some(reason) = significance(property, &search.filter, now) else {
                    continue;
                };
                if let Some(sent) = self.ledger.last_sent(&search.user_id, property.id).await {
                    if now - sent < suppression_window() {
                        continue;
                    }
                }
                let items = per_user.entry(search.user_id.clone()).or_default();
                if items.iter().any(|i| i.property_id == property.id) {
                    continue;
                }
                items.push(AlertItem {
                    property_id: property.id,
                    saved_search_id: search.id,
                    address: property.address.full.clone(),
                    reason,
                });
            }
        }

        let mut digests = Vec::new();
        for (user_id, mut items) in per_user {
            if items.is_empty() {
                continue;
            }
            let overflow_count = items.len().saturating_sub(DIGEST_CAP);
            items.truncate(DIGEST_CAP);
            for item in &items {
                self.ledger.record(&user_id, item.property_id, now).await;
            }
            let hint = (overflow_count > 0).then(|| {
                format!(
                    "{DIGEST_CAP}+ new matches; refine your filters to narrow the list"
                )
            });
            digests.push(AlertDigest {
                user_id,
                items,
                overflow_count,
                hint,
            });
        }
        digests.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        *self.last_run.write().await = now;
        digests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use njff_core::model::{
        Address, ChangeFlags, ForeclosureEvent, GeoFilter, RiskBand, SourceRef, SourceType,
    };
    use njff_storage::MemoryPropertyStore;
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 10, 12, 0, 0).single().unwrap()
    }

    fn days_ago(days: i64) -> DateTime<Utc> {
        now() - Duration::days(days)
    }

    fn property(city: &str, bid: f64, est: f64) -> Property {
        Property {
            id: Uuid::new_v4(),
            dedupe_key: format!("nj-07013-1-{}-nounit", city.to_lowercase()),
            address: Address {
                full: format!("1 Main St, {city}, NJ 07013"),
                street: "1 main street".into(),
                city: city.to_lowercase(),
                county: Some("passaic".into()),
                state: "NJ".into(),
                zip: "07013".into(),
                lat: Some(40.858),
                lng: Some(-74.164),
            },
            beds: Some(3),
            baths: Some(2.0),
            lot_size_sqft: Some(5000.0),
            property_type: Some("Single Family".into()),
            occupancy: None,
            estimated_value: Some(est),
            heuristic_band: RiskBand::Low,
            risk: None,
            ai_summary: None,
            event: ForeclosureEvent {
                stage: Stage::SheriffSale,
                status: Some("Scheduled".into()),
                sale_date: None,
                opening_bid: Some(bid),
                judgment_amount: None,
                plaintiff: None,
                defendant: None,
                owner_phone: None,
                opened_at: days_ago(10),
                closed_at: None,
                pending_verification: false,
            },
            source: SourceRef {
                source_type: SourceType::Scraper,
                name: "civilview-hudson".into(),
                detail_url: None,
                reliability: 0.85,
            },
            ingestion_timestamp: days_ago(10),
            last_updated: now(),
            last_ingested_at: now(),
            change_flags: ChangeFlags::default(),
            enrichment_dirty: false,
            related_keys: Vec::new(),
            notes: None,
        }
    }

    fn search(user: &str, filter: SearchFilter) -> SavedSearch {
        SavedSearch {
            id: Uuid::new_v4(),
            user_id: user.to_string(),
            name: "buy box".into(),
            filter,
            alerts_enabled: true,
        }
    }

    struct Fixture {
        store: Arc<MemoryPropertyStore>,
        searches: Arc<MemorySavedSearchStore>,
        ledger: Arc<MemoryAlertLedger>,
        engine: AlertEngine<MemorySavedSearchStore, MemoryAlertLedger>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryPropertyStore::new());
            let searches = Arc::new(MemorySavedSearchStore::new());
            let ledger = Arc::new(MemoryAlertLedger::new());
            let engine = AlertEngine::new(
                store.clone() as Arc<dyn PropertyStore>,
                searches.clone(),
                ledger.clone(),
                days_ago(1),
            );
            Self {
                store,
                searches,
                ledger,
                engine,
            }
        }
    }

    #[test]
    fn haversine_newark_to_clifton_is_about_nine_miles() {
        let d = haversine_miles(40.7357, -74.1724, 40.8584, -74.1638);
        assert!((d - 8.5).abs() < 1.0, "{d}");
    }

    #[test]
    fn conjunctive_filter_fails_closed_on_missing_fields() {
        let mut p = property("Clifton", 150_000.0, 300_000.0);

        let geo = SearchFilter {
            geo: Some(GeoFilter {
                lat: 40.858,
                lng: -74.164,
                radius_miles: 5.0,
            }),
            ..SearchFilter::default()
        };
        assert!(matches_filter(&p, &geo));

        p.address.lat = None;
        assert!(!matches_filter(&p, &geo));

        let equity = SearchFilter {
            min_equity_pct: Some(25.0),
            ..SearchFilter::default()
        };
        assert!(matches_filter(&p, &equity));
        p.event.opening_bid = None;
        assert!(!matches_filter(&p, &equity));
    }

    #[test]
    fn filter_predicates_are_all_required() {
        let p = property("Clifton", 150_000.0, 300_000.0);
        let filter = SearchFilter {
            city: Some("Clifton".into()),
            stages: vec![Stage::SheriffSale],
            min_equity_pct: Some(25.0),
            max_price: Some(200_000.0),
            min_beds: Some(2),
            ..SearchFilter::default()
        };
        assert!(matches_filter(&p, &filter));

        let wrong_city = SearchFilter {
            city: Some("Newark".into()),
            ..filter.clone()
        };
        assert!(!matches_filter(&p, &wrong_city));

        let too_cheap = SearchFilter {
            max_price: Some(100_000.0),
            ..filter
        };
        assert!(!matches_filter(&p, &too_cheap));
    }

    #[test]
    fn significance_ignores_quiet_reingestion() {
        let mut p = property("Clifton", 150_000.0, 300_000.0);
        p.ingestion_timestamp = days_ago(10);
        let filter = SearchFilter::default();
        assert_eq!(significance(&p, &filter, now()), None);

        // Sub-threshold drift is also quiet.
        p.change_flags.risk_score_delta = Some(3);
        assert_eq!(significance(&p, &filter, now()), None);

        p.change_flags.risk_score_delta = Some(8);
        assert_eq!(
            significance(&p, &filter, now()),
            Some(AlertReason::RiskScoreShift)
        );
    }

    #[test]
    fn new_listings_and_price_drops_are_significant() {
        let mut p = property("Clifton", 150_000.0, 300_000.0);
        p.ingestion_timestamp = now() - Duration::hours(2);
        assert_eq!(
            significance(&p, &SearchFilter::default(), now()),
            Some(AlertReason::NewListing)
        );

        p.ingestion_timestamp = days_ago(10);
        p.change_flags.price_change_pct = Some(-10.0);
        assert_eq!(
            significance(&p, &SearchFilter::default(), now()),
            Some(AlertReason::PriceDrop)
        );

        // A price increase is not a drop.
        p.change_flags.price_change_pct = Some(10.0);
        assert_eq!(significance(&p, &SearchFilter::default(), now()), None);
    }

    #[test]
    fn sale_date_changes_need_auction_intent() {
        let mut p = property("Clifton", 150_000.0, 300_000.0);
        p.ingestion_timestamp = days_ago(10);
        p.change_flags.sale_date_changed = true;

        assert_eq!(significance(&p, &SearchFilter::default(), now()), None);

        let auction_minded = SearchFilter {
            stages: vec![Stage::SheriffSale],
            ..SearchFilter::default()
        };
        assert_eq!(
            significance(&p, &auction_minded, now()),
            Some(AlertReason::SaleDateChanged)
        );
    }

    #[test]
    fn equity_crossing_the_search_floor_is_significant() {
        let mut p = property("Clifton", 150_000.0, 300_000.0); // 50% equity
        p.ingestion_timestamp = days_ago(10);
        p.change_flags.previous_equity_pct = Some(20.0);

        let filter = SearchFilter {
            min_equity_pct: Some(25.0),
            ..SearchFilter::default()
        };
        assert_eq!(
            significance(&p, &filter, now()),
            Some(AlertReason::EquityCrossedThreshold)
        );

        // Already above the floor before: no crossing.
        p.change_flags.previous_equity_pct = Some(40.0);
        assert_eq!(significance(&p, &filter, now()), None);
    }

    #[tokio::test]
    async fn run_groups_per_user_and_records_history() {
        let fx = Fixture::new();
        let mut p = property("Clifton", 150_000.0, 300_000.0);
        p.ingestion_timestamp = now() - Duration::hours(1);
        let pid = p.id;
        fx.store.insert(p).await.unwrap();

        fx.searches
            .put(search("ada", SearchFilter {
                city: Some("Clifton".into()),
                ..SearchFilter::default()
            }))
            .await;

        let digests = fx.engine.run(now()).await;
        assert_eq!(digests.len(), 1);
        assert_eq!(digests[0].user_id, "ada");
        assert_eq!(digests[0].items.len(), 1);
        assert_eq!(digests[0].items[0].reason, AlertReason::NewListing);
        assert!(fx.ledger.last_sent("ada", pid).await.is_some());
    }

    #[tokio::test]
    async fn suppression_holds_for_seven_days() {
        let fx = Fixture::new();
        let mut p = property("Clifton", 150_000.0, 300_000.0);
        p.ingestion_timestamp = now() - Duration::hours(1);
        fx.store.insert(p).await.unwrap();
        fx.searches
            .put(search("ada", SearchFilter::default()))
            .await;

        assert_eq!(fx.engine.run(now()).await.len(), 1);

        // Still fresh the next day, but suppressed.
        let tomorrow = now() + Duration::hours(20);
        assert!(fx.engine.run(tomorrow).await.is_empty());
    }

    #[tokio::test]
    async fn zero_match_searches_emit_nothing() {
        let fx = Fixture::new();
        let mut p = property("Clifton", 150_000.0, 300_000.0);
        p.ingestion_timestamp = now() - Duration::hours(1);
        fx.store.insert(p).await.unwrap();
        fx.searches
            .put(search("ada", SearchFilter {
                city: Some("Hoboken".into()),
                ..SearchFilter::default()
            }))
            .await;

        assert!(fx.engine.run(now()).await.is_empty());
    }

    #[tokio::test]
    async fn digests_cap_at_fifty_with_a_refine_hint() {
        let fx = Fixture::new();
        for i in 0..60 {
            let mut p = property("Clifton", 150_000.0, 300_000.0);
            p.dedupe_key = format!("nj-07013-{i}-main-street-nounit");
            p.ingestion_timestamp = now() - Duration::hours(1);
            fx.store.insert(p).await.unwrap();
        }
        fx.searches
            .put(search("ada", SearchFilter::default()))
            .await;

        let digests = fx.engine.run(now()).await;
        assert_eq!(digests.len(), 1);
        assert_eq!(digests[0].items.len(), DIGEST_CAP);
        assert_eq!(digests[0].overflow_count, 10);
        assert!(digests[0].hint.as_deref().unwrap().contains("refine"));
    }

    #[tokio::test]
    async fn unsubscribe_disables_exactly_the_originating_search() {
        let fx = Fixture::new();
        let keep = search("ada", SearchFilter::default());
        let drop = search("ada", SearchFilter {
            city: Some("Clifton".into()),
            ..SearchFilter::default()
        });
        let drop_id = drop.id;
        let keep_id = keep.id;
        fx.searches.put(keep).await;
        fx.searches.put(drop).await;

        assert!(fx.engine.unsubscribe(drop_id).await);
        assert!(!fx.searches.get(drop_id).await.unwrap().alerts_enabled);
        assert!(fx.searches.get(keep_id).await.unwrap().alerts_enabled);
    }

    #[tokio::test]
    async fn alerts_disabled_searches_are_skipped() {
        let fx = Fixture::new();
        let mut p = property("Clifton", 150_000.0, 300_000.0);
        p.ingestion_timestamp = now() - Duration::hours(1);
        fx.store.insert(p).await.unwrap();

        let mut muted = search("ada", SearchFilter::default());
        muted.alerts_enabled = false;
        fx.searches.put(muted).await;

        assert!(fx.engine.run(now()).await.is_empty());
    }
}
