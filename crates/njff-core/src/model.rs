//! Canonical persisted types: properties, foreclosure events, timelines, saved searches.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Foreclosure lifecycle stage, ordered by how far the case has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    PreForeclosure,
    SheriffSale,
    Auction,
    Reo,
    Unknown,
}

impl Stage {
    /// Progression rank. Sheriff sale and third-party auction are the same
    /// phase of the case reached through different venues.
    pub fn rank(self) -> u8 {
        match self {
            Stage::Unknown => 0,
            Stage::PreForeclosure => 1,
            Stage::SheriffSale | Stage::Auction => 2,
            Stage::Reo => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::PreForeclosure => "PRE_FORECLOSURE",
            Stage::SheriffSale => "SHERIFF_SALE",
            Stage::Auction => "AUCTION",
            Stage::Reo => "REO",
            Stage::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskBand {
    Low,
    Moderate,
    High,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Scraper,
    Manual,
    Api,
}

/// Append-only timeline event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimelineKind {
    LisPendensFiled,
    SheriffSaleScheduled,
    SheriffSaleAdjourned,
    AuctionListed,
    PriceChange,
    SoldToPlaintiff,
    SoldToThirdParty,
    ListingRemoved,
    FinalJudgment,
}

/// Unparsed per-row payload handed from an adapter into normalization.
///
/// Everything is source text; the normalization engine owns all parsing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub address: String,
    pub status: Option<String>,
    pub stage_hint: Option<String>,
    pub sale_date_text: Option<String>,
    pub opening_bid_text: Option<String>,
    pub est_value_text: Option<String>,
    pub judgment_amount_text: Option<String>,
    pub case_title: Option<String>,
    pub plaintiff: Option<String>,
    pub defendant: Option<String>,
    pub owner_phone: Option<String>,
    pub beds_text: Option<String>,
    pub baths_text: Option<String>,
    pub lot_sqft_text: Option<String>,
    pub property_type: Option<String>,
    pub occupancy: Option<String>,
    pub detail_url: Option<String>,
    pub source_name: String,
    pub source_type: SourceType,
    #[serde(default)]
    pub debug: std::collections::BTreeMap<String, String>,
}

impl Default for SourceType {
    fn default() -> Self {
        SourceType::Scraper
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub full: String,
    pub street: String,
    pub city: String,
    pub county: Option<String>,
    /// ISO-2 state code.
    pub state: String,
    /// 5-digit zip.
    pub zip: String,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

/// Provenance of the observation that last wrote a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub source_type: SourceType,
    pub name: String,
    pub detail_url: Option<String>,
    /// Configured trust in [0, 1]; ties in the merge break toward recency.
    pub reliability: f64,
}

/// Temporal legal state attached to a property. At most one active event
/// per property; a stage or outcome change closes it and opens a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeclosureEvent {
    pub stage: Stage,
    pub status: Option<String>,
    pub sale_date: Option<NaiveDate>,
    pub opening_bid: Option<f64>,
    pub judgment_amount: Option<f64>,
    pub plaintiff: Option<String>,
    pub defendant: Option<String>,
    pub owner_phone: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub pending_verification: bool,
}

/// Immutable audit event. Existing entries are never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub id: Uuid,
    pub property_id: Uuid,
    pub kind: TimelineKind,
    pub date: DateTime<Utc>,
    pub source: String,
    pub description: String,
    pub payload: Value,
}

/// Risk score produced by the external analysis service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAnalysis {
    /// 0–100.
    pub score: u8,
    pub band: RiskBand,
    pub summary: String,
    pub rationale: String,
    pub analyzed_at: DateTime<Utc>,
}

/// What the most recent upsert changed, for the alert significance gate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeFlags {
    /// Signed percent change of the opening bid, when it moved more than 5%.
    pub price_change_pct: Option<f64>,
    pub stage_progressed: bool,
    pub sale_date_changed: bool,
    /// Equity percent before this upsert, for boundary-crossing checks.
    pub previous_equity_pct: Option<f64>,
    /// Risk score movement from the last enrichment pass.
    pub risk_score_delta: Option<i16>,
}

/// Canonical real-estate asset, stable across foreclosure cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: Uuid,
    pub dedupe_key: String,
    pub address: Address,

    pub beds: Option<u32>,
    pub baths: Option<f64>,
    pub lot_size_sqft: Option<f64>,
    pub property_type: Option<String>,
    pub occupancy: Option<String>,

    pub estimated_value: Option<f64>,
    /// Pre-enrichment band derived purely from equity percent.
    pub heuristic_band: RiskBand,
    /// Analysis from the external service, when enrichment has run.
    pub risk: Option<RiskAnalysis>,
    pub ai_summary: Option<String>,

    /// The single active foreclosure event.
    pub event: ForeclosureEvent,

    pub source: SourceRef,
    pub ingestion_timestamp: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub last_ingested_at: DateTime<Utc>,

    pub change_flags: ChangeFlags,
    pub enrichment_dirty: bool,

    /// Reserved for block/lot cross-linking.
    #[serde(default)]
    pub related_keys: Vec<String>,
    pub notes: Option<String>,
}

impl Property {
    /// `estimated_value − opening_bid`, when both are present.
    pub fn equity_amount(&self) -> Option<f64> {
        match (self.estimated_value, self.event.opening_bid) {
            (Some(est), Some(bid)) => Some(est - bid),
            _ => None,
        }
    }

    /// Null when either side is missing or the estimate is non-positive.
    pub fn equity_pct(&self) -> Option<f64> {
        match (self.estimated_value, self.event.opening_bid) {
            (Some(est), Some(bid)) if est > 0.0 => Some((est - bid) / est * 100.0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoFilter {
    pub lat: f64,
    pub lng: f64,
    pub radius_miles: f64,
}

/// Serialized Buy Box predicate. Every present field must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilter {
    pub zip: Option<String>,
    pub city: Option<String>,
    pub county: Option<String>,
    #[serde(default)]
    pub cities: Vec<String>,
    #[serde(default)]
    pub stages: Vec<Stage>,
    pub min_equity_pct: Option<f64>,
    #[serde(alias = "maxPrice")]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub property_types: Vec<String>,
    pub min_beds: Option<u32>,
    pub max_beds: Option<u32>,
    pub min_baths: Option<f64>,
    pub max_baths: Option<f64>,
    pub min_lot_sqft: Option<f64>,
    pub max_lot_sqft: Option<f64>,
    pub geo: Option<GeoFilter>,
}

impl SearchFilter {
    /// Preferred city for source-side querying: `city` wins over `cities[0]`.
    pub fn primary_city(&self) -> Option<&str> {
        self.city
            .as_deref()
            .or_else(|| self.cities.first().map(String::as_str))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedSearch {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    pub filter: SearchFilter,
    pub alerts_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event() -> ForeclosureEvent {
        ForeclosureEvent {
            stage: Stage::SheriffSale,
            status: Some("Scheduled".into()),
            sale_date: None,
            opening_bid: Some(150_000.0),
            judgment_amount: None,
            plaintiff: None,
            defendant: None,
            owner_phone: None,
            opened_at: Utc.with_ymd_and_hms(2024, 11, 1, 0, 0, 0).single().unwrap(),
            closed_at: None,
            pending_verification: false,
        }
    }

    fn property(est: Option<f64>, bid: Option<f64>) -> Property {
        let mut ev = event();
        ev.opening_bid = bid;
        Property {
            id: Uuid::new_v4(),
            dedupe_key: "nj-07095-100-garden-state-parkway-nounit".into(),
            address: Address {
                full: "100 Garden State Pkwy, Woodbridge, NJ 07095".into(),
                street: "100 Garden State Pkwy".into(),
                city: "woodbridge".into(),
                county: None,
                state: "NJ".into(),
                zip: "07095".into(),
                lat: None,
                lng: None,
            },
            beds: None,
            baths: None,
            lot_size_sqft: None,
            property_type: None,
            occupancy: None,
            estimated_value: est,
            heuristic_band: RiskBand::Unknown,
            risk: None,
            ai_summary: None,
            event: ev,
            source: SourceRef {
                source_type: SourceType::Scraper,
                name: "civilview-hudson".into(),
                detail_url: None,
                reliability: 0.85,
            },
            ingestion_timestamp: Utc.with_ymd_and_hms(2024, 11, 1, 0, 0, 0).single().unwrap(),
            last_updated: Utc.with_ymd_and_hms(2024, 11, 1, 0, 0, 0).single().unwrap(),
            last_ingested_at: Utc.with_ymd_and_hms(2024, 11, 1, 0, 0, 0).single().unwrap(),
            change_flags: ChangeFlags::default(),
            enrichment_dirty: false,
            related_keys: Vec::new(),
            notes: None,
        }
    }

    #[test]
    fn equity_pct_requires_both_sides_and_positive_estimate() {
        assert_eq!(property(Some(300_000.0), Some(150_000.0)).equity_pct(), Some(50.0));
        assert_eq!(property(None, Some(150_000.0)).equity_pct(), None);
        assert_eq!(property(Some(300_000.0), None).equity_pct(), None);
        assert_eq!(property(Some(0.0), Some(150_000.0)).equity_pct(), None);
        assert_eq!(property(Some(-10.0), Some(150_000.0)).equity_pct(), None);
    }

    #[test]
    fn equity_arithmetic_matches_definition() {
        let p = property(Some(200_000.0), Some(220_000.0));
        assert_eq!(p.equity_amount(), Some(-20_000.0));
        let pct = p.equity_pct().unwrap();
        assert!((pct - (-10.0)).abs() < 1e-6);
    }

    #[test]
    fn stage_rank_orders_progression() {
        assert!(Stage::PreForeclosure.rank() < Stage::SheriffSale.rank());
        assert_eq!(Stage::SheriffSale.rank(), Stage::Auction.rank());
        assert!(Stage::Auction.rank() < Stage::Reo.rank());
        assert_eq!(Stage::Unknown.rank(), 0);
    }

    #[test]
    fn search_filter_prefers_city_over_cities() {
        let filter = SearchFilter {
            city: Some("Clifton".into()),
            cities: vec!["Newark".into()],
            ..SearchFilter::default()
        };
        assert_eq!(filter.primary_city(), Some("Clifton"));

        let filter = SearchFilter {
            cities: vec!["Newark".into()],
            ..SearchFilter::default()
        };
        assert_eq!(filter.primary_city(), Some("Newark"));
    }

    #[test]
    fn search_filter_accepts_legacy_max_price_spelling() {
        let modern: SearchFilter = serde_json::from_str(r#"{"maxPrice": 400000}"#).unwrap();
        assert_eq!(modern.max_price, Some(400_000.0));
        let legacy: SearchFilter = serde_json::from_str(r#"{"max_price": 350000}"#).unwrap();
        assert_eq!(legacy.max_price, Some(350_000.0));
    }
}
