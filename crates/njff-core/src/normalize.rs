//! Pure transformations from raw source rows into canonical candidates.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::{canonicalize_address, CanonicalAddress};
use crate::model::{Address, RawListing, RiskBand, SourceType, Stage};

/// Stage keyword table in match-priority order. REO outranks the sheriff
/// keywords so "Scheduled for REO resale" does not classify as a sale.
pub const DEFAULT_STAGE_KEYWORDS: &[(Stage, &[&str])] = &[
    (Stage::Reo, &["reo", "bank owned", "resale"]),
    (Stage::Auction, &["auction", "trustee", "bid4assets", "xome"]),
    (
        Stage::SheriffSale,
        &["sheriff", "scheduled", "set for sale", "adjourned"],
    ),
    (
        Stage::PreForeclosure,
        &["lis pendens", "nod", "pre-foreclosure"],
    ),
];

/// Date text that names a status rather than a calendar date.
const STATUS_DATE_KEYWORDS: &[&str] = &[
    "adjourned",
    "postponed",
    "cancelled",
    "canceled",
    "tbd",
    "n/a",
    "set for sale",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%m/%d/%Y",
    "%m/%d/%y",
    "%m-%d-%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%B %d %Y",
];

/// Parse source money text. `None` for empty, placeholder, or garbage input.
pub fn parse_money(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '$' && *c != ',')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let upper = cleaned.to_ascii_uppercase();
    if upper == "N/A" || upper == "TBD" {
        return None;
    }
    let value: f64 = cleaned.parse().ok()?;
    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}

/// Parse source sale-date text. Status keywords win over any embedded date:
/// "Adjourned to 1/15" is an adjournment, not a January sale.
pub fn parse_sale_date(raw: &str) -> Option<NaiveDate> {
    let lowered = raw.trim().to_lowercase();
    if lowered.is_empty() {
        return None;
    }
    if STATUS_DATE_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
        return None;
    }
    let trimmed = lowered.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
}

/// First-match stage inference over a custom keyword table.
pub fn infer_stage_with(table: &[(Stage, &[&str])], stage_hint: &str, status: &str) -> Stage {
    let text = format!("{} {}", stage_hint, status).to_lowercase();
    for (stage, keywords) in table {
        if keywords.iter().any(|kw| text.contains(kw)) {
            return *stage;
        }
    }
    Stage::Unknown
}

pub fn infer_stage(stage_hint: &str, status: &str) -> Stage {
    infer_stage_with(DEFAULT_STAGE_KEYWORDS, stage_hint, status)
}

/// Placeholder band derived purely from equity percent; risk analysis may
/// later override it without touching this value.
pub fn heuristic_band(equity_pct: Option<f64>) -> RiskBand {
    match equity_pct {
        None => RiskBand::Unknown,
        Some(pct) if pct >= 25.0 => RiskBand::Low,
        Some(pct) if pct >= 10.0 => RiskBand::Moderate,
        Some(_) => RiskBand::High,
    }
}

/// Why a raw row was dropped before reaching the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("address could not be parsed beyond a zip code")]
    UnparseableAddress,
    #[error("row has no price, date, or status")]
    EmptyRow,
}

/// Canonical candidate produced from one raw row, ready for upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedListing {
    pub dedupe_key: String,
    pub canonical: CanonicalAddress,
    pub address: Address,
    pub stage: Stage,
    pub status: Option<String>,
    pub sale_date: Option<NaiveDate>,
    pub opening_bid: Option<f64>,
    pub estimated_value: Option<f64>,
    pub judgment_amount: Option<f64>,
    pub plaintiff: Option<String>,
    pub defendant: Option<String>,
    pub owner_phone: Option<String>,
    pub beds: Option<u32>,
    pub baths: Option<f64>,
    pub lot_size_sqft: Option<f64>,
    pub property_type: Option<String>,
    pub occupancy: Option<String>,
    pub detail_url: Option<String>,
    pub source_name: String,
    pub source_type: SourceType,
    pub heuristic_band: RiskBand,
}

impl NormalizedListing {
    pub fn equity_pct(&self) -> Option<f64> {
        match (self.estimated_value, self.opening_bid) {
            (Some(est), Some(bid)) if est > 0.0 => Some((est - bid) / est * 100.0),
            _ => None,
        }
    }
}

fn non_empty(text: &Option<String>) -> Option<String> {
    text.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_count(text: &Option<String>) -> Option<u32> {
    non_empty(text)?.parse().ok()
}

fn parse_float(text: &Option<String>) -> Option<f64> {
    parse_money(&non_empty(text)?)
}

/// Normalize one raw listing with a custom stage-keyword table.
///
/// Deterministic: equal inputs always produce equal outputs. Returns the
/// skip sentinel when the row cannot identify a property or carries no
/// signal at all; the caller counts those.
pub fn normalize_raw_listing_with(
    table: &[(Stage, &[&str])],
    raw: &RawListing,
) -> Result<NormalizedListing, SkipReason> {
    let canonical =
        canonicalize_address(&raw.address).ok_or(SkipReason::UnparseableAddress)?;

    let status = non_empty(&raw.status);
    let stage_hint = non_empty(&raw.stage_hint);
    let opening_bid = non_empty(&raw.opening_bid_text).and_then(|t| parse_money(&t));
    let estimated_value = non_empty(&raw.est_value_text).and_then(|t| parse_money(&t));
    let judgment_amount = non_empty(&raw.judgment_amount_text).and_then(|t| parse_money(&t));
    let sale_date = non_empty(&raw.sale_date_text).and_then(|t| parse_sale_date(&t));

    let has_price = opening_bid.is_some() || estimated_value.is_some();
    let has_date = sale_date.is_some();
    let has_status = status.is_some() || stage_hint.is_some();
    if !has_price && !has_date && !has_status {
        return Err(SkipReason::EmptyRow);
    }

    let stage = infer_stage_with(
        table,
        stage_hint.as_deref().unwrap_or(""),
        status.as_deref().unwrap_or(""),
    );

    let equity_pct = match (estimated_value, opening_bid) {
        (Some(est), Some(bid)) if est > 0.0 => Some((est - bid) / est * 100.0),
        _ => None,
    };

    let address = Address {
        full: raw.address.split_whitespace().collect::<Vec<_>>().join(" "),
        street: canonical.street_line(),
        city: canonical.city.clone(),
        county: None,
        state: canonical.state.to_uppercase(),
        zip: canonical.zip.clone(),
        lat: None,
        lng: None,
    };

    Ok(NormalizedListing {
        dedupe_key: canonical.dedupe_key(),
        canonical,
        address,
        stage,
        status,
        sale_date,
        opening_bid,
        estimated_value,
        judgment_amount,
        plaintiff: non_empty(&raw.plaintiff),
        defendant: non_empty(&raw.defendant),
        owner_phone: non_empty(&raw.owner_phone),
        beds: parse_count(&raw.beds_text),
        baths: parse_float(&raw.baths_text),
        lot_size_sqft: parse_float(&raw.lot_sqft_text),
        property_type: non_empty(&raw.property_type),
        occupancy: non_empty(&raw.occupancy),
        detail_url: non_empty(&raw.detail_url),
        source_name: raw.source_name.clone(),
        source_type: raw.source_type,
        heuristic_band: heuristic_band(equity_pct),
    })
}

pub fn normalize_raw_listing(raw: &RawListing) -> Result<NormalizedListing, SkipReason> {
    normalize_raw_listing_with(DEFAULT_STAGE_KEYWORDS, raw)
}
