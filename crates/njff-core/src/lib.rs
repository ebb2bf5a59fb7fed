//! Core domain model and normalization engine for NJFF.

pub mod address;
pub mod error;
pub mod model;
pub mod normalize;

pub const CRATE_NAME: &str = "njff-core";

pub use address::{canonicalize_address, dedupe_keys_match, CanonicalAddress};
pub use error::IngestError;
pub use model::{
    Address, ChangeFlags, ForeclosureEvent, GeoFilter, Property, RawListing, RiskAnalysis,
    RiskBand, SavedSearch, SearchFilter, SourceRef, SourceType, Stage, TimelineEntry, TimelineKind,
};
pub use normalize::{
    heuristic_band, infer_stage, normalize_raw_listing, parse_money, parse_sale_date,
    NormalizedListing, SkipReason,
};
