//! Source adapter contracts, registry, and state profiles.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use njff_core::model::{RawListing, SearchFilter, SourceType, Stage};
use njff_storage::http::{FetchError, HttpFetcher};

pub mod aggregator;
pub mod civilview;
pub mod manual;

pub use aggregator::AggregatorAdapter;
pub use civilview::CivilViewAdapter;
pub use manual::ManualCsvAdapter;

pub const CRATE_NAME: &str = "njff-adapters";

pub const LIST_PAGE_TIMEOUT: Duration = Duration::from_secs(15);
pub const DETAIL_PAGE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DETAIL_BATCH_SIZE: usize = 5;
pub const DETAIL_BATCH_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("parse failed: {0}")]
    Parse(String),
    #[error("adapter does not serve state {0}")]
    UnsupportedState(String),
}

impl From<FetchError> for AdapterError {
    fn from(err: FetchError) -> Self {
        if err.is_rate_limit() {
            AdapterError::RateLimited(err.to_string())
        } else {
            AdapterError::Fetch(err.to_string())
        }
    }
}

/// Normalized search request handed to every adapter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchParams {
    pub state: String,
    pub city: Option<String>,
    pub county: Option<String>,
    pub zip: Option<String>,
    pub max_price: Option<f64>,
}

impl SearchParams {
    /// Derive from a saved-search filter: `city` beats `cities[0]`.
    pub fn from_filter(state: &str, filter: &SearchFilter) -> Self {
        Self {
            state: state.to_uppercase(),
            city: filter.primary_city().map(str::to_string),
            county: filter.county.clone(),
            zip: filter.zip.clone(),
            max_price: filter.max_price,
        }
    }
}

/// Per-source fetcher. Stateless across calls; one dead source must never
/// abort a run, so `search` degrades to an empty batch on whole-page
/// failures and reserves `Err` for conditions the orchestrator reacts to
/// (rate limiting, unsupported state).
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn id(&self) -> &str;
    fn label(&self) -> &str;
    fn source_type(&self) -> SourceType;
    fn supports_state(&self, code: &str) -> bool;

    async fn search(
        &self,
        http: &HttpFetcher,
        params: &SearchParams,
    ) -> Result<Vec<RawListing>, AdapterError>;
}

/// Split a case caption into `(plaintiff, defendant)`.
///
/// Separators `v.`, `vs`, `vs.`, `versus` are matched case-insensitively as
/// standalone words; with no separator, the whole title is the defendant.
pub fn split_case_title(title: &str) -> (Option<String>, Option<String>) {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return (None, None);
    }
    let lowered = trimmed.to_lowercase();
    for sep in [" v. ", " vs. ", " vs ", " versus "] {
        if let Some(pos) = lowered.find(sep) {
            let plaintiff = trimmed[..pos].trim();
            let defendant = trimmed[pos + sep.len()..].trim();
            return (
                (!plaintiff.is_empty()).then(|| plaintiff.to_string()),
                (!defendant.is_empty()).then(|| defendant.to_string()),
            );
        }
    }
    (None, Some(trimmed.to_string()))
}

/// Per-state tuning injected through the registry. Only NJ ships today.
#[derive(Debug, Clone)]
pub struct StateProfile {
    pub state: &'static str,
    pub stage_keywords: &'static [(Stage, &'static [&'static str])],
    pub min_viable_equity_pct: f64,
    pub urgency_window_days: i64,
}

pub fn nj_profile() -> StateProfile {
    StateProfile {
        state: "NJ",
        stage_keywords: njff_core::normalize::DEFAULT_STAGE_KEYWORDS,
        min_viable_equity_pct: 10.0,
        urgency_window_days: 30,
    }
}

/// One configured source, as written in `sources.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    pub id: String,
    pub label: String,
    pub state_scope: String,
    pub source_type: SourceType,
    pub reliability: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRegistryFile {
    pub sources: Vec<SourceSpec>,
}

pub const DEFAULT_RELIABILITY: f64 = 0.50;

/// Maps `(state, source id)` to adapter instances.
pub struct AdapterRegistry {
    specs: Vec<SourceSpec>,
    profile: StateProfile,
}

impl AdapterRegistry {
    pub fn from_yaml(text: &str) -> Result<Self, AdapterError> {
        let file: SourceRegistryFile =
            serde_yaml::from_str(text).map_err(|e| AdapterError::Parse(e.to_string()))?;
        Ok(Self {
            specs: file.sources,
            profile: nj_profile(),
        })
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, AdapterError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AdapterError::Fetch(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    pub fn profile(&self) -> &StateProfile {
        &self.profile
    }

    pub fn specs(&self) -> &[SourceSpec] {
        &self.specs
    }

    pub fn reliability_for(&self, adapter_id: &str) -> f64 {
        self.specs
            .iter()
            .find(|s| s.id == adapter_id)
            .map(|s| s.reliability)
            .unwrap_or(DEFAULT_RELIABILITY)
    }

    fn build(&self, spec: &SourceSpec) -> Option<Arc<dyn SourceAdapter>> {
        match spec.source_type {
            SourceType::Scraper => Some(Arc::new(CivilViewAdapter::new(
                spec.id.clone(),
                spec.label.clone(),
                spec.state_scope.clone(),
                spec.endpoint.clone()?,
            ))),
            SourceType::Api => Some(Arc::new(AggregatorAdapter::new(
                spec.id.clone(),
                spec.label.clone(),
                spec.state_scope.clone(),
                spec.endpoint.clone()?,
            ))),
            SourceType::Manual => Some(Arc::new(ManualCsvAdapter::new(
                spec.id.clone(),
                spec.label.clone(),
                spec.state_scope.clone(),
                spec.path.clone()?,
            ))),
        }
    }

    /// Enabled adapters serving the given state.
    pub fn adapters_for_state(&self, state: &str) -> Vec<(SourceSpec, Arc<dyn SourceAdapter>)> {
        self.specs
            .iter()
            .filter(|spec| spec.enabled && spec.state_scope.eq_ignore_ascii_case(state))
            .filter_map(|spec| self.build(spec).map(|adapter| (spec.clone(), adapter)))
            .collect()
    }

    pub fn adapter_by_id(&self, id: &str) -> Option<(SourceSpec, Arc<dyn SourceAdapter>)> {
        self.specs
            .iter()
            .find(|spec| spec.id == id)
            .and_then(|spec| self.build(spec).map(|adapter| (spec.clone(), adapter)))
    }
}
