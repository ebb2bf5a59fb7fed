//! Ingestion orchestration: adapter fan-out, guards, upserts, enrichment.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use njff_adapters::{AdapterError, AdapterRegistry, SearchParams, SourceAdapter, SourceSpec};
use njff_core::error::IngestError;
use njff_core::model::SavedSearch;
use njff_core::normalize::normalize_raw_listing_with;
use njff_storage::dlq::{DeadLetter, DeadLetterStore};
use njff_storage::http::HttpFetcher;
use njff_storage::{EventLog, KeyLocks, PropertyStore};

pub mod breaker;
pub mod enrich;
pub mod reconcile;
pub mod upsert;

pub use breaker::{BreakerConfig, BreakerDecision, CircuitBreaker, VolumeTracker};
pub use enrich::{EnrichmentAttempt, EnrichmentClient, EnrichmentRequest, HttpRiskScorer, RiskScorer};
pub use reconcile::{reconcile, ReconcileOutcome, VerificationTask};
pub use upsert::{upsert_listing, UpsertOutcome};

pub const CRATE_NAME: &str = "njff-ingest";

pub const DEFAULT_ADAPTER_DEADLINE: Duration = Duration::from_secs(120);

/// Environment-driven configuration. Credentials stay out of the config
/// printout; `Debug` is intentionally not derived.
#[derive(Clone)]
pub struct IngestConfig {
    pub risk_api_key: String,
    pub risk_endpoint: String,
    pub database_url: String,
    pub port: u16,
    pub risk_tokens_per_minute: u32,
    pub drift_threshold: f64,
    pub yield_threshold: f64,
    pub adapter_deadline: Duration,
    pub reconcile_cron: String,
    pub ingest_cron_1: String,
    pub ingest_cron_2: String,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub dlq_dir: PathBuf,
    pub sources_path: PathBuf,
}

fn required(name: &str) -> Result<String, IngestError> {
    std::env::var(name).map_err(|_| IngestError::Config(format!("{name} is not set")))
}

fn optional_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, IngestError> {
        let port: u16 = required("NJFF_PORT")?
            .parse()
            .map_err(|_| IngestError::Config("NJFF_PORT is not a port number".into()))?;
        Ok(Self {
            risk_api_key: required("NJFF_RISK_API_KEY")?,
            risk_endpoint: std::env::var("NJFF_RISK_ENDPOINT")
                .unwrap_or_else(|_| "https://risk.njff.example.com/v1/score".to_string()),
            database_url: required("DATABASE_URL")?,
            port,
            risk_tokens_per_minute: optional_parse("NJFF_RISK_TOKENS_PER_MIN", 10),
            drift_threshold: optional_parse("NJFF_DRIFT_THRESHOLD", 0.20),
            yield_threshold: optional_parse("NJFF_YIELD_THRESHOLD", 0.10),
            adapter_deadline: Duration::from_secs(optional_parse(
                "NJFF_ADAPTER_DEADLINE_SECS",
                120,
            )),
            reconcile_cron: std::env::var("NJFF_RECONCILE_CRON")
                .unwrap_or_else(|_| "0 0 18 * * *".to_string()),
            ingest_cron_1: std::env::var("NJFF_INGEST_CRON_1")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            ingest_cron_2: std::env::var("NJFF_INGEST_CRON_2")
                .unwrap_or_else(|_| "0 0 12 * * *".to_string()),
            http_timeout: Duration::from_secs(optional_parse("NJFF_HTTP_TIMEOUT_SECS", 120)),
            user_agent: std::env::var("NJFF_USER_AGENT")
                .unwrap_or_else(|_| "njff-bot/0.3".to_string()),
            dlq_dir: PathBuf::from(
                std::env::var("NJFF_DLQ_DIR").unwrap_or_else(|_| "./dlq".to_string()),
            ),
            sources_path: PathBuf::from(
                std::env::var("NJFF_SOURCES_PATH").unwrap_or_else(|_| "./sources.yaml".to_string()),
            ),
        })
    }
}

/// How an adapter's slice of the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdapterDisposition {
    Succeeded,
    CircuitOpen,
    VolumeAnomaly,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterIngestionSummary {
    pub adapter_id: String,
    pub raw_count: usize,
    pub normalized_count: usize,
    pub created_count: usize,
    pub updated_count: usize,
    pub items_skipped_normalization: usize,
    pub items_failed_processing: usize,
    pub disposition: AdapterDisposition,
    pub error: Option<String>,
}

impl AdapterIngestionSummary {
    fn empty(adapter_id: &str) -> Self {
        Self {
            adapter_id: adapter_id.to_string(),
            raw_count: 0,
            normalized_count: 0,
            created_count: 0,
            updated_count: 0,
            items_skipped_normalization: 0,
            items_failed_processing: 0,
            disposition: AdapterDisposition::Succeeded,
            error: None,
        }
    }

    fn failed(adapter_id: &str, disposition: AdapterDisposition, error: String) -> Self {
        Self {
            disposition,
            error: Some(error),
            ..Self::empty(adapter_id)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summaries: Vec<AdapterIngestionSummary>,
    pub enriched: usize,
    pub enrichment_failures: usize,
}

impl IngestionResult {
    pub fn created_total(&self) -> usize {
        self.summaries.iter().map(|s| s.created_count).sum()
    }

    pub fn updated_total(&self) -> usize {
        self.summaries.iter().map(|s| s.updated_count).sum()
    }

    pub fn all_circuit_broken(&self) -> bool {
        !self.summaries.is_empty()
            && self
                .summaries
                .iter()
                .all(|s| s.disposition == AdapterDisposition::CircuitOpen)
    }

    pub fn all_volume_anomalies(&self) -> bool {
        !self.summaries.is_empty()
            && self
                .summaries
                .iter()
                .all(|s| s.disposition == AdapterDisposition::VolumeAnomaly)
    }

    pub fn any_failure(&self) -> bool {
        self.summaries
            .iter()
            .any(|s| s.disposition != AdapterDisposition::Succeeded)
    }
}

fn region_of(params: &SearchParams) -> String {
    params
        .county
        .clone()
        .or_else(|| params.city.clone())
        .unwrap_or_else(|| params.state.clone())
        .to_lowercase()
}

/// Drives one ingestion run end to end. Cheap to clone; all collaborators
/// are injected capabilities.
#[derive(Clone)]
pub struct IngestionRunner {
    registry: Arc<AdapterRegistry>,
    store: Arc<dyn PropertyStore>,
    events: Arc<dyn EventLog>,
    locks: Arc<KeyLocks>,
    dlq: Arc<DeadLetterStore>,
    http: Arc<HttpFetcher>,
    enrichment: Arc<EnrichmentClient>,
    breaker: Arc<CircuitBreaker>,
    volume: Arc<VolumeTracker>,
    adapter_deadline: Duration,
}

impl IngestionRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AdapterRegistry>,
        store: Arc<dyn PropertyStore>,
        events: Arc<dyn EventLog>,
        dlq: Arc<DeadLetterStore>,
        http: Arc<HttpFetcher>,
        enrichment: Arc<EnrichmentClient>,
        breaker_config: BreakerConfig,
        yield_threshold: f64,
        adapter_deadline: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            events,
            locks: Arc::new(KeyLocks::new()),
            dlq,
            http,
            enrichment,
            breaker: Arc::new(CircuitBreaker::new(breaker_config)),
            volume: Arc::new(VolumeTracker::new(yield_threshold)),
            adapter_deadline,
        }
    }

    pub fn volume(&self) -> &VolumeTracker {
        &self.volume
    }

    pub fn store(&self) -> &Arc<dyn PropertyStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<dyn EventLog> {
        &self.events
    }

    pub async fn run_saved_search(&self, search: &SavedSearch) -> IngestionResult {
        let params = SearchParams::from_filter("NJ", &search.filter);
        self.run(&params).await
    }

    /// One full run: every enabled adapter for the state, in parallel.
    pub async fn run(&self, params: &SearchParams) -> IngestionResult {
        let adapters = self.registry.adapters_for_state(&params.state);
        self.run_adapters(params, adapters).await
    }

    /// Run a single adapter by id (manual triggers, probe runs).
    pub async fn run_single(&self, adapter_id: &str, params: &SearchParams) -> IngestionResult {
        let adapters = self
            .registry
            .adapter_by_id(adapter_id)
            .into_iter()
            .collect();
        self.run_adapters(params, adapters).await
    }

    /// Run an explicit adapter set. `run`/`run_single` resolve theirs from
    /// the registry; callers with hand-built adapters come through here.
    pub async fn run_adapters(
        &self,
        params: &SearchParams,
        adapters: Vec<(SourceSpec, Arc<dyn SourceAdapter>)>,
    ) -> IngestionResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, state = %params.state, adapters = adapters.len(), "ingestion run starting");

        let mut set = JoinSet::new();
        for (spec, adapter) in adapters {
            let runner = self.clone();
            let params = params.clone();
            let deadline = self.adapter_deadline;
            set.spawn(async move {
                let adapter_id = spec.id.clone();
                match tokio::time::timeout(deadline, runner.run_adapter(spec, adapter, &params))
                    .await
                {
                    Ok(summary) => summary,
                    Err(_) => AdapterIngestionSummary::failed(
                        &adapter_id,
                        AdapterDisposition::TimedOut,
                        "timeout".to_string(),
                    ),
                }
            });
        }

        let mut summaries = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(summary) => summaries.push(summary),
                Err(err) => warn!(error = %err, "adapter task panicked"),
            }
        }
        summaries.sort_by(|a, b| a.adapter_id.cmp(&b.adapter_id));

        // Moving-average counters update once, at the end of the run.
        let today = started_at.date_naive();
        let region = region_of(params);
        for summary in &summaries {
            if summary.disposition == AdapterDisposition::Succeeded {
                self.volume
                    .record(&summary.adapter_id, &region, summary.raw_count, today)
                    .await;
            }
        }

        let (enriched, enrichment_failures) = self.enrich_dirty(started_at).await;

        let finished_at = Utc::now();
        info!(%run_id, enriched, "ingestion run finished");
        IngestionResult {
            run_id,
            started_at,
            finished_at,
            summaries,
            enriched,
            enrichment_failures,
        }
    }

    async fn run_adapter(
        &self,
        spec: SourceSpec,
        adapter: Arc<dyn SourceAdapter>,
        params: &SearchParams,
    ) -> AdapterIngestionSummary {
        let now = Utc::now();
        match self.breaker.check(&spec.id, now).await {
            BreakerDecision::Skip => {
                return AdapterIngestionSummary::failed(
                    &spec.id,
                    AdapterDisposition::CircuitOpen,
                    IngestError::CircuitOpen(spec.id.clone()).to_string(),
                );
            }
            BreakerDecision::Probe => {
                info!(adapter = %spec.id, "circuit half-open; probing");
            }
            BreakerDecision::Proceed => {}
        }

        // One automatic retry on search failure.
        let batch = match adapter.search(&self.http, params).await {
            Ok(batch) => batch,
            Err(AdapterError::RateLimited(msg)) => {
                self.breaker.cool_down(&spec.id, now).await;
                return AdapterIngestionSummary::failed(
                    &spec.id,
                    AdapterDisposition::Failed,
                    IngestError::RateLimited(msg).to_string(),
                );
            }
            Err(first_err) => {
                warn!(adapter = %spec.id, error = %first_err, "search failed; retrying once");
                match adapter.search(&self.http, params).await {
                    Ok(batch) => batch,
                    Err(err) => {
                        return AdapterIngestionSummary::failed(
                            &spec.id,
                            AdapterDisposition::Failed,
                            err.to_string(),
                        );
                    }
                }
            }
        };

        let mut summary = AdapterIngestionSummary::empty(&spec.id);
        summary.raw_count = batch.len();

        // Yield-threshold guard: a collapsed batch never touches the store.
        let region = region_of(params);
        if let Err(err) = self
            .volume
            .check_batch(&spec.id, &region, batch.len(), now.date_naive())
            .await
        {
            warn!(adapter = %spec.id, error = %err, "batch rejected by yield threshold");
            return AdapterIngestionSummary::failed(
                &spec.id,
                AdapterDisposition::VolumeAnomaly,
                err.to_string(),
            );
        }

        // Schema-drift breaker: a degraded parse serves stale data instead.
        if let Some(err) = self.breaker.evaluate_batch(&spec.id, &batch, now).await {
            return AdapterIngestionSummary::failed(
                &spec.id,
                AdapterDisposition::CircuitOpen,
                err.to_string(),
            );
        }

        let keywords = self.registry.profile().stage_keywords;
        for raw in &batch {
            match normalize_raw_listing_with(keywords, raw) {
                Err(reason) => {
                    summary.items_skipped_normalization += 1;
                    tracing::debug!(adapter = %spec.id, %reason, "row skipped by normalization");
                }
                Ok(listing) => {
                    let outcome = upsert_listing(
                        self.store.as_ref(),
                        self.events.as_ref(),
                        &self.locks,
                        &listing,
                        spec.reliability,
                        Utc::now(),
                    )
                    .await;
                    match outcome {
                        Ok(outcome) => {
                            summary.normalized_count += 1;
                            if outcome.created {
                                summary.created_count += 1;
                            } else {
                                summary.updated_count += 1;
                            }
                        }
                        Err(err) => {
                            summary.items_failed_processing += 1;
                            let letter = DeadLetter {
                                adapter_id: spec.id.clone(),
                                error: err.to_string(),
                                payload: serde_json::to_value(raw)
                                    .unwrap_or(serde_json::Value::Null),
                                quarantined_at: Utc::now(),
                            };
                            if let Err(dlq_err) = self.dlq.quarantine(&letter).await {
                                warn!(adapter = %spec.id, error = %dlq_err, "DLQ write failed");
                            }
                        }
                    }
                }
            }
        }

        summary
    }

    /// Post-upsert enrichment of everything this run marked dirty.
    async fn enrich_dirty(&self, since: DateTime<Utc>) -> (usize, usize) {
        let candidates = match self.store.updated_since(since).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(error = %err, "could not load enrichment candidates");
                return (0, 0);
            }
        };

        let mut enriched = 0;
        let mut failures = 0;
        for mut property in candidates {
            if !property.enrichment_dirty {
                continue;
            }
            let attempt = self.enrichment.enrich(&mut property, Utc::now()).await;
            match &attempt {
                EnrichmentAttempt::Failed(reason) => {
                    failures += 1;
                    tracing::debug!(property = %property.id, %reason, "enrichment attempt failed");
                }
                EnrichmentAttempt::Scored | EnrichmentAttempt::AutoRejected => enriched += 1,
            }
            if let Err(err) = self.store.update(property).await {
                warn!(error = %err, "persisting enrichment result failed");
            }
        }
        (enriched, failures)
    }
}
