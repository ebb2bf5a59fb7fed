//! Per-adapter circuit breaker and batch-volume anomaly tracking.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;
use tracing::warn;

use njff_core::error::IngestError;
use njff_core::model::RawListing;

/// A row missing its address, or both its sale date and status, is
/// evidence the source's markup shifted under the parser.
pub fn missing_critical_fields(raw: &RawListing) -> bool {
    let no_address = raw.address.trim().is_empty();
    let no_date = raw
        .sale_date_text
        .as_deref()
        .map_or(true, |t| t.trim().is_empty());
    let no_status = raw.status.as_deref().map_or(true, |t| t.trim().is_empty());
    no_address || (no_date && no_status)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Normal operation.
    Proceed,
    /// Tripped window expired; run one probe batch.
    Probe,
    /// Still tripped; skip the adapter, serve stale data.
    Skip,
}

#[derive(Debug, Clone, Copy)]
enum BreakerState {
    Closed,
    Open { until: DateTime<Utc> },
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Fraction of rows missing critical fields that trips the breaker.
    pub drift_threshold: f64,
    pub trip_duration: Duration,
    pub rate_limit_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            drift_threshold: 0.20,
            trip_duration: Duration::from_secs(60 * 60),
            rate_limit_cooldown: Duration::from_secs(15 * 60),
        }
    }
}

/// Process-local breaker state, one slot per adapter, with timed half-open
/// probes.
pub struct CircuitBreaker {
    config: BreakerConfig,
    states: RwLock<HashMap<String, BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub async fn check(&self, adapter_id: &str, now: DateTime<Utc>) -> BreakerDecision {
        let mut states = self.states.write().await;
        match states.get(adapter_id).copied() {
            None | Some(BreakerState::Closed) => BreakerDecision::Proceed,
            Some(BreakerState::HalfOpen) => BreakerDecision::Probe,
            Some(BreakerState::Open { until }) => {
                if now >= until {
                    states.insert(adapter_id.to_string(), BreakerState::HalfOpen);
                    BreakerDecision::Probe
                } else {
                    BreakerDecision::Skip
                }
            }
        }
    }

    /// Evaluate a parsed batch for schema drift. Returns the error that
    /// tripped the breaker, if it tripped.
    pub async fn evaluate_batch(
        &self,
        adapter_id: &str,
        batch: &[RawListing],
        now: DateTime<Utc>,
    ) -> Option<IngestError> {
        if batch.is_empty() {
            return None;
        }
        let missing = batch.iter().filter(|r| missing_critical_fields(r)).count();
        let ratio = missing as f64 / batch.len() as f64;
        if ratio > self.config.drift_threshold {
            warn!(
                adapter = adapter_id,
                missing,
                total = batch.len(),
                "schema drift tripped circuit breaker"
            );
            self.trip(adapter_id, now, self.config.trip_duration).await;
            return Some(IngestError::SchemaDrift {
                missing,
                total: batch.len(),
            });
        }
        self.record_success(adapter_id).await;
        None
    }

    pub async fn trip(&self, adapter_id: &str, now: DateTime<Utc>, duration: Duration) {
        let until = now + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
        self.states
            .write()
            .await
            .insert(adapter_id.to_string(), BreakerState::Open { until });
    }

    /// Rate-limit / CAPTCHA response: shorter cool-down than a drift trip.
    pub async fn cool_down(&self, adapter_id: &str, now: DateTime<Utc>) {
        self.trip(adapter_id, now, self.config.rate_limit_cooldown).await;
    }

    pub async fn record_success(&self, adapter_id: &str) {
        self.states
            .write()
            .await
            .insert(adapter_id.to_string(), BreakerState::Closed);
    }
}

/// 30-day moving average of batch sizes per `(adapter, region)`, used for
/// the yield-threshold guard. Read during runs, updated atomically at the
/// end of each run.
pub struct VolumeTracker {
    window_days: i64,
    /// Batches below this fraction of the average are rejected.
    threshold: f64,
    samples: RwLock<HashMap<(String, String), Vec<(NaiveDate, usize)>>>,
}

impl VolumeTracker {
    pub fn new(threshold: f64) -> Self {
        Self {
            window_days: 30,
            threshold,
            samples: RwLock::new(HashMap::new()),
        }
    }

    async fn average(&self, adapter_id: &str, region: &str, today: NaiveDate) -> Option<f64> {
        let samples = self.samples.read().await;
        let history = samples.get(&(adapter_id.to_string(), region.to_string()))?;
        let cutoff = today - chrono::Duration::days(self.window_days);
        let recent: Vec<usize> = history
            .iter()
            .filter(|(day, _)| *day >= cutoff)
            .map(|(_, size)| *size)
            .collect();
        if recent.is_empty() {
            return None;
        }
        Some(recent.iter().sum::<usize>() as f64 / recent.len() as f64)
    }

    /// Reject a batch that is a small fraction of the recent average.
    /// Adapters with no history always pass.
    pub async fn check_batch(
        &self,
        adapter_id: &str,
        region: &str,
        size: usize,
        today: NaiveDate,
    ) -> Result<(), IngestError> {
        let Some(average) = self.average(adapter_id, region, today).await else {
            return Ok(());
        };
        let threshold = average * self.threshold;
        if (size as f64) < threshold {
            return Err(IngestError::VolumeAnomaly {
                got: size,
                average,
                threshold,
            });
        }
        Ok(())
    }

    pub async fn record(&self, adapter_id: &str, region: &str, size: usize, today: NaiveDate) {
        let mut samples = self.samples.write().await;
        let history = samples
            .entry((adapter_id.to_string(), region.to_string()))
            .or_default();
        history.push((today, size));
        let cutoff = today - chrono::Duration::days(self.window_days);
        history.retain(|(day, _)| *day >= cutoff);
    }
}
