//! Best-effort risk enrichment via the external scoring service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use njff_core::error::IngestError;
use njff_core::model::{Property, RiskAnalysis, RiskBand};
use njff_storage::http::TokenBucket;

pub const ENRICHMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Equity this far under water skips the service entirely.
pub const AUTO_REJECT_EQUITY_PCT: f64 = -20.0;

pub const UNAVAILABLE_SUMMARY: &str = "unavailable";

/// Trimmed property view sent to the scoring service. Timelines and raw
/// source blobs are omitted to bound token cost.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentRequest {
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub stage: String,
    pub status: Option<String>,
    pub sale_date: Option<String>,
    pub opening_bid: Option<f64>,
    pub estimated_value: Option<f64>,
    pub equity_pct: Option<f64>,
    pub occupancy: Option<String>,
    pub notes: Option<String>,
}

impl EnrichmentRequest {
    pub fn from_property(property: &Property) -> Self {
        Self {
            address: property.address.full.clone(),
            city: property.address.city.clone(),
            state: property.address.state.clone(),
            zip: property.address.zip.clone(),
            stage: property.event.stage.as_str().to_string(),
            status: property.event.status.clone(),
            sale_date: property.event.sale_date.map(|d| d.to_string()),
            opening_bid: property.event.opening_bid,
            estimated_value: property.estimated_value,
            equity_pct: property.equity_pct(),
            occupancy: property.occupancy.clone(),
            notes: property.notes.clone(),
        }
    }
}

/// External risk-scoring capability. The raw LLM client lives behind this.
#[async_trait]
pub trait RiskScorer: Send + Sync {
    async fn score(&self, request: &EnrichmentRequest) -> Result<RiskAnalysis, IngestError>;
}

/// Wire shape of the scoring service response, validated structurally
/// before anything touches a property.
#[derive(Debug, Deserialize)]
struct ScoreResponse {
    score: i64,
    band: String,
    summary: String,
    rationale: String,
}

fn parse_band(text: &str) -> Option<RiskBand> {
    match text.trim().to_lowercase().as_str() {
        "low" => Some(RiskBand::Low),
        "moderate" | "medium" => Some(RiskBand::Moderate),
        "high" => Some(RiskBand::High),
        "unknown" => Some(RiskBand::Unknown),
        _ => None,
    }
}

fn validate_response(
    response: ScoreResponse,
    analyzed_at: DateTime<Utc>,
) -> Result<RiskAnalysis, IngestError> {
    if !(0..=100).contains(&response.score) {
        return Err(IngestError::Enrichment(format!(
            "score {} outside 0-100",
            response.score
        )));
    }
    let band = parse_band(&response.band)
        .ok_or_else(|| IngestError::Enrichment(format!("unknown band {:?}", response.band)))?;
    if response.summary.trim().is_empty() || response.rationale.trim().is_empty() {
        return Err(IngestError::Enrichment("empty summary or rationale".into()));
    }
    Ok(RiskAnalysis {
        score: response.score as u8,
        band,
        summary: response.summary,
        rationale: response.rationale,
        analyzed_at,
    })
}

/// HTTP implementation against the hosted scoring endpoint.
pub struct HttpRiskScorer {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpRiskScorer {
    pub fn new(endpoint: String, api_key: String) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .timeout(ENRICHMENT_TIMEOUT)
            .build()
            .map_err(|e| IngestError::Config(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl RiskScorer for HttpRiskScorer {
    async fn score(&self, request: &EnrichmentRequest) -> Result<RiskAnalysis, IngestError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| IngestError::Enrichment(e.to_string()))?;

        if !response.status().is_success() {
            return Err(IngestError::Enrichment(format!(
                "scoring service returned {}",
                response.status()
            )));
        }

        let parsed: ScoreResponse = response
            .json()
            .await
            .map_err(|e| IngestError::Enrichment(format!("malformed response: {e}")))?;
        validate_response(parsed, Utc::now())
    }
}

/// How one enrichment attempt ended. The caller records the reason; the
/// property is never left worse than it arrived.
#[derive(Debug, Clone, PartialEq)]
pub enum EnrichmentAttempt {
    Scored,
    AutoRejected,
    Failed(String),
}

/// Rate-limited wrapper that never blocks ingestion on service failures.
pub struct EnrichmentClient {
    scorer: Arc<dyn RiskScorer>,
    bucket: TokenBucket,
}

impl EnrichmentClient {
    pub fn new(scorer: Arc<dyn RiskScorer>, tokens_per_minute: u32) -> Self {
        Self {
            scorer,
            bucket: TokenBucket::per_minute(tokens_per_minute),
        }
    }

    /// Enrich in place. On any failure the heuristic band stays and the
    /// summary reads "unavailable".
    pub async fn enrich(&self, property: &mut Property, now: DateTime<Utc>) -> EnrichmentAttempt {
        if let Some(equity) = property.equity_pct() {
            if equity < AUTO_REJECT_EQUITY_PCT {
                let previous_score = property.risk.as_ref().map(|r| r.score);
                let analysis = RiskAnalysis {
                    score: 0,
                    band: RiskBand::High,
                    summary: "auto-rejected: deep negative equity".into(),
                    rationale: format!(
                        "Equity of {equity:.1}% is below the {AUTO_REJECT_EQUITY_PCT:.0}% floor; \
                         not worth a scoring call."
                    ),
                    analyzed_at: now,
                };
                apply_analysis(property, analysis, previous_score);
                return EnrichmentAttempt::AutoRejected;
            }
        }

        self.bucket.take().await;

        let request = EnrichmentRequest::from_property(property);
        match self.scorer.score(&request).await {
            Ok(analysis) => {
                let previous_score = property.risk.as_ref().map(|r| r.score);
                apply_analysis(property, analysis, previous_score);
                EnrichmentAttempt::Scored
            }
            Err(err) => {
                warn!(property = %property.id, error = %err, "enrichment failed; keeping heuristic band");
                property.ai_summary = Some(UNAVAILABLE_SUMMARY.to_string());
                property.enrichment_dirty = false;
                EnrichmentAttempt::Failed(err.to_string())
            }
        }
    }
}

fn apply_analysis(property: &mut Property, analysis: RiskAnalysis, previous_score: Option<u8>) {
    property.change_flags.risk_score_delta =
        previous_score.map(|prev| analysis.score as i16 - prev as i16);
    property.ai_summary = Some(analysis.summary.clone());
    property.risk = Some(analysis);
    property.enrichment_dirty = false;
}
