//! End-to-end ingestion runs against stub adapters and the in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use njff_adapters::{AdapterError, AdapterRegistry, SearchParams, SourceAdapter, SourceSpec};
use njff_core::error::IngestError;
use njff_core::model::{RawListing, RiskAnalysis, RiskBand, SourceType, TimelineKind};
use njff_ingest::{
    AdapterDisposition, BreakerConfig, EnrichmentClient, EnrichmentRequest, IngestionRunner,
    RiskScorer,
};
use njff_storage::dlq::DeadLetterStore;
use njff_storage::http::{HttpClientConfig, HttpFetcher};
use njff_storage::{EventLog, MemoryEventLog, MemoryPropertyStore, PropertyStore};

const REGISTRY_YAML: &str = r#"
sources:
  - id: civilview-hudson
    label: Hudson County Sheriff
    state_scope: NJ
    source_type: scraper
    reliability: 0.85
    endpoint: https://salesweb.example.com/hudson
"#;

struct StubAdapter {
    id: String,
    batch: Vec<RawListing>,
    hang: bool,
    calls: Arc<AtomicUsize>,
}

impl StubAdapter {
    fn new(id: &str, batch: Vec<RawListing>) -> Self {
        Self {
            id: id.to_string(),
            batch,
            hang: false,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn hanging(id: &str) -> Self {
        Self {
            id: id.to_string(),
            batch: Vec::new(),
            hang: true,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl SourceAdapter for StubAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        "stub"
    }

    fn source_type(&self) -> SourceType {
        SourceType::Scraper
    }

    fn supports_state(&self, code: &str) -> bool {
        code.eq_ignore_ascii_case("NJ")
    }

    async fn search(
        &self,
        _http: &HttpFetcher,
        _params: &SearchParams,
    ) -> Result<Vec<RawListing>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            tokio::time::sleep(Duration::from_secs(600)).await;
        }
        Ok(self.batch.clone())
    }
}

struct StubScorer {
    calls: AtomicUsize,
}

#[async_trait]
impl RiskScorer for StubScorer {
    async fn score(&self, _request: &EnrichmentRequest) -> Result<RiskAnalysis, IngestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RiskAnalysis {
            score: 40,
            band: RiskBand::Moderate,
            summary: "workable margin".into(),
            rationale: "bid sits comfortably under the estimate".into(),
            analyzed_at: Utc::now(),
        })
    }
}

struct Harness {
    runner: IngestionRunner,
    store: Arc<MemoryPropertyStore>,
    events: Arc<MemoryEventLog>,
    scorer: Arc<StubScorer>,
    _dlq_dir: tempfile::TempDir,
}

fn harness(deadline: Duration) -> Harness {
    let registry = Arc::new(AdapterRegistry::from_yaml(REGISTRY_YAML).unwrap());
    let store = Arc::new(MemoryPropertyStore::new());
    let events = Arc::new(MemoryEventLog::new());
    let dlq_dir = tempfile::tempdir().unwrap();
    let dlq = Arc::new(DeadLetterStore::new(dlq_dir.path()));
    let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
    let scorer = Arc::new(StubScorer {
        calls: AtomicUsize::new(0),
    });
    let enrichment = Arc::new(EnrichmentClient::new(scorer.clone(), 600));

    let runner = IngestionRunner::new(
        registry,
        store.clone() as Arc<dyn PropertyStore>,
        events.clone() as Arc<dyn EventLog>,
        dlq,
        http,
        enrichment,
        BreakerConfig::default(),
        0.10,
        deadline,
    );

    Harness {
        runner,
        store,
        events,
        scorer,
        _dlq_dir: dlq_dir,
    }
}

fn spec(id: &str) -> SourceSpec {
    SourceSpec {
        id: id.to_string(),
        label: "stub".to_string(),
        state_scope: "NJ".to_string(),
        source_type: SourceType::Scraper,
        reliability: 0.85,
        enabled: true,
        endpoint: None,
        path: None,
    }
}

fn params() -> SearchParams {
    SearchParams {
        state: "NJ".to_string(),
        ..SearchParams::default()
    }
}

fn sheriff_row(address: &str, sale_date: &str, bid: &str, est: &str) -> RawListing {
    RawListing {
        address: address.into(),
        status: Some("Scheduled".into()),
        stage_hint: Some("Sheriff Sale".into()),
        sale_date_text: Some(sale_date.into()),
        opening_bid_text: Some(bid.into()),
        est_value_text: Some(est.into()),
        plaintiff: Some("US Bank Trust".into()),
        defendant: Some("James T. Kirk".into()),
        source_name: "civilview-hudson".into(),
        source_type: SourceType::Scraper,
        ..RawListing::default()
    }
}

#[tokio::test]
async fn full_run_creates_enriches_and_stays_idempotent() {
    let h = harness(Duration::from_secs(30));
    let batch = vec![
        sheriff_row(
            "100 Garden State Pkwy, Woodbridge, NJ 07095",
            "2024-12-25",
            "$150,000.00",
            "$300,000",
        ),
        sheriff_row(
            "777 Messy Rd, Clifton, NJ 07013",
            "2024-12-18",
            "$90,000",
            "$200,000",
        ),
        // Unparseable address: counted as a normalization skip, not a failure.
        RawListing {
            address: "07095".into(),
            status: Some("Scheduled".into()),
            source_name: "civilview-hudson".into(),
            source_type: SourceType::Scraper,
            ..RawListing::default()
        },
    ];
    let adapter: Arc<dyn SourceAdapter> = Arc::new(StubAdapter::new("civilview-hudson", batch));

    let result = h
        .runner
        .run_adapters(&params(), vec![(spec("civilview-hudson"), adapter.clone())])
        .await;

    assert_eq!(result.summaries.len(), 1);
    let summary = &result.summaries[0];
    assert_eq!(summary.disposition, AdapterDisposition::Succeeded);
    assert_eq!(summary.raw_count, 3);
    assert_eq!(summary.created_count, 2);
    assert_eq!(summary.items_skipped_normalization, 1);
    assert_eq!(summary.items_failed_processing, 0);
    assert_eq!(h.store.count().await.unwrap(), 2);
    assert_eq!(result.enriched, 2);
    assert_eq!(h.scorer.calls.load(Ordering::SeqCst), 2);

    // Every property got its analysis and kept its summary.
    for p in h.store.updated_since(result.started_at).await.unwrap() {
        assert_eq!(p.risk.as_ref().unwrap().score, 40);
        assert!(!p.enrichment_dirty);
    }

    // Second identical run: updates, no new properties, entries, or scoring.
    let second = h
        .runner
        .run_adapters(&params(), vec![(spec("civilview-hudson"), adapter)])
        .await;
    let summary = &second.summaries[0];
    assert_eq!(summary.created_count, 0);
    assert_eq!(summary.updated_count, 2);
    assert_eq!(h.store.count().await.unwrap(), 2);
    assert_eq!(second.enriched, 0);
    assert_eq!(h.scorer.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.events.all().await.len(), 2);
}

#[tokio::test]
async fn tiny_batch_against_established_average_is_rejected() {
    let h = harness(Duration::from_secs(30));
    let today = Utc::now().date_naive();
    for i in 1..=10i64 {
        h.runner
            .volume()
            .record("civilview-hudson", "nj", 50, today - chrono::Duration::days(i))
            .await;
    }

    let batch = vec![sheriff_row(
        "1 Lone St, Newark, NJ 07102",
        "2024-12-25",
        "$100,000",
        "$200,000",
    )];
    let adapter: Arc<dyn SourceAdapter> = Arc::new(StubAdapter::new("civilview-hudson", batch));

    let result = h
        .runner
        .run_adapters(&params(), vec![(spec("civilview-hudson"), adapter)])
        .await;

    let summary = &result.summaries[0];
    assert_eq!(summary.disposition, AdapterDisposition::VolumeAnomaly);
    assert!(summary.error.as_deref().unwrap().contains("volume anomaly"));
    // The store was never touched.
    assert_eq!(h.store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn schema_drift_trips_the_breaker_and_preserves_existing_data() {
    let h = harness(Duration::from_secs(30));

    // Day one: a healthy batch.
    let good: Arc<dyn SourceAdapter> = Arc::new(StubAdapter::new(
        "civilview-hudson",
        vec![sheriff_row(
            "100 Garden State Pkwy, Woodbridge, NJ 07095",
            "2024-12-25",
            "$150,000",
            "$300,000",
        )],
    ));
    h.runner
        .run_adapters(&params(), vec![(spec("civilview-hudson"), good)])
        .await;
    assert_eq!(h.store.count().await.unwrap(), 1);

    // Day two: the source's markup shifted; most rows lost their fields.
    let drifted_rows = vec![
        sheriff_row("100 Garden State Pkwy, Woodbridge, NJ 07095", "2024-12-25", "$150,000", "$300,000"),
        RawListing {
            address: "".into(),
            source_name: "civilview-hudson".into(),
            ..RawListing::default()
        },
        RawListing {
            address: "2 Broken Row, Newark, NJ 07102".into(),
            source_name: "civilview-hudson".into(),
            ..RawListing::default()
        },
    ];
    let drifted = StubAdapter::new("civilview-hudson", drifted_rows);
    let drift_calls = drifted.calls.clone();
    let drifted: Arc<dyn SourceAdapter> = Arc::new(drifted);

    let result = h
        .runner
        .run_adapters(&params(), vec![(spec("civilview-hudson"), drifted.clone())])
        .await;
    let summary = &result.summaries[0];
    assert_eq!(summary.disposition, AdapterDisposition::CircuitOpen);
    assert!(summary.error.as_deref().unwrap().contains("schema drift"));

    // Existing data is served stale, never deleted.
    assert_eq!(h.store.count().await.unwrap(), 1);
    assert_eq!(drift_calls.load(Ordering::SeqCst), 1);

    // While tripped, the adapter is not even called.
    let result = h
        .runner
        .run_adapters(&params(), vec![(spec("civilview-hudson"), drifted)])
        .await;
    assert_eq!(result.summaries[0].disposition, AdapterDisposition::CircuitOpen);
    assert_eq!(drift_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn underwater_reo_is_auto_rejected_without_a_service_call() {
    let h = harness(Duration::from_secs(30));
    let mut row = sheriff_row(
        "9 Sunk Ct, Camden, NJ 08101",
        "2024-12-25",
        "$260,000",
        "$200,000",
    );
    row.stage_hint = Some("REO".into());
    let adapter: Arc<dyn SourceAdapter> =
        Arc::new(StubAdapter::new("civilview-hudson", vec![row]));

    let result = h
        .runner
        .run_adapters(&params(), vec![(spec("civilview-hudson"), adapter)])
        .await;

    assert_eq!(result.enriched, 1);
    assert_eq!(h.scorer.calls.load(Ordering::SeqCst), 0);

    let properties = h.store.updated_since(result.started_at).await.unwrap();
    let risk = properties[0].risk.as_ref().unwrap();
    assert_eq!(risk.score, 0);
    assert_eq!(risk.band, RiskBand::High);
    assert!(risk.summary.starts_with("auto-rejected"));
}

#[tokio::test]
async fn hung_adapter_hits_the_deadline() {
    let h = harness(Duration::from_millis(200));
    let adapter: Arc<dyn SourceAdapter> = Arc::new(StubAdapter::hanging("civilview-hudson"));

    let result = h
        .runner
        .run_adapters(&params(), vec![(spec("civilview-hudson"), adapter)])
        .await;

    let summary = &result.summaries[0];
    assert_eq!(summary.disposition, AdapterDisposition::TimedOut);
    assert_eq!(summary.error.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn adjournment_flows_through_a_full_run() {
    let h = harness(Duration::from_secs(30));
    let first: Arc<dyn SourceAdapter> = Arc::new(StubAdapter::new(
        "civilview-hudson",
        vec![sheriff_row(
            "777 Messy Rd, Clifton, NJ 07013",
            "2023-12-25",
            "$150,000",
            "$300,000",
        )],
    ));
    h.runner
        .run_adapters(&params(), vec![(spec("civilview-hudson"), first)])
        .await;

    let adjourned: Arc<dyn SourceAdapter> = Arc::new(StubAdapter::new(
        "civilview-hudson",
        vec![sheriff_row(
            "777 Messy   Road, Clifton Twp, NJ 07013",
            "2024-01-15",
            "$150,000",
            "$300,000",
        )],
    ));
    h.runner
        .run_adapters(&params(), vec![(spec("civilview-hudson"), adjourned)])
        .await;

    // Same property despite the messy address; one adjournment entry.
    assert_eq!(h.store.count().await.unwrap(), 1);
    let entries = h.events.all().await;
    let adjournments: Vec<_> = entries
        .iter()
        .filter(|e| e.kind == TimelineKind::SheriffSaleAdjourned)
        .collect();
    assert_eq!(adjournments.len(), 1);
    assert_eq!(adjournments[0].payload["original_date"], "2023-12-25");
    assert_eq!(adjournments[0].payload["new_date"], "2024-01-15");
}
