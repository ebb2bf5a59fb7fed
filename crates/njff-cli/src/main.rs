//! njff command-line interface.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use njff_adapters::{AdapterRegistry, SearchParams};
use njff_alerts::{AlertEngine, MemoryAlertLedger, MemorySavedSearchStore};
use njff_core::error::IngestError;
use njff_ingest::{
    reconcile, BreakerConfig, EnrichmentClient, HttpRiskScorer, IngestConfig, IngestionResult,
    IngestionRunner,
};
use njff_storage::dlq::DeadLetterStore;
use njff_storage::http::{HttpClientConfig, HttpFetcher};
use njff_storage::{MemoryEventLog, MemoryPropertyStore, PropertyStore};

#[derive(Debug, Parser)]
#[command(name = "njff")]
#[command(about = "NJ foreclosure ingestion, enrichment, and alert pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass over the configured adapters.
    Ingest {
        /// Restrict the run to a single adapter id.
        #[arg(long)]
        adapter: Option<String>,
        #[arg(long, default_value = "NJ")]
        state: String,
        #[arg(long)]
        city: Option<String>,
        #[arg(long)]
        county: Option<String>,
        #[arg(long)]
        zip: Option<String>,
        #[arg(long)]
        max_price: Option<f64>,
    },
    /// Sweep for listings that disappeared from their sources.
    Reconcile,
    /// Match recent changes against saved searches and print digests.
    Alerts,
    /// Print the configured source registry.
    Sources,
    /// Run the ingest and reconcile crons until interrupted.
    Schedule,
}

/// Delay between an ingestion run finishing and the alert pass over it, so
/// enrichment has settled on newly-changed records.
const ALERT_DELAY: std::time::Duration = std::time::Duration::from_secs(15 * 60);

type Alerts = AlertEngine<MemorySavedSearchStore, MemoryAlertLedger>;

struct App {
    runner: IngestionRunner,
    registry: Arc<AdapterRegistry>,
    alerts: Arc<Alerts>,
}

async fn build_app(config: &IngestConfig) -> Result<App> {
    let registry = Arc::new(
        AdapterRegistry::from_path(&config.sources_path)
            .await
            .with_context(|| format!("loading {}", config.sources_path.display()))?,
    );

    let http = Arc::new(
        HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
            ..HttpClientConfig::default()
        })
        .context("building HTTP fetcher")?,
    );

    let scorer = HttpRiskScorer::new(config.risk_endpoint.clone(), config.risk_api_key.clone())
        .context("building risk scorer")?;
    let enrichment = Arc::new(EnrichmentClient::new(
        Arc::new(scorer),
        config.risk_tokens_per_minute,
    ));

    let store: Arc<dyn PropertyStore> = Arc::new(MemoryPropertyStore::new());
    let events = Arc::new(MemoryEventLog::new());
    let dlq = Arc::new(DeadLetterStore::new(config.dlq_dir.clone()));

    let breaker_config = BreakerConfig {
        drift_threshold: config.drift_threshold,
        ..BreakerConfig::default()
    };

    let runner = IngestionRunner::new(
        registry.clone(),
        store.clone(),
        events,
        dlq,
        http,
        enrichment,
        breaker_config,
        config.yield_threshold,
        config.adapter_deadline,
    );

    let alerts = Arc::new(AlertEngine::new(
        store.clone(),
        Arc::new(MemorySavedSearchStore::new()),
        Arc::new(MemoryAlertLedger::new()),
        Utc::now() - chrono::Duration::hours(24),
    ));

    Ok(App {
        runner,
        registry,
        alerts,
    })
}

fn print_result(result: &IngestionResult) {
    println!(
        "ingest complete: run_id={} adapters={} created={} updated={} enriched={}",
        result.run_id,
        result.summaries.len(),
        result.created_total(),
        result.updated_total(),
        result.enriched,
    );
    for summary in &result.summaries {
        println!(
            "  {}: raw={} normalized={} created={} updated={} skipped={} failed={}{}",
            summary.adapter_id,
            summary.raw_count,
            summary.normalized_count,
            summary.created_count,
            summary.updated_count,
            summary.items_skipped_normalization,
            summary.items_failed_processing,
            summary
                .error
                .as_deref()
                .map(|e| format!(" error={e}"))
                .unwrap_or_default(),
        );
    }
}

fn exit_code_for(result: &IngestionResult) -> ExitCode {
    if result.all_circuit_broken() {
        ExitCode::from(3)
    } else if result.all_volume_anomalies() {
        ExitCode::from(4)
    } else if result.any_failure() {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

async fn run_schedule(config: IngestConfig, app: App) -> Result<()> {
    let scheduler = JobScheduler::new().await.context("creating scheduler")?;

    for cron in [&config.ingest_cron_1, &config.ingest_cron_2] {
        let runner = app.runner.clone();
        let alerts = app.alerts.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let runner = runner.clone();
            let alerts = alerts.clone();
            Box::pin(async move {
                let params = SearchParams {
                    state: "NJ".to_string(),
                    ..SearchParams::default()
                };
                let result = runner.run(&params).await;
                info!(run_id = %result.run_id, created = result.created_total(), "scheduled ingest finished");

                // Alert pass trails the run so enrichment has landed.
                tokio::spawn(async move {
                    tokio::time::sleep(ALERT_DELAY).await;
                    let digests = alerts.run(Utc::now()).await;
                    info!(digests = digests.len(), "scheduled alert pass finished");
                });
            })
        })
        .with_context(|| format!("creating ingest job for cron {cron}"))?;
        scheduler.add(job).await.context("adding ingest job")?;
    }

    let runner = app.runner.clone();
    let reconcile_job = Job::new_async(config.reconcile_cron.as_str(), move |_uuid, _lock| {
        let runner = runner.clone();
        Box::pin(async move {
            let now = Utc::now();
            match reconcile(
                runner.store().as_ref(),
                runner.events().as_ref(),
                now.date_naive(),
                now,
            )
            .await
            {
                Ok(outcome) => info!(
                    marked_pending = outcome.marked_pending,
                    "scheduled reconciliation finished"
                ),
                Err(err) => error!(error = %err, "scheduled reconciliation failed"),
            }
        })
    })
    .with_context(|| format!("creating reconcile job for cron {}", config.reconcile_cron))?;
    scheduler.add(reconcile_job).await.context("adding reconcile job")?;

    scheduler.start().await.context("starting scheduler")?;
    info!("scheduler running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("njff=info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match IngestConfig::from_env() {
        Ok(config) => config,
        Err(err @ IngestError::Config(_)) => {
            error!(error = %err, "configuration error");
            return ExitCode::from(2);
        }
        Err(err) => {
            error!(error = %err, "startup failed");
            return ExitCode::from(1);
        }
    };

    let app = match build_app(&config).await {
        Ok(app) => app,
        Err(err) => {
            error!(error = %err, "configuration error");
            return ExitCode::from(2);
        }
    };

    match cli.command.unwrap_or(Commands::Ingest {
        adapter: None,
        state: "NJ".to_string(),
        city: None,
        county: None,
        zip: None,
        max_price: None,
    }) {
        Commands::Ingest {
            adapter,
            state,
            city,
            county,
            zip,
            max_price,
        } => {
            let params = SearchParams {
                state,
                city,
                county,
                zip,
                max_price,
            };
            let result = match adapter {
                Some(id) => app.runner.run_single(&id, &params).await,
                None => app.runner.run(&params).await,
            };
            print_result(&result);
            exit_code_for(&result)
        }
        Commands::Reconcile => {
            let now = Utc::now();
            match reconcile(
                app.runner.store().as_ref(),
                app.runner.events().as_ref(),
                now.date_naive(),
                now,
            )
            .await
            {
                Ok(outcome) => {
                    println!(
                        "reconcile complete: examined={} marked_pending={}",
                        outcome.examined, outcome.marked_pending
                    );
                    for task in &outcome.tasks {
                        println!(
                            "  pending verification: {} (sale date {})",
                            task.dedupe_key, task.sale_date
                        );
                    }
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    error!(error = %err, "reconcile failed");
                    ExitCode::from(1)
                }
            }
        }
        Commands::Alerts => {
            let digests = app.alerts.run(Utc::now()).await;
            if digests.is_empty() {
                println!("no alerts to send");
            }
            for digest in &digests {
                println!(
                    "user {}: {} matches{}",
                    digest.user_id,
                    digest.items.len(),
                    digest
                        .hint
                        .as_deref()
                        .map(|h| format!(" ({h})"))
                        .unwrap_or_default()
                );
                for item in &digest.items {
                    println!("  {:?}: {}", item.reason, item.address);
                }
            }
            ExitCode::SUCCESS
        }
        Commands::Sources => {
            for spec in app.registry.specs() {
                println!(
                    "{} [{}] state={} reliability={:.2} enabled={}",
                    spec.id,
                    spec.label,
                    spec.state_scope,
                    spec.reliability,
                    spec.enabled
                );
            }
            ExitCode::SUCCESS
        }
        Commands::Schedule => match run_schedule(config, app).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!(error = %err, "scheduler failed");
                ExitCode::from(1)
            }
        },
    }
}
