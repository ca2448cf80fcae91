//! txwatch-detector - standalone detector + enricher.
//!
//! Runs the evaluation loop against an existing database without hosting
//! the ingest API. Counters are derived from the trailing window of the
//! event log on each tick, since the ingest process owns the live metric
//! store. Exit codes match the server: 0 normal, 1 configuration error,
//! 2 dependency unavailable, 130 interrupted.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use txwatch_backend::{
    detector::Detector,
    dimensions::event_keys,
    enricher::{backend_for, Enricher},
    metrics::MetricStore,
    models::Config,
    store::{EventLog, IncidentStore, RuleRegistry},
};

#[derive(Debug, Parser)]
#[command(name = "txwatch-detector", about = "Standalone anomaly detector")]
struct Args {
    /// Database path; overrides DB_PATH.
    #[arg(long, env = "DB_PATH")]
    db_path: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "txwatch_backend=info,txwatch_detector=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(1);
        }
    };
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }

    let (event_log, registry, incidents) = match open_stores(&config) {
        Ok(stores) => stores,
        Err(e) => {
            error!(error = %e, "storage unavailable at startup");
            return ExitCode::from(2);
        }
    };

    let backend = match backend_for(
        config.llm_provider,
        config.llm_api_key.as_deref(),
        Duration::from_secs(config.llm_timeout_seconds),
    ) {
        Ok(backend) => backend,
        Err(e) => {
            error!(error = %e, "LLM client construction failed");
            return ExitCode::from(2);
        }
    };

    let (enrich_tx, enrich_rx) = mpsc::channel(256);
    let enricher = Arc::new(Enricher::new(
        incidents.clone(),
        backend,
        config.llm_max_retries,
    ));
    enricher.spawn_workers(enrich_rx, config.enricher_workers);

    let metrics = Arc::new(MetricStore::new(config.bucket_ttl_seconds));
    let detector = Arc::new(Detector::new(
        config.clone(),
        metrics.clone(),
        event_log.clone(),
        registry,
        incidents,
        enrich_tx,
    ));

    // Counter hydration: fold the trailing log window into the local
    // store ahead of each tick. Increments are idempotent per run because
    // the store is rebuilt from scratch every time.
    let hydrate_log = event_log.clone();
    let hydrate_window = config.window_minutes_rate * 60 + 120;
    let hydrate = move |store: &MetricStore| -> anyhow::Result<()> {
        let now = chrono::Utc::now().timestamp();
        for event in hydrate_log.events_in_range(now - hydrate_window, now + 1)? {
            let minute = MetricStore::minute_of(event.received_at);
            for key in event_keys(&event) {
                store.incr(&key, minute, 1);
            }
        }
        Ok(())
    };

    info!("🔎 standalone detector starting");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_handle = tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(config.tick_interval_seconds));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown = shutdown_rx;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            let fresh = MetricStore::new(config.bucket_ttl_seconds);
            if let Err(e) = hydrate(&fresh) {
                error!(error = %e, "counter hydration failed, skipping tick");
                continue;
            }
            metrics.adopt(fresh);
            let now = chrono::Utc::now().timestamp();
            if let Err(e) = detector.tick(now) {
                error!(error = %e, "detector tick failed");
            }
        }
    });

    if tokio::signal::ctrl_c().await.is_ok() {
        info!("interrupt received, shutting down");
        let _ = shutdown_tx.send(true);
        let _ = loop_handle.await;
        return ExitCode::from(130);
    }

    let _ = loop_handle.await;
    ExitCode::SUCCESS
}

type Stores = (Arc<EventLog>, Arc<RuleRegistry>, Arc<IncidentStore>);

fn open_stores(config: &Config) -> anyhow::Result<Stores> {
    Ok((
        Arc::new(EventLog::open(&config.db_path)?),
        Arc::new(RuleRegistry::open(&config.db_path)?),
        Arc::new(IncidentStore::open(&config.db_path)?),
    ))
}
