//! txwatch - payment telemetry and alerting server.
//!
//! Hosts the ingest API, the rule registry, the alerts query surface, and
//! (unless disabled) the detector loop and enrichment workers in one
//! process. Exit codes: 0 normal shutdown, 1 configuration error,
//! 2 dependency unavailable at startup, 130 interrupted.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use txwatch_backend::{
    api::{self, AppState},
    detector::Detector,
    enricher::{backend_for, Enricher},
    ingest::Ingestor,
    metrics::MetricStore,
    models::Config,
    store::{BaselineStore, EventLog, IncidentStore, RuleRegistry},
};

const EXIT_CONFIG: u8 = 1;
const EXIT_DEPENDENCY: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

/// Enrichment queue depth; sized for bursts of simultaneous incidents.
const ENRICH_QUEUE_DEPTH: usize = 256;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    info!("🚀 txwatch starting");
    info!(db_path = %config.db_path, bind = %config.bind_addr, "configuration loaded");

    let (event_log, rules, incidents, baselines) = match open_stores(&config) {
        Ok(stores) => stores,
        Err(e) => {
            error!(error = %e, "storage unavailable at startup");
            return ExitCode::from(EXIT_DEPENDENCY);
        }
    };
    info!(events = event_log.len(), "📊 event log opened");

    let metrics = Arc::new(MetricStore::new(config.bucket_ttl_seconds));
    let ingestor = Arc::new(Ingestor::new(
        event_log.clone(),
        metrics.clone(),
        config.ingest_max_inflight,
    ));

    // Sweep expired buckets once a minute; reads already skip them.
    {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let removed = metrics.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "expired metric buckets swept");
                }
            }
        });
    }

    let backend = match backend_for(
        config.llm_provider,
        config.llm_api_key.as_deref(),
        Duration::from_secs(config.llm_timeout_seconds),
    ) {
        Ok(backend) => backend,
        Err(e) => {
            error!(error = %e, "LLM client construction failed");
            return ExitCode::from(EXIT_DEPENDENCY);
        }
    };

    let (enrich_tx, enrich_rx) = mpsc::channel(ENRICH_QUEUE_DEPTH);
    let enricher = Arc::new(Enricher::new(
        incidents.clone(),
        backend,
        config.llm_max_retries,
    ));
    enricher.spawn_workers(enrich_rx, config.enricher_workers);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if config.detector_enabled {
        let detector = Arc::new(Detector::new(
            config.clone(),
            metrics.clone(),
            event_log.clone(),
            rules.clone(),
            incidents.clone(),
            enrich_tx,
        ));
        tokio::spawn(detector.run(shutdown_rx));
    } else {
        warn!("detector disabled (DETECTOR_ENABLED=0), this instance only ingests");
        drop(shutdown_rx);
    }

    let state = AppState {
        config: config.clone(),
        ingestor,
        event_log,
        rules,
        incidents,
        baselines,
    };
    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(
            txwatch_backend::middleware::logging::request_logging,
        ));

    let listener = match TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %config.bind_addr, "failed to bind");
            return ExitCode::from(EXIT_DEPENDENCY);
        }
    };
    info!(addr = %config.bind_addr, "🎯 API server listening");

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flag.store(true, Ordering::SeqCst);
            info!("interrupt received, shutting down");
        }
    });

    let result = serve.await;
    let _ = shutdown_tx.send(true);

    if let Err(e) = result {
        error!(error = %e, "server error");
        return ExitCode::from(EXIT_DEPENDENCY);
    }
    if interrupted.load(Ordering::SeqCst) {
        return ExitCode::from(EXIT_INTERRUPTED);
    }
    ExitCode::SUCCESS
}

type Stores = (
    Arc<EventLog>,
    Arc<RuleRegistry>,
    Arc<IncidentStore>,
    Arc<BaselineStore>,
);

fn open_stores(config: &Config) -> anyhow::Result<Stores> {
    Ok((
        Arc::new(EventLog::open(&config.db_path)?),
        Arc::new(RuleRegistry::open(&config.db_path)?),
        Arc::new(IncidentStore::open(&config.db_path)?),
        Arc::new(BaselineStore::open(&config.db_path)?),
    ))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "txwatch_backend=info,txwatch=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
