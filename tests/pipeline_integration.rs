//! End-to-end pipeline tests: seeded traffic, directly driven detector
//! ticks (no timers), and a stubbed LLM backend.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;

use txwatch_backend::{
    detector::Detector,
    dimensions::event_keys,
    enricher::{Enricher, EnrichmentJob, ExplanationBackend},
    error::CoreError,
    ingest::Ingestor,
    metrics::MetricStore,
    models::{
        Config, EnrichmentStatus, Event, IncidentState, IngestRequest, LlmProvider, MetricType,
        Rule, RuleOperator, Severity, TxStatus,
    },
    store::{EventLog, IncidentStore, RuleRegistry},
};

fn test_config() -> Config {
    Config {
        db_path: String::new(),
        bind_addr: String::new(),
        tick_interval_seconds: 10,
        rule_refresh_seconds: 0,
        window_minutes_rate: 10,
        min_consecutive_errors: 8,
        recovery_threshold: 5,
        cooldown_seconds: 600,
        bucket_ttl_seconds: 1800,
        llm_provider: LlmProvider::None,
        llm_timeout_seconds: 15,
        llm_max_retries: 2,
        llm_api_key: None,
        enricher_workers: 1,
        ingest_max_inflight: 64,
        detector_enabled: true,
    }
}

struct Pipeline {
    _dir: tempfile::TempDir,
    event_log: Arc<EventLog>,
    metrics: Arc<MetricStore>,
    registry: Arc<RuleRegistry>,
    incidents: Arc<IncidentStore>,
    detector: Detector,
    enrich_rx: mpsc::Receiver<EnrichmentJob>,
    seq: u64,
}

impl Pipeline {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("txwatch.db").to_str().unwrap().to_string();
        let event_log = Arc::new(EventLog::open(&db_path).unwrap());
        let registry = Arc::new(RuleRegistry::open(&db_path).unwrap());
        let incidents = Arc::new(IncidentStore::open(&db_path).unwrap());
        let metrics = Arc::new(MetricStore::new(1800));
        let (tx, rx) = mpsc::channel(64);
        let detector = Detector::new(
            test_config(),
            metrics.clone(),
            event_log.clone(),
            registry.clone(),
            incidents.clone(),
            tx,
        );
        Pipeline {
            _dir: dir,
            event_log,
            metrics,
            registry,
            incidents,
            detector,
            enrich_rx: rx,
            seq: 0,
        }
    }

    /// Seed a historical event the way ingest would have recorded it:
    /// one log row plus the counter fan-out at its minute bucket.
    fn seed(&mut self, ts: i64, status: TxStatus, amount_usd: f64, response_code: Option<&str>) {
        self.seed_with_advice(ts, status, amount_usd, response_code, None);
    }

    fn seed_with_advice(
        &mut self,
        ts: i64,
        status: TxStatus,
        amount_usd: f64,
        response_code: Option<&str>,
        advice: Option<&str>,
    ) {
        self.seq += 1;
        let event = Event {
            event_id: format!("evt_{:06}", self.seq),
            received_at: ts,
            merchant_id: "shopito".into(),
            provider_id: "STRIPE".into(),
            country: "US".into(),
            status,
            sub_status: None,
            amount_usd,
            issuer_name: Some("CHASE".into()),
            card_brand: "VISA".into(),
            bin: "411111".into(),
            response_code: response_code.map(String::from),
            merchant_advice_code: advice.map(String::from),
            latency_ms: 45,
            raw_payload: format!("{{\"event_id\":\"evt_{:06}\"}}", self.seq),
        };
        self.event_log.append(&event).unwrap();
        let minute = MetricStore::minute_of(ts);
        for key in event_keys(&event) {
            self.metrics.incr(&key, minute, 1);
        }
    }

    /// `succeeded + errors` per minute across the trailing `minutes`
    /// minutes, ending at `now`.
    fn seed_spread(
        &mut self,
        now: i64,
        minutes: i64,
        succ_per_min: u64,
        err_per_min: u64,
        err_amount: f64,
    ) {
        let m_now = MetricStore::minute_of(now);
        for i in 0..minutes {
            let base = (m_now - i) * 60;
            for j in 0..succ_per_min {
                self.seed(base + j as i64 % 60, TxStatus::Succeeded, 20.0, None);
            }
            for j in 0..err_per_min {
                self.seed(base + j as i64 % 60, TxStatus::Error, err_amount, Some("503"));
            }
        }
    }
}

fn error_rate_rule(threshold: f64, min_transactions: u64) -> Rule {
    Rule {
        rule_id: "rule_err".into(),
        merchant_id: Some("shopito".into()),
        country: None,
        provider_id: Some("STRIPE".into()),
        issuer_name: None,
        metric: MetricType::ErrorRate,
        operator: RuleOperator::Gt,
        threshold,
        min_transactions,
        start_hour: None,
        end_hour: None,
        severity: Severity::Warning,
        active: true,
        created_at: 0,
    }
}

/// A timestamp with a known UTC hour, away from any midnight wrap.
fn base_ts(hour: u32) -> i64 {
    Utc.with_ymd_and_hms(2024, 6, 3, hour, 13, 20)
        .unwrap()
        .timestamp()
}

#[test]
fn ingested_events_land_in_one_minute_bucket() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("e.db").to_str().unwrap().to_string();
    let log = Arc::new(EventLog::open(&db).unwrap());
    let metrics = Arc::new(MetricStore::new(1800));
    let ingestor = Ingestor::new(log.clone(), metrics.clone(), 64);

    let body = |i: u32| {
        format!(
            "{{\"event_id\":\"evt_{i}\",\"merchant_id\":\"shopito\",\"provider_id\":\"STRIPE\",\
             \"country\":\"US\",\"status\":\"SUCCEEDED\",\
             \"amount\":{{\"value\":50.0,\"currency\":\"EUR\"}}}}"
        )
    };

    let mut accepted_minute = None;
    for i in 0..12u32 {
        let raw = body(i);
        let req: IngestRequest = serde_json::from_str(&raw).unwrap();
        let accepted = ingestor.ingest(req, raw).unwrap();
        accepted_minute = Some(MetricStore::minute_of(accepted.accepted_at));
    }

    // Counter reads exactly N for the dimension at that minute. The run
    // can straddle a minute boundary, so sum the two candidate buckets.
    let m = accepted_minute.unwrap();
    let total = metrics.range_sum("shopito/US/_/_/SUCCEEDED", m - 1, m + 1);
    assert_eq!(total, 12);

    // Raw payload round-trips byte for byte.
    let stored = log.get_by_id("evt_7").unwrap().unwrap();
    assert_eq!(stored.raw_payload, body(7));
    assert!((stored.amount_usd - 54.5).abs() < 1e-9);
}

#[test]
fn scenario_sample_floor_blocks_incident() {
    let mut p = Pipeline::new();
    p.registry.insert(&error_rate_rule(0.10, 30)).unwrap();

    let now = base_ts(14);
    // 28 succeeded + 2 errors within 3 minutes: below the floor of 30.
    let m = MetricStore::minute_of(now);
    for i in 0..28 {
        p.seed((m - (i % 3)) * 60 + i, TxStatus::Succeeded, 20.0, None);
    }
    p.seed((m - 1) * 60 + 30, TxStatus::Error, 15.0, Some("503"));
    p.seed(m * 60 + 30, TxStatus::Error, 15.0, Some("503"));

    let outcome = p.detector.tick(now).unwrap();
    assert_eq!(outcome.opened, 0);
    assert_eq!(p.incidents.count_active().unwrap(), 0);
}

#[test]
fn scenario_persistent_error_opens_one_warning_incident() {
    let mut p = Pipeline::new();
    p.registry.insert(&error_rate_rule(0.10, 30)).unwrap();

    let now = base_ts(14);
    // 70 succeeded + 30 errors spread evenly across 10 minutes.
    p.seed_spread(now, 10, 7, 3, 15.0);

    let outcome = p.detector.tick(now).unwrap();
    assert_eq!(outcome.opened, 1);

    let alerts = p.incidents.list(None, None, 10).unwrap();
    assert_eq!(alerts.len(), 1);
    let inc = &alerts[0];
    assert!((inc.observed_value - 0.30).abs() < 1e-9);
    assert_eq!(inc.severity, Severity::Warning);
    assert_eq!(inc.state, IncidentState::Enriching);
    assert_eq!(inc.affected_transactions, 30);
    // Revenue at risk: the 30 error amounts, from the event log.
    assert!((inc.revenue_at_risk_usd - 30.0 * 15.0).abs() < 1e-6);
    assert_eq!(inc.response_code_breakdown.get("503"), Some(&30));
    assert_eq!(inc.suggested_action, "Increase timeout or failover");
    assert_eq!(inc.enrichment_status, EnrichmentStatus::Pending);

    // Dedup invariant: further ticks update in place.
    let outcome = p.detector.tick(now + 10).unwrap();
    assert_eq!(outcome.opened, 0);
    assert_eq!(outcome.updated, 1);
    assert_eq!(p.incidents.count_active().unwrap(), 1);

    let inc = &p.incidents.list(None, None, 10).unwrap()[0];
    assert!(inc.opened_at <= inc.last_evaluated_at);
}

#[test]
fn scenario_high_error_rate_promotes_to_critical() {
    let mut p = Pipeline::new();
    p.registry.insert(&error_rate_rule(0.10, 30)).unwrap();

    let now = base_ts(14);
    // 40 succeeded + 60 errors: error rate 0.60 > 0.30 promotion bar.
    p.seed_spread(now, 10, 4, 6, 10.0);

    let outcome = p.detector.tick(now).unwrap();
    assert_eq!(outcome.opened, 1);
    let inc = &p.incidents.list(None, None, 10).unwrap()[0];
    assert!((inc.observed_value - 0.60).abs() < 1e-9);
    assert_eq!(inc.severity, Severity::Critical);
}

#[test]
fn scenario_recovery_then_cooldown_suppression() {
    let mut p = Pipeline::new();
    p.registry.insert(&error_rate_rule(0.10, 30)).unwrap();

    let t0 = base_ts(14);
    p.seed_spread(t0, 10, 7, 3, 15.0);
    assert_eq!(p.detector.tick(t0).unwrap().opened, 1);

    // Healthy flood: rate drops under the threshold, and the freshest
    // events are a clean run of successes.
    let t1 = t0 + 60;
    let m1 = MetricStore::minute_of(t1);
    for i in 0..300 {
        p.seed(m1 * 60 + (i % 50), TxStatus::Succeeded, 20.0, None);
    }
    let outcome = p.detector.tick(t1).unwrap();
    assert_eq!(outcome.recovered, 1);

    let inc = &p.incidents.list(None, None, 10).unwrap()[0];
    assert_eq!(inc.state, IncidentState::Recovered);
    let closed_at = inc.closed_at.unwrap();
    assert!(inc.opened_at <= inc.last_evaluated_at && inc.last_evaluated_at <= closed_at);

    // Re-fire two minutes later, well inside the 600 s cooldown.
    let t2 = t1 + 120;
    let m2 = MetricStore::minute_of(t2);
    for minute in [m2 - 1, m2] {
        for i in 0..20 {
            p.seed(minute * 60 + i, TxStatus::Error, 15.0, Some("503"));
        }
        for i in 0..5 {
            p.seed(minute * 60 + 30 + i, TxStatus::Succeeded, 20.0, None);
        }
    }

    let outcome = p.detector.tick(t2).unwrap();
    assert_eq!(outcome.opened, 0);
    assert_eq!(outcome.suppressed, 1);
    assert_eq!(p.incidents.count_active().unwrap(), 0);

    let suppressed = p
        .incidents
        .list(None, Some(&[IncidentState::Suppressed]), 10)
        .unwrap();
    assert_eq!(suppressed.len(), 1);

    // A second suppressed tick refreshes the marker instead of stacking.
    let outcome = p.detector.tick(t2 + 10).unwrap();
    assert_eq!(outcome.suppressed, 1);
    let suppressed = p
        .incidents
        .list(None, Some(&[IncidentState::Suppressed]), 10)
        .unwrap();
    assert_eq!(suppressed.len(), 1);
    assert_eq!(suppressed[0].last_evaluated_at, t2 + 10);
}

#[test]
fn scenario_time_bounded_rule_skips_outside_hours() {
    let mut p = Pipeline::new();
    let mut rule = error_rate_rule(0.10, 30);
    rule.start_hour = Some(9);
    rule.end_hour = Some(18);
    p.registry.insert(&rule).unwrap();

    // Satisfying traffic, evaluated at 03:00 UTC.
    let now = base_ts(3);
    p.seed_spread(now, 10, 7, 3, 15.0);

    let outcome = p.detector.tick(now).unwrap();
    assert_eq!(outcome.opened, 0);
    assert_eq!(p.incidents.count_active().unwrap(), 0);

    // Same traffic inside the window fires.
    let mut p = Pipeline::new();
    let mut rule = error_rate_rule(0.10, 30);
    rule.start_hour = Some(9);
    rule.end_hour = Some(18);
    p.registry.insert(&rule).unwrap();
    let now = base_ts(14);
    p.seed_spread(now, 10, 7, 3, 15.0);
    assert_eq!(p.detector.tick(now).unwrap().opened, 1);
}

struct TimeoutBackend;

#[async_trait]
impl ExplanationBackend for TimeoutBackend {
    async fn explain(&self, _prompt: &str) -> Result<String, CoreError> {
        Err(CoreError::TransientDependency("deadline exceeded".into()))
    }

    fn name(&self) -> &'static str {
        "timeout-stub"
    }
}

#[tokio::test]
async fn scenario_enrichment_failure_still_notifies() {
    let mut p = Pipeline::new();
    p.registry.insert(&error_rate_rule(0.10, 30)).unwrap();
    let now = base_ts(14);
    p.seed_spread(now, 10, 7, 3, 15.0);
    assert_eq!(p.detector.tick(now).unwrap().opened, 1);

    // The detector queued exactly one enrichment job.
    let job = p.enrich_rx.try_recv().unwrap();
    assert!(p.enrich_rx.try_recv().is_err());

    let enricher = Enricher::new(p.incidents.clone(), Some(Arc::new(TimeoutBackend)), 0);
    enricher.process(job).await.unwrap();

    let inc = &p.incidents.list(None, None, 10).unwrap()[0];
    assert_eq!(inc.state, IncidentState::Notified);
    assert_eq!(inc.enrichment_status, EnrichmentStatus::Failed);
    assert!(inc.llm_explanation.is_none());
}

#[test]
fn advice_code_majority_overrides_suggested_action() {
    let mut p = Pipeline::new();
    p.registry.insert(&error_rate_rule(0.10, 30)).unwrap();

    let now = base_ts(14);
    let m = MetricStore::minute_of(now);
    for i in 0..10 {
        for j in 0..7u64 {
            p.seed((m - i) * 60 + j as i64, TxStatus::Succeeded, 20.0, None);
        }
        for j in 0..3u64 {
            p.seed_with_advice(
                (m - i) * 60 + 30 + j as i64,
                TxStatus::Error,
                15.0,
                Some("503"),
                Some("TRY_AGAIN_LATER"),
            );
        }
    }

    assert_eq!(p.detector.tick(now).unwrap().opened, 1);
    let inc = &p.incidents.list(None, None, 10).unwrap()[0];
    assert_eq!(inc.suggested_action, "Pause Traffic");
}

#[test]
fn rule_refresh_picks_up_new_and_deleted_rules() {
    let mut p = Pipeline::new();
    let now = base_ts(14);
    p.seed_spread(now, 10, 7, 3, 15.0);

    // No rules yet: nothing happens.
    assert_eq!(p.detector.tick(now).unwrap().rules_evaluated, 0);

    // New rule appears after the next refresh (refresh age 0 here).
    p.registry.insert(&error_rate_rule(0.10, 30)).unwrap();
    let outcome = p.detector.tick(now + 10).unwrap();
    assert_eq!(outcome.rules_evaluated, 1);
    assert_eq!(outcome.opened, 1);

    // Soft-deleted rules stop being evaluated; the incident row remains.
    p.registry.deactivate("rule_err").unwrap();
    let outcome = p.detector.tick(now + 20).unwrap();
    assert_eq!(outcome.rules_evaluated, 0);
    assert_eq!(p.incidents.list(None, None, 10).unwrap().len(), 1);
}

#[test]
fn volume_rule_fires_and_recovers_on_flow() {
    let mut p = Pipeline::new();
    let rule = Rule {
        rule_id: "rule_vol".into(),
        merchant_id: Some("shopito".into()),
        country: None,
        provider_id: None,
        issuer_name: None,
        metric: MetricType::TotalVolume,
        operator: RuleOperator::Lt,
        threshold: 5.0,
        min_transactions: 0,
        start_hour: None,
        end_hour: None,
        severity: Severity::Critical,
        active: true,
        created_at: 0,
    };
    p.registry.insert(&rule).unwrap();

    // Two lonely events in the current minute: volume 2 < 5.
    let now = base_ts(14);
    let m = MetricStore::minute_of(now);
    p.seed(m * 60 + 1, TxStatus::Succeeded, 20.0, None);
    p.seed(m * 60 + 2, TxStatus::Succeeded, 20.0, None);

    let outcome = p.detector.tick(now).unwrap();
    assert_eq!(outcome.opened, 1);
    let inc = &p.incidents.list(None, None, 10).unwrap()[0];
    assert_eq!(inc.severity, Severity::Critical);
    assert!((inc.observed_value - 2.0).abs() < 1e-9);

    // Flow returns; the incident recovers on the next tick.
    let t1 = now + 60;
    let m1 = MetricStore::minute_of(t1);
    for i in 0..20 {
        p.seed(m1 * 60 + i, TxStatus::Succeeded, 20.0, None);
    }
    let outcome = p.detector.tick(t1).unwrap();
    assert_eq!(outcome.recovered, 1);
}
