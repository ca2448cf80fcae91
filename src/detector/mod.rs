//! The periodic anomaly-detection loop.
//!
//! One logical detector per deployment: an advisory lease on a well-known
//! metadata key keeps a second instance idle. Each tick refreshes the rule
//! snapshot, evaluates every active rule against the counters, and drives
//! the incident lifecycle. A faulty rule is skipped for the tick; the loop
//! itself only stops on shutdown.

pub mod eval;
pub mod lifecycle;
pub mod trend;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{TimeZone, Timelike, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dimensions::{rule_dimension_key, rule_response_code_pattern, KeyPattern},
    enricher::EnrichmentJob,
    metrics::MetricStore,
    models::{Config, EnrichmentStatus, Incident, IncidentState, RootCauseScope, Rule},
    store::{DimensionFilter, EventLog, IncidentStore, RuleRegistry, RuleSnapshot},
};

use eval::{observe, window_bounds, RuleObservation};

/// Per-tick work budget; ticks running past it are logged, and the next
/// tick is simply delayed (ticks never overlap).
const TICK_BUDGET: Duration = Duration::from_secs(8);

/// How many recent adverse events to sample for the advice-code override.
const ADVICE_SAMPLE: usize = 50;

pub struct Detector {
    config: Config,
    metrics: Arc<MetricStore>,
    event_log: Arc<EventLog>,
    registry: Arc<RuleRegistry>,
    snapshot: Arc<RuleSnapshot>,
    incidents: Arc<IncidentStore>,
    enrich_tx: mpsc::Sender<EnrichmentJob>,
    instance_id: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub lease_skipped: bool,
    pub rules_evaluated: usize,
    pub opened: usize,
    pub updated: usize,
    pub suppressed: usize,
    pub recovered: usize,
    pub rule_failures: usize,
}

enum RuleAction {
    Nothing,
    Opened,
    Updated,
    Suppressed,
    Recovered,
}

impl Detector {
    pub fn new(
        config: Config,
        metrics: Arc<MetricStore>,
        event_log: Arc<EventLog>,
        registry: Arc<RuleRegistry>,
        incidents: Arc<IncidentStore>,
        enrich_tx: mpsc::Sender<EnrichmentJob>,
    ) -> Self {
        let snapshot = Arc::new(RuleSnapshot::new(Duration::from_secs(
            config.rule_refresh_seconds,
        )));
        Self {
            config,
            metrics,
            event_log,
            registry,
            snapshot,
            incidents,
            enrich_tx,
            instance_id: format!("detector-{}", Uuid::new_v4()),
        }
    }

    /// Run until shutdown flips. Ticks are strictly sequential.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.config.tick_interval_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            instance = %self.instance_id,
            tick_seconds = self.config.tick_interval_seconds,
            "detector loop starting"
        );

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

            let started = Instant::now();
            let now = Utc::now().timestamp();
            match self.tick(now) {
                Ok(outcome) if outcome.lease_skipped => {
                    debug!("tick skipped, another detector holds the lease");
                }
                Ok(outcome) => {
                    debug!(
                        rules = outcome.rules_evaluated,
                        opened = outcome.opened,
                        updated = outcome.updated,
                        suppressed = outcome.suppressed,
                        recovered = outcome.recovered,
                        failures = outcome.rule_failures,
                        "tick complete"
                    );
                }
                Err(e) => warn!(error = %e, "detector tick failed"),
            }

            let elapsed = started.elapsed();
            if elapsed > TICK_BUDGET {
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    "tick exceeded budget, next tick delayed"
                );
            }
        }
        info!(instance = %self.instance_id, "detector loop stopped");
    }

    /// One evaluation pass at `now` (unix seconds). Public so tests can
    /// drive ticks without timers.
    pub fn tick(&self, now: i64) -> Result<TickOutcome> {
        let lease_ttl = (self.config.tick_interval_seconds * 3) as i64;
        if !self
            .incidents
            .try_acquire_lease(&self.instance_id, now, lease_ttl)?
        {
            return Ok(TickOutcome {
                lease_skipped: true,
                ..TickOutcome::default()
            });
        }

        self.snapshot
            .refresh_if_stale(&self.registry)
            .context("rule snapshot refresh failed")?;

        let mut outcome = TickOutcome::default();
        for rule in self.snapshot.active_rules() {
            outcome.rules_evaluated += 1;
            match self.evaluate_rule(&rule, now) {
                Ok(RuleAction::Nothing) => {}
                Ok(RuleAction::Opened) => outcome.opened += 1,
                Ok(RuleAction::Updated) => outcome.updated += 1,
                Ok(RuleAction::Suppressed) => outcome.suppressed += 1,
                Ok(RuleAction::Recovered) => outcome.recovered += 1,
                Err(e) => {
                    outcome.rule_failures += 1;
                    warn!(rule_id = %rule.rule_id, error = %e, "rule evaluation failed, will retry next tick");
                }
            }
        }
        Ok(outcome)
    }

    fn evaluate_rule(&self, rule: &Rule, now: i64) -> Result<RuleAction> {
        let observation = observe(&self.metrics, rule, self.config.window_minutes_rate, now);

        // Guards, in order. First failure skips the rule for this tick.
        if observation.total < rule.min_transactions {
            return Ok(RuleAction::Nothing);
        }
        let hour = Utc
            .timestamp_opt(now, 0)
            .single()
            .map(|dt| dt.hour() as u8)
            .unwrap_or(0);
        if !rule.in_hours(hour) {
            return Ok(RuleAction::Nothing);
        }

        let dimension_key = rule_dimension_key(rule);
        if rule.operator.holds(observation.observed_value, rule.threshold) {
            self.on_firing(rule, &observation, &dimension_key, now)
        } else {
            self.on_quiet(rule, &dimension_key, now)
        }
    }

    /// The rule condition holds this tick.
    fn on_firing(
        &self,
        rule: &Rule,
        observation: &RuleObservation,
        dimension_key: &str,
        now: i64,
    ) -> Result<RuleAction> {
        if let Some(active) = self.incidents.active_for_key(&rule.rule_id, dimension_key)? {
            let (affected, revenue) = self.impact(rule, observation, now)?;
            self.incidents.update_observation(
                &active.incident_id,
                observation.observed_value,
                affected,
                revenue,
                lifecycle::effective_severity(rule, observation.observed_value)
                    .max(active.severity),
                now,
            )?;
            // An earlier enqueue may have failed and left the incident OPEN.
            if active.state == IncidentState::Open {
                self.enqueue_enrichment(&active.incident_id, now);
            }
            return Ok(RuleAction::Updated);
        }

        if !trend::confirmed(observation, self.config.min_consecutive_errors) {
            return Ok(RuleAction::Nothing);
        }

        // Cooldown: a recently closed episode suppresses re-opening.
        if let Some(closed_at) = self.incidents.last_closed_at(&rule.rule_id, dimension_key)? {
            if now - closed_at < self.config.cooldown_seconds {
                return self.record_suppression(rule, observation, dimension_key, now);
            }
        }

        self.open_incident(rule, observation, dimension_key, now)
    }

    fn open_incident(
        &self,
        rule: &Rule,
        observation: &RuleObservation,
        dimension_key: &str,
        now: i64,
    ) -> Result<RuleAction> {
        let (affected, revenue) = self.impact(rule, observation, now)?;
        let breakdown = self.response_code_breakdown(rule, now);
        let advice = self.recent_advice(rule, now)?;
        let suggested = lifecycle::suggested_action(&breakdown, &advice);
        let severity = lifecycle::effective_severity(rule, observation.observed_value);

        let incident = Incident {
            incident_id: format!("inc_{}", Uuid::new_v4()),
            rule_id: rule.rule_id.clone(),
            dimension_key: dimension_key.to_string(),
            opened_at: now,
            last_evaluated_at: now,
            closed_at: None,
            state: IncidentState::Open,
            severity,
            observed_value: observation.observed_value,
            affected_transactions: affected,
            revenue_at_risk_usd: revenue,
            response_code_breakdown: breakdown,
            root_cause: RootCauseScope {
                merchant_id: rule.merchant_id.clone(),
                country: rule.country.clone(),
                provider_id: rule.provider_id.clone(),
                issuer_name: rule.issuer_name.clone(),
                metric: rule.metric,
            },
            llm_explanation: None,
            suggested_action: suggested.to_string(),
            enrichment_status: EnrichmentStatus::Pending,
            sla_breach_countdown_seconds: None,
        };
        self.incidents.insert(&incident)?;
        info!(
            incident_id = %incident.incident_id,
            rule_id = %rule.rule_id,
            dimension = %dimension_key,
            severity = severity.as_str(),
            observed = observation.observed_value,
            "incident opened"
        );

        self.enqueue_enrichment(&incident.incident_id, now);
        Ok(RuleAction::Opened)
    }

    fn record_suppression(
        &self,
        rule: &Rule,
        observation: &RuleObservation,
        dimension_key: &str,
        now: i64,
    ) -> Result<RuleAction> {
        if let Some(marker) = self
            .incidents
            .latest_suppressed(&rule.rule_id, dimension_key)?
        {
            self.incidents.touch(&marker.incident_id, now)?;
            return Ok(RuleAction::Suppressed);
        }

        let (affected, revenue) = self.impact(rule, observation, now)?;
        let marker = Incident {
            incident_id: format!("inc_{}", Uuid::new_v4()),
            rule_id: rule.rule_id.clone(),
            dimension_key: dimension_key.to_string(),
            opened_at: now,
            last_evaluated_at: now,
            closed_at: None,
            state: IncidentState::Suppressed,
            severity: lifecycle::effective_severity(rule, observation.observed_value),
            observed_value: observation.observed_value,
            affected_transactions: affected,
            revenue_at_risk_usd: revenue,
            response_code_breakdown: BTreeMap::new(),
            root_cause: RootCauseScope {
                merchant_id: rule.merchant_id.clone(),
                country: rule.country.clone(),
                provider_id: rule.provider_id.clone(),
                issuer_name: rule.issuer_name.clone(),
                metric: rule.metric,
            },
            llm_explanation: None,
            suggested_action: String::new(),
            enrichment_status: EnrichmentStatus::Pending,
            sla_breach_countdown_seconds: None,
        };
        self.incidents.insert(&marker)?;
        info!(
            rule_id = %rule.rule_id,
            dimension = %dimension_key,
            "re-fire inside cooldown suppressed"
        );
        Ok(RuleAction::Suppressed)
    }

    /// The rule condition does not hold: check open incidents for recovery.
    fn on_quiet(&self, rule: &Rule, dimension_key: &str, now: i64) -> Result<RuleAction> {
        let Some(active) = self.incidents.active_for_key(&rule.rule_id, dimension_key)? else {
            return Ok(RuleAction::Nothing);
        };

        let recovered = if rule.metric.is_rate() {
            let statuses = self.event_log.recent_statuses(
                &DimensionFilter::from_rule(rule),
                now - 60,
                self.config.recovery_threshold,
            )?;
            lifecycle::recovered_by_stream(&statuses, self.config.recovery_threshold)
        } else {
            // Volume windows are the last minute; its total already reads
            // in the healthy direction, which is what brought us here.
            true
        };

        if recovered {
            let moved = self.incidents.transition(
                &active.incident_id,
                &[
                    IncidentState::Open,
                    IncidentState::Enriching,
                    IncidentState::Notified,
                ],
                IncidentState::Recovered,
                Some(now),
                now,
            )?;
            if moved {
                info!(
                    incident_id = %active.incident_id,
                    rule_id = %rule.rule_id,
                    "incident recovered"
                );
                return Ok(RuleAction::Recovered);
            }
        } else {
            self.incidents.touch(&active.incident_id, now)?;
        }
        Ok(RuleAction::Nothing)
    }

    /// Adverse-event count and revenue at risk over the rule's window,
    /// from the event log (authoritative amounts, not counters).
    fn impact(&self, rule: &Rule, observation: &RuleObservation, now: i64) -> Result<(u64, f64)> {
        let Some(adverse) = rule.metric.adverse_status() else {
            return Ok((observation.total, 0.0));
        };
        let (start_minute, _) = window_bounds(now, observation.window_minutes);
        let (count, revenue) = self.event_log.adverse_summary(
            &DimensionFilter::from_rule(rule),
            adverse,
            start_minute * 60,
            now + 1,
        )?;
        Ok((count, revenue))
    }

    fn response_code_breakdown(&self, rule: &Rule, now: i64) -> BTreeMap<String, u64> {
        let window = if rule.metric.is_rate() {
            self.config.window_minutes_rate
        } else {
            1
        };
        let (start, end) = window_bounds(now, window);
        let mut breakdown = BTreeMap::new();
        for (key, count) in
            self.metrics
                .pattern_sums_by_key(&rule_response_code_pattern(rule), start, end)
        {
            if let Some(code) = KeyPattern::response_code_of(&key) {
                *breakdown.entry(code.to_string()).or_insert(0) += count;
            }
        }
        breakdown
    }

    fn recent_advice(&self, rule: &Rule, now: i64) -> Result<Vec<Option<String>>> {
        let Some(adverse) = rule.metric.adverse_status() else {
            return Ok(Vec::new());
        };
        let (start_minute, _) = window_bounds(now, self.config.window_minutes_rate);
        self.event_log.recent_advice_codes(
            &DimensionFilter::from_rule(rule),
            adverse,
            start_minute * 60,
            ADVICE_SAMPLE,
        )
    }

    /// Hand the incident to the enricher. On a full queue the incident
    /// stays OPEN and the next tick retries.
    fn enqueue_enrichment(&self, incident_id: &str, now: i64) {
        match self.enrich_tx.try_send(EnrichmentJob {
            incident_id: incident_id.to_string(),
        }) {
            Ok(()) => {
                if let Err(e) = self.incidents.transition(
                    incident_id,
                    &[IncidentState::Open],
                    IncidentState::Enriching,
                    None,
                    now,
                ) {
                    warn!(incident_id, error = %e, "failed to mark incident ENRICHING");
                }
            }
            Err(e) => {
                warn!(incident_id, error = %e, "enrichment queue full, incident stays OPEN");
            }
        }
    }
}
