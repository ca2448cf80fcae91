//! HTTP surface: ingest, rule CRUD, alerts and metrics queries.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::{
    error::CoreError,
    ingest::Ingestor,
    models::{
        Config, Incident, IncidentState, IngestRequest, MerchantBaseline, MetricType, Rule,
        RuleOperator, Severity,
    },
    store::{BaselineStore, EventLog, IncidentStore, MinuteSnapshot, RuleRegistry},
};

/// Shared application context, constructed once at startup and threaded
/// through every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub ingestor: Arc<Ingestor>,
    pub event_log: Arc<EventLog>,
    pub rules: Arc<RuleRegistry>,
    pub incidents: Arc<IncidentStore>,
    pub baselines: Arc<BaselineStore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", post(post_event))
        .route("/rules", get(get_rules).post(post_rule))
        .route("/rules/:rule_id", delete(delete_rule))
        .route("/alerts", get(get_alerts))
        .route("/metrics/recent", get(get_metrics_recent))
        .route("/merchants/:merchant_id/baseline", put(put_baseline))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<String>,
}

fn error_response(err: CoreError) -> Response {
    let status = err.http_status();
    let body = match &err {
        CoreError::Validation { field, message } => ErrorBody {
            error: message.clone(),
            field: Some(field.clone()),
        },
        other => ErrorBody {
            error: other.to_string(),
            field: None,
        },
    };
    (status, Json(body)).into_response()
}

fn internal_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: err.to_string(),
            field: None,
        }),
    )
        .into_response()
}

async fn health(State(state): State<AppState>) -> Response {
    #[derive(Serialize)]
    struct Health {
        status: &'static str,
        events: usize,
        active_incidents: u64,
        timestamp: String,
    }
    let active_incidents = state.incidents.count_active().unwrap_or(0);
    Json(Health {
        status: "ok",
        events: state.event_log.len(),
        active_incidents,
        timestamp: Utc::now().to_rfc3339(),
    })
    .into_response()
}

/// Ingest endpoint. The body is kept verbatim as the event's raw payload,
/// so it is consumed as a string and parsed from there.
async fn post_event(State(state): State<AppState>, body: String) -> Response {
    let request: IngestRequest = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(e) => {
            return error_response(CoreError::validation("body", format!("invalid JSON: {e}")));
        }
    };

    match state.ingestor.ingest(request, body) {
        Ok(accepted) => (StatusCode::OK, Json(accepted)).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Serialize)]
struct RuleListResponse {
    rules: Vec<Rule>,
    count: usize,
    timestamp: String,
}

async fn get_rules(State(state): State<AppState>) -> Response {
    match state.rules.list(false) {
        Ok(rules) => {
            let count = rules.len();
            Json(RuleListResponse {
                rules,
                count,
                timestamp: Utc::now().to_rfc3339(),
            })
            .into_response()
        }
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    #[serde(default)]
    pub merchant_id: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub issuer_name: Option<String>,
    pub metric_type: String,
    pub operator: String,
    pub threshold: f64,
    #[serde(default)]
    pub min_transactions: Option<u64>,
    #[serde(default)]
    pub start_hour: Option<u8>,
    #[serde(default)]
    pub end_hour: Option<u8>,
    #[serde(default)]
    pub severity: Option<String>,
}

fn build_rule(req: CreateRuleRequest, now: i64) -> Result<Rule, CoreError> {
    let metric = MetricType::parse(&req.metric_type).ok_or_else(|| {
        CoreError::validation("metric_type", format!("unknown metric {:?}", req.metric_type))
    })?;
    let operator = RuleOperator::parse(&req.operator).ok_or_else(|| {
        CoreError::validation("operator", format!("unknown operator {:?}", req.operator))
    })?;
    let severity = match req.severity.as_deref() {
        None => Severity::Warning,
        Some(raw) => Severity::parse(raw)
            .ok_or_else(|| CoreError::validation("severity", format!("unknown severity {raw:?}")))?,
    };

    if !req.threshold.is_finite() || req.threshold < 0.0 {
        return Err(CoreError::validation(
            "threshold",
            "must be finite and non-negative",
        ));
    }
    if metric.is_rate() && req.threshold > 1.0 {
        return Err(CoreError::validation(
            "threshold",
            "rate thresholds are a fraction between 0 and 1",
        ));
    }

    match (req.start_hour, req.end_hour) {
        (None, None) => {}
        (Some(start), Some(end)) => {
            if start > 23 || end > 24 {
                return Err(CoreError::validation(
                    "start_hour",
                    "hours are 0-23 (end may be 24)",
                ));
            }
        }
        _ => {
            return Err(CoreError::validation(
                "start_hour",
                "start_hour and end_hour must be set together",
            ));
        }
    }

    if let Some(country) = req.country.as_deref() {
        if country.len() != 2 || !country.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(CoreError::validation(
                "country",
                "must be a two-letter uppercase ISO code",
            ));
        }
    }

    Ok(Rule {
        rule_id: format!("rule_{}", Uuid::new_v4()),
        merchant_id: req.merchant_id.filter(|s| !s.is_empty()),
        country: req.country,
        provider_id: req.provider_id.filter(|s| !s.is_empty()),
        issuer_name: req.issuer_name.filter(|s| !s.is_empty()),
        metric,
        operator,
        threshold: req.threshold,
        min_transactions: req.min_transactions.unwrap_or(0),
        start_hour: req.start_hour,
        end_hour: req.end_hour,
        severity,
        active: true,
        created_at: now,
    })
}

async fn post_rule(
    State(state): State<AppState>,
    Json(request): Json<CreateRuleRequest>,
) -> Response {
    let rule = match build_rule(request, Utc::now().timestamp()) {
        Ok(rule) => rule,
        Err(err) => return error_response(err),
    };
    if let Err(e) = state.rules.insert(&rule) {
        return internal_error(e);
    }
    info!(rule_id = %rule.rule_id, metric = rule.metric.as_str(), "rule created");
    (StatusCode::CREATED, Json(rule)).into_response()
}

async fn delete_rule(State(state): State<AppState>, Path(rule_id): Path<String>) -> Response {
    match state.rules.deactivate(&rule_id) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("no rule {rule_id}"),
                field: None,
            }),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    #[serde(default)]
    pub since: Option<i64>,
    /// Comma-separated state filter, e.g. `OPEN,NOTIFIED`.
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct AlertsResponse {
    alerts: Vec<Incident>,
    count: usize,
    timestamp: String,
}

async fn get_alerts(State(state): State<AppState>, Query(query): Query<AlertsQuery>) -> Response {
    let states: Option<Vec<IncidentState>> = match query.state.as_deref() {
        None => None,
        Some(raw) => {
            let mut parsed = Vec::new();
            for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match IncidentState::parse(part) {
                    Some(state) => parsed.push(state),
                    None => {
                        return error_response(CoreError::validation(
                            "state",
                            format!("unknown incident state {part:?}"),
                        ));
                    }
                }
            }
            Some(parsed)
        }
    };

    let limit = query.limit.unwrap_or(100).min(500);
    let mut alerts = match state
        .incidents
        .list(query.since, states.as_deref(), limit)
    {
        Ok(alerts) => alerts,
        Err(e) => return internal_error(e),
    };

    let now = Utc::now().timestamp();
    for incident in &mut alerts {
        incident.sla_breach_countdown_seconds = sla_countdown(&state.baselines, incident, now);
    }

    let count = alerts.len();
    Json(AlertsResponse {
        alerts,
        count,
        timestamp: Utc::now().to_rfc3339(),
    })
    .into_response()
}

/// Seconds until the merchant's SLA for this episode is breached. Negative
/// once the breach has happened, clamped at one day past breach; absent
/// for terminal incidents or merchants without a baseline.
fn sla_countdown(baselines: &BaselineStore, incident: &Incident, now: i64) -> Option<i64> {
    if !incident.state.is_active() {
        return None;
    }
    let merchant_id = incident.root_cause.merchant_id.as_deref()?;
    let baseline = baselines.get(merchant_id).ok().flatten()?;
    Some((baseline.sla_minutes as i64 * 60 - (now - incident.opened_at)).max(-86_400))
}

#[derive(Debug, Deserialize)]
pub struct RecentMetricsQuery {
    #[serde(default)]
    pub minutes: Option<i64>,
}

#[derive(Debug, Serialize)]
struct RecentMetricsResponse {
    snapshots: Vec<MinuteSnapshot>,
    count: usize,
    timestamp: String,
}

async fn get_metrics_recent(
    State(state): State<AppState>,
    Query(query): Query<RecentMetricsQuery>,
) -> Response {
    let minutes = query.minutes.unwrap_or(15).clamp(1, 240);
    match state.event_log.minute_snapshots(Utc::now().timestamp(), minutes) {
        Ok(snapshots) => {
            let count = snapshots.len();
            Json(RecentMetricsResponse {
                snapshots,
                count,
                timestamp: Utc::now().to_rfc3339(),
            })
            .into_response()
        }
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct BaselineRequest {
    pub sla_minutes: u32,
    pub avg_approval_rate: f64,
}

async fn put_baseline(
    State(state): State<AppState>,
    Path(merchant_id): Path<String>,
    Json(request): Json<BaselineRequest>,
) -> Response {
    if !(0.0..=1.0).contains(&request.avg_approval_rate) {
        return error_response(CoreError::validation(
            "avg_approval_rate",
            "must be between 0 and 1",
        ));
    }
    let baseline = MerchantBaseline {
        merchant_id,
        sla_minutes: request.sla_minutes,
        avg_approval_rate: request.avg_approval_rate,
    };
    match state.baselines.upsert(&baseline) {
        Ok(()) => Json(baseline).into_response(),
        Err(e) => internal_error(e),
    }
}
