//! Core domain types shared across the pipeline.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Processing status of a payment transaction.
///
/// The set is closed: anything else is rejected at the ingest boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    Created,
    Succeeded,
    Declined,
    Error,
    Rejected,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Created => "CREATED",
            TxStatus::Succeeded => "SUCCEEDED",
            TxStatus::Declined => "DECLINED",
            TxStatus::Error => "ERROR",
            TxStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(TxStatus::Created),
            "SUCCEEDED" => Some(TxStatus::Succeeded),
            "DECLINED" => Some(TxStatus::Declined),
            "ERROR" => Some(TxStatus::Error),
            "REJECTED" => Some(TxStatus::Rejected),
            _ => None,
        }
    }

    /// Statuses that count toward rate denominators. REJECTED is a
    /// gateway-side refusal and CREATED is not yet settled; both would
    /// dilute approval/error/decline rates.
    pub fn counts_toward_rates(&self) -> bool {
        matches!(
            self,
            TxStatus::Succeeded | TxStatus::Declined | TxStatus::Error
        )
    }
}

/// A validated, accepted transaction event. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    /// Server-assigned unix seconds, monotone per ingestor instance.
    pub received_at: i64,
    pub merchant_id: String,
    pub provider_id: String,
    pub country: String,
    pub status: TxStatus,
    pub sub_status: Option<String>,
    pub amount_usd: f64,
    pub issuer_name: Option<String>,
    pub card_brand: String,
    pub bin: String,
    pub response_code: Option<String>,
    pub merchant_advice_code: Option<String>,
    pub latency_ms: u64,
    /// Original request body, verbatim. Never inspected by the core.
    pub raw_payload: String,
}

/// Monetary amount as it arrives on the wire: value + ISO currency code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Amount {
    pub value: f64,
    pub currency: String,
}

/// Inbound ingest request body. Everything the core does not use stays in
/// the preserved raw payload.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    pub event_id: String,
    pub merchant_id: String,
    pub provider_id: String,
    pub country: String,
    pub status: String,
    #[serde(default)]
    pub sub_status: Option<String>,
    pub amount: Amount,
    #[serde(default)]
    pub issuer_name: Option<String>,
    #[serde(default)]
    pub card_brand: Option<String>,
    #[serde(default)]
    pub bin: Option<String>,
    #[serde(default)]
    pub response_code: Option<String>,
    #[serde(default)]
    pub merchant_advice_code: Option<String>,
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

/// Which rate (or count) a rule watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricType {
    ApprovalRate,
    ErrorRate,
    DeclineRate,
    TotalVolume,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::ApprovalRate => "APPROVAL_RATE",
            MetricType::ErrorRate => "ERROR_RATE",
            MetricType::DeclineRate => "DECLINE_RATE",
            MetricType::TotalVolume => "TOTAL_VOLUME",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "APPROVAL_RATE" => Some(MetricType::ApprovalRate),
            "ERROR_RATE" => Some(MetricType::ErrorRate),
            "DECLINE_RATE" => Some(MetricType::DeclineRate),
            "TOTAL_VOLUME" => Some(MetricType::TotalVolume),
            _ => None,
        }
    }

    pub fn is_rate(&self) -> bool {
        !matches!(self, MetricType::TotalVolume)
    }

    /// The outcome this metric treats as adverse, if any. APPROVAL_RATE
    /// alerts on approval dropping, so its adverse outcome is DECLINED.
    pub fn adverse_status(&self) -> Option<TxStatus> {
        match self {
            MetricType::ApprovalRate | MetricType::DeclineRate => Some(TxStatus::Declined),
            MetricType::ErrorRate => Some(TxStatus::Error),
            MetricType::TotalVolume => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleOperator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">=")]
    Ge,
}

impl RuleOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleOperator::Lt => "<",
            RuleOperator::Gt => ">",
            RuleOperator::Le => "<=",
            RuleOperator::Ge => ">=",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "<" => Some(RuleOperator::Lt),
            ">" => Some(RuleOperator::Gt),
            "<=" => Some(RuleOperator::Le),
            ">=" => Some(RuleOperator::Ge),
            _ => None,
        }
    }

    #[inline]
    pub fn holds(&self, observed: f64, threshold: f64) -> bool {
        match self {
            RuleOperator::Lt => observed < threshold,
            RuleOperator::Gt => observed > threshold,
            RuleOperator::Le => observed <= threshold,
            RuleOperator::Ge => observed >= threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WARNING" => Some(Severity::Warning),
            "CRITICAL" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// User-defined alert condition. Immutable after creation apart from the
/// `active` soft-delete flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: String,
    /// None = global rule across all merchants.
    pub merchant_id: Option<String>,
    pub country: Option<String>,
    pub provider_id: Option<String>,
    pub issuer_name: Option<String>,
    #[serde(rename = "metric_type")]
    pub metric: MetricType,
    pub operator: RuleOperator,
    pub threshold: f64,
    pub min_transactions: u64,
    /// UTC evaluation window [start_hour, end_hour). None = always on.
    pub start_hour: Option<u8>,
    pub end_hour: Option<u8>,
    pub severity: Severity,
    pub active: bool,
    pub created_at: i64,
}

impl Rule {
    /// True when the rule has no hour bounds or `hour` falls inside them.
    /// Bounds wrapping midnight (start > end) are honored.
    pub fn in_hours(&self, hour: u8) -> bool {
        match (self.start_hour, self.end_hour) {
            (Some(start), Some(end)) => {
                if start <= end {
                    hour >= start && hour < end
                } else {
                    hour >= start || hour < end
                }
            }
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentState {
    Open,
    Enriching,
    Notified,
    Recovered,
    Suppressed,
}

impl IncidentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentState::Open => "OPEN",
            IncidentState::Enriching => "ENRICHING",
            IncidentState::Notified => "NOTIFIED",
            IncidentState::Recovered => "RECOVERED",
            IncidentState::Suppressed => "SUPPRESSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(IncidentState::Open),
            "ENRICHING" => Some(IncidentState::Enriching),
            "NOTIFIED" => Some(IncidentState::Notified),
            "RECOVERED" => Some(IncidentState::Recovered),
            "SUPPRESSED" => Some(IncidentState::Suppressed),
            _ => None,
        }
    }

    /// States counted as an active alert episode. A key with an incident
    /// in one of these states must never get a second incident.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            IncidentState::Open | IncidentState::Enriching | IncidentState::Notified
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentStatus {
    Pending,
    Succeeded,
    Failed,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::Succeeded => "succeeded",
            EnrichmentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EnrichmentStatus::Pending),
            "succeeded" => Some(EnrichmentStatus::Succeeded),
            "failed" => Some(EnrichmentStatus::Failed),
            _ => None,
        }
    }
}

/// Structured description of the traffic slice an incident covers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootCauseScope {
    pub merchant_id: Option<String>,
    pub country: Option<String>,
    pub provider_id: Option<String>,
    pub issuer_name: Option<String>,
    pub metric: MetricType,
}

/// A stateful alert episode bound to a `(rule, dimension)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub incident_id: String,
    pub rule_id: String,
    pub dimension_key: String,
    pub opened_at: i64,
    pub last_evaluated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<i64>,
    pub state: IncidentState,
    pub severity: Severity,
    pub observed_value: f64,
    pub affected_transactions: u64,
    pub revenue_at_risk_usd: f64,
    pub response_code_breakdown: BTreeMap<String, u64>,
    pub root_cause: RootCauseScope,
    pub llm_explanation: Option<String>,
    pub suggested_action: String,
    pub enrichment_status: EnrichmentStatus,
    /// Derived at read time from the merchant baseline; never persisted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sla_breach_countdown_seconds: Option<i64>,
}

/// Per-merchant operating expectations consulted by the alert read path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerchantBaseline {
    pub merchant_id: String,
    pub sla_minutes: u32,
    pub avg_approval_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Gemini,
    Openai,
    None,
}

impl LlmProvider {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gemini" => Some(LlmProvider::Gemini),
            "openai" => Some(LlmProvider::Openai),
            "none" => Some(LlmProvider::None),
            _ => None,
        }
    }
}

/// Runtime configuration, sourced from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub bind_addr: String,
    pub tick_interval_seconds: u64,
    pub rule_refresh_seconds: u64,
    pub window_minutes_rate: i64,
    pub min_consecutive_errors: u64,
    pub recovery_threshold: usize,
    pub cooldown_seconds: i64,
    pub bucket_ttl_seconds: i64,
    pub llm_provider: LlmProvider,
    pub llm_timeout_seconds: u64,
    pub llm_max_retries: u32,
    pub llm_api_key: Option<String>,
    pub enricher_workers: usize,
    pub ingest_max_inflight: usize,
    pub detector_enabled: bool,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let db_path = std::env::var("DB_PATH").unwrap_or_else(|_| "./txwatch.db".to_string());
        let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

        let llm_provider_raw =
            std::env::var("LLM_PROVIDER").unwrap_or_else(|_| "gemini".to_string());
        let llm_provider = LlmProvider::parse(llm_provider_raw.trim())
            .with_context(|| format!("invalid LLM_PROVIDER: {llm_provider_raw:?}"))?;

        let detector_enabled = std::env::var("DETECTOR_ENABLED")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(true);

        let config = Self {
            db_path,
            bind_addr,
            tick_interval_seconds: env_parse("TICK_INTERVAL_SECONDS", 10)?,
            rule_refresh_seconds: env_parse("RULE_REFRESH_SECONDS", 10)?,
            window_minutes_rate: env_parse("WINDOW_MINUTES_RATE", 10)?,
            min_consecutive_errors: env_parse("MIN_CONSECUTIVE_ERRORS", 8)?,
            recovery_threshold: env_parse("RECOVERY_THRESHOLD", 5)?,
            cooldown_seconds: env_parse("COOLDOWN_SECONDS", 600)?,
            bucket_ttl_seconds: env_parse("BUCKET_TTL_SECONDS", 1800)?,
            llm_provider,
            llm_timeout_seconds: env_parse("LLM_TIMEOUT_SECONDS", 15)?,
            llm_max_retries: env_parse("LLM_MAX_RETRIES", 2)?,
            llm_api_key: std::env::var("LLM_API_KEY").ok().filter(|k| !k.is_empty()),
            enricher_workers: env_parse("ENRICHER_WORKERS", 4)?,
            ingest_max_inflight: env_parse("INGEST_MAX_INFLIGHT", 256)?,
            detector_enabled,
        };

        if config.tick_interval_seconds == 0 {
            bail!("TICK_INTERVAL_SECONDS must be > 0");
        }
        if config.window_minutes_rate <= 0 {
            bail!("WINDOW_MINUTES_RATE must be > 0");
        }
        if config.bucket_ttl_seconds <= config.window_minutes_rate * 60 {
            bail!(
                "BUCKET_TTL_SECONDS ({}) must exceed the evaluation window ({}s)",
                config.bucket_ttl_seconds,
                config.window_minutes_rate * 60
            );
        }

        Ok(config)
    }
}
