//! Ingest pipeline: validate, persist, fan out counters.
//!
//! The event log append is the commit point. Counter increments after it
//! are best-effort aggregates, rebuildable from the log in principle, so
//! their failure never fails the request.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::{
    dimensions::event_keys,
    error::CoreError,
    metrics::MetricStore,
    models::{Event, IngestRequest, TxStatus},
    store::EventLog,
};

/// Static conversion table to USD. Minor currencies a payment simulator
/// realistically emits; unknown codes are rejected at validation.
const USD_RATES: &[(&str, f64)] = &[
    ("USD", 1.0),
    ("EUR", 1.09),
    ("GBP", 1.27),
    ("CAD", 0.73),
    ("AUD", 0.66),
    ("JPY", 0.0067),
    ("CNY", 0.14),
    ("INR", 0.012),
    ("BRL", 0.18),
    ("MXN", 0.054),
    ("COP", 0.00025),
    ("CLP", 0.0011),
    ("PEN", 0.27),
    ("ARS", 0.0011),
    ("UYU", 0.025),
    ("CHF", 1.13),
    ("SEK", 0.095),
    ("NOK", 0.094),
    ("DKK", 0.146),
    ("PLN", 0.25),
    ("KRW", 0.00072),
    ("SGD", 0.74),
    ("HKD", 0.128),
    ("NZD", 0.6),
    ("ZAR", 0.054),
];

pub fn to_usd(value: f64, currency: &str) -> Option<f64> {
    USD_RATES
        .iter()
        .find(|(code, _)| *code == currency)
        .map(|(_, rate)| value * rate)
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Accepted {
    pub event_id: String,
    pub accepted_at: i64,
}

fn require_identifier(field: &'static str, value: &str) -> Result<(), CoreError> {
    if value.trim().is_empty() {
        return Err(CoreError::validation(field, "must not be empty"));
    }
    if value.len() > 128 {
        return Err(CoreError::validation(field, "longer than 128 characters"));
    }
    if value.contains('/') {
        return Err(CoreError::validation(field, "must not contain '/'"));
    }
    Ok(())
}

/// Validation contract for the ingest boundary. Returns the parsed status
/// and the USD amount; nothing is written on failure.
pub fn validate(req: &IngestRequest) -> Result<(TxStatus, f64), CoreError> {
    require_identifier("event_id", &req.event_id)?;
    require_identifier("merchant_id", &req.merchant_id)?;
    require_identifier("provider_id", &req.provider_id)?;
    if let Some(issuer) = req.issuer_name.as_deref() {
        require_identifier("issuer_name", issuer)?;
    }

    if req.country.len() != 2 || !req.country.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(CoreError::validation(
            "country",
            "must be a two-letter uppercase ISO code",
        ));
    }

    let status = TxStatus::parse(&req.status)
        .ok_or_else(|| CoreError::validation("status", format!("unknown status {:?}", req.status)))?;

    if !req.amount.value.is_finite() || req.amount.value < 0.0 {
        return Err(CoreError::validation(
            "amount.value",
            "must be finite and non-negative",
        ));
    }
    let amount_usd = to_usd(req.amount.value, &req.amount.currency).ok_or_else(|| {
        CoreError::validation(
            "amount.currency",
            format!("unknown currency {:?}", req.amount.currency),
        )
    })?;
    if !amount_usd.is_finite() {
        return Err(CoreError::validation("amount.value", "conversion overflowed"));
    }

    Ok((status, amount_usd))
}

pub struct Ingestor {
    event_log: Arc<EventLog>,
    metrics: Arc<MetricStore>,
    permits: Semaphore,
    /// Floor for server-assigned timestamps; never moves backwards even if
    /// the wall clock does.
    last_received_at: Mutex<i64>,
}

impl Ingestor {
    pub fn new(event_log: Arc<EventLog>, metrics: Arc<MetricStore>, max_inflight: usize) -> Self {
        Self {
            event_log,
            metrics,
            permits: Semaphore::new(max_inflight.max(1)),
            last_received_at: Mutex::new(0),
        }
    }

    fn next_received_at(&self) -> i64 {
        let now = Utc::now().timestamp();
        let mut last = self.last_received_at.lock();
        let ts = now.max(*last);
        *last = ts;
        ts
    }

    /// Accept one event. Validation failures and back-pressure are the
    /// only synchronous rejections; counter trouble after the append is
    /// logged and absorbed.
    pub fn ingest(&self, req: IngestRequest, raw_payload: String) -> Result<Accepted, CoreError> {
        let _permit = self.permits.try_acquire().map_err(|_| {
            CoreError::TransientDependency("ingest queue saturated, retry later".into())
        })?;

        let (status, amount_usd) = validate(&req)?;

        match self.event_log.exists(&req.event_id) {
            Ok(true) => {
                return Err(CoreError::validation("event_id", "already ingested"));
            }
            Ok(false) => {}
            Err(e) => {
                return Err(CoreError::TransientDependency(format!(
                    "event log lookup failed: {e}"
                )));
            }
        }

        let event = Event {
            event_id: req.event_id,
            received_at: self.next_received_at(),
            merchant_id: req.merchant_id,
            provider_id: req.provider_id,
            country: req.country,
            status,
            sub_status: req.sub_status,
            amount_usd,
            issuer_name: req.issuer_name,
            card_brand: req.card_brand.unwrap_or_default(),
            bin: req.bin.unwrap_or_default(),
            response_code: req.response_code,
            merchant_advice_code: req.merchant_advice_code,
            latency_ms: req.latency_ms.unwrap_or(0),
            raw_payload,
        };

        if let Err(e) = self.event_log.append(&event) {
            return Err(CoreError::TransientDependency(format!(
                "event log append failed: {e}"
            )));
        }

        // Committed. Everything below is best-effort.
        let minute = MetricStore::minute_of(event.received_at);
        let keys = event_keys(&event);
        for key in &keys {
            self.metrics.incr(key, minute, 1);
        }
        debug!(
            event_id = %event.event_id,
            status = event.status.as_str(),
            counters = keys.len(),
            "event ingested"
        );

        Ok(Accepted {
            event_id: event.event_id,
            accepted_at: event.received_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Amount;

    fn request(id: &str, status: &str) -> IngestRequest {
        IngestRequest {
            event_id: id.to_string(),
            merchant_id: "shopito".into(),
            provider_id: "STRIPE".into(),
            country: "US".into(),
            status: status.to_string(),
            sub_status: None,
            amount: Amount {
                value: 100.0,
                currency: "USD".into(),
            },
            issuer_name: Some("CHASE".into()),
            card_brand: Some("VISA".into()),
            bin: Some("411111".into()),
            response_code: None,
            merchant_advice_code: None,
            latency_ms: Some(12),
        }
    }

    fn ingestor() -> (tempfile::TempDir, Ingestor) {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(EventLog::open(dir.path().join("e.db").to_str().unwrap()).unwrap());
        let metrics = Arc::new(MetricStore::new(1800));
        let ing = Ingestor::new(log, metrics, 16);
        (dir, ing)
    }

    #[test]
    fn currency_conversion() {
        assert_eq!(to_usd(100.0, "USD"), Some(100.0));
        assert!((to_usd(100.0, "BRL").unwrap() - 18.0).abs() < 1e-9);
        assert_eq!(to_usd(100.0, "XTS"), None);
    }

    #[test]
    fn validation_matrix() {
        assert!(validate(&request("e1", "SUCCEEDED")).is_ok());

        let mut bad = request("e1", "REFUNDED");
        assert!(matches!(
            validate(&bad),
            Err(CoreError::Validation { ref field, .. }) if field == "status"
        ));

        bad = request("e1", "SUCCEEDED");
        bad.country = "usa".into();
        assert!(matches!(
            validate(&bad),
            Err(CoreError::Validation { ref field, .. }) if field == "country"
        ));

        bad = request("e1", "SUCCEEDED");
        bad.amount.currency = "XTS".into();
        assert!(matches!(
            validate(&bad),
            Err(CoreError::Validation { ref field, .. }) if field == "amount.currency"
        ));

        bad = request("e1", "SUCCEEDED");
        bad.amount.value = -3.0;
        assert!(validate(&bad).is_err());

        bad = request("e1", "SUCCEEDED");
        bad.amount.value = f64::NAN;
        assert!(validate(&bad).is_err());

        bad = request("", "SUCCEEDED");
        assert!(matches!(
            validate(&bad),
            Err(CoreError::Validation { ref field, .. }) if field == "event_id"
        ));

        bad = request("e1", "SUCCEEDED");
        bad.merchant_id = "shop/ito".into();
        assert!(validate(&bad).is_err());
    }

    #[test]
    fn ingest_appends_and_fans_out() {
        let (_dir, ing) = ingestor();
        let accepted = ing
            .ingest(request("e1", "SUCCEEDED"), "{\"raw\":true}".into())
            .unwrap();
        assert_eq!(accepted.event_id, "e1");

        let stored = ing.event_log.get_by_id("e1").unwrap().unwrap();
        assert_eq!(stored.raw_payload, "{\"raw\":true}");
        assert!((stored.amount_usd - 100.0).abs() < 1e-9);

        let minute = MetricStore::minute_of(accepted.accepted_at);
        assert_eq!(
            ing.metrics
                .range_sum("shopito/US/STRIPE/CHASE/SUCCEEDED", minute, minute + 1),
            1
        );
        assert_eq!(
            ing.metrics
                .range_sum("_/US/STRIPE/_/SUCCEEDED", minute, minute + 1),
            1
        );
    }

    #[test]
    fn duplicate_event_id_rejected_without_side_effects() {
        let (_dir, ing) = ingestor();
        ing.ingest(request("e1", "SUCCEEDED"), "{}".into()).unwrap();
        let err = ing
            .ingest(request("e1", "SUCCEEDED"), "{}".into())
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { ref field, .. } if field == "event_id"));
        assert_eq!(ing.event_log.len(), 1);
    }

    #[test]
    fn rejected_request_writes_nothing() {
        let (_dir, ing) = ingestor();
        let mut bad = request("e1", "SUCCEEDED");
        bad.amount.currency = "XTS".into();
        assert!(ing.ingest(bad, "{}".into()).is_err());
        assert!(ing.event_log.is_empty());
        assert_eq!(ing.metrics.bucket_count(), 0);
    }

    #[test]
    fn received_at_is_monotone() {
        let (_dir, ing) = ingestor();
        // Force the floor far into the future; assignments must not regress.
        *ing.last_received_at.lock() = i64::MAX - 10;
        let a = ing.next_received_at();
        let b = ing.next_received_at();
        assert!(a >= i64::MAX - 10);
        assert!(b >= a);
    }
}
