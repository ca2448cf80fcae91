//! Incident enrichment pipeline.
//!
//! Consumes incidents in ENRICHING, asks the LLM for a human-readable
//! explanation, and moves them to NOTIFIED. Enrichment failure must never
//! block notification: retry exhaustion still transitions, with a null
//! explanation and `enrichment_status = failed`.

pub mod llm;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::{
    models::{EnrichmentStatus, Incident, IncidentState},
    store::IncidentStore,
};

pub use llm::{backend_for, ExplanationBackend};

#[derive(Debug, Clone)]
pub struct EnrichmentJob {
    pub incident_id: String,
}

pub struct Enricher {
    incidents: Arc<IncidentStore>,
    backend: Option<Arc<dyn ExplanationBackend>>,
    max_retries: u32,
    initial_backoff: Duration,
}

impl Enricher {
    pub fn new(
        incidents: Arc<IncidentStore>,
        backend: Option<Arc<dyn ExplanationBackend>>,
        max_retries: u32,
    ) -> Self {
        Self {
            incidents,
            backend,
            max_retries,
            initial_backoff: Duration::from_secs(1),
        }
    }

    #[cfg(test)]
    fn with_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Start the worker pool over a shared queue receiver.
    pub fn spawn_workers(self: Arc<Self>, rx: mpsc::Receiver<EnrichmentJob>, worker_count: usize) {
        let shared_rx = Arc::new(Mutex::new(rx));
        let workers = worker_count.max(1);
        info!(workers, "enrichment workers starting");

        for i in 0..workers {
            let svc = self.clone();
            let rx = shared_rx.clone();
            tokio::spawn(async move {
                loop {
                    let job_opt = { rx.lock().await.recv().await };
                    let Some(job) = job_opt else {
                        break;
                    };
                    if let Err(e) = svc.process(job).await {
                        warn!(worker = i, error = %e, "enrichment job failed");
                    }
                }
            });
        }
    }

    pub async fn process(&self, job: EnrichmentJob) -> Result<()> {
        let Some(incident) = self.incidents.get(&job.incident_id)? else {
            warn!(incident_id = %job.incident_id, "enrichment job for unknown incident");
            return Ok(());
        };

        // Recovery can close an incident while it sits in the queue; a
        // closed incident is left exactly as recovery stamped it.
        if incident.state != IncidentState::Enriching {
            debug!(
                incident_id = %incident.incident_id,
                state = incident.state.as_str(),
                "skipping enrichment, incident no longer ENRICHING"
            );
            return Ok(());
        }

        let explanation = match &self.backend {
            Some(backend) => self.explain_with_retries(backend, &incident).await,
            None => None,
        };

        let status = if explanation.is_some() {
            EnrichmentStatus::Succeeded
        } else {
            EnrichmentStatus::Failed
        };
        self.incidents
            .set_enrichment(&incident.incident_id, explanation.as_deref(), status)?;

        let now = chrono::Utc::now().timestamp();
        let notified = self.incidents.transition(
            &incident.incident_id,
            &[IncidentState::Enriching],
            IncidentState::Notified,
            None,
            now,
        )?;
        if notified {
            info!(
                incident_id = %incident.incident_id,
                enrichment = status.as_str(),
                "incident notified"
            );
        }
        Ok(())
    }

    /// Bounded retry loop. Only transient failures are retried; a
    /// permanent one (bad credentials, schema mismatch) is surfaced once
    /// and the loop stops immediately.
    async fn explain_with_retries(
        &self,
        backend: &Arc<dyn ExplanationBackend>,
        incident: &Incident,
    ) -> Option<String> {
        let prompt = build_prompt(incident);
        let attempts = self.max_retries + 1;
        let mut backoff = self.initial_backoff;

        for attempt in 1..=attempts {
            let err = match backend.explain(&prompt).await {
                Ok(text) => return Some(text),
                Err(e) => e,
            };
            warn!(
                incident_id = %incident.incident_id,
                provider = backend.name(),
                attempt,
                error = %err,
                "LLM call failed"
            );
            if !err.is_retriable() {
                break;
            }
            if attempt < attempts {
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                tokio::time::sleep(backoff + jitter).await;
                backoff *= 2;
            }
        }
        None
    }
}

/// Prompt over the incident's context tuple. Not retained after the call.
pub fn build_prompt(incident: &Incident) -> String {
    let scope = &incident.root_cause;
    let mut breakdown: Vec<String> = incident
        .response_code_breakdown
        .iter()
        .map(|(code, count)| format!("{code}: {count}"))
        .collect();
    if breakdown.is_empty() {
        breakdown.push("none recorded".to_string());
    }

    format!(
        "You are a payments reliability analyst. A monitoring rule fired and \
         opened an incident. Explain in 2-3 sentences what is most likely \
         happening and what the operator should check first.\n\
         \n\
         Metric: {metric}\n\
         Observed value: {observed:.4}\n\
         Severity: {severity}\n\
         Merchant: {merchant}\n\
         Country: {country}\n\
         Provider: {provider}\n\
         Issuer: {issuer}\n\
         Affected transactions: {affected}\n\
         Revenue at risk (USD): {revenue:.2}\n\
         Error response codes: {breakdown}\n\
         Current suggested action: {action}",
        metric = scope.metric.as_str(),
        observed = incident.observed_value,
        severity = incident.severity.as_str(),
        merchant = scope.merchant_id.as_deref().unwrap_or("all"),
        country = scope.country.as_deref().unwrap_or("all"),
        provider = scope.provider_id.as_deref().unwrap_or("all"),
        issuer = scope.issuer_name.as_deref().unwrap_or("all"),
        affected = incident.affected_transactions,
        revenue = incident.revenue_at_risk_usd,
        breakdown = breakdown.join(", "),
        action = incident.suggested_action,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::models::{MetricType, RootCauseScope, Severity};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailingBackend {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ExplanationBackend for FailingBackend {
        async fn explain(&self, _prompt: &str) -> Result<String, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::TransientDependency("simulated timeout".into()))
        }

        fn name(&self) -> &'static str {
            "failing-stub"
        }
    }

    struct RejectedKeyBackend {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ExplanationBackend for RejectedKeyBackend {
        async fn explain(&self, _prompt: &str) -> Result<String, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::PermanentDependency(
                "stub rejected credentials: 401".into(),
            ))
        }

        fn name(&self) -> &'static str {
            "rejected-key-stub"
        }
    }

    struct EchoBackend;

    #[async_trait]
    impl ExplanationBackend for EchoBackend {
        async fn explain(&self, prompt: &str) -> Result<String, CoreError> {
            Ok(format!("explained: {}", &prompt[..20.min(prompt.len())]))
        }

        fn name(&self) -> &'static str {
            "echo-stub"
        }
    }

    fn incident(id: &str, state: IncidentState) -> Incident {
        Incident {
            incident_id: id.to_string(),
            rule_id: "r1".into(),
            dimension_key: "shopito/*/STRIPE/_/ERROR_RATE".into(),
            opened_at: 1000,
            last_evaluated_at: 1000,
            closed_at: None,
            state,
            severity: Severity::Warning,
            observed_value: 0.3,
            affected_transactions: 30,
            revenue_at_risk_usd: 450.0,
            response_code_breakdown: BTreeMap::from([("503".to_string(), 20u64)]),
            root_cause: RootCauseScope {
                merchant_id: Some("shopito".into()),
                country: None,
                provider_id: Some("STRIPE".into()),
                issuer_name: None,
                metric: MetricType::ErrorRate,
            },
            llm_explanation: None,
            suggested_action: "Increase timeout or failover".into(),
            enrichment_status: EnrichmentStatus::Pending,
            sla_breach_countdown_seconds: None,
        }
    }

    fn temp_incidents() -> (tempfile::TempDir, Arc<IncidentStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(IncidentStore::open(dir.path().join("i.db").to_str().unwrap()).unwrap());
        (dir, store)
    }

    #[test]
    fn prompt_carries_incident_context() {
        let prompt = build_prompt(&incident("i1", IncidentState::Enriching));
        assert!(prompt.contains("ERROR_RATE"));
        assert!(prompt.contains("shopito"));
        assert!(prompt.contains("STRIPE"));
        assert!(prompt.contains("503: 20"));
        assert!(prompt.contains("450.00"));
    }

    #[tokio::test]
    async fn success_notifies_with_explanation() {
        let (_dir, store) = temp_incidents();
        store.insert(&incident("i1", IncidentState::Enriching)).unwrap();

        let enricher = Enricher::new(store.clone(), Some(Arc::new(EchoBackend)), 2);
        enricher
            .process(EnrichmentJob {
                incident_id: "i1".into(),
            })
            .await
            .unwrap();

        let inc = store.get("i1").unwrap().unwrap();
        assert_eq!(inc.state, IncidentState::Notified);
        assert_eq!(inc.enrichment_status, EnrichmentStatus::Succeeded);
        assert!(inc.llm_explanation.unwrap().starts_with("explained:"));
    }

    #[tokio::test]
    async fn exhaustion_still_notifies_without_explanation() {
        let (_dir, store) = temp_incidents();
        store.insert(&incident("i1", IncidentState::Enriching)).unwrap();

        let backend = Arc::new(FailingBackend {
            calls: AtomicU32::new(0),
        });
        let enricher = Enricher::new(store.clone(), Some(backend.clone()), 2)
            .with_backoff(Duration::from_millis(1));
        enricher
            .process(EnrichmentJob {
                incident_id: "i1".into(),
            })
            .await
            .unwrap();

        // Initial attempt plus two retries.
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        let inc = store.get("i1").unwrap().unwrap();
        assert_eq!(inc.state, IncidentState::Notified);
        assert_eq!(inc.enrichment_status, EnrichmentStatus::Failed);
        assert!(inc.llm_explanation.is_none());
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let (_dir, store) = temp_incidents();
        store.insert(&incident("i1", IncidentState::Enriching)).unwrap();

        let backend = Arc::new(RejectedKeyBackend {
            calls: AtomicU32::new(0),
        });
        let enricher = Enricher::new(store.clone(), Some(backend.clone()), 2)
            .with_backoff(Duration::from_millis(1));
        enricher
            .process(EnrichmentJob {
                incident_id: "i1".into(),
            })
            .await
            .unwrap();

        // One attempt only, despite the retry budget.
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        let inc = store.get("i1").unwrap().unwrap();
        assert_eq!(inc.state, IncidentState::Notified);
        assert_eq!(inc.enrichment_status, EnrichmentStatus::Failed);
        assert!(inc.llm_explanation.is_none());
    }

    #[tokio::test]
    async fn recovered_incident_is_left_alone() {
        let (_dir, store) = temp_incidents();
        let mut inc = incident("i1", IncidentState::Recovered);
        inc.closed_at = Some(1100);
        store.insert(&inc).unwrap();

        let enricher = Enricher::new(store.clone(), Some(Arc::new(EchoBackend)), 2);
        enricher
            .process(EnrichmentJob {
                incident_id: "i1".into(),
            })
            .await
            .unwrap();

        let inc = store.get("i1").unwrap().unwrap();
        assert_eq!(inc.state, IncidentState::Recovered);
        assert_eq!(inc.enrichment_status, EnrichmentStatus::Pending);
        assert!(inc.llm_explanation.is_none());
    }

    #[tokio::test]
    async fn no_backend_short_circuits_to_failed() {
        let (_dir, store) = temp_incidents();
        store.insert(&incident("i1", IncidentState::Enriching)).unwrap();

        let enricher = Enricher::new(store.clone(), None, 2);
        enricher
            .process(EnrichmentJob {
                incident_id: "i1".into(),
            })
            .await
            .unwrap();

        let inc = store.get("i1").unwrap().unwrap();
        assert_eq!(inc.state, IncidentState::Notified);
        assert_eq!(inc.enrichment_status, EnrichmentStatus::Failed);
    }
}
