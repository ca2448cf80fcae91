//! Incident lifecycle decisions that do not touch storage.

use std::collections::BTreeMap;

use crate::models::{MetricType, Rule, Severity, TxStatus};

/// Error rate above this promotes any incident to CRITICAL.
pub const CRITICAL_ERROR_RATE: f64 = 0.30;

pub const ACTION_FAILOVER: &str = "Increase timeout or failover";
pub const ACTION_CONTACT_PROVIDER: &str = "Contact provider";
pub const ACTION_PAUSE_TEMPORARILY: &str = "Pause traffic temporarily";
pub const ACTION_PAUSE: &str = "Pause Traffic";

const ADVICE_TRY_AGAIN_LATER: &str = "TRY_AGAIN_LATER";

/// Suggested operator action from the dominant error response code, with a
/// merchant-advice override when issuers are explicitly asking for a pause.
pub fn suggested_action(
    breakdown: &BTreeMap<String, u64>,
    recent_advice_codes: &[Option<String>],
) -> &'static str {
    if advice_majority(recent_advice_codes) {
        return ACTION_PAUSE;
    }

    let top_code = breakdown
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(code, _)| code.as_str());

    match top_code {
        Some("502") | Some("503") | Some("504") => ACTION_FAILOVER,
        Some("500") => ACTION_CONTACT_PROVIDER,
        _ => ACTION_PAUSE_TEMPORARILY,
    }
}

/// Strict majority of the sampled adverse events carry TRY_AGAIN_LATER.
fn advice_majority(codes: &[Option<String>]) -> bool {
    if codes.is_empty() {
        return false;
    }
    let hits = codes
        .iter()
        .filter(|c| c.as_deref() == Some(ADVICE_TRY_AGAIN_LATER))
        .count();
    hits * 2 > codes.len()
}

/// Rule severity, promoted when the error rate observation crosses the
/// promotion threshold.
pub fn effective_severity(rule: &Rule, observed_value: f64) -> Severity {
    if rule.metric == MetricType::ErrorRate && observed_value > CRITICAL_ERROR_RATE {
        Severity::Critical
    } else {
        rule.severity
    }
}

/// Recovery scan over the dimension's freshest events (newest first): the
/// incident closes once the leading run of non-adverse outcomes reaches
/// the threshold.
pub fn recovered_by_stream(recent_newest_first: &[TxStatus], threshold: usize) -> bool {
    if recent_newest_first.len() < threshold {
        return false;
    }
    recent_newest_first[..threshold]
        .iter()
        .all(|s| *s == TxStatus::Succeeded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RuleOperator;

    fn breakdown(pairs: &[(&str, u64)]) -> BTreeMap<String, u64> {
        pairs
            .iter()
            .map(|(code, count)| (code.to_string(), *count))
            .collect()
    }

    #[test]
    fn action_from_dominant_code() {
        assert_eq!(
            suggested_action(&breakdown(&[("503", 12), ("500", 3)]), &[]),
            ACTION_FAILOVER
        );
        assert_eq!(
            suggested_action(&breakdown(&[("500", 9), ("504", 2)]), &[]),
            ACTION_CONTACT_PROVIDER
        );
        assert_eq!(
            suggested_action(&breakdown(&[("05", 30)]), &[]),
            ACTION_PAUSE_TEMPORARILY
        );
        assert_eq!(suggested_action(&BTreeMap::new(), &[]), ACTION_PAUSE_TEMPORARILY);
    }

    #[test]
    fn advice_override_needs_strict_majority() {
        let mostly = vec![
            Some(ADVICE_TRY_AGAIN_LATER.to_string()),
            Some(ADVICE_TRY_AGAIN_LATER.to_string()),
            None,
        ];
        assert_eq!(
            suggested_action(&breakdown(&[("503", 12)]), &mostly),
            ACTION_PAUSE
        );

        let split = vec![Some(ADVICE_TRY_AGAIN_LATER.to_string()), None];
        assert_eq!(
            suggested_action(&breakdown(&[("503", 12)]), &split),
            ACTION_FAILOVER
        );
    }

    #[test]
    fn error_rate_promotion() {
        let mut rule = Rule {
            rule_id: "r1".into(),
            merchant_id: None,
            country: None,
            provider_id: None,
            issuer_name: None,
            metric: MetricType::ErrorRate,
            operator: RuleOperator::Gt,
            threshold: 0.1,
            min_transactions: 30,
            start_hour: None,
            end_hour: None,
            severity: Severity::Warning,
            active: true,
            created_at: 0,
        };
        assert_eq!(effective_severity(&rule, 0.30), Severity::Warning);
        assert_eq!(effective_severity(&rule, 0.31), Severity::Critical);

        // Promotion is specific to error rate.
        rule.metric = MetricType::DeclineRate;
        assert_eq!(effective_severity(&rule, 0.9), Severity::Warning);
    }

    #[test]
    fn recovery_needs_leading_run() {
        let healthy = vec![TxStatus::Succeeded; 5];
        assert!(recovered_by_stream(&healthy, 5));

        let mut broken = vec![TxStatus::Succeeded; 5];
        broken[2] = TxStatus::Error;
        assert!(!recovered_by_stream(&broken, 5));

        // An old failure behind the run does not block recovery.
        let mut tail = vec![TxStatus::Succeeded; 6];
        tail[5] = TxStatus::Error;
        assert!(recovered_by_stream(&tail, 5));

        assert!(!recovered_by_stream(&[TxStatus::Succeeded; 3], 5));
    }
}
