//! Per-rule observation: window sums, observed value, guard clauses.

use crate::{
    dimensions::rule_status_pattern,
    metrics::MetricStore,
    models::{MetricType, Rule, TxStatus},
};

/// One sub-window (minute) of the evaluation window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinuteSample {
    /// Any traffic in this minute (settled outcomes for rate metrics).
    pub trafficked: bool,
    /// The rule condition held over this minute alone.
    pub holds: bool,
}

/// Everything a tick needs to know about one rule's window.
#[derive(Debug, Clone)]
pub struct RuleObservation {
    pub window_minutes: i64,
    /// Denominator population: settled outcomes for rates, all
    /// non-rejected events for volume.
    pub total: u64,
    pub succeeded: u64,
    pub declined: u64,
    pub errors: u64,
    pub observed_value: f64,
    /// Count of the metric's adverse outcome in the window.
    pub adverse_count: u64,
    pub samples: Vec<MinuteSample>,
}

/// Window end is exclusive of the next minute: the current partial minute
/// participates, so freshly ingested traffic is visible to the same tick.
pub fn window_bounds(now: i64, window_minutes: i64) -> (i64, i64) {
    let end = MetricStore::minute_of(now) + 1;
    (end - window_minutes, end)
}

pub fn observe(metrics: &MetricStore, rule: &Rule, window_minutes_rate: i64, now: i64) -> RuleObservation {
    let window_minutes = if rule.metric.is_rate() {
        window_minutes_rate
    } else {
        1
    };
    let (start, end) = window_bounds(now, window_minutes);

    let succeeded_by_min =
        metrics.pattern_minute_sums(&rule_status_pattern(rule, TxStatus::Succeeded), start, end);
    let declined_by_min =
        metrics.pattern_minute_sums(&rule_status_pattern(rule, TxStatus::Declined), start, end);
    let errors_by_min =
        metrics.pattern_minute_sums(&rule_status_pattern(rule, TxStatus::Error), start, end);
    let created_by_min = if rule.metric.is_rate() {
        vec![0; window_minutes as usize]
    } else {
        metrics.pattern_minute_sums(&rule_status_pattern(rule, TxStatus::Created), start, end)
    };

    let succeeded: u64 = succeeded_by_min.iter().sum();
    let declined: u64 = declined_by_min.iter().sum();
    let errors: u64 = errors_by_min.iter().sum();
    let created: u64 = created_by_min.iter().sum();

    let settled = succeeded + declined + errors;
    let total = if rule.metric.is_rate() {
        settled
    } else {
        settled + created
    };

    let observed_value = match rule.metric {
        MetricType::ApprovalRate => ratio(succeeded, settled),
        MetricType::ErrorRate => ratio(errors, settled),
        MetricType::DeclineRate => ratio(declined, settled),
        MetricType::TotalVolume => total as f64,
    };

    let adverse_count = match rule.metric.adverse_status() {
        Some(TxStatus::Error) => errors,
        Some(TxStatus::Declined) => declined,
        _ => 0,
    };

    let mut samples = Vec::with_capacity(window_minutes as usize);
    for i in 0..window_minutes as usize {
        let s = succeeded_by_min[i];
        let d = declined_by_min[i];
        let e = errors_by_min[i];
        let minute_settled = s + d + e;
        let minute_total = minute_settled + created_by_min[i];

        let (trafficked, minute_value) = match rule.metric {
            MetricType::ApprovalRate => (minute_settled > 0, ratio(s, minute_settled)),
            MetricType::ErrorRate => (minute_settled > 0, ratio(e, minute_settled)),
            MetricType::DeclineRate => (minute_settled > 0, ratio(d, minute_settled)),
            MetricType::TotalVolume => (minute_total > 0, minute_total as f64),
        };
        samples.push(MinuteSample {
            trafficked,
            holds: trafficked && rule.operator.holds(minute_value, rule.threshold),
        });
    }

    RuleObservation {
        window_minutes,
        total,
        succeeded,
        declined,
        errors,
        observed_value,
        adverse_count,
        samples,
    }
}

#[inline]
fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}
