//! Dimension keys: the slices of traffic counters are bucketed by.
//!
//! A key is five `/`-joined segments: merchant, country, provider, issuer,
//! outcome. A literal `_` marks a slot the granularity does not populate.
//! The outcome slot carries either a transaction status or `rc=<code>` for
//! the per-response-code side counters.
//!
//! Pre-declared granularities (one counter series each, per outcome):
//!   merchant/_/_/_            merchant/country/_/_
//!   merchant/country/provider/_   merchant/country/provider/issuer
//!   _/country/provider/_          (global per-country provider view)

use crate::models::{Event, Rule, TxStatus};

pub const WILDCARD: &str = "_";
const RESPONSE_CODE_PREFIX: &str = "rc=";

fn join(merchant: &str, country: &str, provider: &str, issuer: &str, outcome: &str) -> String {
    format!("{merchant}/{country}/{provider}/{issuer}/{outcome}")
}

/// All counter keys a single accepted event increments.
pub fn event_keys(event: &Event) -> Vec<String> {
    let status = event.status.as_str();
    let m = event.merchant_id.as_str();
    let c = event.country.as_str();
    let p = event.provider_id.as_str();

    let mut keys = Vec::with_capacity(6);
    keys.push(join(m, WILDCARD, WILDCARD, WILDCARD, status));
    keys.push(join(m, c, WILDCARD, WILDCARD, status));
    keys.push(join(m, c, p, WILDCARD, status));
    if let Some(issuer) = event.issuer_name.as_deref() {
        keys.push(join(m, c, p, issuer, status));
    }
    keys.push(join(WILDCARD, c, p, WILDCARD, status));

    if event.status == TxStatus::Error {
        if let Some(code) = event.response_code.as_deref() {
            keys.push(join(
                m,
                c,
                p,
                WILDCARD,
                &format!("{RESPONSE_CODE_PREFIX}{code}"),
            ));
        }
    }

    keys
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Exact(String),
    Any,
    Prefixed(&'static str),
}

impl Slot {
    #[inline]
    fn matches(&self, segment: &str) -> bool {
        match self {
            Slot::Exact(v) => v == segment,
            Slot::Any => true,
            Slot::Prefixed(p) => segment.starts_with(p),
        }
    }
}

/// A query over counter keys at exactly one granularity. Structural `_`
/// slots are exact, so a pattern never mixes granularity levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPattern {
    slots: [Slot; 5],
}

impl KeyPattern {
    pub fn matches(&self, key: &str) -> bool {
        let mut segments = key.splitn(5, '/');
        for slot in &self.slots {
            match segments.next() {
                Some(segment) if slot.matches(segment) => {}
                _ => return false,
            }
        }
        true
    }

    /// The single key this pattern denotes, when it has no open slots.
    /// Lets the store skip a full scan.
    pub fn exact_key(&self) -> Option<String> {
        let mut parts = Vec::with_capacity(5);
        for slot in &self.slots {
            match slot {
                Slot::Exact(v) => parts.push(v.as_str()),
                _ => return None,
            }
        }
        Some(parts.join("/"))
    }

    /// Response code carried in the outcome slot of `key`, if any.
    pub fn response_code_of(key: &str) -> Option<&str> {
        key.rsplit('/')
            .next()
            .and_then(|outcome| outcome.strip_prefix(RESPONSE_CODE_PREFIX))
    }
}

fn exact(v: &str) -> Slot {
    Slot::Exact(v.to_string())
}

fn filter_slot(v: Option<&str>) -> Slot {
    match v {
        Some(v) => Slot::Exact(v.to_string()),
        None => Slot::Any,
    }
}

/// Granularity selection for a rule: the narrowest pre-declared level whose
/// populated slots cover every filter the rule sets. Filters the level does
/// not pin become match-any over that level's keys.
fn rule_slots(rule: &Rule) -> [Slot; 4] {
    match rule.merchant_id.as_deref() {
        None => [
            exact(WILDCARD),
            filter_slot(rule.country.as_deref()),
            filter_slot(rule.provider_id.as_deref()),
            exact(WILDCARD),
        ],
        Some(m) => {
            let has_issuer = rule.issuer_name.is_some();
            let has_provider = rule.provider_id.is_some();
            let has_country = rule.country.is_some();
            if has_issuer {
                [
                    exact(m),
                    filter_slot(rule.country.as_deref()),
                    filter_slot(rule.provider_id.as_deref()),
                    filter_slot(rule.issuer_name.as_deref()),
                ]
            } else if has_provider {
                [
                    exact(m),
                    filter_slot(rule.country.as_deref()),
                    filter_slot(rule.provider_id.as_deref()),
                    exact(WILDCARD),
                ]
            } else if has_country {
                [
                    exact(m),
                    filter_slot(rule.country.as_deref()),
                    exact(WILDCARD),
                    exact(WILDCARD),
                ]
            } else {
                [exact(m), exact(WILDCARD), exact(WILDCARD), exact(WILDCARD)]
            }
        }
    }
}

/// Pattern selecting the rule's dimension counters for one status.
pub fn rule_status_pattern(rule: &Rule, status: TxStatus) -> KeyPattern {
    let [m, c, p, i] = rule_slots(rule);
    KeyPattern {
        slots: [m, c, p, i, exact(status.as_str())],
    }
}

/// Pattern selecting the rule's per-response-code side counters.
pub fn rule_response_code_pattern(rule: &Rule) -> KeyPattern {
    // Side counters live at merchant/country/provider granularity.
    KeyPattern {
        slots: [
            filter_slot(rule.merchant_id.as_deref()),
            filter_slot(rule.country.as_deref()),
            filter_slot(rule.provider_id.as_deref()),
            exact(WILDCARD),
            Slot::Prefixed(RESPONSE_CODE_PREFIX),
        ],
    }
}

/// Stable identifier for the traffic slice a rule watches; incidents are
/// deduplicated on `(rule_id, dimension_key)`.
pub fn rule_dimension_key(rule: &Rule) -> String {
    let [m, c, p, i] = rule_slots(rule);
    let part = |s: &Slot| match s {
        Slot::Exact(v) => v.clone(),
        Slot::Any => "*".to_string(),
        Slot::Prefixed(p) => format!("{p}*"),
    };
    format!(
        "{}/{}/{}/{}/{}",
        part(&m),
        part(&c),
        part(&p),
        part(&i),
        rule.metric.as_str()
    )
}
