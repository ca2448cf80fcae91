//! Rule registry and the detector-facing snapshot cache.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection};

use crate::models::{MetricType, Rule, RuleOperator, Severity};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS rules (
    rule_id TEXT PRIMARY KEY,
    merchant_id TEXT,
    country TEXT,
    provider_id TEXT,
    issuer_name TEXT,
    metric TEXT NOT NULL,
    operator TEXT NOT NULL,
    threshold REAL NOT NULL,
    min_transactions INTEGER NOT NULL,
    start_hour INTEGER,
    end_hour INTEGER,
    severity TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_rules_active ON rules(active, created_at DESC);
"#;

pub struct RuleRegistry {
    conn: Mutex<Connection>,
}

impl RuleRegistry {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open rule registry at {path}"))?;
        conn.busy_timeout(Duration::from_secs(2))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply rule registry schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert(&self, rule: &Rule) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO rules (
                rule_id, merchant_id, country, provider_id, issuer_name,
                metric, operator, threshold, min_transactions,
                start_hour, end_hour, severity, active, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                rule.rule_id,
                rule.merchant_id,
                rule.country,
                rule.provider_id,
                rule.issuer_name,
                rule.metric.as_str(),
                rule.operator.as_str(),
                rule.threshold,
                rule.min_transactions as i64,
                rule.start_hour.map(|h| h as i64),
                rule.end_hour.map(|h| h as i64),
                rule.severity.as_str(),
                rule.active as i64,
                rule.created_at,
            ],
        )
        .context("rule insert failed")?;
        Ok(())
    }

    pub fn list(&self, include_inactive: bool) -> Result<Vec<Rule>> {
        let conn = self.conn.lock();
        let sql = if include_inactive {
            "SELECT rule_id, merchant_id, country, provider_id, issuer_name,
                    metric, operator, threshold, min_transactions,
                    start_hour, end_hour, severity, active, created_at
             FROM rules ORDER BY created_at DESC"
        } else {
            "SELECT rule_id, merchant_id, country, provider_id, issuer_name,
                    metric, operator, threshold, min_transactions,
                    start_hour, end_hour, severity, active, created_at
             FROM rules WHERE active = 1 ORDER BY created_at DESC"
        };
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map([], row_to_rule)?;
        let mut out = Vec::new();
        for rule in rows {
            out.push(rule??);
        }
        Ok(out)
    }

    /// Soft delete. Returns false when the rule does not exist.
    pub fn deactivate(&self, rule_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE rules SET active = 0 WHERE rule_id = ?1",
            params![rule_id],
        )?;
        Ok(changed > 0)
    }

    pub fn get(&self, rule_id: &str) -> Result<Option<Rule>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT rule_id, merchant_id, country, provider_id, issuer_name,
                    metric, operator, threshold, min_transactions,
                    start_hour, end_hour, severity, active, created_at
             FROM rules WHERE rule_id = ?1",
        )?;
        let mut rows = stmt.query(params![rule_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_rule(row)??)),
            None => Ok(None),
        }
    }
}

fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Rule>> {
    let metric_raw: String = row.get(5)?;
    let operator_raw: String = row.get(6)?;
    let severity_raw: String = row.get(11)?;

    Ok((|| {
        let metric = MetricType::parse(&metric_raw)
            .with_context(|| format!("corrupt metric column: {metric_raw}"))?;
        let operator = RuleOperator::parse(&operator_raw)
            .with_context(|| format!("corrupt operator column: {operator_raw}"))?;
        let severity = Severity::parse(&severity_raw)
            .with_context(|| format!("corrupt severity column: {severity_raw}"))?;
        Ok(Rule {
            rule_id: row.get(0)?,
            merchant_id: row.get(1)?,
            country: row.get(2)?,
            provider_id: row.get(3)?,
            issuer_name: row.get(4)?,
            metric,
            operator,
            threshold: row.get(7)?,
            min_transactions: row.get::<_, i64>(8)?.max(0) as u64,
            start_hour: row.get::<_, Option<i64>>(9)?.map(|h| h as u8),
            end_hour: row.get::<_, Option<i64>>(10)?.map(|h| h as u8),
            severity,
            active: row.get::<_, i64>(12)? != 0,
            created_at: row.get(13)?,
        })
    })())
}

struct SnapshotInner {
    rules: Vec<Rule>,
    refreshed_at: Option<Instant>,
}

/// Read-only view of active rules for the detector. New and deleted rules
/// take effect after the next refresh, never mid-tick.
pub struct RuleSnapshot {
    inner: RwLock<SnapshotInner>,
    max_age: Duration,
}

impl RuleSnapshot {
    pub fn new(max_age: Duration) -> Self {
        Self {
            inner: RwLock::new(SnapshotInner {
                rules: Vec::new(),
                refreshed_at: None,
            }),
            max_age,
        }
    }

    /// Reload from the registry when the snapshot is stale. Returns true
    /// when a reload happened.
    pub fn refresh_if_stale(&self, registry: &RuleRegistry) -> Result<bool> {
        {
            let inner = self.inner.read();
            if let Some(at) = inner.refreshed_at {
                if at.elapsed() < self.max_age {
                    return Ok(false);
                }
            }
        }
        let rules = registry.list(false)?;
        let mut inner = self.inner.write();
        inner.rules = rules;
        inner.refreshed_at = Some(Instant::now());
        Ok(true)
    }

    pub fn active_rules(&self) -> Vec<Rule> {
        self.inner.read().rules.clone()
    }
}
