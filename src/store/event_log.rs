//! Durable append-only event log.
//!
//! Source of truth for accepted events. Typed columns for the fields the
//! core queries, plus the original payload verbatim for ad-hoc granular
//! queries. Rows are never mutated.

use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, types::Value, Connection};

use crate::models::{Event, Rule, TxStatus};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY,
    received_at INTEGER NOT NULL,
    merchant_id TEXT NOT NULL,
    provider_id TEXT NOT NULL,
    country TEXT NOT NULL,
    status TEXT NOT NULL,
    sub_status TEXT,
    amount_usd REAL NOT NULL,
    issuer_name TEXT,
    card_brand TEXT NOT NULL,
    bin TEXT NOT NULL,
    response_code TEXT,
    merchant_advice_code TEXT,
    latency_ms INTEGER NOT NULL,
    raw_payload TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_events_received
    ON events(received_at DESC);

CREATE INDEX IF NOT EXISTS idx_events_scope
    ON events(merchant_id, provider_id, received_at DESC);

CREATE INDEX IF NOT EXISTS idx_events_status_received
    ON events(status, received_at DESC);
"#;

/// Optional scope narrowing for event-log queries, mirroring a rule's
/// filter tuple.
#[derive(Debug, Clone, Default)]
pub struct DimensionFilter {
    pub merchant_id: Option<String>,
    pub country: Option<String>,
    pub provider_id: Option<String>,
    pub issuer_name: Option<String>,
}

impl DimensionFilter {
    pub fn from_rule(rule: &Rule) -> Self {
        Self {
            merchant_id: rule.merchant_id.clone(),
            country: rule.country.clone(),
            provider_id: rule.provider_id.clone(),
            issuer_name: rule.issuer_name.clone(),
        }
    }

    /// Appends `AND col = ?` clauses for every populated filter.
    fn push_clauses(&self, sql: &mut String, values: &mut Vec<Value>) {
        for (col, filter) in [
            ("merchant_id", &self.merchant_id),
            ("country", &self.country),
            ("provider_id", &self.provider_id),
            ("issuer_name", &self.issuer_name),
        ] {
            if let Some(v) = filter {
                sql.push_str(" AND ");
                sql.push_str(col);
                sql.push_str(" = ?");
                values.push(Value::Text(v.clone()));
            }
        }
    }
}

/// Per-minute ingest summary for the metrics query endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MinuteSnapshot {
    pub timestamp: i64,
    pub total_count: u64,
    pub approval_rate: f64,
    pub error_rate: f64,
}

pub struct EventLog {
    conn: Mutex<Connection>,
}

impl EventLog {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open event log at {path}"))?;
        conn.busy_timeout(Duration::from_secs(2))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply event log schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append one accepted event. `event_id` collisions surface as errors;
    /// the log never overwrites.
    pub fn append(&self, event: &Event) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO events (
                event_id, received_at, merchant_id, provider_id, country,
                status, sub_status, amount_usd, issuer_name, card_brand,
                bin, response_code, merchant_advice_code, latency_ms, raw_payload
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                event.event_id,
                event.received_at,
                event.merchant_id,
                event.provider_id,
                event.country,
                event.status.as_str(),
                event.sub_status,
                event.amount_usd,
                event.issuer_name,
                event.card_brand,
                event.bin,
                event.response_code,
                event.merchant_advice_code,
                event.latency_ms as i64,
                event.raw_payload,
            ],
        )
        .context("event log append failed")?;
        Ok(())
    }

    pub fn exists(&self, event_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT 1 FROM events WHERE event_id = ?1")?;
        Ok(stmt.exists(params![event_id])?)
    }

    pub fn get_by_id(&self, event_id: &str) -> Result<Option<Event>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT event_id, received_at, merchant_id, provider_id, country,
                    status, sub_status, amount_usd, issuer_name, card_brand,
                    bin, response_code, merchant_advice_code, latency_ms, raw_payload
             FROM events WHERE event_id = ?1",
        )?;
        let mut rows = stmt.query(params![event_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_event(row)?)),
            None => Ok(None),
        }
    }

    /// Count and USD revenue of events with `status` in the scope over
    /// `[from_ts, to_ts)`. Used for revenue-at-risk.
    pub fn adverse_summary(
        &self,
        filter: &DimensionFilter,
        status: TxStatus,
        from_ts: i64,
        to_ts: i64,
    ) -> Result<(u64, f64)> {
        let mut sql = String::from(
            "SELECT COUNT(*), COALESCE(SUM(amount_usd), 0.0) FROM events
             WHERE received_at >= ? AND received_at < ? AND status = ?",
        );
        let mut values = vec![
            Value::Integer(from_ts),
            Value::Integer(to_ts),
            Value::Text(status.as_str().to_string()),
        ];
        filter.push_clauses(&mut sql, &mut values);

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let (count, revenue): (i64, f64) =
            stmt.query_row(params_from_iter(values), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
        Ok((count.max(0) as u64, revenue))
    }

    /// Most recent statuses in the scope since `from_ts`, newest first.
    /// Drives the recovery consecutive-success scan.
    pub fn recent_statuses(
        &self,
        filter: &DimensionFilter,
        from_ts: i64,
        limit: usize,
    ) -> Result<Vec<TxStatus>> {
        let mut sql = String::from("SELECT status FROM events WHERE received_at >= ?");
        let mut values = vec![Value::Integer(from_ts)];
        filter.push_clauses(&mut sql, &mut values);
        sql.push_str(" ORDER BY received_at DESC, event_id DESC LIMIT ?");
        values.push(Value::Integer(limit as i64));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| row.get::<_, String>(0))?;
        let mut out = Vec::with_capacity(limit);
        for raw in rows {
            if let Some(status) = TxStatus::parse(&raw?) {
                out.push(status);
            }
        }
        Ok(out)
    }

    /// Merchant advice codes on recent adverse events in the scope,
    /// newest first. Feeds the suggested-action override.
    pub fn recent_advice_codes(
        &self,
        filter: &DimensionFilter,
        status: TxStatus,
        from_ts: i64,
        limit: usize,
    ) -> Result<Vec<Option<String>>> {
        let mut sql = String::from(
            "SELECT merchant_advice_code FROM events
             WHERE received_at >= ? AND status = ?",
        );
        let mut values = vec![
            Value::Integer(from_ts),
            Value::Text(status.as_str().to_string()),
        ];
        filter.push_clauses(&mut sql, &mut values);
        sql.push_str(" ORDER BY received_at DESC, event_id DESC LIMIT ?");
        values.push(Value::Integer(limit as i64));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            row.get::<_, Option<String>>(0)
        })?;
        let mut out = Vec::with_capacity(limit);
        for code in rows {
            out.push(code?);
        }
        Ok(out)
    }

    /// Per-minute ingest summaries for the trailing `minutes` minutes,
    /// oldest first. Rates are over settled outcomes only.
    pub fn minute_snapshots(&self, now: i64, minutes: i64) -> Result<Vec<MinuteSnapshot>> {
        let from_ts = now - minutes * 60;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT received_at / 60 AS minute,
                    COUNT(*),
                    SUM(CASE WHEN status = 'SUCCEEDED' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'ERROR' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status IN ('SUCCEEDED','DECLINED','ERROR') THEN 1 ELSE 0 END)
             FROM events
             WHERE received_at >= ?1 AND received_at < ?2
             GROUP BY minute ORDER BY minute ASC",
        )?;
        let rows = stmt.query_map(params![from_ts, now], |row| {
            let minute: i64 = row.get(0)?;
            let total: i64 = row.get(1)?;
            let succeeded: i64 = row.get(2)?;
            let errors: i64 = row.get(3)?;
            let settled: i64 = row.get(4)?;
            Ok((minute, total, succeeded, errors, settled))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (minute, total, succeeded, errors, settled) = row?;
            let denom = settled.max(0) as f64;
            out.push(MinuteSnapshot {
                timestamp: minute * 60,
                total_count: total.max(0) as u64,
                approval_rate: if denom > 0.0 {
                    succeeded as f64 / denom
                } else {
                    0.0
                },
                error_rate: if denom > 0.0 {
                    errors as f64 / denom
                } else {
                    0.0
                },
            });
        }
        Ok(out)
    }

    /// Full events over `[from_ts, to_ts)`, oldest first. Lets a detector
    /// running outside the ingest process derive its counters from the
    /// trailing window of the log.
    pub fn events_in_range(&self, from_ts: i64, to_ts: i64) -> Result<Vec<Event>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT event_id, received_at, merchant_id, provider_id, country,
                    status, sub_status, amount_usd, issuer_name, card_brand,
                    bin, response_code, merchant_advice_code, latency_ms, raw_payload
             FROM events WHERE received_at >= ?1 AND received_at < ?2
             ORDER BY received_at ASC",
        )?;
        let mut rows = stmt.query(params![from_ts, to_ts])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_event(row)?);
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get::<_, i64>(0))
            .unwrap_or(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<Event> {
    let status_raw: String = row.get(5)?;
    let status = TxStatus::parse(&status_raw)
        .with_context(|| format!("corrupt status column: {status_raw}"))?;
    Ok(Event {
        event_id: row.get(0)?,
        received_at: row.get(1)?,
        merchant_id: row.get(2)?,
        provider_id: row.get(3)?,
        country: row.get(4)?,
        status,
        sub_status: row.get(6)?,
        amount_usd: row.get(7)?,
        issuer_name: row.get(8)?,
        card_brand: row.get(9)?,
        bin: row.get(10)?,
        response_code: row.get(11)?,
        merchant_advice_code: row.get(12)?,
        latency_ms: row.get::<_, i64>(13)?.max(0) as u64,
        raw_payload: row.get(14)?,
    })
}
