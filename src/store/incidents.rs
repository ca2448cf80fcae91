//! Incident store: alert episodes plus the detector advisory lease.
//!
//! The detector is the only writer of state transitions; the enricher
//! touches enrichment fields and the ENRICHING -> NOTIFIED edge. All
//! transitions are guarded on the current state so a stale writer loses.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, types::Value, Connection};
use tracing::error;

use crate::error::CoreError;
use crate::models::{
    EnrichmentStatus, Incident, IncidentState, RootCauseScope, Severity,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS incidents (
    incident_id TEXT PRIMARY KEY,
    rule_id TEXT NOT NULL,
    dimension_key TEXT NOT NULL,
    opened_at INTEGER NOT NULL,
    last_evaluated_at INTEGER NOT NULL,
    closed_at INTEGER,
    state TEXT NOT NULL,
    severity TEXT NOT NULL,
    observed_value REAL NOT NULL,
    affected_transactions INTEGER NOT NULL,
    revenue_at_risk_usd REAL NOT NULL,
    response_code_breakdown TEXT NOT NULL,
    root_cause TEXT NOT NULL,
    llm_explanation TEXT,
    suggested_action TEXT NOT NULL,
    enrichment_status TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_incidents_key
    ON incidents(rule_id, dimension_key, state);

CREATE INDEX IF NOT EXISTS idx_incidents_opened
    ON incidents(opened_at DESC);

CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;
"#;

const LEASE_KEY: &str = "detector_lease";

const SELECT_COLS: &str = "incident_id, rule_id, dimension_key, opened_at, last_evaluated_at,
     closed_at, state, severity, observed_value, affected_transactions,
     revenue_at_risk_usd, response_code_breakdown, root_cause,
     llm_explanation, suggested_action, enrichment_status";

pub struct IncidentStore {
    conn: Mutex<Connection>,
}

impl IncidentStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open incident store at {path}"))?;
        conn.busy_timeout(Duration::from_secs(2))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply incident store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert(&self, incident: &Incident) -> Result<()> {
        let breakdown = serde_json::to_string(&incident.response_code_breakdown)?;
        let root_cause = serde_json::to_string(&incident.root_cause)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO incidents (
                incident_id, rule_id, dimension_key, opened_at, last_evaluated_at,
                closed_at, state, severity, observed_value, affected_transactions,
                revenue_at_risk_usd, response_code_breakdown, root_cause,
                llm_explanation, suggested_action, enrichment_status
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                incident.incident_id,
                incident.rule_id,
                incident.dimension_key,
                incident.opened_at,
                incident.last_evaluated_at,
                incident.closed_at,
                incident.state.as_str(),
                incident.severity.as_str(),
                incident.observed_value,
                incident.affected_transactions as i64,
                incident.revenue_at_risk_usd,
                breakdown,
                root_cause,
                incident.llm_explanation,
                incident.suggested_action,
                incident.enrichment_status.as_str(),
            ],
        )
        .context("incident insert failed")?;
        Ok(())
    }

    pub fn get(&self, incident_id: &str) -> Result<Option<Incident>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {SELECT_COLS} FROM incidents WHERE incident_id = ?1");
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(params![incident_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_incident(row)?)),
            None => Ok(None),
        }
    }

    /// The at-most-one active (OPEN/ENRICHING/NOTIFIED) incident for a
    /// `(rule, dimension)` pair.
    pub fn active_for_key(&self, rule_id: &str, dimension_key: &str) -> Result<Option<Incident>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {SELECT_COLS} FROM incidents
             WHERE rule_id = ?1 AND dimension_key = ?2
               AND state IN ('OPEN','ENRICHING','NOTIFIED')
             ORDER BY opened_at DESC LIMIT 1"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(params![rule_id, dimension_key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_incident(row)?)),
            None => Ok(None),
        }
    }

    /// Refresh the live observation on an existing active incident.
    pub fn update_observation(
        &self,
        incident_id: &str,
        observed_value: f64,
        affected_transactions: u64,
        revenue_at_risk_usd: f64,
        severity: Severity,
        last_evaluated_at: i64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE incidents SET observed_value = ?2, affected_transactions = ?3,
                    revenue_at_risk_usd = ?4, severity = ?5, last_evaluated_at = ?6
             WHERE incident_id = ?1",
            params![
                incident_id,
                observed_value,
                affected_transactions as i64,
                revenue_at_risk_usd,
                severity.as_str(),
                last_evaluated_at,
            ],
        )?;
        Ok(())
    }

    /// Guarded state transition. Returns false when the incident is no
    /// longer in one of `from` (a concurrent writer won).
    pub fn transition(
        &self,
        incident_id: &str,
        from: &[IncidentState],
        to: IncidentState,
        closed_at: Option<i64>,
        last_evaluated_at: i64,
    ) -> Result<bool> {
        let mut sql = String::from(
            "UPDATE incidents SET state = ?, last_evaluated_at = ?, closed_at = COALESCE(?, closed_at)
             WHERE incident_id = ? AND state IN (",
        );
        let mut values: Vec<Value> = vec![
            Value::Text(to.as_str().to_string()),
            Value::Integer(last_evaluated_at),
            match closed_at {
                Some(ts) => Value::Integer(ts),
                None => Value::Null,
            },
            Value::Text(incident_id.to_string()),
        ];
        for (i, state) in from.iter().enumerate() {
            if i > 0 {
                sql.push(',');
            }
            sql.push('?');
            values.push(Value::Text(state.as_str().to_string()));
        }
        sql.push(')');

        let conn = self.conn.lock();
        let changed = conn.execute(&sql, params_from_iter(values))?;
        Ok(changed > 0)
    }

    /// Enricher write path: explanation + status, independent of state.
    pub fn set_enrichment(
        &self,
        incident_id: &str,
        explanation: Option<&str>,
        status: EnrichmentStatus,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE incidents SET llm_explanation = ?2, enrichment_status = ?3
             WHERE incident_id = ?1",
            params![incident_id, explanation, status.as_str()],
        )?;
        Ok(())
    }

    /// Most recent closure time for the pair; drives the cooldown check.
    pub fn last_closed_at(&self, rule_id: &str, dimension_key: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT MAX(closed_at) FROM incidents
             WHERE rule_id = ?1 AND dimension_key = ?2 AND closed_at IS NOT NULL",
        )?;
        Ok(stmt.query_row(params![rule_id, dimension_key], |row| {
            row.get::<_, Option<i64>>(0)
        })?)
    }

    /// Latest SUPPRESSED marker for the pair, if any.
    pub fn latest_suppressed(
        &self,
        rule_id: &str,
        dimension_key: &str,
    ) -> Result<Option<Incident>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {SELECT_COLS} FROM incidents
             WHERE rule_id = ?1 AND dimension_key = ?2 AND state = 'SUPPRESSED'
             ORDER BY opened_at DESC LIMIT 1"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(params![rule_id, dimension_key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_incident(row)?)),
            None => Ok(None),
        }
    }

    pub fn touch(&self, incident_id: &str, last_evaluated_at: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE incidents SET last_evaluated_at = ?2 WHERE incident_id = ?1",
            params![incident_id, last_evaluated_at],
        )?;
        Ok(())
    }

    /// Incidents ordered by `opened_at` desc, optionally bounded by open
    /// time and filtered to a state set.
    pub fn list(
        &self,
        since: Option<i64>,
        states: Option<&[IncidentState]>,
        limit: usize,
    ) -> Result<Vec<Incident>> {
        let mut sql = format!("SELECT {SELECT_COLS} FROM incidents WHERE 1=1");
        let mut values: Vec<Value> = Vec::new();
        if let Some(since) = since {
            sql.push_str(" AND opened_at >= ?");
            values.push(Value::Integer(since));
        }
        if let Some(states) = states {
            if !states.is_empty() {
                sql.push_str(" AND state IN (");
                for (i, state) in states.iter().enumerate() {
                    if i > 0 {
                        sql.push(',');
                    }
                    sql.push('?');
                    values.push(Value::Text(state.as_str().to_string()));
                }
                sql.push(')');
            }
        }
        sql.push_str(" ORDER BY opened_at DESC LIMIT ?");
        values.push(Value::Integer(limit as i64));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(params_from_iter(values))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            // A corrupt row is an invariant violation: page the operator
            // via the log and suppress the row rather than failing the
            // whole listing.
            match row_to_incident(row) {
                Ok(incident) => out.push(incident),
                Err(e) => error!(error = %e, "corrupt incident row suppressed"),
            }
        }
        Ok(out)
    }

    pub fn count_active(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM incidents WHERE state IN ('OPEN','ENRICHING','NOTIFIED')",
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Advisory lease on the well-known metadata key. Grants when the
    /// lease is free, expired, or already held by `owner`; renewal and
    /// acquisition are the same operation.
    pub fn try_acquire_lease(&self, owner: &str, now: i64, ttl_seconds: i64) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                params![LEASE_KEY],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let available = match current.as_deref().and_then(parse_lease) {
            Some((holder, expires_at)) => holder == owner || expires_at <= now,
            None => true,
        };
        if !available {
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![LEASE_KEY, format!("{owner}:{}", now + ttl_seconds)],
        )?;
        tx.commit()?;
        Ok(true)
    }
}

fn parse_lease(raw: &str) -> Option<(&str, i64)> {
    let (holder, expires) = raw.rsplit_once(':')?;
    Some((holder, expires.parse().ok()?))
}

fn row_to_incident(row: &rusqlite::Row<'_>) -> Result<Incident> {
    let state_raw: String = row.get(6)?;
    let severity_raw: String = row.get(7)?;
    let enrichment_raw: String = row.get(15)?;
    let breakdown_raw: String = row.get(11)?;
    let root_cause_raw: String = row.get(12)?;

    let state = IncidentState::parse(&state_raw)
        .ok_or_else(|| CoreError::Invariant(format!("corrupt state column: {state_raw}")))?;
    let severity = Severity::parse(&severity_raw)
        .ok_or_else(|| CoreError::Invariant(format!("corrupt severity column: {severity_raw}")))?;
    let enrichment_status = EnrichmentStatus::parse(&enrichment_raw).ok_or_else(|| {
        CoreError::Invariant(format!("corrupt enrichment_status column: {enrichment_raw}"))
    })?;
    let response_code_breakdown: BTreeMap<String, u64> = serde_json::from_str(&breakdown_raw)
        .map_err(|e| CoreError::Invariant(format!("corrupt response_code_breakdown: {e}")))?;
    let root_cause: RootCauseScope = serde_json::from_str(&root_cause_raw)
        .map_err(|e| CoreError::Invariant(format!("corrupt root_cause: {e}")))?;

    Ok(Incident {
        incident_id: row.get(0)?,
        rule_id: row.get(1)?,
        dimension_key: row.get(2)?,
        opened_at: row.get(3)?,
        last_evaluated_at: row.get(4)?,
        closed_at: row.get(5)?,
        state,
        severity,
        observed_value: row.get(8)?,
        affected_transactions: row.get::<_, i64>(9)?.max(0) as u64,
        revenue_at_risk_usd: row.get(10)?,
        response_code_breakdown,
        root_cause,
        llm_explanation: row.get(13)?,
        suggested_action: row.get(14)?,
        enrichment_status,
        sla_breach_countdown_seconds: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetricType;

    fn temp_store() -> (tempfile::TempDir, IncidentStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("incidents.db");
        let store = IncidentStore::open(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    fn incident(id: &str, state: IncidentState, opened_at: i64) -> Incident {
        Incident {
            incident_id: id.to_string(),
            rule_id: "r1".into(),
            dimension_key: "shopito/*/STRIPE/_/ERROR_RATE".into(),
            opened_at,
            last_evaluated_at: opened_at,
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

    #[test]
    fn insert_and_round_trip() {
        let (_dir, store) = temp_store();
        let inc = incident("i1", IncidentState::Open, 1000);
        store.insert(&inc).unwrap();

        let fetched = store.get("i1").unwrap().unwrap();
        assert_eq!(fetched.state, IncidentState::Open);
        assert_eq!(fetched.response_code_breakdown.get("503"), Some(&20));
        assert_eq!(fetched.root_cause.metric, MetricType::ErrorRate);
    }

    #[test]
    fn active_lookup_ignores_terminal_states() {
        let (_dir, store) = temp_store();
        let mut closed = incident("i1", IncidentState::Recovered, 500);
        closed.closed_at = Some(600);
        store.insert(&closed).unwrap();
        assert!(store
            .active_for_key("r1", "shopito/*/STRIPE/_/ERROR_RATE")
            .unwrap()
            .is_none());

        store
            .insert(&incident("i2", IncidentState::Enriching, 700))
            .unwrap();
        let active = store
            .active_for_key("r1", "shopito/*/STRIPE/_/ERROR_RATE")
            .unwrap()
            .unwrap();
        assert_eq!(active.incident_id, "i2");
    }

    #[test]
    fn guarded_transition_loses_when_state_moved() {
        let (_dir, store) = temp_store();
        store
            .insert(&incident("i1", IncidentState::Enriching, 1000))
            .unwrap();

        // Recovery closes it first.
        assert!(store
            .transition(
                "i1",
                &[IncidentState::Open, IncidentState::Enriching, IncidentState::Notified],
                IncidentState::Recovered,
                Some(1100),
                1100,
            )
            .unwrap());

        // The enricher's NOTIFIED edge must now be a no-op.
        assert!(!store
            .transition("i1", &[IncidentState::Enriching], IncidentState::Notified, None, 1200)
            .unwrap());

        let inc = store.get("i1").unwrap().unwrap();
        assert_eq!(inc.state, IncidentState::Recovered);
        assert_eq!(inc.closed_at, Some(1100));
    }

    #[test]
    fn cooldown_reads_latest_closure() {
        let (_dir, store) = temp_store();
        let mut a = incident("i1", IncidentState::Recovered, 100);
        a.closed_at = Some(200);
        let mut b = incident("i2", IncidentState::Recovered, 300);
        b.closed_at = Some(400);
        store.insert(&a).unwrap();
        store.insert(&b).unwrap();

        assert_eq!(
            store
                .last_closed_at("r1", "shopito/*/STRIPE/_/ERROR_RATE")
                .unwrap(),
            Some(400)
        );
        assert_eq!(store.last_closed_at("r1", "other").unwrap(), None);
    }

    #[test]
    fn list_orders_and_filters() {
        let (_dir, store) = temp_store();
        store.insert(&incident("i1", IncidentState::Open, 100)).unwrap();
        store
            .insert(&incident("i2", IncidentState::Recovered, 200))
            .unwrap();
        store.insert(&incident("i3", IncidentState::Open, 300)).unwrap();

        let all = store.list(None, None, 50).unwrap();
        assert_eq!(
            all.iter().map(|i| i.incident_id.as_str()).collect::<Vec<_>>(),
            vec!["i3", "i2", "i1"]
        );

        let open_only = store
            .list(Some(150), Some(&[IncidentState::Open]), 50)
            .unwrap();
        assert_eq!(open_only.len(), 1);
        assert_eq!(open_only[0].incident_id, "i3");

        assert_eq!(store.count_active().unwrap(), 2);
    }

    #[test]
    fn corrupt_row_is_suppressed_from_listings() {
        let (_dir, store) = temp_store();
        store.insert(&incident("i1", IncidentState::Open, 100)).unwrap();
        store.insert(&incident("i2", IncidentState::Open, 200)).unwrap();

        {
            let conn = store.conn.lock();
            conn.execute(
                "UPDATE incidents SET root_cause = 'not json' WHERE incident_id = 'i1'",
                [],
            )
            .unwrap();
        }

        // The broken row drops out of listings; the healthy one survives.
        let listed = store.list(None, None, 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].incident_id, "i2");

        // Direct lookup surfaces the violation to the caller.
        assert!(store.get("i1").is_err());
        assert!(store.get("i2").unwrap().is_some());
    }

    #[test]
    fn lease_grants_free_expired_and_own() {
        let (_dir, store) = temp_store();
        assert!(store.try_acquire_lease("det-a", 1000, 30).unwrap());
        // Held by someone else and still live.
        assert!(!store.try_acquire_lease("det-b", 1010, 30).unwrap());
        // Renewal by the holder.
        assert!(store.try_acquire_lease("det-a", 1020, 30).unwrap());
        // Expired lease is up for grabs.
        assert!(store.try_acquire_lease("det-b", 1060, 30).unwrap());
        assert!(!store.try_acquire_lease("det-a", 1070, 30).unwrap());
    }
}
