//! Merchant baselines: SLA expectations and long-run approval rates.

use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::models::MerchantBaseline;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS merchant_baselines (
    merchant_id TEXT PRIMARY KEY,
    sla_minutes INTEGER NOT NULL,
    avg_approval_rate REAL NOT NULL
) WITHOUT ROWID;
"#;

pub struct BaselineStore {
    conn: Mutex<Connection>,
}

impl BaselineStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open baseline store at {path}"))?;
        conn.busy_timeout(Duration::from_secs(2))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply baseline store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn upsert(&self, baseline: &MerchantBaseline) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO merchant_baselines (merchant_id, sla_minutes, avg_approval_rate)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(merchant_id) DO UPDATE SET
                 sla_minutes = excluded.sla_minutes,
                 avg_approval_rate = excluded.avg_approval_rate",
            params![
                baseline.merchant_id,
                baseline.sla_minutes as i64,
                baseline.avg_approval_rate,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, merchant_id: &str) -> Result<Option<MerchantBaseline>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT merchant_id, sla_minutes, avg_approval_rate
             FROM merchant_baselines WHERE merchant_id = ?1",
        )?;
        let mut rows = stmt.query(params![merchant_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(MerchantBaseline {
                merchant_id: row.get(0)?,
                sla_minutes: row.get::<_, i64>(1)?.max(0) as u32,
                avg_approval_rate: row.get(2)?,
            })),
            None => Ok(None),
        }
    }
}
