//! Asset database management with SQLite
//!
//! Owns the schema of `assets-<version>.sqlite`: the `equities` metadata table
//! and the append-only `equity_supplementary_mappings` fact table read by
//! [`AssetFinder`](super::AssetFinder).

use crate::asset::Asset;
use crate::error::{PipelineError, Result};
use crate::sql::configure_connection;
use crate::types::{fmt_date, Sid};
use chrono::{Duration, NaiveDate};
use rusqlite::types::{ToSqlOutput, Value};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde::{Deserialize, Serialize};
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS equities (
    sid INTEGER PRIMARY KEY,
    symbol TEXT NOT NULL,
    asset_name TEXT,
    exchange TEXT NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL,
    auto_close_date TEXT
);
CREATE INDEX IF NOT EXISTS ix_equities_symbol ON equities (symbol);

CREATE TABLE IF NOT EXISTS equity_supplementary_mappings (
    sid INTEGER NOT NULL,
    field TEXT NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT,
    value,
    PRIMARY KEY (sid, field, start_date)
);
CREATE INDEX IF NOT EXISTS ix_supplementary_start_date_field
    ON equity_supplementary_mappings (start_date, field);
"#;

/// Value of a supplementary fact. Numeric facts are stored as REAL, labels as TEXT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FactValue {
    Number(f64),
    Text(String),
}

impl FactValue {
    fn matches(&self, stored: &Value) -> bool {
        match (self, stored) {
            (FactValue::Number(a), Value::Real(b)) => a == b,
            (FactValue::Number(a), Value::Integer(b)) => *a == *b as f64,
            (FactValue::Text(a), Value::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl From<f64> for FactValue {
    fn from(v: f64) -> Self {
        FactValue::Number(v)
    }
}

impl From<&str> for FactValue {
    fn from(v: &str) -> Self {
        FactValue::Text(v.to_string())
    }
}

impl From<String> for FactValue {
    fn from(v: String) -> Self {
        FactValue::Text(v)
    }
}

impl ToSql for FactValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            FactValue::Number(v) => ToSqlOutput::from(*v),
            FactValue::Text(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

/// One row of the point-in-time fact table: as of `start_date`, `field` of
/// `sid` became `value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplementaryFact {
    pub sid: Sid,
    pub field: String,
    pub start_date: NaiveDate,
    pub value: FactValue,
}

impl SupplementaryFact {
    pub fn new(sid: Sid, field: impl Into<String>, start_date: NaiveDate, value: impl Into<FactValue>) -> Self {
        Self {
            sid,
            field: field.into(),
            start_date,
            value: value.into(),
        }
    }

    /// A quarterly filing becomes visible the day after its filing date
    pub fn filing(sid: Sid, field: impl Into<String>, datekey: NaiveDate, value: f64) -> Self {
        Self::new(sid, field, datekey + Duration::days(1), value)
    }
}

/// Asset database with SQLite backend
pub struct AssetDB {
    conn: Connection,
}

impl AssetDB {
    /// Create or open database at path
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(|e| {
            PipelineError::InvalidInput(format!(
                "Failed to open asset database {}: {}",
                db_path.display(),
                e
            ))
        })?;
        configure_connection(&conn)?;
        let db = Self { conn };
        db.create_tables()?;
        Ok(db)
    }

    /// Create in-memory database (for testing)
    pub fn new_in_memory() -> Result<Self> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.create_tables()?;
        Ok(db)
    }

    /// Create database tables
    pub fn create_tables(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Hand the connection over to a reader
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    /// Insert or replace equity metadata
    pub fn write_equities(&mut self, assets: &[Asset]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO equities
                 (sid, symbol, asset_name, exchange, start_date, end_date, auto_close_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for asset in assets {
                stmt.execute(params![
                    asset.sid as i64,
                    asset.symbol.to_uppercase(),
                    asset.name,
                    asset.exchange,
                    fmt_date(asset.start_date),
                    fmt_date(asset.end_date),
                    asset.auto_close_date.map(fmt_date),
                ])?;
            }
        }
        tx.commit()?;
        log::info!("Wrote {} equities", assets.len());
        Ok(assets.len())
    }

    /// Append facts. A fact with the same `(sid, field, start_date)` replaces
    /// the stored one, so re-ingesting a vendor file is idempotent.
    pub fn insert_facts(&mut self, facts: &[SupplementaryFact]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO equity_supplementary_mappings
                 (sid, field, start_date, end_date, value) VALUES (?1, ?2, ?3, NULL, ?4)",
            )?;
            for fact in facts {
                if let FactValue::Number(v) = fact.value {
                    if v.is_nan() {
                        continue;
                    }
                }
                stmt.execute(params![
                    fact.sid as i64,
                    fact.field,
                    fmt_date(fact.start_date),
                    fact.value,
                ])?;
            }
        }
        tx.commit()?;
        log::debug!("Inserted {} supplementary facts", facts.len());
        Ok(facts.len())
    }

    /// True if `(sid, field)` already has a latest value and it differs from `value`
    pub fn value_changed(&self, sid: Sid, field: &str, value: &FactValue) -> Result<bool> {
        let stored: Option<Value> = self
            .conn
            .query_row(
                "SELECT value FROM equity_supplementary_mappings
                 WHERE sid = ?1 AND field = ?2 ORDER BY start_date DESC LIMIT 1",
                params![sid as i64, field],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match stored {
            None => false,
            Some(stored) => !value.matches(&stored),
        })
    }

    /// Record a slowly-changing descriptive field (sector, exchange, ...).
    ///
    /// The first observation is back-dated to `first_date` so history sees
    /// it; a later change only becomes visible from `observed_on`. Unchanged
    /// values are rewritten in place.
    pub fn upsert_info(
        &mut self,
        sid: Sid,
        field: &str,
        value: impl Into<FactValue>,
        first_date: NaiveDate,
        observed_on: NaiveDate,
    ) -> Result<()> {
        let value = value.into();
        let start_date = if self.value_changed(sid, field, &value)? {
            observed_on
        } else {
            first_date
        };
        self.insert_facts(&[SupplementaryFact::new(sid, field, start_date, value)])?;
        Ok(())
    }

    pub fn fact_count(&self) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM equity_supplementary_mappings",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
