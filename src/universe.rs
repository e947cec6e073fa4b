//! Named universe store
//!
//! A universe is the output of a screen evaluated over history, kept as
//! `(date, sid)` membership rows in one table per name inside
//! `universes.sqlite`. Rows are written with `INSERT OR REPLACE`, so
//! re-running a range is idempotent and a universe can be extended from
//! its last stored date.

use crate::error::{PipelineError, Result};
use crate::pipeline::engine::{Pipeline, SimplePipelineEngine};
use crate::pipeline::term::{OutputKind, Term};
use crate::sql::{configure_connection, quote_identifier, table_exists};
use crate::types::{fmt_date, parse_date, Sid};
use chrono::NaiveDate;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub struct UniverseStore {
    conn: Mutex<Connection>,
}

impl UniverseStore {
    /// Open (or create) the universe database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        configure_connection(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn new_in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::LockPoisoned("universe store connection"))
    }

    fn ensure_table(conn: &Connection, name: &str) -> Result<String> {
        let table = quote_identifier(name)?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                date TEXT NOT NULL,
                sid INTEGER NOT NULL,
                PRIMARY KEY (date, sid)
            );
            CREATE INDEX IF NOT EXISTS {index} ON {table} (date);",
            table = table,
            index = quote_identifier(&format!("{}_date_idx", name))?,
        ))?;
        Ok(table)
    }

    /// Names of every stored universe
    pub fn names(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Upsert membership rows, returning how many were written
    pub fn write_rows(&self, name: &str, rows: &[(NaiveDate, Sid)]) -> Result<usize> {
        let mut conn = self.conn()?;
        let table = Self::ensure_table(&conn, name)?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!("INSERT OR REPLACE INTO {} (date, sid) VALUES (?1, ?2)", table))?;
            for (date, sid) in rows {
                stmt.execute(params![fmt_date(*date), *sid as i64])?;
            }
        }
        tx.commit()?;
        log::debug!("Wrote {} rows to universe {}", rows.len(), name);
        Ok(rows.len())
    }

    /// Members of `name` on `date`, ascending; empty for unknown universes
    pub fn get_sid(&self, name: &str, date: NaiveDate) -> Result<Vec<Sid>> {
        let table = quote_identifier(name)?;
        let conn = self.conn()?;
        if !table_exists(&conn, name)? {
            log::debug!("Universe {} does not exist", name);
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare_cached(&format!("SELECT sid FROM {} WHERE date = ?1 ORDER BY sid", table))?;
        let sids = stmt
            .query_map([fmt_date(date)], |row| row.get::<_, i64>(0))?
            .map(|sid| sid.map(|s| s as Sid))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sids)
    }

    /// Latest stored date of `name`
    pub fn get_last_date(&self, name: &str) -> Result<Option<NaiveDate>> {
        let table = quote_identifier(name)?;
        let conn = self.conn()?;
        if !table_exists(&conn, name)? {
            return Ok(None);
        }
        let last: Option<String> = conn.query_row(&format!("SELECT MAX(date) FROM {}", table), [], |row| row.get(0))?;
        last.as_deref().map(parse_date).transpose()
    }

    /// Evaluate `screen` over `[start, end]` and store every passing
    /// `(date, sid)` pair under `name`
    pub fn write(
        &self,
        name: &str,
        engine: &SimplePipelineEngine,
        screen: Arc<dyn Term>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<usize> {
        quote_identifier(name)?;
        if screen.output_kind() != OutputKind::Boolean {
            return Err(PipelineError::TypeMismatch(format!(
                "Universe screen {} is not a filter",
                screen.identity()
            )));
        }
        let mut pipeline = Pipeline::new();
        pipeline.set_screen(screen);
        let output = engine.run_pipeline(&pipeline, start, end, None)?;

        let rows: Vec<(NaiveDate, Sid)> = output
            .dates()
            .iter()
            .copied()
            .zip(output.sids().iter().copied())
            .collect();
        let written = self.write_rows(name, &rows)?;
        log::info!(
            "Universe {}: {} memberships over {} sessions ({} to {})",
            name,
            written,
            output.unique_dates().len(),
            start,
            end
        );
        Ok(written)
    }

    /// Extend `name` up to `end`, starting the session after its last
    /// stored date (or at `default_start` for a new universe)
    pub fn update_universe(
        &self,
        name: &str,
        engine: &SimplePipelineEngine,
        screen: Arc<dyn Term>,
        default_start: NaiveDate,
        end: NaiveDate,
    ) -> Result<usize> {
        let start = match self.get_last_date(name)? {
            Some(last) => {
                let calendar = engine.context().calendar();
                if last >= end || calendar.last_session().map_or(true, |l| last >= l) {
                    log::info!("Universe {} is up to date ({})", name, last);
                    return Ok(0);
                }
                calendar.next_session(last)?
            }
            None => default_start,
        };
        if start > end {
            log::info!("Universe {} is up to date", name);
            return Ok(0);
        }
        self.write(name, engine, screen, start, end)
    }
}
