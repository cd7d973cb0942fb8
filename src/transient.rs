//! Transient relations: call scoped `temp` tables holding identifier sets.
//!
//! SQLite keeps the `temp` schema private to the connection that created it,
//! so relations never leak between sessions. Within a session a relation is an
//! RAII guard; it is dropped on every exit path, including early returns,
//! errors and cancellation.
//!
//! Population goes through a [`BulkPopulationPolicy`]. Policies only carry
//! performance hints; results never depend on which one is used.

use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::{Connection, Params, params};
use roaring::RoaringTreemap;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::construct::Thing;
use crate::error::{Result, Step, StepContext};

/// Every transient relation name starts with this prefix.
pub const RELATION_PREFIX: &str = "transient_";

// check for cancellation this often while inserting rows one by one
const CHECK_EVERY: usize = 4096;

static NEXT_RELATION: AtomicU64 = AtomicU64::new(1);

// ------------- Population policies -------------
/// Store specific hints applied around bulk population.
pub trait BulkPopulationPolicy: Send + Sync {
    fn name(&self) -> &'static str;
    /// Runs on the session before each population.
    fn prepare(&self, _conn: &Connection) -> rusqlite::Result<()> {
        Ok(())
    }
    /// Whether a population is written as one unit.
    fn single_write_unit(&self) -> bool {
        false
    }
    /// Refreshes optimizer statistics for a relation.
    fn refresh_statistics(&self, _conn: &Connection, _relation: &str) -> rusqlite::Result<()> {
        Ok(())
    }
    /// Called after a population has been written.
    fn populated(&self, _relation: &str, _rows: usize) {}
}

/// The policy for stores without any hints.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHints;

impl BulkPopulationPolicy for NoHints {
    fn name(&self) -> &'static str {
        "none"
    }
}

/// SQLite hints: capped auxiliary worker threads, savepoint batched writes,
/// and `analyze` for fresh planner statistics.
#[derive(Debug, Clone, Copy)]
pub struct SqliteHints {
    max_workers: u32,
}

impl SqliteHints {
    pub fn new(max_workers: u32) -> Self {
        Self {
            max_workers: max_workers.max(1),
        }
    }
    pub fn max_workers(&self) -> u32 {
        self.max_workers
    }
}

impl BulkPopulationPolicy for SqliteHints {
    fn name(&self) -> &'static str {
        "sqlite"
    }
    fn prepare(&self, conn: &Connection) -> rusqlite::Result<()> {
        // the pragma answers with the limit in effect, drain it
        let mut statement = conn.prepare(&format!("pragma threads = {}", self.max_workers))?;
        let mut rows = statement.query([])?;
        while rows.next()?.is_some() {}
        Ok(())
    }
    fn single_write_unit(&self) -> bool {
        true
    }
    fn refresh_statistics(&self, conn: &Connection, relation: &str) -> rusqlite::Result<()> {
        conn.execute_batch(&format!("analyze {relation}"))
    }
}

// ------------- Write units -------------
const SAVEPOINT: &str = "transient_populate";

struct WriteUnit<'c> {
    conn: Option<&'c Connection>,
}

impl<'c> WriteUnit<'c> {
    fn begin(conn: &'c Connection, enabled: bool) -> Result<Self> {
        if !enabled {
            return Ok(Self { conn: None });
        }
        conn.execute_batch(&format!("savepoint {SAVEPOINT}"))
            .at(Step::Populate)?;
        Ok(Self { conn: Some(conn) })
    }
    fn commit(mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.execute_batch(&format!("release {SAVEPOINT}")) {
                rollback(conn);
                return Err(e).at(Step::Populate);
            }
        }
        Ok(())
    }
}

impl Drop for WriteUnit<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            rollback(conn);
        }
    }
}

fn rollback(conn: &Connection) {
    if let Err(e) = conn.execute_batch(&format!("rollback to {SAVEPOINT}; release {SAVEPOINT}")) {
        warn!(error = %e, "could not roll back transient population");
    }
}

// ------------- TransientRelation -------------
/// A `temp` table with a single `Id` column, dropped when the guard goes away.
pub struct TransientRelation<'c> {
    conn: &'c Connection,
    name: String,
    indexed: bool,
    released: bool,
}

impl<'c> TransientRelation<'c> {
    pub fn create(conn: &'c Connection, purpose: &'static str, cancel: &CancelToken) -> Result<Self> {
        cancel.check()?;
        let name = format!(
            "{RELATION_PREFIX}{purpose}_{}",
            NEXT_RELATION.fetch_add(1, Ordering::Relaxed)
        );
        conn.execute_batch(&format!("create temp table {name} (Id integer not null)"))
            .at(Step::CreateRelation)?;
        debug!(relation = %name, "transient relation created");
        Ok(Self {
            conn,
            name,
            indexed: false,
            released: false,
        })
    }

    /// Creates a relation and inserts `ids` into it in one write unit.
    pub fn create_and_populate<I>(
        conn: &'c Connection,
        purpose: &'static str,
        ids: I,
        policy: &dyn BulkPopulationPolicy,
        cancel: &CancelToken,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = Thing>,
    {
        let relation = Self::create(conn, purpose, cancel)?;
        cancel.check()?;
        policy.prepare(conn).at(Step::Populate)?;
        let unit = WriteUnit::begin(conn, policy.single_write_unit())?;
        let mut rows = 0;
        {
            let mut insert = conn
                .prepare(&format!("insert into {} (Id) values (?1)", relation.qualified()))
                .at(Step::Populate)?;
            for id in ids {
                if rows % CHECK_EVERY == 0 {
                    cancel.check()?;
                }
                insert.execute(params![id]).at(Step::Populate)?;
                rows += 1;
            }
        }
        unit.commit()?;
        debug!(relation = %relation.name, rows, policy = policy.name(), "transient relation populated");
        policy.populated(&relation.name, rows);
        Ok(relation)
    }

    /// Runs a set oriented statement that writes into this relation.
    /// Returns the number of rows written.
    pub fn populate_with<P: Params>(
        &self,
        statement: &str,
        params: P,
        policy: &dyn BulkPopulationPolicy,
        cancel: &CancelToken,
    ) -> Result<usize> {
        cancel.check()?;
        policy.prepare(self.conn).at(Step::Populate)?;
        let unit = WriteUnit::begin(self.conn, policy.single_write_unit())?;
        let rows = self.conn.execute(statement, params).at(Step::Populate)?;
        unit.commit()?;
        debug!(relation = %self.name, rows, policy = policy.name(), "transient relation populated");
        policy.populated(&self.name, rows);
        Ok(rows)
    }

    /// Builds the uniqueness index on `Id`. Must follow population: an index
    /// present during the insert serializes it.
    pub fn build_unique_index(&mut self, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        if self.indexed {
            return Ok(());
        }
        self.conn
            .execute_batch(&format!(
                "create unique index temp.{name}_id on {name} (Id)",
                name = self.name
            ))
            .at(Step::BuildIndex)?;
        self.indexed = true;
        debug!(relation = %self.name, "transient relation indexed");
        Ok(())
    }

    pub fn refresh_statistics(&self, policy: &dyn BulkPopulationPolicy, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        policy
            .refresh_statistics(self.conn, &self.qualified())
            .at(Step::RefreshStatistics)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    /// Name usable in statements run on the owning session.
    pub fn qualified(&self) -> String {
        format!("temp.{}", self.name)
    }
    pub fn is_indexed(&self) -> bool {
        self.indexed
    }

    pub fn len(&self, cancel: &CancelToken) -> Result<u64> {
        cancel.check()?;
        self.conn
            .query_row(&format!("select count(*) from {}", self.qualified()), [], |r| r.get(0))
            .at(Step::Hydrate)
    }

    pub fn ids(&self, cancel: &CancelToken) -> Result<RoaringTreemap> {
        cancel.check()?;
        let mut statement = self
            .conn
            .prepare(&format!("select Id from {}", self.qualified()))
            .at(Step::Hydrate)?;
        let ids = statement
            .query_map([], |r| r.get::<_, Thing>(0))
            .at(Step::Hydrate)?
            .collect::<rusqlite::Result<RoaringTreemap>>()
            .at(Step::Hydrate)?;
        Ok(ids)
    }

    /// Drops the relation now, reporting failure instead of only logging it.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.conn
            .execute_batch(&format!("drop table if exists {}", self.qualified()))
            .at(Step::DropRelation)?;
        debug!(relation = %self.name, "transient relation released");
        Ok(())
    }
}

impl Drop for TransientRelation<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self
            .conn
            .execute_batch(&format!("drop table if exists {}", self.qualified()))
        {
            Ok(()) => debug!(relation = %self.name, "transient relation dropped"),
            Err(e) => warn!(relation = %self.name, error = %e, "could not drop transient relation"),
        }
    }
}

/// Transient relations currently present on a session.
pub fn live_relations(conn: &Connection) -> Result<Vec<String>> {
    let mut statement = conn
        .prepare(
            "
            select name
                from sqlite_temp_master
                where type = 'table'
                and name like 'transient\\_%' escape '\\'
                order by name
        ",
        )
        .at(Step::DropRelation)?;
    let names = statement
        .query_map([], |r| r.get::<_, String>(0))
        .at(Step::DropRelation)?
        .collect::<rusqlite::Result<Vec<String>>>()
        .at(Step::DropRelation)?;
    Ok(names)
}
