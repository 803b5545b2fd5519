//! In-memory destination.
//!
//! Holds rows in process memory with transactional staging: writes after
//! `begin_unit_of_work` land in a staged copy that `commit` publishes and
//! `rollback` discards. Primary keys are unique per table; foreign keys are
//! not enforced. A destination can be told to fail every write to one table,
//! which is how rollback paths are exercised without a database.
//!
//! Without transactions a chunk behaves like an ordered document insert: rows
//! before a duplicate key stay written and the error reports how many.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::config::TargetMode;
use crate::core::schema::TableDefinition;
use crate::core::traits::{Backend, Capabilities, Destination};
use crate::core::value::{InsertRecord, SqlValue};
use crate::error::{MigrateError, Result};

#[derive(Debug, Clone, Default)]
struct StoredTable {
    columns: Vec<String>,
    primary_key: Option<String>,
    rows: Vec<Vec<SqlValue>>,
}

impl StoredTable {
    fn new(table: &TableDefinition) -> Self {
        Self {
            columns: table.columns.iter().map(|c| c.name.clone()).collect(),
            primary_key: Some(table.primary_key.clone()),
            rows: Vec::new(),
        }
    }

    fn key_index(&self) -> Option<usize> {
        let pk = self.primary_key.as_ref()?;
        self.columns.iter().position(|c| c == pk)
    }
}

type Store = BTreeMap<String, StoredTable>;

#[derive(Debug, Default)]
struct State {
    committed: Store,
    staged: Option<Store>,
    commits: usize,
    rollbacks: usize,
}

impl State {
    fn active(&mut self) -> &mut Store {
        match self.staged {
            Some(ref mut staged) => staged,
            None => &mut self.committed,
        }
    }
}

/// Destination that keeps everything in memory.
#[derive(Debug)]
pub struct MemoryDestination {
    state: Mutex<State>,
    fail_on_table: Option<String>,
    transactional: bool,
}

impl Default for MemoryDestination {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDestination {
    /// Transactional in-memory destination.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            fail_on_table: None,
            transactional: true,
        }
    }

    /// In-memory destination without transactions, behaving like a document
    /// store: every chunk is durable as soon as it is written.
    pub fn non_transactional() -> Self {
        Self {
            transactional: false,
            ..Self::new()
        }
    }

    /// Fail every write to `table`.
    pub fn fail_on_table(mut self, table: impl Into<String>) -> Self {
        self.fail_on_table = Some(table.into());
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Committed (or, outside a unit of work, written) tables.
    pub fn tables(&self) -> Vec<String> {
        self.state().committed.keys().cloned().collect()
    }

    /// Committed row count of `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.state()
            .committed
            .get(table)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    /// Committed rows of `table` as records.
    pub fn rows(&self, table: &str) -> Vec<InsertRecord> {
        let state = self.state();
        let Some(stored) = state.committed.get(table) else {
            return Vec::new();
        };
        stored
            .rows
            .iter()
            .map(|row| {
                stored
                    .columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }

    /// Total committed rows across all tables.
    pub fn total_rows(&self) -> usize {
        self.state().committed.values().map(|t| t.rows.len()).sum()
    }

    pub fn commit_count(&self) -> usize {
        self.state().commits
    }

    pub fn rollback_count(&self) -> usize {
        self.state().rollbacks
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    fn backend(&self) -> Backend {
        Backend::Memory
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            transactional: self.transactional,
            transactional_ddl: self.transactional,
            deferrable_constraints: self.transactional,
            concurrent_writes: true,
        }
    }

    async fn prepare_schema(&self, tables: &[TableDefinition], mode: TargetMode) -> Result<()> {
        let mut state = self.state();
        let store = state.active();
        for table in tables {
            match mode {
                TargetMode::DropRecreate => {
                    store.insert(table.name.clone(), StoredTable::new(table));
                }
                TargetMode::Append => {
                    let stored = store
                        .entry(table.name.clone())
                        .or_insert_with(|| StoredTable::new(table));
                    if stored.primary_key.is_none() {
                        stored.primary_key = Some(table.primary_key.clone());
                    }
                }
            }
        }
        debug!("memory: prepared {} tables ({:?})", tables.len(), mode);
        Ok(())
    }

    async fn begin_unit_of_work(&self, _defer_constraints: bool) -> Result<()> {
        if !self.transactional {
            return Ok(());
        }
        let mut state = self.state();
        if state.staged.is_some() {
            return Err(MigrateError::Config(
                "memory destination already has an open unit of work".into(),
            ));
        }
        state.staged = Some(state.committed.clone());
        Ok(())
    }

    async fn write_batch(
        &self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<SqlValue>>,
    ) -> Result<u64> {
        if self.fail_on_table.as_deref() == Some(table) {
            return Err(MigrateError::write(table, "injected failure"));
        }

        let transactional = self.transactional;
        let mut state = self.state();
        let stored = state.active().entry(table.to_string()).or_default();
        if stored.columns.is_empty() {
            stored.columns = columns.to_vec();
        }

        // Align incoming columns with the stored layout.
        let positions: Vec<Option<usize>> = stored
            .columns
            .iter()
            .map(|c| columns.iter().position(|incoming| incoming == c))
            .collect();
        if let Some(unknown) = columns.iter().find(|c| !stored.columns.contains(c)) {
            return Err(MigrateError::write(
                table,
                format!("column {} does not exist", unknown),
            ));
        }

        let key_index = stored.key_index();
        let mut keys: HashSet<String> = match key_index {
            Some(k) => stored
                .rows
                .iter()
                .filter_map(|r| r.get(k).map(SqlValue::key_repr))
                .collect(),
            None => HashSet::new(),
        };

        let before = stored.rows.len();
        for row in rows {
            let aligned: Vec<SqlValue> = positions
                .iter()
                .map(|p| p.and_then(|i| row.get(i).cloned()).unwrap_or(SqlValue::Null))
                .collect();
            if let Some(key) = key_index.and_then(|k| aligned.get(k)) {
                if !key.is_null() && !keys.insert(key.key_repr()) {
                    let message = format!("duplicate primary key {}", key.key_repr());
                    let applied = (stored.rows.len() - before) as u64;
                    if transactional || applied == 0 {
                        stored.rows.truncate(before);
                        return Err(MigrateError::write(table, message));
                    }
                    return Err(MigrateError::PartialWrite {
                        table: table.to_string(),
                        applied,
                        message,
                    });
                }
            }
            stored.rows.push(aligned);
        }
        Ok((stored.rows.len() - before) as u64)
    }

    async fn max_key(&self, table: &TableDefinition) -> Result<Option<i64>> {
        let mut state = self.state();
        let Some(stored) = state.active().get(&table.name) else {
            return Ok(None);
        };
        let Some(k) = stored
            .columns
            .iter()
            .position(|c| *c == table.primary_key)
        else {
            return Ok(None);
        };
        Ok(stored
            .rows
            .iter()
            .filter_map(|r| r.get(k).and_then(SqlValue::as_i64))
            .max())
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.state();
        if let Some(staged) = state.staged.take() {
            state.committed = staged;
        }
        state.commits += 1;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state();
        state.staged = None;
        state.rollbacks += 1;
        Ok(())
    }

    async fn close(&self) {}
}
