//! Chunked batch writer.

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::traits::Destination;
use crate::core::value::InsertRecord;
use crate::error::{MigrateError, Result};

/// Default rows per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Statistics for one table write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WriteStats {
    pub written: u64,
    pub chunks: usize,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

impl WriteStats {
    /// Average throughput in rows per second.
    pub fn rows_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.written as f64 / secs
        } else {
            0.0
        }
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

/// Writes one table's records in sequential chunks.
///
/// The writer only borrows the records and the destination; chunk `i`
/// completes before chunk `i + 1` begins, and a failed chunk is returned
/// immediately without retry.
#[derive(Debug, Clone)]
pub struct BatchWriter {
    chunk_size: usize,
    cancel: Option<CancellationToken>,
}

impl Default for BatchWriter {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl BatchWriter {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            cancel: None,
        }
    }

    /// Stop before the next chunk once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Column list used for a set of records: the first record's keys.
    pub fn columns_for(records: &[InsertRecord]) -> Vec<String> {
        records
            .first()
            .map(|r| r.columns().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Write `records` into `table`, calling `on_progress(written, total)`
    /// after every chunk.
    pub async fn write<F>(
        &self,
        destination: &dyn Destination,
        table: &str,
        records: &[InsertRecord],
        mut on_progress: F,
    ) -> Result<WriteStats>
    where
        F: FnMut(u64, u64) + Send,
    {
        let start = Instant::now();
        let total = records.len() as u64;
        if records.is_empty() {
            return Ok(WriteStats::default());
        }

        let columns = Self::columns_for(records);
        let mut written = 0u64;
        let mut chunks = 0usize;

        for chunk in records.chunks(self.chunk_size) {
            if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                debug!("{}: cancelled after {} rows", table, written);
                return Err(MigrateError::Cancelled);
            }

            let rows: Vec<_> = chunk.iter().map(|r| r.project(&columns)).collect();
            let inserted = match destination.write_batch(table, &columns, rows).await {
                Ok(inserted) => inserted,
                Err(e) => {
                    let applied = e.applied_rows().min(chunk.len() as u64);
                    if applied > 0 {
                        written += applied;
                        on_progress(written, total);
                    }
                    return Err(e);
                }
            };
            if inserted != chunk.len() as u64 {
                debug!(
                    "{}: destination reported {} rows for a chunk of {}",
                    table,
                    inserted,
                    chunk.len()
                );
            }

            written += chunk.len() as u64;
            chunks += 1;
            on_progress(written, total);
        }

        let stats = WriteStats {
            written,
            chunks,
            duration: start.elapsed(),
        };
        debug!(
            "{}: wrote {} rows in {} chunks ({:.0} rows/s)",
            table,
            stats.written,
            stats.chunks,
            stats.rows_per_second()
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::SqlValue;
    use crate::drivers::memory::MemoryDestination;

    fn records(n: usize) -> Vec<InsertRecord> {
        (1..=n as i64)
            .map(|i| InsertRecord::new().with("id", i).with("name", format!("row{}", i)))
            .collect()
    }

    #[tokio::test]
    async fn test_chunks_and_progress_callbacks() {
        let dest = MemoryDestination::new();
        let mut calls = Vec::new();
        let stats = BatchWriter::new(1000)
            .write(&dest, "items", &records(2500), |w, t| calls.push((w, t)))
            .await
            .unwrap();

        assert_eq!(stats.written, 2500);
        assert_eq!(stats.chunks, 3);
        assert_eq!(calls, vec![(1000, 2500), (2000, 2500), (2500, 2500)]);
        assert_eq!(dest.row_count("items"), 2500);
    }

    #[tokio::test]
    async fn test_empty_input_writes_nothing() {
        let dest = MemoryDestination::new();
        let mut called = false;
        let stats = BatchWriter::default()
            .write(&dest, "items", &[], |_, _| called = true)
            .await
            .unwrap();
        assert_eq!(stats.written, 0);
        assert!(!called);
    }

    #[tokio::test]
    async fn test_missing_columns_become_null() {
        let dest = MemoryDestination::new();
        let rows = vec![
            InsertRecord::new().with("id", 1i64).with("email", "a@b.com"),
            InsertRecord::new().with("id", 2i64),
        ];
        BatchWriter::default()
            .write(&dest, "users", &rows, |_, _| {})
            .await
            .unwrap();
        let stored = dest.rows("users");
        assert_eq!(stored[1].get("email"), Some(&SqlValue::Null));
    }

    #[tokio::test]
    async fn test_failure_propagates_without_retry() {
        let dest = MemoryDestination::new().fail_on_table("items");
        let mut calls = 0;
        let err = BatchWriter::new(10)
            .write(&dest, "items", &records(25), |_, _| calls += 1)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Write { .. }));
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn test_partially_applied_chunk_is_counted() {
        use crate::config::TargetMode;
        use crate::core::schema::{ColumnDef, ColumnType, TableDefinition};

        let dest = MemoryDestination::non_transactional();
        let mut items = TableDefinition::new("items", ColumnDef::synthetic_key("id"));
        items.push_column(ColumnDef::new("name", ColumnType::Text));
        dest.prepare_schema(&[items], TargetMode::DropRecreate)
            .await
            .unwrap();

        let mut rows = records(5);
        rows.push(InsertRecord::new().with("id", 3i64).with("name", "again"));
        rows.extend(records(8).into_iter().skip(5));

        let mut calls = Vec::new();
        let err = BatchWriter::new(4)
            .write(&dest, "items", &rows, |w, t| calls.push((w, t)))
            .await
            .unwrap_err();
        assert_eq!(err.applied_rows(), 1);
        assert_eq!(calls, vec![(4, 9), (5, 9)]);
        assert_eq!(dest.row_count("items"), 5);
    }

    #[tokio::test]
    async fn test_cancellation_between_chunks() {
        let dest = MemoryDestination::new();
        let token = CancellationToken::new();
        let writer = BatchWriter::new(10).with_cancellation(token.clone());
        let err = writer
            .write(&dest, "items", &records(25), |written, _| {
                if written == 10 {
                    token.cancel();
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Cancelled));
        assert_eq!(dest.row_count("items"), 10);
    }
}
