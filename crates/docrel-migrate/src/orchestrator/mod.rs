//! Migration orchestrator - main workflow coordinator.
//!
//! Drives one run from `idle` through `connecting -> preparing -> normalizing ->
//! writing -> committing -> done`. Any unrecoverable error moves the run to
//! `failed`, rolls back transactional destinations, and is returned as
//! [`MigrateError::Aborted`] carrying the full [`MigrationReport`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, TargetMode};
use crate::context::{LogEntry, LogLevel, MigrationContext, MigrationProgress, Phase};
use crate::core::schema::TableDefinition;
use crate::core::traits::{Backend, Capabilities, Destination};
use crate::core::value::{InsertRecord, TableRows};
use crate::drivers::connect;
use crate::enhance::Suggestion;
use crate::error::{MigrateError, Result};
use crate::plan::MigrationPlan;
use crate::writer::BatchWriter;

/// Final outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Every table written and committed.
    Completed,
    /// The unit of work was rolled back; nothing from this run persists.
    RolledBack,
    /// A non-transactional destination kept the tables written before the failure.
    PartiallyApplied,
    /// Failed before any row could persist.
    Failed,
    Cancelled,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status.
    pub status: MigrationStatus,

    /// Phase the run ended in.
    pub phase: Phase,

    /// Phase that was active when the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_during: Option<Phase>,

    /// Destination backend.
    pub backend: Backend,

    /// Fingerprint of the configuration.
    pub config_hash: String,

    /// When the migration started.
    pub started_at: DateTime<Utc>,

    /// When the migration completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Tables in the plan.
    pub tables_total: usize,

    /// Tables whose rows were all written.
    pub tables_completed: usize,

    /// Rows accepted by the destination during the run.
    pub rows_written: u64,

    /// Rows that persist after the run.
    pub rows_committed: u64,

    /// Average throughput (rows/second).
    pub rows_per_second: f64,

    pub write_order: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cycles: Vec<Vec<String>>,

    /// Per-table progress snapshot.
    pub progress: Vec<MigrationProgress>,

    /// Full migration log.
    pub log: Vec<LogEntry>,

    pub warnings: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<Suggestion>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MigrationReport {
    /// Serialize the report as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn is_success(&self) -> bool {
        self.status == MigrationStatus::Completed
    }
}

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    context: MigrationContext,
    destination: Option<Arc<dyn Destination>>,
    cancel: CancellationToken,
}

/// Facts about a run needed to classify its failure.
#[derive(Debug, Default)]
struct RunState {
    began: bool,
    capabilities: Capabilities,
    backend: Option<Backend>,
}

impl Orchestrator {
    /// Create an orchestrator that connects to `config.target` when run.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            context: MigrationContext::new(),
            destination: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an already connected destination instead of `config.target`.
    pub fn with_destination(mut self, destination: Arc<dyn Destination>) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Stop between chunks once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The run's context, for subscribing to events before [`Orchestrator::run`].
    pub fn context(&self) -> &MigrationContext {
        &self.context
    }

    /// Run the migration.
    pub async fn run(self, plan: &MigrationPlan) -> Result<MigrationReport> {
        let started_at = Utc::now();
        let ctx = self.context.clone();
        info!("Starting migration run: {}", ctx.run_id());

        for warning in &plan.warnings {
            ctx.warn(warning.clone());
        }

        let mut state = RunState::default();
        let mut destination = None;
        let outcome = self.execute(plan, &mut state, &mut destination).await;

        let failed_during = outcome.as_ref().err().map(|_| ctx.phase());
        let status = match &outcome {
            Ok(()) => MigrationStatus::Completed,
            Err(e) => {
                if let Some(dest) = &destination {
                    self.recover(dest.as_ref(), &state).await;
                }
                self.classify(e, &state)
            }
        };

        if let Some(dest) = &destination {
            dest.close().await;
        }

        if let Err(e) = &outcome {
            ctx.error(format!("Migration failed: {}", e));
            ctx.set_phase(Phase::Failed);
        }

        let report = self.report(plan, started_at, status, failed_during, &state, &outcome);
        info!(
            "Migration {}: {:?}, {} rows committed in {:.1}s",
            report.run_id, report.status, report.rows_committed, report.duration_seconds
        );

        match outcome {
            Ok(()) => Ok(report),
            Err(e) => Err(MigrateError::Aborted {
                phase: failed_during.unwrap_or(Phase::Failed),
                message: e.to_string(),
                report: Box::new(report),
            }),
        }
    }

    async fn execute(
        &self,
        plan: &MigrationPlan,
        state: &mut RunState,
        slot: &mut Option<Arc<dyn Destination>>,
    ) -> Result<()> {
        let ctx = &self.context;
        let migration = &self.config.migration;

        // Phase 1: Connect
        ctx.set_phase(Phase::Connecting);
        let destination = match &self.destination {
            Some(dest) => dest.clone(),
            None => connect(&self.config.target, migration).await?,
        };
        *slot = Some(destination.clone());
        let caps = destination.capabilities();
        state.capabilities = caps;
        state.backend = Some(destination.backend());
        ctx.info(format!("Connected to {} destination", destination.backend()));
        self.check_cancelled()?;

        let defer = migration.defer_constraints && caps.deferrable_constraints;
        if migration.defer_constraints && !caps.deferrable_constraints {
            debug!(
                "{} cannot defer constraint checks; relying on write order",
                destination.backend()
            );
        }

        let tables: Vec<TableDefinition> =
            plan.tables_in_write_order().into_iter().cloned().collect();

        // Phase 2: Prepare schema, inside the unit of work when DDL is transactional
        ctx.set_phase(Phase::Preparing);
        if caps.transactional && caps.transactional_ddl {
            destination.begin_unit_of_work(defer).await?;
            state.began = true;
        }
        destination
            .prepare_schema(&tables, migration.target_mode)
            .await?;
        ctx.info(format!(
            "Prepared {} tables ({:?})",
            tables.len(),
            migration.target_mode
        ));
        if caps.transactional && !state.began {
            destination.begin_unit_of_work(defer).await?;
            state.began = true;
        }
        let last_keys = match migration.target_mode {
            TargetMode::Append => self.existing_keys(destination.as_ref(), &tables).await?,
            TargetMode::DropRecreate => HashMap::new(),
        };
        self.check_cancelled()?;

        // Phase 3: Produce rows
        ctx.set_phase(Phase::Normalizing);
        let (rows, warnings) = plan.materialize_rows_after(&last_keys);
        for warning in warnings {
            ctx.warn(warning);
        }
        let mut rows: HashMap<String, Vec<InsertRecord>> =
            rows.into_iter().map(|TableRows { table, rows }| (table, rows)).collect();
        for table in &plan.write_order {
            let total = rows.get(table).map_or(0, Vec::len) as u64;
            ctx.start_table(table, total);
        }
        self.check_cancelled()?;

        // Phase 4: Write in dependency order
        ctx.set_phase(Phase::Writing);
        let writer = BatchWriter::new(migration.chunk_size).with_cancellation(self.cancel.clone());
        if migration.parallel_waves && caps.concurrent_writes {
            self.write_waves(plan, destination.as_ref(), &writer, &mut rows)
                .await?;
        } else {
            for table in &plan.write_order {
                self.check_cancelled()?;
                let records = rows.remove(table).unwrap_or_default();
                self.write_table(plan, destination.as_ref(), &writer, table, records)
                    .await?;
            }
        }

        // Phase 5: Commit
        ctx.set_phase(Phase::Committing);
        self.check_cancelled()?;
        destination.commit().await?;
        state.began = false;
        ctx.info("Migration committed");
        ctx.set_phase(Phase::Done);
        Ok(())
    }

    /// Highest existing key of every synthetic-key table that already holds rows.
    async fn existing_keys(
        &self,
        destination: &dyn Destination,
        tables: &[TableDefinition],
    ) -> Result<HashMap<String, i64>> {
        let mut last_keys = HashMap::new();
        let synthetic = tables.iter().filter(|t| {
            t.primary_key_column()
                .is_some_and(|c| c.is_auto_increment())
        });
        for table in synthetic {
            if let Some(last) = destination.max_key(table).await? {
                self.context.log(
                    LogLevel::Info,
                    Some(&table.name),
                    format!("Appending after existing key {}", last),
                );
                last_keys.insert(table.name.clone(), last);
            }
        }
        Ok(last_keys)
    }

    /// Write each dependency wave concurrently, then the cyclic leftovers in order.
    async fn write_waves(
        &self,
        plan: &MigrationPlan,
        destination: &dyn Destination,
        writer: &BatchWriter,
        rows: &mut HashMap<String, Vec<InsertRecord>>,
    ) -> Result<()> {
        for (level, wave) in plan.waves.iter().enumerate() {
            self.check_cancelled()?;
            debug!("Writing wave {} ({} tables)", level, wave.len());
            let jobs = wave.iter().map(|table| {
                let records = rows.remove(table).unwrap_or_default();
                self.write_table(plan, destination, writer, table, records)
            });
            for result in join_all(jobs).await {
                result?;
            }
        }

        for table in &plan.write_order {
            if let Some(records) = rows.remove(table) {
                self.check_cancelled()?;
                self.write_table(plan, destination, writer, table, records)
                    .await?;
            }
        }
        Ok(())
    }

    async fn write_table(
        &self,
        plan: &MigrationPlan,
        destination: &dyn Destination,
        writer: &BatchWriter,
        table: &str,
        records: Vec<InsertRecord>,
    ) -> Result<u64> {
        let ctx = &self.context;
        let result = async {
            let stats = writer
                .write(destination, table, &records, |written, _| {
                    ctx.record_progress(table, written)
                })
                .await?;
            if let Some(def) = plan.table(table) {
                destination.finish_table(def).await?;
            }
            Ok::<_, MigrateError>(stats)
        }
        .await;

        match result {
            Ok(stats) => {
                ctx.complete_table(table);
                ctx.log(
                    LogLevel::Info,
                    Some(table),
                    format!(
                        "Wrote {} rows in {} chunks ({:.0} rows/s)",
                        stats.written,
                        stats.chunks,
                        stats.rows_per_second()
                    ),
                );
                Ok(stats.written)
            }
            Err(e) => {
                ctx.fail_table(table, e.to_string());
                Err(e)
            }
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }
        Ok(())
    }

    /// Roll back an open unit of work.
    async fn recover(&self, destination: &dyn Destination, state: &RunState) {
        if !(state.began && state.capabilities.transactional) {
            return;
        }
        match destination.rollback().await {
            Ok(()) => self.context.warn("Unit of work rolled back"),
            Err(e) => {
                error!("Rollback failed: {}", e);
                self.context.error(format!("Rollback failed: {}", e));
            }
        }
    }

    fn classify(&self, err: &MigrateError, state: &RunState) -> MigrationStatus {
        if matches!(err, MigrateError::Cancelled) {
            return MigrationStatus::Cancelled;
        }
        if state.began && state.capabilities.transactional {
            return MigrationStatus::RolledBack;
        }
        let written: u64 = self
            .context
            .progress_snapshot()
            .iter()
            .map(|p| p.written_rows)
            .sum();
        if !state.capabilities.transactional && written > 0 {
            warn!("{} rows persist after the failure", written);
            MigrationStatus::PartiallyApplied
        } else {
            MigrationStatus::Failed
        }
    }

    fn report(
        &self,
        plan: &MigrationPlan,
        started_at: DateTime<Utc>,
        status: MigrationStatus,
        failed_during: Option<Phase>,
        state: &RunState,
        outcome: &Result<()>,
    ) -> MigrationReport {
        let ctx = &self.context;
        let completed_at = Utc::now();
        let duration_seconds = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;
        let progress = ctx.progress_snapshot();
        let rows_written: u64 = progress.iter().map(|p| p.written_rows).sum();
        let persisted = match status {
            MigrationStatus::Completed | MigrationStatus::PartiallyApplied => true,
            MigrationStatus::Cancelled => !state.capabilities.transactional,
            MigrationStatus::RolledBack | MigrationStatus::Failed => false,
        };

        MigrationReport {
            run_id: ctx.run_id().to_string(),
            status,
            phase: ctx.phase(),
            failed_during,
            backend: state.backend.unwrap_or(self.config.target.r#type),
            config_hash: self.config.hash(),
            started_at,
            completed_at,
            duration_seconds,
            tables_total: plan.tables.len(),
            tables_completed: progress
                .iter()
                .filter(|p| p.status == crate::context::TaskStatus::Completed)
                .count(),
            rows_written,
            rows_committed: if persisted { rows_written } else { 0 },
            rows_per_second: if duration_seconds > 0.0 {
                rows_written as f64 / duration_seconds
            } else {
                0.0
            },
            write_order: plan.write_order.clone(),
            cycles: plan.sort.cycles.clone(),
            progress,
            log: ctx.log_snapshot(),
            warnings: ctx.warnings(),
            suggestions: plan.suggestions.clone(),
            error: outcome.as_ref().err().map(|e| e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{MigrationEvent, TaskStatus};
    use crate::core::value::SqlValue;
    use crate::drivers::MemoryDestination;
    use serde_json::json;

    fn plan(users: usize) -> MigrationPlan {
        let records = (1..=users)
            .map(|i| {
                json!({
                    "id": i,
                    "email": format!("u{}@example.com", i),
                    "orders": [{"sku": "a"}, {"sku": "b"}]
                })
            })
            .collect();
        MigrationPlan::from_documents("users", records).unwrap()
    }

    fn config() -> Config {
        let mut config = Config::memory();
        config.migration.chunk_size = 10;
        config
    }

    #[tokio::test]
    async fn test_run_writes_every_row() {
        let dest = Arc::new(MemoryDestination::new());
        let report = Orchestrator::new(config())
            .with_destination(dest.clone())
            .run(&plan(25))
            .await
            .unwrap();

        assert_eq!(report.status, MigrationStatus::Completed);
        assert_eq!(report.phase, Phase::Done);
        assert_eq!(report.rows_committed, 75);
        assert_eq!(dest.row_count("users"), 25);
        assert_eq!(dest.row_count("users_orders"), 50);
        assert_eq!(dest.commit_count(), 1);
        assert!(report
            .progress
            .iter()
            .all(|p| p.status == TaskStatus::Completed));
    }

    #[tokio::test]
    async fn test_failure_rolls_back_everything() {
        let dest = Arc::new(MemoryDestination::new().fail_on_table("users_orders"));
        let err = Orchestrator::new(config())
            .with_destination(dest.clone())
            .run(&plan(5))
            .await
            .unwrap_err();

        let report = err.report().unwrap();
        assert_eq!(report.status, MigrationStatus::RolledBack);
        assert_eq!(report.phase, Phase::Failed);
        assert_eq!(report.failed_during, Some(Phase::Writing));
        assert_eq!(report.rows_committed, 0);
        assert_eq!(dest.total_rows(), 0);
        assert_eq!(dest.rollback_count(), 1);
        let failed = report
            .progress
            .iter()
            .find(|p| p.table == "users_orders")
            .unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(report.log.iter().any(|e| e.level == LogLevel::Error));
    }

    #[tokio::test]
    async fn test_document_store_keeps_written_tables() {
        let dest = Arc::new(MemoryDestination::non_transactional().fail_on_table("users_orders"));
        let err = Orchestrator::new(config())
            .with_destination(dest.clone())
            .run(&plan(5))
            .await
            .unwrap_err();

        let report = err.report().unwrap();
        assert_eq!(report.status, MigrationStatus::PartiallyApplied);
        assert_eq!(report.rows_committed, 5);
        assert_eq!(dest.row_count("users"), 5);
        assert_eq!(dest.row_count("users_orders"), 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_rolls_back() {
        let token = CancellationToken::new();
        token.cancel();
        let dest = Arc::new(MemoryDestination::new());
        let err = Orchestrator::new(config())
            .with_destination(dest.clone())
            .with_cancellation(token)
            .run(&plan(5))
            .await
            .unwrap_err();

        assert_eq!(err.exit_code(), crate::error::EXIT_CANCELLED);
        let report = err.report().unwrap();
        assert_eq!(report.status, MigrationStatus::Cancelled);
        assert_eq!(report.phase, Phase::Failed);
        assert_eq!(dest.total_rows(), 0);
    }

    #[tokio::test]
    async fn test_append_runs_continue_synthetic_keys() {
        let records: Vec<_> = (0..3)
            .map(|i| {
                json!({
                    "email": format!("u{}@example.com", i),
                    "orders": [{"sku": "a"}, {"sku": "b"}]
                })
            })
            .collect();
        let plan = MigrationPlan::from_documents("users", records).unwrap();
        let mut config = config();
        config.migration.target_mode = TargetMode::Append;
        let dest = Arc::new(MemoryDestination::new());

        for _ in 0..2 {
            let report = Orchestrator::new(config.clone())
                .with_destination(dest.clone())
                .run(&plan)
                .await
                .unwrap();
            assert_eq!(report.rows_committed, 9);
        }

        let ids = |table: &str, column: &str| -> Vec<i64> {
            dest.rows(table)
                .iter()
                .filter_map(|r| r.get(column).and_then(SqlValue::as_i64))
                .collect()
        };
        assert_eq!(ids("users", "id"), (1..=6).collect::<Vec<_>>());
        assert_eq!(ids("users_orders", "id"), (1..=12).collect::<Vec<_>>());
        assert!(ids("users_orders", "users_id")[6..].iter().all(|id| (4..=6).contains(id)));
        assert_eq!(dest.commit_count(), 2);
    }

    #[tokio::test]
    async fn test_append_of_same_identifiers_is_rejected() {
        let mut config = config();
        config.migration.target_mode = TargetMode::Append;
        let dest = Arc::new(MemoryDestination::new());
        Orchestrator::new(config.clone())
            .with_destination(dest.clone())
            .run(&plan(2))
            .await
            .unwrap();

        let err = Orchestrator::new(config)
            .with_destination(dest.clone())
            .run(&plan(2))
            .await
            .unwrap_err();
        assert_eq!(err.report().unwrap().status, MigrationStatus::RolledBack);
        assert_eq!(dest.row_count("users"), 2);
        assert_eq!(dest.row_count("users_orders"), 4);
    }

    #[tokio::test]
    async fn test_parallel_waves_write_everything() {
        let mut config = config();
        config.migration.parallel_waves = true;
        let dest = Arc::new(MemoryDestination::new());
        let report = Orchestrator::new(config)
            .with_destination(dest.clone())
            .run(&plan(12))
            .await
            .unwrap();
        assert_eq!(report.rows_committed, 36);
        assert_eq!(dest.row_count("users_orders"), 24);
    }

    #[tokio::test]
    async fn test_events_follow_phases() {
        let orchestrator =
            Orchestrator::new(config()).with_destination(Arc::new(MemoryDestination::new()));
        let mut events = orchestrator.context().subscribe();
        orchestrator.run(&plan(3)).await.unwrap();

        let mut phases = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let MigrationEvent::Phase { phase, .. } = event {
                phases.push(phase);
            }
        }
        assert_eq!(
            phases,
            vec![
                Phase::Connecting,
                Phase::Preparing,
                Phase::Normalizing,
                Phase::Writing,
                Phase::Committing,
                Phase::Done
            ]
        );
    }

    #[test]
    fn test_report_json_uses_snake_case_status() {
        let report = MigrationReport {
            run_id: "r".into(),
            status: MigrationStatus::PartiallyApplied,
            phase: Phase::Failed,
            failed_during: Some(Phase::Writing),
            backend: Backend::Mongodb,
            config_hash: String::new(),
            started_at: Utc::now(),
            completed_at: Utc::now(),
            duration_seconds: 0.0,
            tables_total: 0,
            tables_completed: 0,
            rows_written: 0,
            rows_committed: 0,
            rows_per_second: 0.0,
            write_order: Vec::new(),
            cycles: Vec::new(),
            progress: Vec::new(),
            log: Vec::new(),
            warnings: Vec::new(),
            suggestions: Vec::new(),
            error: None,
        };
        let json = report.to_json().unwrap();
        assert!(json.contains("\"partially_applied\""));
        assert!(json.contains("\"failed_during\": \"writing\""));
    }
}
