//! Per-run migration context: log, progress, and event broadcast.
//!
//! Each run owns one [`MigrationContext`]. The log is append-only and
//! per-table progress only moves forward. Every append is mirrored into
//! `tracing` and published on a broadcast channel so another task can
//! follow the run while it executes.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const EVENT_CAPACITY: usize = 1024;

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Created, not yet started.
    Idle,
    Connecting,
    Preparing,
    Normalizing,
    Writing,
    Committing,
    Done,
    Failed,
}

impl Phase {
    /// Whether the run has finished, successfully or not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Connecting => "connecting",
            Phase::Preparing => "preparing",
            Phase::Normalizing => "normalizing",
            Phase::Writing => "writing",
            Phase::Committing => "committing",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One immutable migration log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Per-table write progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationProgress {
    pub table: String,
    pub status: TaskStatus,
    pub total_rows: u64,
    pub written_rows: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl MigrationProgress {
    fn new(table: &str, total_rows: u64) -> Self {
        Self {
            table: table.to_string(),
            status: TaskStatus::Pending,
            total_rows,
            written_rows: 0,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Completion percentage, 100 for empty tables.
    pub fn percent(&self) -> f64 {
        if self.total_rows == 0 {
            100.0
        } else {
            self.written_rows as f64 * 100.0 / self.total_rows as f64
        }
    }
}

/// Event published to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MigrationEvent {
    Phase { run_id: String, phase: Phase },
    Log { run_id: String, entry: LogEntry },
    Progress { run_id: String, progress: MigrationProgress },
}

#[derive(Debug)]
struct Journal {
    phase: Phase,
    log: Vec<LogEntry>,
    progress: Vec<MigrationProgress>,
}

/// Log, progress and event sink owned by one migration run.
#[derive(Clone)]
pub struct MigrationContext {
    run_id: String,
    journal: Arc<Mutex<Journal>>,
    events: broadcast::Sender<MigrationEvent>,
}

impl fmt::Debug for MigrationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationContext")
            .field("run_id", &self.run_id)
            .field("phase", &self.phase())
            .finish()
    }
}

impl MigrationContext {
    /// Create a context with a fresh random run id.
    pub fn new() -> Self {
        Self::with_run_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_run_id(run_id: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            run_id: run_id.into(),
            journal: Arc::new(Mutex::new(Journal {
                phase: Phase::Idle,
                log: Vec::new(),
                progress: Vec::new(),
            })),
            events,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Follow phase changes, log entries and progress updates.
    pub fn subscribe(&self) -> broadcast::Receiver<MigrationEvent> {
        self.events.subscribe()
    }

    fn journal(&self) -> MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, event: MigrationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn phase(&self) -> Phase {
        self.journal().phase
    }

    /// Move to `phase`. Terminal phases absorb further transitions.
    pub fn set_phase(&self, phase: Phase) {
        {
            let mut journal = self.journal();
            if journal.phase.is_terminal() || journal.phase == phase {
                return;
            }
            journal.phase = phase;
        }
        info!(run_id = %self.run_id, "Phase: {}", phase);
        self.publish(MigrationEvent::Phase {
            run_id: self.run_id.clone(),
            phase,
        });
    }

    /// Append a log entry.
    pub fn log(&self, level: LogLevel, table: Option<&str>, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            table: table.map(str::to_string),
        };
        let table_name = entry.table.as_deref().unwrap_or("-");
        match level {
            LogLevel::Info => info!(run_id = %self.run_id, table = table_name, "{}", entry.message),
            LogLevel::Warn => warn!(run_id = %self.run_id, table = table_name, "{}", entry.message),
            LogLevel::Error => {
                error!(run_id = %self.run_id, table = table_name, "{}", entry.message)
            }
        }
        self.journal().log.push(entry.clone());
        self.publish(MigrationEvent::Log {
            run_id: self.run_id.clone(),
            entry,
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, None, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, None, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, None, message);
    }

    /// Register a table as pending with its row total.
    pub fn start_table(&self, table: &str, total_rows: u64) {
        let progress = {
            let mut journal = self.journal();
            match journal.progress.iter_mut().find(|p| p.table == table) {
                Some(existing) => existing.clone(),
                None => {
                    let progress = MigrationProgress::new(table, total_rows);
                    journal.progress.push(progress.clone());
                    progress
                }
            }
        };
        self.publish_progress(progress);
    }

    /// Record rows written so far. The first call moves the table to in_progress.
    pub fn record_progress(&self, table: &str, written_rows: u64) {
        self.update_table(table, |p| {
            if p.status.is_terminal() {
                return;
            }
            p.status = TaskStatus::InProgress;
            p.written_rows = p.written_rows.max(written_rows.min(p.total_rows));
        });
    }

    /// Mark a table completed.
    pub fn complete_table(&self, table: &str) {
        self.update_table(table, |p| {
            if p.status.is_terminal() {
                return;
            }
            p.status = TaskStatus::Completed;
            p.completed_at = Some(Utc::now());
        });
    }

    /// Mark a table failed with an error message.
    pub fn fail_table(&self, table: &str, error: impl Into<String>) {
        let error = error.into();
        self.update_table(table, |p| {
            if p.status.is_terminal() {
                return;
            }
            p.status = TaskStatus::Failed;
            p.error = Some(error.clone());
            p.completed_at = Some(Utc::now());
        });
        self.log(LogLevel::Error, Some(table), error);
    }

    fn update_table(&self, table: &str, update: impl FnOnce(&mut MigrationProgress)) {
        let progress = {
            let mut journal = self.journal();
            let Some(progress) = journal.progress.iter_mut().find(|p| p.table == table) else {
                return;
            };
            update(progress);
            progress.clone()
        };
        self.publish_progress(progress);
    }

    fn publish_progress(&self, progress: MigrationProgress) {
        self.publish(MigrationEvent::Progress {
            run_id: self.run_id.clone(),
            progress,
        });
    }

    /// Progress for one table.
    pub fn table_progress(&self, table: &str) -> Option<MigrationProgress> {
        self.journal()
            .progress
            .iter()
            .find(|p| p.table == table)
            .cloned()
    }

    /// Copy of the log so far.
    pub fn log_snapshot(&self) -> Vec<LogEntry> {
        self.journal().log.clone()
    }

    /// Copy of all table progress, in the order tables were started.
    pub fn progress_snapshot(&self) -> Vec<MigrationProgress> {
        self.journal().progress.clone()
    }

    /// Warning messages logged so far.
    pub fn warnings(&self) -> Vec<String> {
        self.journal()
            .log
            .iter()
            .filter(|e| e.level == LogLevel::Warn)
            .map(|e| match &e.table {
                Some(table) => format!("{}: {}", table, e.message),
                None => e.message.clone(),
            })
            .collect()
    }
}

impl Default for MigrationContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_lifecycle() {
        let ctx = MigrationContext::new();
        ctx.start_table("users", 2500);
        assert_eq!(
            ctx.table_progress("users").unwrap().status,
            TaskStatus::Pending
        );

        ctx.record_progress("users", 1000);
        let p = ctx.table_progress("users").unwrap();
        assert_eq!(p.status, TaskStatus::InProgress);
        assert_eq!(p.written_rows, 1000);

        // never moves backwards
        ctx.record_progress("users", 500);
        assert_eq!(ctx.table_progress("users").unwrap().written_rows, 1000);

        ctx.record_progress("users", 2500);
        ctx.complete_table("users");
        let p = ctx.table_progress("users").unwrap();
        assert_eq!(p.status, TaskStatus::Completed);
        assert!((p.percent() - 100.0).abs() < f64::EPSILON);

        // terminal state is final
        ctx.fail_table("users", "late error");
        assert_eq!(
            ctx.table_progress("users").unwrap().status,
            TaskStatus::Completed
        );
    }

    #[test]
    fn test_terminal_phase_absorbs() {
        let ctx = MigrationContext::new();
        ctx.set_phase(Phase::Writing);
        ctx.set_phase(Phase::Failed);
        ctx.set_phase(Phase::Done);
        assert_eq!(ctx.phase(), Phase::Failed);
    }

    #[test]
    fn test_first_transition_is_published() {
        let ctx = MigrationContext::new();
        assert_eq!(ctx.phase(), Phase::Idle);
        let mut rx = ctx.subscribe();
        ctx.set_phase(Phase::Connecting);
        assert!(matches!(
            rx.try_recv().unwrap(),
            MigrationEvent::Phase {
                phase: Phase::Connecting,
                ..
            }
        ));
    }

    #[test]
    fn test_log_is_append_only_and_ordered() {
        let ctx = MigrationContext::new();
        ctx.info("first");
        ctx.warn("second");
        ctx.log(LogLevel::Error, Some("orders"), "third");
        let log = ctx.log_snapshot();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].message, "first");
        assert_eq!(log[2].table.as_deref(), Some("orders"));
        assert!(log.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(ctx.warnings(), vec!["second".to_string()]);
    }

    #[test]
    fn test_runs_do_not_share_state() {
        let a = MigrationContext::new();
        let b = MigrationContext::new();
        a.info("only in a");
        assert!(b.log_snapshot().is_empty());
        assert_ne!(a.run_id(), b.run_id());
    }

    #[tokio::test]
    async fn test_subscribers_observe_events() {
        let ctx = MigrationContext::with_run_id("run-1");
        let mut rx = ctx.subscribe();
        ctx.set_phase(Phase::Preparing);
        ctx.start_table("users", 1);

        match rx.recv().await.unwrap() {
            MigrationEvent::Phase { run_id, phase } => {
                assert_eq!(run_id, "run-1");
                assert_eq!(phase, Phase::Preparing);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            MigrationEvent::Progress { .. }
        ));
    }
}
