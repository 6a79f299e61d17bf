//! Job run tracking: status, the run's error list, and the end-of-run
//! summary that is logged and appended to `jobs.jsonl`.

use std::fmt;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use rebound_storage::UpsertResult;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

// ── Status ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Daily,
    Backfill,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily => f.write_str("daily"),
            Self::Backfill => f.write_str("backfill"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    PartiallyFailed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::PartiallyFailed)
    }
}

// ── Errors ──────────────────────────────────────────────────────

/// Pipeline stage an error was raised in. `Warning` entries are kept for
/// the operator but never count as failures. A `Checkpoint` error halts
/// the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Discovery,
    Fetch,
    Extract,
    Validation,
    Persistence,
    Checkpoint,
    Warning,
}

impl ErrorCategory {
    pub fn is_failure(self) -> bool {
        self != Self::Warning
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Discovery => "discovery",
            Self::Fetch => "fetch",
            Self::Extract => "extract",
            Self::Validation => "validation",
            Self::Persistence => "persistence",
            Self::Checkpoint => "checkpoint",
            Self::Warning => "warning",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub category: ErrorCategory,
    /// Entity identifier the error belongs to, if any.
    pub entity: Option<String>,
    pub chunk: Option<String>,
    pub detail: String,
}

impl RunError {
    pub fn new(category: ErrorCategory, detail: impl Into<String>) -> Self {
        Self {
            category,
            entity: None,
            chunk: None,
            detail: detail.into(),
        }
    }

    pub fn for_entity(mut self, id: impl Into<String>) -> Self {
        self.entity = Some(id.into());
        self
    }

    pub fn in_chunk(mut self, chunk: impl fmt::Display) -> Self {
        self.chunk = Some(chunk.to_string());
        self
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.category)?;
        if let Some(chunk) = &self.chunk {
            write!(f, " chunk {chunk}")?;
        }
        if let Some(entity) = &self.entity {
            write!(f, " entity {entity}")?;
        }
        write!(f, ": {}", self.detail)
    }
}

// ── Run ─────────────────────────────────────────────────────────

/// One daily or backfill invocation.
#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job_type: JobType,
    /// Target date for daily runs, season label or range key for backfills.
    pub scope: String,
    pub status: JobStatus,
    pub errors: Vec<RunError>,
    pub units_attempted: u64,
    pub units_failed: u64,
    pub chunks_completed: u64,
    pub chunks_skipped: u64,
    pub loaded: UpsertResult,
    /// Watermark position at the end of the run.
    pub watermark: Option<String>,
    pub cancelled: bool,
    /// Stopped early because a watermark checkpoint could not be written.
    pub halted: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRun {
    pub fn new(job_type: JobType, scope: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            scope: scope.into(),
            status: JobStatus::Pending,
            errors: Vec::new(),
            units_attempted: 0,
            units_failed: 0,
            chunks_completed: 0,
            chunks_skipped: 0,
            loaded: UpsertResult::default(),
            watermark: None,
            cancelled: false,
            halted: false,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn record(&mut self, error: RunError) {
        self.errors.push(error);
    }

    /// Errors that count against the run; warnings excluded.
    pub fn failures(&self) -> usize {
        self.errors.iter().filter(|e| e.category.is_failure()).count()
    }

    pub fn warnings(&self) -> usize {
        self.errors.len() - self.failures()
    }

    pub fn finish(&mut self) {
        self.status = if self.failures() == 0 {
            JobStatus::Succeeded
        } else {
            JobStatus::PartiallyFailed
        };
        self.completed_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }

    /// Process exit code: the failure count, saturated at 255. A cancelled
    /// or halted run never exits 0.
    pub fn exit_code(&self) -> u8 {
        let mut code = self.failures();
        if self.cancelled || self.halted {
            code = code.max(1);
        }
        code.min(u8::MAX as usize) as u8
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            job_type: self.job_type,
            scope: self.scope.clone(),
            status: self.status,
            units_attempted: self.units_attempted,
            units_failed: self.units_failed,
            chunks_completed: self.chunks_completed,
            chunks_skipped: self.chunks_skipped,
            inserted: self.loaded.inserted,
            updated: self.loaded.updated,
            unchanged: self.loaded.unchanged,
            failures: self.failures(),
            warnings: self.warnings(),
            watermark: self.watermark.clone(),
            cancelled: self.cancelled,
            halted: self.halted,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms(),
            errors: self.errors.clone(),
        }
    }
}

/// Serialized end-of-run record, one line per run in `jobs.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub job_type: JobType,
    pub scope: String,
    pub status: JobStatus,
    pub units_attempted: u64,
    pub units_failed: u64,
    pub chunks_completed: u64,
    pub chunks_skipped: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failures: usize,
    pub warnings: usize,
    pub watermark: Option<String>,
    pub cancelled: bool,
    #[serde(default)]
    pub halted: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub errors: Vec<RunError>,
}

/// Append `summary` to `<dir>/jobs.jsonl`. Failures are logged, never raised.
pub fn append_job_log(dir: &Path, summary: &JobSummary) {
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!(error = %e, path = %dir.display(), "failed to create job log directory");
        return;
    }

    let log_path = dir.join("jobs.jsonl");
    let json_line = match serde_json::to_string(summary) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "failed to serialize job summary");
            return;
        }
    };

    let mut file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, path = %log_path.display(), "failed to open job log");
            return;
        }
    };

    if let Err(e) = writeln!(file, "{json_line}") {
        warn!(error = %e, "failed to write job log entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_as_snake_case() {
        for (variant, expected) in [
            (JobStatus::Pending, "pending"),
            (JobStatus::Running, "running"),
            (JobStatus::Succeeded, "succeeded"),
            (JobStatus::PartiallyFailed, "partially_failed"),
        ] {
            let json = serde_json::to_string(&variant).unwrap();
            assert_eq!(json, format!("\"{expected}\""));
        }
    }

    #[test]
    fn warnings_do_not_fail_the_run() {
        let mut run = JobRun::new(JobType::Daily, "2024-01-15");
        run.start();
        run.record(RunError::new(ErrorCategory::Warning, "unknown field 'attendance'"));
        run.finish();
        assert_eq!(run.status, JobStatus::Succeeded);
        assert_eq!(run.failures(), 0);
        assert_eq!(run.warnings(), 1);
        assert_eq!(run.exit_code(), 0);
    }

    #[test]
    fn failures_mark_run_partially_failed() {
        let mut run = JobRun::new(JobType::Backfill, "2024-25");
        run.start();
        run.record(RunError::new(ErrorCategory::Fetch, "404").for_entity("0022400001"));
        run.record(RunError::new(ErrorCategory::Validation, "missing key").for_entity("0022400002"));
        run.finish();
        assert_eq!(run.status, JobStatus::PartiallyFailed);
        assert!(run.status.is_terminal());
        assert_eq!(run.exit_code(), 2);
    }

    #[test]
    fn exit_code_saturates() {
        let mut run = JobRun::new(JobType::Backfill, "2024-25");
        for i in 0..300 {
            run.record(RunError::new(ErrorCategory::Fetch, "boom").for_entity(i.to_string()));
        }
        assert_eq!(run.exit_code(), 255);
    }

    #[test]
    fn cancelled_run_without_failures_exits_nonzero() {
        let mut run = JobRun::new(JobType::Backfill, "2024-25");
        run.start();
        run.cancelled = true;
        run.finish();
        assert_eq!(run.status, JobStatus::Succeeded);
        assert_eq!(run.exit_code(), 1);
    }

    #[test]
    fn halted_run_counts_checkpoint_failure() {
        let mut run = JobRun::new(JobType::Backfill, "2024-25");
        run.start();
        run.record(RunError::new(ErrorCategory::Fetch, "404").for_entity("0022400002"));
        run.record(RunError::new(ErrorCategory::Checkpoint, "write failed").in_chunk("2024-01-01..2024-01-07"));
        run.halted = true;
        run.finish();
        assert_eq!(run.status, JobStatus::PartiallyFailed);
        assert_eq!(run.exit_code(), 2);
        assert!(run.summary().halted);
    }

    #[test]
    fn run_error_display() {
        let err = RunError::new(ErrorCategory::Persistence, "constraint violation")
            .for_entity("0022400007")
            .in_chunk("2024-01-01..2024-01-07");
        assert_eq!(
            err.to_string(),
            "[persistence] chunk 2024-01-01..2024-01-07 entity 0022400007: constraint violation"
        );
    }

    #[test]
    fn job_log_appends_one_line_per_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = JobRun::new(JobType::Daily, "2024-01-15");
        run.start();
        run.finish();
        append_job_log(dir.path(), &run.summary());
        append_job_log(dir.path(), &run.summary());

        let content = std::fs::read_to_string(dir.path().join("jobs.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: JobSummary = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.id, run.id);
        assert_eq!(parsed.status, JobStatus::Succeeded);
        assert_eq!(parsed.job_type, JobType::Daily);
    }
}
