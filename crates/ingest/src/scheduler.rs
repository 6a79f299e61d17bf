//! Daily and backfill jobs.
//!
//! Both resolve a date scope, split it into chunks, discover entity ids per
//! chunk and run every id through fetch → extract → transform → load as its
//! own unit of work. Units within a chunk run on a bounded pool; the chunk's
//! watermark moves only once every unit has either committed or recorded
//! its failure.

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Days, NaiveDate, Utc};
use chrono_tz::Tz;
use futures::stream::{self, StreamExt};
use rebound_connector::FetchClient;
use rebound_core::config::SchedulerConfig;
use rebound_core::{BackfillMarker, ReboundError, Season, Transformer};
use rebound_storage::{
    Advance, Checkpoint, IdempotentLoader, Position, Stage, UnitOfWork, UpsertResult,
    WatermarkError, WatermarkOrdering, WatermarkStore,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunk::{plan, Chunk};
use crate::job::{append_job_log, ErrorCategory, JobRun, JobType, RunError};
use crate::source::Source;

/// Watermark key of the daily job under the `schedule` stage.
pub const DAILY_KEY: &str = "daily";

// ── Settings ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Zone in which "yesterday" is computed.
    pub timezone: Tz,
    /// Units processed concurrently within a chunk.
    pub max_concurrent: usize,
    pub chunk_days: NonZeroU32,
    pub marker: BackfillMarker,
    pub job_log_dir: Option<PathBuf>,
}

impl SchedulerSettings {
    pub fn from_config(config: &SchedulerConfig) -> Result<Self, ReboundError> {
        let chunk_days = NonZeroU32::new(config.chunk_days).ok_or_else(|| {
            ReboundError::Config("BACKFILL_CHUNK_DAYS must be at least 1".to_string())
        })?;
        Ok(Self {
            timezone: config.timezone()?,
            max_concurrent: config.max_concurrent_requests.max(1) as usize,
            chunk_days,
            marker: config.backfill_marker()?,
            job_log_dir: config.job_log_dir.clone(),
        })
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::America::New_York,
            max_concurrent: 5,
            chunk_days: NonZeroU32::new(7).unwrap_or(NonZeroU32::MIN),
            marker: BackfillMarker::Date,
            job_log_dir: None,
        }
    }
}

// ── Requests and errors ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillScope {
    Season(Season),
    /// Inclusive date range; `key` names its watermark, defaulting to
    /// `start..end`.
    Range {
        start: NaiveDate,
        end: NaiveDate,
        key: Option<String>,
    },
}

impl BackfillScope {
    pub fn bounds(&self) -> (NaiveDate, NaiveDate) {
        match self {
            Self::Season(season) => season.bounds(),
            Self::Range { start, end, .. } => (*start, *end),
        }
    }

    /// Watermark key for this scope.
    pub fn key(&self) -> String {
        match self {
            Self::Season(season) => season.label(),
            Self::Range { key: Some(key), .. } => key.clone(),
            Self::Range { start, end, key: None } => format!("{start}..{end}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillRequest {
    pub scope: BackfillScope,
    /// Overrides the configured chunk size.
    pub chunk_days: Option<NonZeroU32>,
    /// Explicit resume point; wins over the stored watermark.
    pub resume_from: Option<String>,
}

impl BackfillRequest {
    pub fn new(scope: BackfillScope) -> Self {
        Self { scope, chunk_days: None, resume_from: None }
    }

    pub fn with_chunk_days(mut self, chunk_days: NonZeroU32) -> Self {
        self.chunk_days = Some(chunk_days);
        self
    }

    pub fn resume_from(mut self, position: impl Into<String>) -> Self {
        self.resume_from = Some(position.into());
        self
    }
}

/// Errors that stop a job before any unit runs. Everything later,
/// including a failed checkpoint, is recorded in [`JobRun::errors`].
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Watermark(#[from] WatermarkError),

    #[error("invalid resume point '{value}': {source}")]
    InvalidResumePoint { value: String, source: WatermarkError },
}

/// The calendar day before `now` as seen in `timezone`.
pub fn yesterday_in(timezone: Tz, now: DateTime<Utc>) -> NaiveDate {
    let today = now.with_timezone(&timezone).date_naive();
    today.checked_sub_days(Days::new(1)).unwrap_or(today)
}

// ── Scheduler ───────────────────────────────────────────────────

pub struct JobScheduler {
    source: Arc<dyn Source>,
    fetcher: Arc<FetchClient>,
    transformer: Arc<dyn Transformer>,
    loader: Arc<IdempotentLoader>,
    watermarks: WatermarkStore,
    settings: SchedulerSettings,
    cancel: CancellationToken,
}

#[derive(Default)]
struct UnitReport {
    failed: bool,
    loaded: UpsertResult,
    errors: Vec<RunError>,
}

impl UnitReport {
    fn fail(mut self, error: RunError) -> Self {
        warn!(
            entity = error.entity.as_deref().unwrap_or_default(),
            category = %error.category,
            error = %error.detail,
            "Unit failed"
        );
        self.failed = true;
        self.errors.push(error);
        self
    }
}

impl JobScheduler {
    pub fn new(
        source: Arc<dyn Source>,
        fetcher: Arc<FetchClient>,
        transformer: Arc<dyn Transformer>,
        loader: Arc<IdempotentLoader>,
        settings: SchedulerSettings,
    ) -> Self {
        let watermarks = WatermarkStore::new(loader.store().clone());
        Self {
            source,
            fetcher,
            transformer,
            loader,
            watermarks,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Cancelling stops new units from starting; in-flight units finish.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn watermarks(&self) -> &WatermarkStore {
        &self.watermarks
    }

    /// Stage backfill watermarks live under, ordered per the configured marker.
    pub fn backfill_stage(&self) -> Stage {
        match self.settings.marker {
            BackfillMarker::Date => Stage::backfill(WatermarkOrdering::Date),
            BackfillMarker::Id => Stage::backfill(WatermarkOrdering::Lexicographic),
        }
    }

    pub async fn run_daily(&self) -> Result<JobRun, JobError> {
        self.run_daily_for(yesterday_in(self.settings.timezone, Utc::now())).await
    }

    /// Daily job for an explicit target date. A watermark at or past the
    /// target makes this a no-op. Entity failures are recorded and the
    /// watermark still advances; a failed discovery leaves it untouched.
    pub async fn run_daily_for(&self, target: NaiveDate) -> Result<JobRun, JobError> {
        let stage = Stage::schedule();
        let mut run = JobRun::new(JobType::Daily, target.to_string());
        run.start();
        info!(job_id = %run.id, job_type = %run.job_type, target = %target, "Job started");

        if let Some(current) = self.watermarks.get(&stage, DAILY_KEY).await? {
            run.watermark = Some(current.position.to_string());
            if current.position.as_date().is_some_and(|done| done >= target) {
                info!(
                    job_id = %run.id,
                    watermark = %current.position,
                    "Target date already processed, nothing to do"
                );
                return Ok(self.complete(run));
            }
        }

        if self.cancel.is_cancelled() {
            run.cancelled = true;
            return Ok(self.complete(run));
        }

        let chunk = Chunk::day(target);
        let Some(ids) = self.discover(&chunk, &mut run).await else {
            return Ok(self.complete(run));
        };
        if !self.process_chunk(&chunk, &ids, &mut run).await {
            run.cancelled = true;
            warn!(job_id = %run.id, "Job cancelled, watermark not advanced");
            return Ok(self.complete(run));
        }

        if self.checkpoint(&stage, DAILY_KEY, &chunk, Position::Date(target), &mut run).await {
            run.chunks_completed = 1;
        }
        Ok(self.complete(run))
    }

    /// Backfill a season or date range chunk by chunk, resuming after the
    /// stored watermark (or the explicit resume point).
    pub async fn run_backfill(&self, request: BackfillRequest) -> Result<JobRun, JobError> {
        let stage = self.backfill_stage();
        let key = request.scope.key();
        let (start, end) = request.scope.bounds();
        let chunk_days = request.chunk_days.unwrap_or(self.settings.chunk_days);

        let mut run = JobRun::new(JobType::Backfill, key.clone());
        run.start();

        let stored = self.watermarks.get(&stage, &key).await?;
        run.watermark = stored.as_ref().map(|w| w.position.to_string());
        let resume = match &request.resume_from {
            Some(value) => Some(Position::parse(stage.ordering, value).map_err(|source| {
                JobError::InvalidResumePoint { value: value.clone(), source }
            })?),
            None => stored.map(|w| w.position),
        };

        let chunks = plan(start, end, chunk_days);
        info!(
            job_id = %run.id,
            job_type = %run.job_type,
            scope = %key,
            start = %start,
            end = %end,
            chunks = chunks.len(),
            resume_from = resume.as_ref().map(ToString::to_string).unwrap_or_default(),
            "Job started"
        );

        for chunk in &chunks {
            if self.cancel.is_cancelled() {
                run.cancelled = true;
                warn!(job_id = %run.id, chunk = %chunk, "Job cancelled before chunk");
                break;
            }
            if let Some(Position::Date(done)) = &resume {
                if chunk.end <= *done {
                    run.chunks_skipped += 1;
                    debug!(chunk = %chunk, "Chunk already processed, skipping");
                    continue;
                }
            }

            let Some(mut ids) = self.discover(chunk, &mut run).await else {
                warn!(
                    job_id = %run.id,
                    chunk = %chunk,
                    "Backfill halted at failed discovery; remaining chunks left for the next run"
                );
                break;
            };
            if let Some(Position::Id(last)) = &resume {
                ids.retain(|id| id.as_str() > last.as_str());
                if ids.is_empty() {
                    run.chunks_skipped += 1;
                    debug!(chunk = %chunk, "No entities past the watermark, skipping");
                    continue;
                }
            }

            if !self.process_chunk(chunk, &ids, &mut run).await {
                run.cancelled = true;
                warn!(job_id = %run.id, chunk = %chunk, "Job cancelled mid-chunk, watermark not advanced");
                break;
            }

            let position = match self.settings.marker {
                BackfillMarker::Date => Some(Position::Date(chunk.end)),
                BackfillMarker::Id => ids.iter().max().cloned().map(Position::Id),
            };
            if let Some(position) = position {
                if !self.checkpoint(&stage, &key, chunk, position, &mut run).await {
                    break;
                }
            }
            run.chunks_completed += 1;
            info!(job_id = %run.id, chunk = %chunk, units = ids.len(), "Chunk completed");
        }

        Ok(self.complete(run))
    }

    async fn discover(&self, chunk: &Chunk, run: &mut JobRun) -> Option<Vec<String>> {
        let request = self.source.listing_request(chunk);
        let fetched = match self.fetcher.fetch(&request).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(
                    chunk = %chunk,
                    status = ?e.status(),
                    attempts = e.attempts(),
                    error = %e,
                    "Discovery fetch failed"
                );
                run.record(RunError::new(ErrorCategory::Discovery, e.to_string()).in_chunk(chunk));
                return None;
            }
        };
        match self.source.parse_listing(&fetched.payload) {
            Ok(ids) => {
                debug!(chunk = %chunk, ids = ids.len(), "Entities discovered");
                Some(ids)
            }
            Err(e) => {
                warn!(chunk = %chunk, error = %e, "Discovery listing malformed");
                run.record(RunError::new(ErrorCategory::Discovery, e.to_string()).in_chunk(chunk));
                None
            }
        }
    }

    /// Run every id in `ids` as its own unit. Returns `false` when
    /// cancellation kept some units from starting.
    async fn process_chunk(&self, chunk: &Chunk, ids: &[String], run: &mut JobRun) -> bool {
        let reports: Vec<Option<UnitReport>> = stream::iter(ids)
            .map(|id| async move {
                if self.cancel.is_cancelled() {
                    return None;
                }
                Some(self.process_unit(chunk, id).await)
            })
            .buffer_unordered(self.settings.max_concurrent.max(1))
            .collect()
            .await;

        let mut complete = true;
        for report in reports {
            let Some(report) = report else {
                complete = false;
                continue;
            };
            run.units_attempted += 1;
            if report.failed {
                run.units_failed += 1;
            }
            run.loaded += report.loaded;
            run.errors.extend(report.errors);
        }
        complete
    }

    async fn process_unit(&self, chunk: &Chunk, id: &str) -> UnitReport {
        let mut report = UnitReport::default();
        let error = |category: ErrorCategory, detail: String| {
            RunError::new(category, detail).for_entity(id).in_chunk(chunk)
        };

        let mut records = Vec::new();
        for entity_request in self.source.entity_requests(id) {
            let fetched = match self.fetcher.fetch(&entity_request.request).await {
                Ok(fetched) => fetched,
                Err(e) => return report.fail(error(ErrorCategory::Fetch, e.to_string())),
            };
            let rows = match entity_request.extractor.extract(&fetched.payload) {
                Ok(rows) => rows,
                Err(e) => return report.fail(error(ErrorCategory::Extract, e.to_string())),
            };
            for row in rows {
                match self.transformer.transform(row) {
                    Ok(validated) => {
                        for w in validated.warnings {
                            report
                                .errors
                                .push(error(ErrorCategory::Warning, format!("{}: {}", w.kind, w.detail)));
                        }
                        records.push(validated.record);
                    }
                    Err(e) => return report.fail(error(ErrorCategory::Validation, e.to_string())),
                }
            }
        }

        let unit = UnitOfWork::new(format!("{}/{id}", self.source.name())).with_records(records);
        match self.loader.load_unit(&unit).await {
            Ok(outcome) => {
                debug!(
                    entity = id,
                    inserted = outcome.result.inserted,
                    updated = outcome.result.updated,
                    unchanged = outcome.result.unchanged,
                    "Unit loaded"
                );
                report.loaded = outcome.result;
                report
            }
            Err(e) => report.fail(error(ErrorCategory::Persistence, e.to_string())),
        }
    }

    /// Commit the chunk's watermark. A failure is recorded on the run and
    /// marks it halted; the caller stops before the next chunk.
    async fn checkpoint(
        &self,
        stage: &Stage,
        key: &str,
        chunk: &Chunk,
        position: Position,
        run: &mut JobRun,
    ) -> bool {
        let unit = UnitOfWork::new(format!("{}/{key}", stage.name)).with_checkpoint(Checkpoint {
            stage: stage.clone(),
            key: key.to_string(),
            position,
        });
        match self.loader.load_unit(&unit).await {
            Ok(outcome) => {
                match outcome.checkpoint {
                    Some(Advance::Advanced { to, .. }) => run.watermark = Some(to.to_string()),
                    Some(Advance::Unchanged { current }) => run.watermark = Some(current.to_string()),
                    None => {}
                }
                true
            }
            Err(e) => {
                error!(
                    job_id = %run.id,
                    stage = %stage.name,
                    key,
                    chunk = %chunk,
                    error = %e,
                    "Watermark checkpoint failed, job halted"
                );
                run.record(
                    RunError::new(ErrorCategory::Checkpoint, format!("{}/{key}: {e}", stage.name))
                        .in_chunk(chunk),
                );
                run.halted = true;
                false
            }
        }
    }

    fn complete(&self, mut run: JobRun) -> JobRun {
        run.finish();
        let summary = run.summary();
        let json = serde_json::to_string(&summary).unwrap_or_default();
        info!(
            job_id = %summary.id,
            job_type = %summary.job_type,
            scope = %summary.scope,
            status = ?summary.status,
            failures = summary.failures,
            duration_ms = summary.duration_ms,
            summary = %json,
            "Job finished"
        );
        if let Some(dir) = &self.settings.job_log_dir {
            append_job_log(dir, &summary);
        }
        run
    }
}
