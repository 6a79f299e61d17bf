//! Job orchestration: chunk planning, the daily and backfill jobs, and the
//! run bookkeeping they report through.

pub mod chunk;
pub mod job;
pub mod scheduler;
pub mod source;
pub mod transform;

pub use chunk::{plan, Chunk};
pub use job::{append_job_log, ErrorCategory, JobRun, JobStatus, JobSummary, JobType, RunError};
pub use scheduler::{
    yesterday_in, BackfillRequest, BackfillScope, JobError, JobScheduler, SchedulerSettings,
    DAILY_KEY,
};
pub use source::{EntityRequest, JsonRows, JsonSource, Source};
pub use transform::CatalogTransformer;
