use std::num::NonZeroU32;
use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};

/// Resumable sports-data ingestion.
///
/// Connection and tuning settings come from the environment (and `.env`),
/// optionally under a profile prefix such as `PROD_DATABASE_URL`.
#[derive(Parser, Debug)]
#[command(name = "rebound", version, about = "Resumable sports-data ingestion")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Config profile (overrides REBOUND_PROFILE)
    #[arg(long, global = true)]
    pub profile: Option<String>,

    /// Source manifest (overrides SOURCE_MANIFEST)
    #[arg(long, global = true)]
    pub manifest: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ingest yesterday's entities (in the configured timezone)
    RunDaily {
        /// Target date instead of yesterday
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Load into an in-memory store instead of PostgreSQL
        #[arg(long)]
        dry_run: bool,
    },

    /// Backfill a season or date range in resumable chunks
    RunBackfill(BackfillArgs),

    /// Inspect or edit watermarks
    #[command(subcommand)]
    Watermark(WatermarkCommand),

    /// Print the resolved configuration with secrets redacted
    Config,
}

#[derive(Args, Debug)]
pub struct BackfillArgs {
    /// Season label, e.g. 2024-25
    #[arg(long, conflicts_with_all = ["start", "end", "key"], required_unless_present = "start")]
    pub season: Option<String>,

    /// First day of the range (inclusive)
    #[arg(long, requires = "end")]
    pub start: Option<NaiveDate>,

    /// Last day of the range (inclusive)
    #[arg(long, requires = "start")]
    pub end: Option<NaiveDate>,

    /// Watermark key for a date range (default: START..END)
    #[arg(long, requires = "start")]
    pub key: Option<String>,

    /// Days per chunk (default: BACKFILL_CHUNK_DAYS)
    #[arg(long)]
    pub chunk_days: Option<NonZeroU32>,

    /// Resume after this date or identifier, ignoring the stored watermark
    #[arg(long)]
    pub resume_from: Option<String>,

    /// Load into an in-memory store instead of PostgreSQL
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug)]
pub enum WatermarkCommand {
    /// List watermarks
    List {
        /// Only this stage
        #[arg(long)]
        stage: Option<String>,
    },
    /// Show one watermark
    Get {
        /// `schedule` or `backfill`
        #[arg(long)]
        stage: String,
        /// e.g. `daily` or a season label
        #[arg(long)]
        key: String,
    },
    /// Overwrite a watermark, bypassing the forward-only check
    Set {
        #[arg(long)]
        stage: String,
        #[arg(long)]
        key: String,
        /// ISO date or identifier, per the stage's ordering
        #[arg(long)]
        value: String,
    },
}
