//! Wiring from configuration to a ready-to-run scheduler.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rebound_connector::{FetchClient, HttpTransport, RateLimiter, RetryPolicy};
use rebound_core::{BackfillMarker, Config, Season, SourceManifest};
use rebound_ingest::{
    BackfillRequest, BackfillScope, CatalogTransformer, JobScheduler, JsonSource, SchedulerSettings,
};
use rebound_storage::{IdempotentLoader, MemoryStore, PgStore, Stage, Store, WatermarkOrdering};
use tracing::info;

use crate::cli::BackfillArgs;

/// PostgreSQL, or an empty in-memory store for dry runs.
pub async fn open_store(config: &Config, dry_run: bool) -> Result<Arc<dyn Store>> {
    if dry_run {
        info!("Dry run: loading into an in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    if !config.postgres.is_configured() {
        bail!("PostgreSQL is not configured (set DATABASE_URL or PG_HOST); use --dry-run to run without a database");
    }
    let store = PgStore::connect(&config.postgres)
        .await
        .context("failed to connect to PostgreSQL")?;
    Ok(Arc::new(store))
}

pub fn load_manifest(config: &Config, path: Option<&Path>) -> Result<SourceManifest> {
    let path = match path.or(config.source.manifest_path.as_deref()) {
        Some(path) => path,
        None => bail!("no source manifest given (use --manifest or set SOURCE_MANIFEST)"),
    };
    let manifest = SourceManifest::from_file(path)
        .with_context(|| format!("failed to load manifest {}", path.display()))?;
    info!(
        source = %manifest.source.name,
        endpoints = manifest.endpoints.len(),
        entities = manifest.entities.len(),
        "Source manifest loaded"
    );
    Ok(manifest)
}

pub fn build_scheduler(
    config: &Config,
    manifest: &SourceManifest,
    store: Arc<dyn Store>,
) -> Result<JobScheduler> {
    let limiter = RateLimiter::from_config(&config.rate_limit).context("invalid rate limit")?;
    let transport = HttpTransport::new(&config.fetch).context("failed to build HTTP client")?;
    let fetcher = FetchClient::new(
        Arc::new(transport),
        Arc::new(limiter),
        RetryPolicy::from_config(&config.fetch),
    );
    let loader = IdempotentLoader::new(store).with_max_attempts(config.scheduler.unit_max_attempts);
    let settings = SchedulerSettings::from_config(&config.scheduler)?;

    Ok(JobScheduler::new(
        Arc::new(JsonSource::from_manifest(manifest)),
        Arc::new(fetcher),
        Arc::new(CatalogTransformer::new(manifest.catalog())),
        Arc::new(loader),
        settings,
    ))
}

pub fn backfill_request(args: &BackfillArgs) -> Result<BackfillRequest> {
    let scope = match (&args.season, args.start, args.end) {
        (Some(season), _, _) => BackfillScope::Season(Season::parse(season)?),
        (None, Some(start), Some(end)) => {
            if end < start {
                bail!("--end {end} is before --start {start}");
            }
            BackfillScope::Range { start, end, key: args.key.clone() }
        }
        _ => bail!("give either --season or both --start and --end"),
    };
    Ok(BackfillRequest {
        scope,
        chunk_days: args.chunk_days,
        resume_from: args.resume_from.clone(),
    })
}

/// Stage by name, with the ordering its positions use under `marker`.
pub fn stage_for(name: &str, marker: BackfillMarker) -> Result<Stage> {
    match name {
        Stage::SCHEDULE => Ok(Stage::schedule()),
        Stage::BACKFILL => Ok(Stage::backfill(match marker {
            BackfillMarker::Date => WatermarkOrdering::Date,
            BackfillMarker::Id => WatermarkOrdering::Lexicographic,
        })),
        other => bail!("unknown stage '{other}' (expected '{}' or '{}')", Stage::SCHEDULE, Stage::BACKFILL),
    }
}
