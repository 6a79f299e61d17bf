use std::env;
use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::ReboundError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_f64(profile: &str, key: &str, default: f64) -> f64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub postgres: PostgresConfig,
    pub fetch: FetchConfig,
    pub rate_limit: RateLimitConfig,
    pub scheduler: SchedulerConfig,
    pub source: SourceConfig,
}

/// Well-known env keys that identify a profile when prefixed.
const PROFILE_MARKER_KEYS: &[&str] = &[
    "DATABASE_URL",
    "PG_HOST",
    "SOURCE_MANIFEST",
    "RATE_LIMIT_PER_SEC",
];

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `REBOUND_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("REBOUND_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            postgres: PostgresConfig::from_env_profiled(p),
            fetch: FetchConfig::from_env_profiled(p),
            rate_limit: RateLimitConfig::from_env_profiled(p),
            scheduler: SchedulerConfig::from_env_profiled(p),
            source: SourceConfig::from_env_profiled(p),
        }
    }

    /// Discover available profiles by scanning env vars for `{PREFIX}_{MARKER_KEY}` patterns.
    /// Always includes "default" (the unprefixed config).
    pub fn available_profiles() -> Vec<String> {
        let mut profiles = std::collections::BTreeSet::new();
        profiles.insert("default".to_string());

        for (key, _) in env::vars() {
            for marker in PROFILE_MARKER_KEYS {
                if let Some(prefix) = key.strip_suffix(&format!("_{}", marker)) {
                    if !prefix.is_empty()
                        && prefix.chars().all(|c| c.is_ascii_uppercase() || c == '_')
                    {
                        profiles.insert(prefix.to_string());
                    }
                }
            }
        }

        profiles.into_iter().collect()
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject values that cannot be defaulted sensibly.
    pub fn validate(&self) -> Result<(), ReboundError> {
        self.rate_limit.validate()?;
        self.scheduler.timezone()?;
        self.scheduler.backfill_marker()?;
        if self.fetch.max_attempts == 0 {
            return Err(ReboundError::Config(
                "FETCH_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.scheduler.max_concurrent_requests == 0 {
            return Err(ReboundError::Config(
                "MAX_CONCURRENT_REQUESTS must be at least 1".to_string(),
            ));
        }
        if self.scheduler.chunk_days == 0 {
            return Err(ReboundError::Config(
                "BACKFILL_CHUNK_DAYS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  postgres:    host={}, db={}", self.postgres.host(), self.postgres.database);
        tracing::info!(
            "  fetch:       attempts={}, backoff_ceiling={}s, attempt_timeout={}s",
            self.fetch.max_attempts, self.fetch.max_backoff_secs, self.fetch.attempt_timeout_secs
        );
        tracing::info!(
            "  rate_limit:  {}/s, burst={}",
            self.rate_limit.per_second, self.rate_limit.burst
        );
        tracing::info!(
            "  scheduler:   tz={}, workers={}, chunk_days={}, marker={}",
            self.scheduler.timezone, self.scheduler.max_concurrent_requests,
            self.scheduler.chunk_days, self.scheduler.backfill_marker
        );
        tracing::info!(
            "  source:      manifest={}",
            self.source.manifest_path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "(none)".into())
        );
    }

    /// Return a redacted view safe for printing (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "postgres": {
                "host": self.postgres.host(),
                "port": self.postgres.port,
                "database": self.postgres.database,
                "url_override": self.postgres.url.is_some(),
                "configured": self.postgres.is_configured(),
            },
            "fetch": {
                "user_agent": self.fetch.user_agent,
                "max_attempts": self.fetch.max_attempts,
                "base_backoff_ms": self.fetch.base_backoff_ms,
                "max_backoff_secs": self.fetch.max_backoff_secs,
                "max_retry_after_secs": self.fetch.max_retry_after_secs,
                "attempt_timeout_secs": self.fetch.attempt_timeout_secs,
            },
            "rate_limit": { "per_second": self.rate_limit.per_second, "burst": self.rate_limit.burst },
            "scheduler": {
                "timezone": self.scheduler.timezone,
                "max_concurrent_requests": self.scheduler.max_concurrent_requests,
                "chunk_days": self.scheduler.chunk_days,
                "backfill_marker": self.scheduler.backfill_marker,
                "unit_max_attempts": self.scheduler.unit_max_attempts,
                "job_log_dir": self.scheduler.job_log_dir,
            },
            "source": { "manifest": self.source.manifest_path },
        })
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Full connection URL; wins over the discrete fields when set.
    pub url: Option<String>,
    /// `PG_HOST`; unset means `localhost`.
    pub host: Option<String>,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_opt(p, "DATABASE_URL"),
            host: profiled_env_opt(p, "PG_HOST"),
            port: profiled_env_u16(p, "PG_PORT", 5432),
            database: profiled_env_or(p, "PG_DATABASE", "rebound"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", "prefer"),
            max_connections: profiled_env_u32(p, "PG_MAX_CONNECTIONS", 10),
        }
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("localhost")
    }

    pub fn database_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host(), self.port, self.database, self.ssl_mode
        )
    }

    /// True once any of `DATABASE_URL`, `PG_HOST` or `PG_USERNAME` is set.
    pub fn is_configured(&self) -> bool {
        self.url.is_some() || self.host.is_some() || self.username.is_some()
    }
}

// ── Fetch / retry ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    pub user_agent: String,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_secs: u64,
    /// Longest server `Retry-After` honoured before giving up.
    pub max_retry_after_secs: u64,
    pub attempt_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl FetchConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            user_agent: profiled_env_or(
                p,
                "HTTP_USER_AGENT",
                concat!("rebound/", env!("CARGO_PKG_VERSION")),
            ),
            max_attempts: profiled_env_u32(p, "FETCH_MAX_ATTEMPTS", 5),
            base_backoff_ms: profiled_env_u64(p, "FETCH_BASE_BACKOFF_MS", 1000),
            max_backoff_secs: profiled_env_u64(p, "FETCH_MAX_BACKOFF_SECS", 60),
            max_retry_after_secs: profiled_env_u64(p, "FETCH_MAX_RETRY_AFTER_SECS", 300),
            attempt_timeout_secs: profiled_env_u64(p, "FETCH_ATTEMPT_TIMEOUT_SECS", 30),
            connect_timeout_secs: profiled_env_u64(p, "FETCH_CONNECT_TIMEOUT_SECS", 10),
        }
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn max_retry_after(&self) -> Duration {
        Duration::from_secs(self.max_retry_after_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self::from_env_profiled("")
    }
}

// ── Rate limit ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Token refill rate.
    pub per_second: f64,
    /// Bucket capacity (max burst).
    pub burst: u32,
}

impl RateLimitConfig {
    fn from_env_profiled(p: &str) -> Self {
        let per_second = profiled_env_f64(p, "RATE_LIMIT_PER_SEC", 4.0);
        let default_burst = if per_second.is_finite() && per_second > 1.0 {
            per_second.ceil() as u32
        } else {
            1
        };
        Self {
            per_second,
            burst: profiled_env_u32(p, "RATE_LIMIT_BURST", default_burst).max(1),
        }
    }

    pub fn validate(&self) -> Result<(), ReboundError> {
        if !self.per_second.is_finite() || self.per_second <= 0.0 {
            return Err(ReboundError::Config(format!(
                "RATE_LIMIT_PER_SEC must be a positive number, got {}",
                self.per_second
            )));
        }
        Ok(())
    }
}

// ── Scheduler ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// IANA zone used to decide what "yesterday" means for the daily job.
    pub timezone: String,
    pub max_concurrent_requests: u32,
    pub chunk_days: u32,
    /// "date" or "id".
    pub backfill_marker: String,
    pub unit_max_attempts: u32,
    pub job_log_dir: Option<PathBuf>,
}

/// How backfill progress is recorded in the watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillMarker {
    /// Last completed chunk end date.
    Date,
    /// Highest fixed-width entity identifier processed.
    Id,
}

impl SchedulerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            timezone: profiled_env_or(p, "SCHEDULE_TIMEZONE", "America/New_York"),
            max_concurrent_requests: profiled_env_u32(p, "MAX_CONCURRENT_REQUESTS", 5),
            chunk_days: profiled_env_u32(p, "BACKFILL_CHUNK_DAYS", 7),
            backfill_marker: profiled_env_or(p, "BACKFILL_MARKER", "date").to_lowercase(),
            unit_max_attempts: profiled_env_u32(p, "UNIT_MAX_ATTEMPTS", 3).max(1),
            job_log_dir: profiled_env_opt(p, "JOB_LOG_DIR").map(PathBuf::from),
        }
    }

    pub fn timezone(&self) -> Result<Tz, ReboundError> {
        self.timezone.parse::<Tz>().map_err(|_| {
            ReboundError::Config(format!("unknown SCHEDULE_TIMEZONE '{}'", self.timezone))
        })
    }

    pub fn backfill_marker(&self) -> Result<BackfillMarker, ReboundError> {
        match self.backfill_marker.as_str() {
            "date" => Ok(BackfillMarker::Date),
            "id" => Ok(BackfillMarker::Id),
            other => Err(ReboundError::Config(format!(
                "BACKFILL_MARKER must be 'date' or 'id', got '{other}'"
            ))),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_env_profiled("")
    }
}

// ── Source ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub manifest_path: Option<PathBuf>,
}

impl SourceConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            manifest_path: profiled_env_opt(p, "SOURCE_MANIFEST").map(PathBuf::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_url_prefers_explicit_url() {
        let mut pg = PostgresConfig::from_env_profiled("REBOUND_TEST_NOPE");
        pg.url = Some("postgres://u:p@db:5432/x".into());
        assert_eq!(pg.database_url(), "postgres://u:p@db:5432/x");
        assert!(pg.is_configured());
    }

    #[test]
    fn database_url_from_parts() {
        let pg = PostgresConfig {
            url: None,
            host: Some("db".into()),
            port: 6543,
            database: "hoops".into(),
            username: Some("ingest".into()),
            password: Some("pw".into()),
            ssl_mode: "disable".into(),
            max_connections: 4,
        };
        assert_eq!(pg.database_url(), "postgres://ingest:pw@db:6543/hoops?sslmode=disable");
    }

    #[test]
    fn host_alone_counts_as_configured() {
        let mut pg = PostgresConfig {
            url: None,
            host: None,
            port: 5432,
            database: "rebound".into(),
            username: None,
            password: None,
            ssl_mode: "prefer".into(),
            max_connections: 10,
        };
        assert!(!pg.is_configured());
        assert_eq!(pg.host(), "localhost");

        pg.host = Some("db.internal".into());
        assert!(pg.is_configured());
        assert_eq!(pg.database_url(), "postgres://postgres:@db.internal:5432/rebound?sslmode=prefer");
    }

    #[test]
    fn profiled_key_wins_over_plain_key() {
        std::env::set_var("REBOUNDCFGA_PG_HOST", "profiled-host");
        let cfg = Config::for_profile("reboundcfga");
        assert_eq!(cfg.postgres.host(), "profiled-host");
        assert_eq!(cfg.profile_label(), "REBOUNDCFGA");
        assert!(Config::available_profiles().contains(&"REBOUNDCFGA".to_string()));
        std::env::remove_var("REBOUNDCFGA_PG_HOST");
    }

    #[test]
    fn scheduler_parses_timezone_and_marker() {
        let mut sched = SchedulerConfig::default();
        sched.timezone = "America/New_York".into();
        sched.backfill_marker = "id".into();
        assert_eq!(sched.timezone().unwrap(), chrono_tz::America::New_York);
        assert_eq!(sched.backfill_marker().unwrap(), BackfillMarker::Id);

        sched.timezone = "Mars/Olympus".into();
        assert!(sched.timezone().is_err());
        sched.backfill_marker = "lexical".into();
        assert!(sched.backfill_marker().is_err());
    }

    #[test]
    fn validate_rejects_zero_rate() {
        let mut cfg = Config::for_profile("REBOUND_VALIDATE_TEST");
        cfg.scheduler.timezone = "UTC".into();
        cfg.scheduler.backfill_marker = "date".into();
        cfg.rate_limit.per_second = 0.0;
        assert!(cfg.validate().is_err());
        cfg.rate_limit.per_second = 2.5;
        cfg.fetch.max_attempts = 5;
        cfg.scheduler.max_concurrent_requests = 2;
        cfg.scheduler.chunk_days = 7;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn redacted_summary_hides_password() {
        let mut cfg = Config::for_profile("REBOUND_REDACT_TEST");
        cfg.postgres.password = Some("hunter2".into());
        let json = cfg.redacted_summary().to_string();
        assert!(!json.contains("hunter2"));
        assert!(json.contains("rate_limit"));
    }
}
