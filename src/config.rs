use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr};

/// What happens to stored objects when the service is decommissioned with
/// `--teardown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TeardownPolicy {
    /// Keep all metadata rows and payload files.
    Retain,
    /// Drop all object metadata and delete the payload tree.
    Destroy,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown teardown policy `{0}` (expected retain|destroy)")]
pub struct ParseTeardownPolicyError(String);

impl FromStr for TeardownPolicy {
    type Err = ParseTeardownPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "retain" => Ok(Self::Retain),
            "destroy" => Ok(Self::Destroy),
            other => Err(ParseTeardownPolicyError(other.to_string())),
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments; constructed once and
/// passed to each component, never read from ambient context afterwards.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Logical bucket all uploads land in.
    pub bucket: String,
    /// Uploads larger than this are rejected with 413.
    pub max_upload_bytes: usize,
    /// Versioning on: every write to a key keeps prior versions.
    pub versioning_enabled: bool,
    pub teardown_policy: TeardownPolicy,
    /// Lease granted to a consumer per received message.
    pub visibility_timeout_secs: u64,
    /// Messages older than this are purged even if never acknowledged.
    /// Size generously relative to expected consumer downtime.
    pub retention_secs: u64,
    /// Bridge enqueue retries before an event is dropped (and alerted).
    pub bridge_max_attempts: u32,
    /// Base backoff between bridge retries; doubles per attempt.
    pub bridge_backoff_ms: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Image upload pipeline: HTTP ingress, versioned store, processing queue")]
pub struct Args {
    /// Host to bind to (overrides IMAGE_PIPELINE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides IMAGE_PIPELINE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where object payloads are stored (overrides IMAGE_PIPELINE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides IMAGE_PIPELINE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Bucket name uploads are stored under (overrides IMAGE_PIPELINE_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Maximum accepted upload size in bytes (overrides IMAGE_PIPELINE_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,

    /// Disable object versioning: each write replaces prior versions
    #[arg(long)]
    pub no_versioning: bool,

    /// Teardown policy (overrides IMAGE_PIPELINE_TEARDOWN_POLICY)
    #[arg(long, value_enum)]
    pub teardown_policy: Option<TeardownPolicy>,

    /// Queue visibility timeout in seconds (overrides IMAGE_PIPELINE_VISIBILITY_TIMEOUT_SECS)
    #[arg(long)]
    pub visibility_timeout_secs: Option<u64>,

    /// Queue retention period in seconds (overrides IMAGE_PIPELINE_RETENTION_SECS)
    #[arg(long)]
    pub retention_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Apply the teardown policy and exit
    #[arg(long)]
    pub teardown: bool,
}

/// One-shot modes requested on the command line.
#[derive(Debug, Clone, Copy)]
pub struct RunModes {
    pub migrate: bool,
    pub teardown: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run modes.
    pub fn from_env_and_args() -> Result<(Self, RunModes)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("IMAGE_PIPELINE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_storage =
            env::var("IMAGE_PIPELINE_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("IMAGE_PIPELINE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/image_pipeline.db".into());
        let env_bucket = env::var("IMAGE_PIPELINE_BUCKET").unwrap_or_else(|_| "images".into());

        let env_port: u16 = parse_env("IMAGE_PIPELINE_PORT", 3000)?;
        let env_max_upload: usize = parse_env("IMAGE_PIPELINE_MAX_UPLOAD_BYTES", 25 * 1024 * 1024)?;
        let env_visibility: u64 = parse_env("IMAGE_PIPELINE_VISIBILITY_TIMEOUT_SECS", 300)?;
        let env_retention: u64 = parse_env("IMAGE_PIPELINE_RETENTION_SECS", 86_400)?;
        let env_versioning: bool = parse_env("IMAGE_PIPELINE_VERSIONING_ENABLED", true)?;
        let env_teardown: TeardownPolicy =
            parse_env("IMAGE_PIPELINE_TEARDOWN_POLICY", TeardownPolicy::Retain)?;
        let env_bridge_attempts: u32 = parse_env("IMAGE_PIPELINE_BRIDGE_MAX_ATTEMPTS", 5)?;
        let env_bridge_backoff: u64 = parse_env("IMAGE_PIPELINE_BRIDGE_BACKOFF_MS", 200)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            bucket: args.bucket.unwrap_or(env_bucket),
            max_upload_bytes: args.max_upload_bytes.unwrap_or(env_max_upload),
            versioning_enabled: if args.no_versioning {
                false
            } else {
                env_versioning
            },
            teardown_policy: args.teardown_policy.unwrap_or(env_teardown),
            visibility_timeout_secs: args.visibility_timeout_secs.unwrap_or(env_visibility),
            retention_secs: args.retention_secs.unwrap_or(env_retention),
            bridge_max_attempts: env_bridge_attempts,
            bridge_backoff_ms: env_bridge_backoff,
        };

        let modes = RunModes {
            migrate: args.migrate,
            teardown: args.teardown,
        };

        Ok((cfg, modes))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read and parse an environment variable, falling back to `default` when it
/// is not set.
fn parse_env<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
