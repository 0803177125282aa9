use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::MigrateArgs;
use crate::migrate::paths::PathLayout;
use crate::migrate::MigrateConfig;
use crate::retry::RetryConfig;
use crate::types::OriginScheme;

/// Smallest part size S3 accepts for every part but the last.
pub const MIN_CHUNK_SIZE_MIB: usize = 5;

const MAX_RETRY_DELAY_SECS: u64 = 60;

/// Load `.env` into the process environment before arguments are parsed.
///
/// Uses `NS_MIGRATE_ENV_FILE` when set, otherwise `./.env`. A missing file is
/// not an error. Variables already set in the environment win.
pub fn load_env_file() -> anyhow::Result<bool> {
    let path = std::env::var_os("NS_MIGRATE_ENV_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".env"));
    load_env_from(&path)
}

fn load_env_from(path: &Path) -> anyhow::Result<bool> {
    match dotenvy::from_path(path) {
        Ok(()) => Ok(true),
        Err(dotenvy::Error::Io(_)) => Ok(false),
        Err(e) => Err(anyhow::anyhow!("Invalid env file {}: {}", path.display(), e)),
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Validated settings for a `start` or `resume` run.
pub struct Config {
    pub host: String,
    pub key: String,
    pub key_name: String,
    pub root: String,
    pub bucket: String,
    pub prefix: String,
    pub region: Option<String>,
    pub manifest_base_url: String,
    pub extensions: Vec<String>,

    pub state_dir: PathBuf,
    pub manifest_log: PathBuf,
    pub dead_letter_log: PathBuf,

    pub transfer_timeout: Duration,
    pub jobs: usize,
    pub page_size: usize,
    pub chunk_size: usize,
    pub retry: RetryConfig,

    pub origin_scheme: OriginScheme,

    pub dry_run: bool,
    pub no_progress_bar: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("key", &"<redacted>")
            .field("key_name", &self.key_name)
            .field("root", &self.root)
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("jobs", &self.jobs)
            .field("page_size", &self.page_size)
            .field("state_dir", &self.state_dir)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

fn required(value: Option<String>, flag: &str, env: &str) -> anyhow::Result<String> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => anyhow::bail!("--{} (or {}) is required", flag, env),
    }
}

impl Config {
    pub fn from_args(state_dir: &str, args: MigrateArgs) -> anyhow::Result<Self> {
        let host = required(args.host, "host", "NS_HOST")?;
        let key = required(args.key, "key", "NS_KEY")?;
        let key_name = required(args.key_name, "key-name", "NS_KEYNAME")?;
        let root = required(args.root, "root", "NS_PATH")?;
        let bucket = required(args.bucket, "bucket", "S3_BUCKET")?;

        if args.jobs == 0 {
            anyhow::bail!("--jobs must be at least 1");
        }
        if args.page_multiplier == 0 {
            anyhow::bail!("--page-multiplier must be at least 1");
        }
        if args.chunk_size_mib < MIN_CHUNK_SIZE_MIB {
            anyhow::bail!(
                "--chunk-size-mib must be at least {} (got {})",
                MIN_CHUNK_SIZE_MIB,
                args.chunk_size_mib
            );
        }
        if args.transfer_timeout == 0 {
            anyhow::bail!("--transfer-timeout must be at least 1 second");
        }

        let manifest_base_url = if args.manifest_base_url.trim().is_empty() {
            format!("s3://{}", bucket)
        } else {
            args.manifest_base_url.trim().to_string()
        };

        let state_dir = expand_tilde(state_dir);
        let manifest_log = args
            .manifest_log
            .map(|p| expand_tilde(&p))
            .unwrap_or_else(|| state_dir.join("manifests.jsonl"));
        let dead_letter_log = args
            .dead_letter_log
            .map(|p| expand_tilde(&p))
            .unwrap_or_else(|| state_dir.join("dead_letters.jsonl"));

        Ok(Self {
            host,
            key,
            key_name,
            root,
            bucket,
            prefix: args.prefix,
            region: args.region.filter(|r| !r.trim().is_empty()),
            manifest_base_url,
            extensions: args.extensions,
            state_dir,
            manifest_log,
            dead_letter_log,
            transfer_timeout: Duration::from_secs(args.transfer_timeout),
            jobs: args.jobs,
            page_size: args.jobs.saturating_mul(args.page_multiplier),
            chunk_size: args.chunk_size_mib * 1024 * 1024,
            retry: RetryConfig {
                max_retries: args.max_retries,
                base_delay_secs: args.retry_delay,
                max_delay_secs: MAX_RETRY_DELAY_SECS,
            },
            origin_scheme: args.origin_scheme,
            dry_run: args.dry_run,
            no_progress_bar: args.no_progress_bar,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("state.db")
    }

    pub fn layout(&self) -> PathLayout {
        PathLayout::new(&self.root, &self.prefix, &self.manifest_base_url)
    }

    pub fn migrate_config(&self) -> MigrateConfig {
        MigrateConfig {
            layout: self.layout(),
            extensions: self.extensions.clone(),
            jobs: self.jobs,
            page_size: self.page_size,
            retry: self.retry,
            chunk_size: self.chunk_size,
            transfer_timeout: self.transfer_timeout,
            no_progress_bar: self.no_progress_bar,
        }
    }
}
