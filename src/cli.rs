use clap::{Args, Parser, Subcommand};

use crate::types::*;

#[derive(Parser, Debug)]
#[command(
    name = "ns-migrate",
    about = "Migrate adaptive-bitrate video renditions from NetStorage to S3"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    /// Directory for the state database and default log locations
    #[arg(
        long,
        env = "NS_MIGRATE_STATE_DIR",
        default_value = "~/.ns-migrate",
        global = true
    )]
    pub state_dir: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Migrate everything under the source root, or under one subdirectory of it
    Start {
        /// Subdirectory of the source root to begin listing at
        subdirectory: Option<String>,

        #[command(flatten)]
        args: MigrateArgs,
    },

    /// Continue a previous run from the cursor it reported
    Resume {
        /// Cursor printed by an interrupted run or shown by `status`
        cursor: String,

        #[command(flatten)]
        args: MigrateArgs,
    },

    /// Show run history, the last checkpoint and dead letters
    Status {
        /// List every dead-letter record
        #[arg(long)]
        dead_letters: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct MigrateArgs {
    /// NetStorage upload host (e.g. example-nsu.akamaihd.net)
    #[arg(long, env = "NS_HOST")]
    pub host: Option<String>,

    /// Shared signing key.
    /// WARNING: passing via --key is visible in process listings.
    /// Prefer the NS_KEY environment variable instead.
    #[arg(long, env = "NS_KEY", hide_env_values = true)]
    pub key: Option<String>,

    /// Name of the signing key
    #[arg(long, env = "NS_KEYNAME")]
    pub key_name: Option<String>,

    /// Source root path on the origin (e.g. /123456/media)
    #[arg(long, env = "NS_PATH")]
    pub root: Option<String>,

    /// Destination bucket
    #[arg(long, env = "S3_BUCKET")]
    pub bucket: Option<String>,

    /// Key prefix that replaces the source root in destination keys
    #[arg(long, env = "S3_PREFIX", default_value = "")]
    pub prefix: String,

    /// Destination region (falls back to the AWS default chain)
    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,

    /// Base URL manifests are published under
    #[arg(long, env = "MANIFEST_BASE_URL", default_value = "")]
    pub manifest_base_url: String,

    /// Number of concurrent transfers
    #[arg(short = 'j', long, env = "NS_JOBS", default_value_t = 100)]
    pub jobs: usize,

    /// Listing page size as a multiple of --jobs
    #[arg(long, default_value_t = 10)]
    pub page_multiplier: usize,

    /// Max retries per transfer (0 = no retries)
    #[arg(long, default_value_t = 2)]
    pub max_retries: u32,

    /// Initial retry delay in seconds
    #[arg(long, default_value_t = 5)]
    pub retry_delay: u64,

    /// Upload part size in MiB (minimum 5)
    #[arg(long, default_value_t = 8)]
    pub chunk_size_mib: usize,

    /// Per-attempt transfer timeout in seconds
    #[arg(long, default_value_t = 3600)]
    pub transfer_timeout: u64,

    /// Rendition file extensions to migrate
    #[arg(long, value_delimiter = ',', default_value = "mp4")]
    pub extensions: Vec<String>,

    /// Scheme used to reach the origin host
    #[arg(long, value_enum, default_value = "http")]
    pub origin_scheme: OriginScheme,

    /// Manifest log path (default: <state-dir>/manifests.jsonl)
    #[arg(long)]
    pub manifest_log: Option<String>,

    /// Dead-letter log path (default: <state-dir>/dead_letters.jsonl)
    #[arg(long)]
    pub dead_letter_log: Option<String>,

    /// List and select renditions without transferring anything
    #[arg(long)]
    pub dry_run: bool,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,
}
