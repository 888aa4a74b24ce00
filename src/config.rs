//! CLI arguments and configuration defaults for the server and the uploader.

use clap::{Args as ClapArgs, Parser, Subcommand};
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_UPLOADS_DIR: &str = ".axo/uploads";
pub const DEFAULT_HTTP_PORT: u16 = 3000;
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:3000";
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_TRACKER_IDLE_TTL_SECS: u64 = 60 * 60;
pub const TRACKER_EVICT_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_TRANSPORT_RETRIES: u32 = 3;
pub const DEFAULT_MAX_REJECTIONS: u32 = 5;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

/// Top level command line.
#[derive(Parser, Debug)]
#[command(name = "axo-resume", version = VERSION_INFO, about = "Resumable chunked uploads")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the upload server.
    Serve(ServeArgs),
    /// Upload a file to a running server, resuming where it stopped.
    Push(PushArgs),
}

#[derive(ClapArgs, Debug)]
pub struct ServeArgs {
    #[arg(
        short = 's',
        long,
        env = "AXO_UPLOADS_DIR",
        default_value = DEFAULT_UPLOADS_DIR,
        help = "Directory holding one file per upload id"
    )]
    pub uploads_dir: String,
    #[arg(
        short = 'b',
        long,
        env = "AXO_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "AXO_HTTP_PORT",
        default_value_t = DEFAULT_HTTP_PORT,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(long, env = "AXO_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "AXO_MAX_CHUNK_SIZE",
        default_value_t = DEFAULT_MAX_CHUNK_SIZE,
        help = "Largest accepted chunk in bytes"
    )]
    pub max_chunk_size: u64,
    #[arg(
        long,
        env = "AXO_LOCK_WAIT_SECS",
        default_value_t = DEFAULT_LOCK_WAIT_TIMEOUT_SECS,
        help = "How long a chunk waits for another chunk of the same upload"
    )]
    pub lock_wait_secs: u64,
    #[arg(
        long,
        env = "AXO_TRACKER_IDLE_TTL_SECS",
        default_value_t = DEFAULT_TRACKER_IDLE_TTL_SECS,
        help = "Drop cached offsets idle this long (0 to disable)"
    )]
    pub tracker_idle_ttl_secs: u64,
}

#[derive(ClapArgs, Debug)]
pub struct PushArgs {
    #[arg(help = "File to upload")]
    pub file: String,
    #[arg(
        short = 'u',
        long,
        env = "AXO_SERVER_URL",
        default_value = DEFAULT_SERVER_URL,
        help = "Server base URL"
    )]
    pub server: String,
    #[arg(long, help = "Upload id (defaults to the file name)")]
    pub id: Option<String>,
    #[arg(
        long,
        env = "AXO_CHUNK_SIZE",
        default_value_t = DEFAULT_CHUNK_SIZE,
        help = "Chunk size in bytes"
    )]
    pub chunk_size: u64,
    #[arg(
        long,
        default_value_t = DEFAULT_TRANSPORT_RETRIES,
        help = "Retries per chunk after a network failure"
    )]
    pub retries: u32,
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_REJECTIONS,
        help = "Retries per chunk after the server reports a failure"
    )]
    pub max_rejections: u32,
    #[arg(
        long,
        default_value_t = DEFAULT_RETRY_BACKOFF_MS,
        help = "Base delay between retries in milliseconds"
    )]
    pub retry_backoff_ms: u64,
}
