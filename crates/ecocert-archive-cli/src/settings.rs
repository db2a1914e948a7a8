use std::path::PathBuf;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args};
use ecocert_archive_core::config::{
    DEFAULT_DATABASE_PATH, DEFAULT_GATEWAY_URL, DEFAULT_PINATA_API_URL,
};
use ecocert_archive_core::ArchiveConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Pipeline options; every flag can also be set through its environment key
#[derive(Debug, Args)]
pub struct Settings {
    #[arg(
        long = "db",
        env = "ARCHIVE_DATABASE_PATH",
        default_value = DEFAULT_DATABASE_PATH,
        global = true
    )]
    pub database_path: PathBuf,

    /// Defaults to a directory under the system temp dir
    #[arg(long, env = "ARCHIVE_STAGING_DIR", global = true)]
    pub staging_dir: Option<PathBuf>,

    #[arg(long, env = "ARCHIVE_MAX_FILE_SIZE_MB", default_value_t = 100, global = true)]
    pub max_file_size_mb: u64,

    #[arg(long, env = "ARCHIVE_REQUEST_TIMEOUT_MS", default_value_t = 30_000, global = true)]
    pub request_timeout_ms: u64,

    /// URLs of one identifier archived at once
    #[arg(long, env = "ARCHIVE_FETCH_CONCURRENCY", default_value_t = 5, global = true)]
    pub fetch_concurrency: usize,

    /// Pins in flight at once across the whole run
    #[arg(long, env = "ARCHIVE_UPLOAD_CONCURRENCY", default_value_t = 3, global = true)]
    pub upload_concurrency: usize,

    #[arg(long, env = "ARCHIVE_IDENTIFIER_CONCURRENCY", default_value_t = 2, global = true)]
    pub identifier_concurrency: usize,

    #[arg(long, env = "ARCHIVE_MAX_RETRY_ATTEMPTS", default_value_t = 3, global = true)]
    pub max_retry_attempts: u32,

    #[arg(long, env = "PINATA_JWT", hide_env_values = true, global = true)]
    pub pinata_jwt: Option<String>,

    #[arg(long, env = "PINATA_API_URL", default_value = DEFAULT_PINATA_API_URL, global = true)]
    pub pinata_api_url: String,

    #[arg(long, env = "IPFS_GATEWAY_URL", default_value = DEFAULT_GATEWAY_URL, global = true)]
    pub gateway_url: String,

    #[arg(long, env = "ARCHIVE_REQUIRE_HTTPS", action = ArgAction::SetTrue, global = true)]
    pub require_https: bool,

    #[arg(long, env = "ARCHIVE_PRODUCTION", action = ArgAction::SetTrue, global = true)]
    pub production: bool,

    /// Hosts exempt from the private-address check, exact or `*.suffix`
    #[arg(long = "allow-host", env = "ARCHIVE_ALLOWED_HOSTS", value_delimiter = ',', global = true)]
    pub allowed_hosts: Vec<String>,

    #[arg(
        long,
        env = "ARCHIVE_ENFORCE_MIME_ALLOWLIST",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        default_value_t = true,
        global = true
    )]
    pub enforce_mime_allowlist: bool,

    #[arg(
        long,
        env = "ARCHIVE_BLOCK_SUSPICIOUS_CONTENT",
        action = ArgAction::SetTrue,
        global = true
    )]
    pub block_suspicious_content: bool,
}

impl Settings {
    pub fn into_config(self) -> ArchiveConfig {
        let defaults = ArchiveConfig::default();
        ArchiveConfig {
            database_path: self.database_path,
            staging_dir: self.staging_dir.unwrap_or(defaults.staging_dir),
            max_file_size_mb: self.max_file_size_mb,
            request_timeout_ms: self.request_timeout_ms,
            fetch_concurrency: self.fetch_concurrency,
            upload_concurrency: self.upload_concurrency,
            identifier_concurrency: self.identifier_concurrency,
            max_retry_attempts: self.max_retry_attempts,
            pinata_jwt: self.pinata_jwt,
            pinata_api_url: self.pinata_api_url,
            gateway_url: self.gateway_url,
            require_https: self.require_https,
            production: self.production,
            allowed_hosts: self
                .allowed_hosts
                .into_iter()
                .map(|host| host.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect(),
            enforce_mime_allowlist: self.enforce_mime_allowlist,
            block_suspicious_content: self.block_suspicious_content,
        }
    }
}

/// Log to stderr so stdout stays reserved for command output.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env("ARCHIVE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let json_layer = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
    });
    let text_layer = (!json).then(|| {
        tracing_subscriber::fmt::layer().with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}
