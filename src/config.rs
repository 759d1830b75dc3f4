//! Centralized hub configuration.
//! Combines environment variables and CLI arguments; CLI wins.

use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Tuning record consumed by the hub core and the disk driver.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    /// Name baked into the challenge text and the implicit valid hub URL.
    pub server_name: String,
    /// Subdirectory of `storage_dir` holding all object payloads.
    pub bucket: String,
    pub page_size: u64,
    /// Stored with object metadata for a fronting read path to honor.
    pub cache_control: Option<String>,
    /// Public URL prefix substituted into returned `publicURL` values.
    pub read_url: Option<String>,
    /// Megabytes.
    pub max_file_upload_size: u64,
    pub auth_timestamp_cache_size: usize,
    pub blacklist_cache_size: usize,
    /// When set, only these addresses may act as the effective signer.
    pub whitelist: Option<Vec<String>>,
    pub valid_hub_urls: Vec<String>,
    pub require_correct_hub_url: bool,
    pub check_association_issuer_blacklist: bool,
    pub storage_dir: String,
    pub database_url: String,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Authenticated object-storage hub")]
pub struct Args {
    /// Host to bind to (overrides HUB_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Server name used in the auth challenge (overrides HUB_SERVER_NAME)
    #[arg(long)]
    pub server_name: Option<String>,

    /// Directory where object payloads are stored (overrides HUB_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides HUB_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Public read URL prefix (overrides HUB_READ_URL)
    #[arg(long)]
    pub read_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {name} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).context(format!("reading {name}")),
    }
}

fn env_list(name: &str) -> Option<Vec<String>> {
    let value = env::var(name).ok()?;
    let items: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

impl HubConfig {
    /// Parse environment variables + CLI args into the config and the
    /// migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        Self::from_env_with(args)
    }

    fn from_env_with(args: Args) -> Result<(Self, bool)> {
        let env_host = env::var("HUB_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port: u16 = env_or("PORT", 8088)?;
        let env_server_name = env::var("HUB_SERVER_NAME").unwrap_or_else(|_| "localhost".into());
        let env_storage = env::var("HUB_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db =
            env::var("HUB_DATABASE_URL").unwrap_or_else(|_| "sqlite://./data/meta/hub.db".into());

        let read_url = args
            .read_url
            .or_else(|| env::var("HUB_READ_URL").ok())
            .map(|mut url| {
                if !url.ends_with('/') {
                    url.push('/');
                }
                url
            });

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            server_name: args.server_name.unwrap_or(env_server_name),
            bucket: env::var("HUB_BUCKET").unwrap_or_else(|_| "hub".into()),
            page_size: env_or("HUB_PAGE_SIZE", 100u64)?.max(1),
            cache_control: env::var("HUB_CACHE_CONTROL").ok(),
            read_url,
            max_file_upload_size: env_or("HUB_MAX_FILE_UPLOAD_SIZE_MB", 20u64)?,
            auth_timestamp_cache_size: env_or("HUB_AUTH_TIMESTAMP_CACHE_SIZE", 50_000usize)?,
            blacklist_cache_size: env_or("HUB_BLACKLIST_CACHE_SIZE", 50_000usize)?,
            whitelist: env_list("HUB_WHITELIST"),
            valid_hub_urls: env_list("HUB_VALID_HUB_URLS").unwrap_or_default(),
            require_correct_hub_url: env_or("HUB_REQUIRE_CORRECT_HUB_URL", false)?,
            check_association_issuer_blacklist: env_or(
                "HUB_CHECK_ASSOCIATION_ISSUER_BLACKLIST",
                false,
            )?,
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_file_upload_size_bytes(&self) -> u64 {
        self.max_file_upload_size * 1024 * 1024
    }
}
