use anyhow::{Context, Result};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Where the service re-invokes itself for continuations.
    pub worker_url: String,
    pub invocation_budget: Duration,
    /// Zero disables the restore monitor.
    pub monitor_interval: Duration,
    pub max_concurrency: Option<usize>,
    pub multipart_size: Option<u64>,
    pub client_config: Option<PathBuf>,
    pub api_key: Option<String>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Cloud storage copy and restore worker")]
pub struct Args {
    /// Host to bind to (overrides CLOUD_STORAGE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CLOUD_STORAGE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides CLOUD_STORAGE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Worker endpoint used for continuations (overrides CLOUD_STORAGE_WORKER_URL)
    #[arg(long)]
    pub worker_url: Option<String>,

    /// Seconds one invocation may run (overrides CLOUD_STORAGE_INVOCATION_BUDGET_SECS)
    #[arg(long)]
    pub invocation_budget_secs: Option<u64>,

    /// Seconds between restore monitor passes, 0 disables (overrides CLOUD_STORAGE_MONITOR_INTERVAL_SECS)
    #[arg(long)]
    pub monitor_interval_secs: Option<u64>,

    /// Path to the storage client JSON config (overrides CLOUD_STORAGE_CLIENT_CONFIG)
    #[arg(long)]
    pub client_config: Option<PathBuf>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("CLOUD_STORAGE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("CLOUD_STORAGE_PORT")?.unwrap_or(3000);
        let env_db = env::var("CLOUD_STORAGE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/cloud_storage.db".into());
        let env_budget = env_parse("CLOUD_STORAGE_INVOCATION_BUDGET_SECS")?.unwrap_or(900);
        let env_interval = env_parse("CLOUD_STORAGE_MONITOR_INTERVAL_SECS")?.unwrap_or(60);

        // --- Merge ---
        let port = args.port.unwrap_or(env_port);
        let worker_url = args
            .worker_url
            .or_else(|| env::var("CLOUD_STORAGE_WORKER_URL").ok())
            .unwrap_or_else(|| format!("http://127.0.0.1:{}/worker", port));

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port,
            database_url: args.database_url.unwrap_or(env_db),
            worker_url,
            invocation_budget: Duration::from_secs(args.invocation_budget_secs.unwrap_or(env_budget)),
            monitor_interval: Duration::from_secs(
                args.monitor_interval_secs.unwrap_or(env_interval),
            ),
            max_concurrency: env_parse("CLOUD_STORAGE_MAX_CONCURRENCY")?,
            multipart_size: env_parse("CLOUD_STORAGE_MULTIPART_SIZE")?,
            client_config: args
                .client_config
                .or_else(|| env::var("CLOUD_STORAGE_CLIENT_CONFIG").ok().map(PathBuf::from)),
            api_key: env::var("CLOUD_STORAGE_API_KEY")
                .ok()
                .filter(|key| !key.is_empty()),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Reads and parses an optional variable; a present but malformed value is an error.
fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
