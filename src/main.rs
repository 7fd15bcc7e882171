use anyhow::Result;
use axum::Router;
use cloud_storage_service::{
    config,
    handlers::AppState,
    operations::{Services, Worker},
    routes,
    services::{
        document_table::DocumentTable,
        file_copier::FileCopierSettings,
        http_source::ReqwestHttpSource,
        restore_monitor::RestoreMonitor,
        storage_clients::{FileSecretsProvider, SdkClientBuilder, StorageClientFactory},
        worker_invoker::{HttpWorkerInvoker, WorkerInvoker},
    },
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{io::ErrorKind, path::Path, str::FromStr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!(
        addr = %cfg.addr(),
        worker_url = %cfg.worker_url,
        budget_secs = cfg.invocation_budget.as_secs(),
        "Starting cloud-storage-service"
    );

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    // Create parent directory if needed
    if !db_path.starts_with(':')
        && let Some(parent) = Path::new(db_path).parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent)?;
        tracing::info!("Created missing directory {:?}", parent);
    }

    let options = SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);
    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );
    let table = DocumentTable::new(db);

    // --- Handle migration mode ---
    table.migrate().await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let http = ReqwestHttpSource::build_client(cfg.invocation_budget)?;
    let clients = Arc::new(StorageClientFactory::new(
        Arc::new(FileSecretsProvider::new(cfg.client_config.clone())),
        Arc::new(SdkClientBuilder::new(http.clone())),
    ));
    let invoker: Arc<dyn WorkerInvoker> =
        Arc::new(HttpWorkerInvoker::new(http.clone(), cfg.worker_url.clone()));

    let mut services = Services::new(
        table.clone(),
        clients.clone(),
        Arc::new(ReqwestHttpSource::new(http)),
        invoker.clone(),
    );
    services.copier_settings = FileCopierSettings::new(cfg.max_concurrency, cfg.multipart_size);
    services.api_key = cfg.api_key.clone();

    let worker = Worker::new(Arc::new(services), cfg.invocation_budget);
    let state = AppState::new(worker);

    // --- Restore monitor ---
    if !cfg.monitor_interval.is_zero() {
        let monitor = RestoreMonitor::new(
            table,
            clients,
            invoker,
            uuid::Uuid::new_v4().to_string(),
        );
        tokio::spawn(run_monitor(monitor, cfg.monitor_interval));
    }

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state.clone());

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    // let in-flight worker requests reach a checkpoint or finish
    state.tasks.close();
    tracing::info!(pending = state.tasks.len(), "Waiting for worker requests");
    state.tasks.wait().await;

    Ok(())
}

async fn run_monitor(monitor: RestoreMonitor, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match monitor.run_once().await {
            Ok(report) if report.ran => tracing::debug!(
                finished_restores = report.finished_restores,
                dropped = report.dropped,
                completed_jobs = report.completed_jobs.len(),
                "restore monitor pass"
            ),
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "restore monitor pass failed"),
        }
    }
}
