use site_insight::{
    config::AppConfig,
    db::{self, store::JobStore, store::PgJobStore},
    services::{
        browser::ChromeCapture,
        describe::OpenAiDescriber,
        fetcher::FetchSettings,
        processor::Processor,
        queue::{JobPublisher, JobQueue, RetryPolicy},
        robots::RobotsChecker,
    },
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL_MS: u64 = 1000; // 1 second

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting crawl worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    let store = PgJobStore::new(db_pool);
    store.ping().await.expect("Database is not reachable");

    let worker_id = config.worker_id();
    tracing::info!(worker_id = %worker_id, "Connecting to Redis queue");
    let queue = JobQueue::new(&config.redis_url, &worker_id)
        .expect("Failed to initialize job queue");
    queue.ping().await.expect("Redis is not reachable");

    let recovered = queue
        .recover_in_flight()
        .await
        .expect("Failed to recover in-flight deliveries");
    if recovered > 0 {
        tracing::warn!(recovered, "Returned unfinished deliveries to the queue");
    }

    let policy = RobotsChecker::new(config.robots_timeout())
        .expect("Failed to initialize robots.txt client");

    let settings = FetchSettings {
        navigation_timeout: config.navigation_timeout(),
        chromium_path: config.chromium_path.clone().map(PathBuf::from),
        ..FetchSettings::default()
    };

    if config.openai_mock {
        tracing::warn!("OPENAI_MOCK is set, descriptions are fixed text");
    } else if config.openai_api_key.is_none() {
        tracing::warn!("OPENAI_API_KEY is not set, every job will fail to describe");
    }
    let describer = OpenAiDescriber::new(
        config.openai_api_key.clone(),
        config.openai_model.clone(),
        config.openai_mock,
        config.openai_timeout(),
    )
    .expect("Failed to initialize description client");

    let processor = Processor::new(
        Arc::new(store),
        Arc::new(policy),
        Arc::new(ChromeCapture::new(settings)),
        Arc::new(describer),
        RetryPolicy::new(config.max_retries),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    tracing::info!(max_retries = config.max_retries, "Worker ready, starting job processing loop");

    processor
        .run(&queue, shutdown, Duration::from_millis(POLL_INTERVAL_MS))
        .await;

    tracing::info!("Worker stopped");
}

/// Cancel `token` on Ctrl+C or SIGTERM.
async fn watch_signals(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown requested, finishing current job");
    token.cancel();
}
