//! Hookrelay webhook delivery service.
//!
//! Main entry point: loads configuration, establishes the database pool,
//! bootstraps the schema, and runs the HTTP surface and the delivery
//! engine side by side until a shutdown signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use hookrelay_api::{AppState, Config};
use hookrelay_core::storage::Storage;
use hookrelay_delivery::{
    planner::FanoutPlanner, replay::ReplayService, storage::PostgresDeliveryStore,
    DeliveryEngine, IdentityTransformer, MemoryRateLimiter, NoOpNotifier,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("starting hookrelay webhook delivery service");

    let config = Config::load()?;
    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        workers = config.worker_pool_size,
        "configuration loaded"
    );

    let pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    bootstrap_schema(&pool).await?;
    info!("database schema verified");

    let storage = Arc::new(Storage::new(pool.clone()));
    let store = Arc::new(PostgresDeliveryStore::new(storage.clone()));
    let queue = storage.queue_jobs.clone();

    let dispatcher_config = config.to_dispatcher_config()?;
    let mut engine = DeliveryEngine::new(
        store.clone(),
        queue.clone(),
        Arc::new(MemoryRateLimiter::new()),
        Arc::new(IdentityTransformer),
        Arc::new(NoOpNotifier),
        dispatcher_config,
    )?;

    let planner: Arc<FanoutPlanner> = engine.planner();
    let replay = Arc::new(ReplayService::new(store, queue, planner.clone()));
    let state = AppState::new(storage, planner, replay, engine.caches());

    engine.start().await;

    let retention_handle = tokio::spawn(retention_scheduler(state.storage.clone()));

    let addr = config.parse_server_addr()?;
    let server_config = config.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = hookrelay_api::start_server(state, &server_config, addr).await {
            error!(error = %e, "server failed");
        }
    });

    info!(addr = %addr, "hookrelay is ready to receive events");

    // The server task exits when the shutdown signal fires.
    let _ = server_handle.await;
    retention_handle.abort();
    info!("server stopped, draining delivery workers");

    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "delivery engine shutdown incomplete");
    }

    pool.close().await;
    info!("hookrelay shutdown complete");
    Ok(())
}

/// Enqueues a daily retention sweep for every live project.
async fn retention_scheduler(storage: Arc<Storage>) {
    use hookrelay_core::queue::{QueueName, TaskName, WorkQueue};
    use hookrelay_delivery::worker::RetentionSweepPayload;

    const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 3600);

    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;

        let project_ids = match storage.projects.find_all_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "retention scheduler failed to list projects");
                continue;
            },
        };

        for project_id in project_ids {
            let payload = match serde_json::to_value(RetentionSweepPayload { project_id }) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(error = %e, "retention payload serialization failed");
                    continue;
                },
            };
            if let Err(e) = storage
                .queue_jobs
                .enqueue(
                    QueueName::Scheduled,
                    TaskName::RetentionSweep,
                    payload,
                    None,
                    Duration::ZERO,
                )
                .await
            {
                error!(project_id = %project_id, error = %e, "retention sweep enqueue failed");
            }
        }
    }
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,hookrelay=debug,tower_http=debug"))
        .expect("invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer().with_target(true).with_file(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;
    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;
                return Ok(pool);
            },
            Err(_) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Ensures the schema exists.
async fn bootstrap_schema(pool: &sqlx::PgPool) -> Result<()> {
    let statements: &[&str] = &[
        r"
        CREATE TABLE IF NOT EXISTS projects (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            project_type TEXT NOT NULL,
            config JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            deleted_at TIMESTAMPTZ
        )
        ",
        r"
        CREATE TABLE IF NOT EXISTS sources (
            id UUID PRIMARY KEY,
            project_id UUID NOT NULL REFERENCES projects(id),
            name TEXT NOT NULL,
            source_type TEXT NOT NULL,
            verifier JSONB,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            deleted_at TIMESTAMPTZ
        )
        ",
        r"
        CREATE TABLE IF NOT EXISTS endpoints (
            id UUID PRIMARY KEY,
            project_id UUID NOT NULL REFERENCES projects(id),
            name TEXT NOT NULL,
            target_url TEXT NOT NULL,
            secrets JSONB NOT NULL DEFAULT '[]',
            http_timeout_seconds INTEGER NOT NULL DEFAULT 30,
            rate_limit INTEGER NOT NULL DEFAULT 0,
            rate_limit_duration_seconds INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'active',
            auth JSONB,
            alert_config JSONB,
            breaker_failure_count INTEGER NOT NULL DEFAULT 0,
            breaker_window_started_at TIMESTAMPTZ,
            disabled_by_breaker BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            deleted_at TIMESTAMPTZ
        )
        ",
        r"
        CREATE TABLE IF NOT EXISTS subscriptions (
            id UUID PRIMARY KEY,
            sub_type TEXT NOT NULL,
            project_id UUID NOT NULL REFERENCES projects(id),
            name TEXT NOT NULL,
            endpoint_id UUID REFERENCES endpoints(id),
            source_id UUID REFERENCES sources(id),
            device_id UUID,
            filter_config JSONB NOT NULL,
            alert_config JSONB,
            retry_config JSONB,
            rate_limit_config JSONB,
            function TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            deleted_at TIMESTAMPTZ
        )
        ",
        r"
        CREATE TABLE IF NOT EXISTS events (
            id UUID PRIMARY KEY,
            event_type TEXT NOT NULL,
            project_id UUID NOT NULL REFERENCES projects(id),
            source_id UUID,
            endpoints UUID[] NOT NULL DEFAULT '{}',
            headers JSONB NOT NULL DEFAULT '{}',
            raw TEXT NOT NULL,
            data JSONB NOT NULL,
            url_query_params TEXT,
            idempotency_key TEXT,
            is_duplicate_event BOOLEAN NOT NULL DEFAULT FALSE,
            acknowledged_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            deleted_at TIMESTAMPTZ
        )
        ",
        r"
        CREATE TABLE IF NOT EXISTS events_endpoints (
            event_id UUID NOT NULL REFERENCES events(id),
            endpoint_id UUID NOT NULL
        )
        ",
        r"
        CREATE TABLE IF NOT EXISTS events_search (
            id UUID PRIMARY KEY,
            event_type TEXT NOT NULL,
            project_id UUID NOT NULL,
            source_id UUID,
            endpoints UUID[] NOT NULL DEFAULT '{}',
            headers JSONB NOT NULL DEFAULT '{}',
            raw TEXT NOT NULL,
            data JSONB NOT NULL,
            url_query_params TEXT,
            idempotency_key TEXT,
            is_duplicate_event BOOLEAN NOT NULL DEFAULT FALSE,
            acknowledged_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            deleted_at TIMESTAMPTZ,
            search_token TSVECTOR
        )
        ",
        r"
        CREATE TABLE IF NOT EXISTS event_deliveries (
            id UUID PRIMARY KEY,
            project_id UUID NOT NULL REFERENCES projects(id),
            event_id UUID NOT NULL REFERENCES events(id),
            endpoint_id UUID NOT NULL REFERENCES endpoints(id),
            subscription_id UUID NOT NULL,
            device_id UUID,
            headers JSONB NOT NULL DEFAULT '{}',
            url_query_params TEXT,
            idempotency_key TEXT,
            event_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'scheduled',
            metadata JSONB NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            deleted_at TIMESTAMPTZ
        )
        ",
        r"
        CREATE TABLE IF NOT EXISTS delivery_attempts (
            id UUID PRIMARY KEY,
            delivery_id UUID NOT NULL REFERENCES event_deliveries(id),
            endpoint_id UUID NOT NULL,
            api_version TEXT NOT NULL,
            ip_address TEXT NOT NULL DEFAULT '',
            request_http_header JSONB NOT NULL DEFAULT '{}',
            response_http_header JSONB NOT NULL DEFAULT '{}',
            http_status INTEGER,
            response_data TEXT NOT NULL DEFAULT '',
            error TEXT NOT NULL DEFAULT '',
            status BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
        r"
        CREATE TABLE IF NOT EXISTS queue_jobs (
            id UUID PRIMARY KEY,
            queue TEXT NOT NULL,
            task TEXT NOT NULL,
            payload JSONB NOT NULL,
            delivery_id UUID,
            priority SMALLINT NOT NULL,
            run_at TIMESTAMPTZ NOT NULL,
            claimed_at TIMESTAMPTZ,
            attempts INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
        r"
        CREATE INDEX IF NOT EXISTS idx_queue_jobs_ready
        ON queue_jobs (priority, run_at)
        WHERE claimed_at IS NULL
        ",
        r"
        CREATE INDEX IF NOT EXISTS idx_queue_jobs_delivery
        ON queue_jobs (delivery_id)
        WHERE delivery_id IS NOT NULL
        ",
        r"
        CREATE INDEX IF NOT EXISTS idx_events_idempotency
        ON events (project_id, idempotency_key, created_at)
        WHERE idempotency_key IS NOT NULL
        ",
        r"
        CREATE INDEX IF NOT EXISTS idx_events_project_id
        ON events (project_id, id DESC)
        WHERE deleted_at IS NULL
        ",
        r"
        CREATE INDEX IF NOT EXISTS idx_event_deliveries_project_id
        ON event_deliveries (project_id, id DESC)
        WHERE deleted_at IS NULL
        ",
        r"
        CREATE INDEX IF NOT EXISTS idx_event_deliveries_status
        ON event_deliveries (status)
        ",
        r"
        CREATE INDEX IF NOT EXISTS idx_delivery_attempts_delivery
        ON delivery_attempts (delivery_id, created_at)
        ",
        r"
        CREATE INDEX IF NOT EXISTS idx_events_search_token
        ON events_search USING GIN (search_token)
        ",
        r"
        CREATE INDEX IF NOT EXISTS idx_events_endpoints_event
        ON events_endpoints (event_id)
        ",
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await.context("schema bootstrap failed")?;
    }

    Ok(())
}
