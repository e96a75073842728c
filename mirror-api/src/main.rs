//! Webhook ingress and admin surface of the account mirror.
use std::sync::Arc;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use mirror_common::bloom::BloomFilter;
use mirror_common::config::ConfigDocument;
use mirror_common::metrics::{serve, setup_metrics_recorder};
use mirror_common::pipeline::{AccountProcessor, SharedRegistry, WriteOrigin};
use mirror_common::rpc::ChainClient;
use mirror_common::schema::SchemaRegistry;
use mirror_common::transactions::TransactionResolver;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use config::Config;
use handlers::AppState;
use integrity::IntegrityChecker;
use refresh::FullRefresh;

mod config;
mod error;
#[cfg(test)]
mod fixtures;
mod handlers;
mod integrity;
mod refresh;
mod scheduler;

fn setup_tracing() {
    let log_layer: tracing_subscriber::filter::Filtered<
        tracing_subscriber::fmt::Layer<tracing_subscriber::Registry>,
        EnvFilter,
        tracing_subscriber::Registry,
    > = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

async fn listen(app: Router, bind: String, cancel: CancellationToken) -> Result<()> {
    serve(app, &bind, async move { cancel.cancelled().await }).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    setup_tracing();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let document = ConfigDocument::load(config.accounts_config_path.as_str())
        .expect("failed to read accounts configuration");
    let registry = SchemaRegistry::load(&document).expect("invalid accounts configuration");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .acquire_timeout(config.pg_acquire_timeout.0)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");
    sqlx::migrate!("../migrations")
        .run(&pool)
        .await
        .expect("failed to run migrations");
    registry
        .migrate(&pool)
        .await
        .expect("failed to migrate account tables");

    let chain = ChainClient::new(&config.solana_url, config.rpc_timeout.0)
        .expect("failed to build rpc client");
    let registry = SharedRegistry::new(registry);

    let refresh = Arc::new(FullRefresh::new(
        pool.clone(),
        registry.clone(),
        chain.clone(),
        config.refresh_chunk_size,
    ));
    let integrity = Arc::new(IntegrityChecker::new(
        pool.clone(),
        registry.clone(),
        chain.clone(),
        config.integrity_window_hours,
    ));

    let cancel = CancellationToken::new();
    if config.enable_cron_jobs {
        let jobs = scheduler::schedule_jobs(
            &registry.current(),
            refresh.clone(),
            integrity.clone(),
            cancel.clone(),
        )
        .expect("invalid cron schedule");
        info!(jobs = jobs.len(), "cron jobs enabled");
    }

    let state = AppState {
        processor: AccountProcessor::new(pool, registry.clone(), WriteOrigin::Webhook),
        resolver: Arc::new(TransactionResolver::new(
            chain,
            registry,
            BloomFilter::new(config.bloom_capacity, config.bloom_false_positive_rate),
        )),
        refresh,
        integrity,
        accounts_config_path: config.accounts_config_path.0.clone(),
        webhook_secret: config.webhook_secret.0.clone(),
        admin_password: config.admin_password.0.clone(),
    };

    let recorder = setup_metrics_recorder().expect("failed to install metrics recorder");
    let app = handlers::app(state, Some(recorder));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for shutdown signal: {}", error);
            return;
        }
        shutdown.cancel();
    });

    match listen(app, config.bind(), cancel.clone()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start mirror-api http server, {}", e),
    }
    cancel.cancel();
}
