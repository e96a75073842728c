//! Run the streaming sources and the queue consumer that keep the mirror
//! tables in sync with the chain.
use std::sync::Arc;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use eyre::eyre;
use futures::future::ready;
use mirror_common::bloom::BloomFilter;
use mirror_common::config::ConfigDocument;
use mirror_common::cursor::{CursorRepository, CursorStore, PgCursorRepository};
use mirror_common::health::HealthRegistry;
use metrics_exporter_prometheus::PrometheusHandle;
use mirror_common::metrics::{serve, setup_metrics_recorder, setup_metrics_routes};
use mirror_common::pipeline::{AccountProcessor, SharedRegistry, WriteOrigin};
use mirror_common::rpc::ChainClient;
use mirror_common::schema::SchemaRegistry;
use mirror_common::transactions::TransactionResolver;
use mirror_worker::config::Config;
use mirror_worker::error::SourceError;
use mirror_worker::geyser::{self, GeyserSource};
use mirror_worker::kafka::{self, KafkaSource};
use mirror_worker::router::EventRouter;
use mirror_worker::source::{SourceRunner, StreamingSource};
use mirror_worker::substreams::{self, SubstreamsSource};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer: tracing_subscriber::filter::Filtered<
        tracing_subscriber::fmt::Layer<tracing_subscriber::Registry>,
        EnvFilter,
        tracing_subscriber::Registry,
    > = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "account mirror worker"
}

fn start_health_liveness_server(
    config: &Config,
    liveness: HealthRegistry,
    recorder: PrometheusHandle,
    cancel: CancellationToken,
) {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router, recorder);
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind, async move { cancel.cancelled().await })
            .await
            .expect("failed to start serving metrics");
    });
}

struct Context {
    config: Config,
    pool: PgPool,
    registry: SharedRegistry,
    chain: ChainClient,
    cursors: Arc<dyn CursorRepository>,
    liveness: HealthRegistry,
    cancel: CancellationToken,
}

impl Context {
    fn router(&self, service: &'static str, origin: WriteOrigin) -> EventRouter {
        EventRouter::new(
            AccountProcessor::new(self.pool.clone(), self.registry.clone(), origin),
            self.bloom(),
            service,
        )
    }

    fn bloom(&self) -> BloomFilter {
        BloomFilter::new(
            self.config.bloom_capacity,
            self.config.bloom_false_positive_rate,
        )
    }

    /// Long enough to cover a full backoff wait plus a stale check.
    fn health_deadline(&self) -> time::Duration {
        let window = self.config.stale_check_interval.0 + self.config.reconnect.maximum_interval.0;
        time::Duration::seconds(2 * window.as_secs() as i64)
    }

    async fn spawn_streaming<S>(&self, sources: &mut JoinSet<Result<(), SourceError>>, source: S)
    where
        S: StreamingSource + 'static,
    {
        let name = source.name();
        let cursor = CursorStore::new(name, self.cursors.clone(), self.config.stale_after.0)
            .with_flush_interval(self.config.cursor_flush_interval.0);
        let health = self.liveness.register(name, self.health_deadline()).await;
        let runner = SourceRunner {
            policy: self.config.reconnect.policy(),
            stale_check_interval: self.config.stale_check_interval.0,
        };
        let cancel = self.cancel.clone();

        info!(source = name, "starting source");
        sources.spawn(async move { runner.run(source, cursor, health, cancel).await });
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_from_env().expect("Invalid configuration:");

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

    let context = Context {
        pool: pool.clone(),
        registry: SharedRegistry::new(registry),
        chain,
        cursors: Arc::new(PgCursorRepository::new(pool)),
        liveness: HealthRegistry::new("liveness"),
        cancel: CancellationToken::new(),
        config,
    };
    let config = &context.config;
    let mut sources = JoinSet::new();

    if let Some(url) = &config.geyser.url {
        let resolver = TransactionResolver::new(
            context.chain.clone(),
            context.registry.clone(),
            context.bloom(),
        );
        let source = GeyserSource::new(
            url.as_str(),
            config.geyser.x_token.as_ref().map(|token| token.as_str()),
            config.geyser.connect_timeout.0,
            config.geyser.subscribe_transactions,
            context.router(geyser::SERVICE, WriteOrigin::Stream),
            context.chain.clone(),
            resolver,
        )?;
        context.spawn_streaming(&mut sources, source).await;
    }

    if let Some(url) = &config.substreams.url {
        let path = config
            .substreams
            .package_path
            .as_ref()
            .expect("SUBSTREAMS_PACKAGE_PATH is required when SUBSTREAMS_URL is set");
        let package = substreams::load_package(path.as_str())?;
        let source = SubstreamsSource::new(
            url.as_str(),
            config.substreams.api_token.as_ref().map(|token| token.as_str()),
            config.substreams.connect_timeout.0,
            package,
            &config.substreams.module,
            context.router(substreams::SERVICE, WriteOrigin::Stream),
            context.chain.clone(),
        )?;
        context.spawn_streaming(&mut sources, source).await;
    }

    if let Some(hosts) = &config.kafka.hosts {
        let secret = config
            .kafka
            .secret
            .as_ref()
            .expect("KAFKA_SECRET is required when KAFKA_HOSTS is set");
        let source = KafkaSource::new(
            &config.kafka,
            hosts.as_str(),
            secret.as_str(),
            context.router(kafka::SERVICE, WriteOrigin::Queue),
            config.reconnect.policy(),
        )?;
        let health = context
            .liveness
            .register(kafka::SERVICE, context.health_deadline())
            .await;
        let cancel = context.cancel.clone();
        sources.spawn(async move { source.run(health, cancel).await });
    }

    let supervised = sources.len();
    if supervised == 0 {
        warn!("no source configured, only serving health and metrics");
    }

    start_health_liveness_server(
        config,
        context.liveness.clone(),
        setup_metrics_recorder().expect("failed to install metrics recorder"),
        context.cancel.clone(),
    );

    let shutdown = context.cancel.clone();
    tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {}", error);
            return;
        }
        info!("shutting down");
        shutdown.cancel();
    });

    let mut failure = None;
    while let Some(joined) = sources.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                error!("source failed: {}", error);
                context.cancel.cancel();
                failure.get_or_insert(eyre!(error));
            }
            Err(error) => {
                error!("source task panicked: {}", error);
                context.cancel.cancel();
                failure.get_or_insert(eyre!(error));
            }
        }
    }

    if supervised == 0 {
        context.cancel.cancelled().await;
    }

    match failure {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
