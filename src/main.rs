use std::{future::Future, net::SocketAddr, process, sync::Arc};

use slastamp::{
    application::{error::AppError, repos::TimestampsRepo, timestamps::TimestampService},
    cache::{
        CacheConfig, CacheInvalidator, CacheStore, MemoryCacheStore, RedisCacheStore,
        TimestampCache,
    },
    config::{self, CacheBackend, ChannelBackend},
    events::{EventConsumer, EventPublisher, MemoryChannel},
    infra::{
        db::{PgEventQueue, PgEventQueueConfig, PostgresRepositories},
        error::InfraError,
        http::{self, ApiRateLimiter, ApiState},
        telemetry,
    },
};
use sqlx::PgPool;
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Consume(_) => run_consume(settings).await,
        config::Command::Migrate(_) => run_migrate(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let pool = init_database(&settings).await?;
    let repositories = Arc::new(PostgresRepositories::new(pool.clone()));
    let cache = init_cache(&settings).await?;

    let (publisher, consumer_handle): (Arc<dyn EventPublisher>, Option<JoinHandle<()>>) =
        match settings.channel.backend {
            ChannelBackend::Postgres => {
                let queue = PgEventQueue::new(pool, queue_config(&settings));
                (Arc::new(queue) as Arc<dyn EventPublisher>, None)
            }
            ChannelBackend::Memory => {
                let channel = Arc::new(
                    MemoryChannel::new(settings.channel.ack_mode, settings.channel.max_attempts)
                        .with_backoff(settings.channel.retry_backoff),
                );
                let handle = spawn_local_consumer(Arc::clone(&channel), Arc::clone(&cache));
                (channel as Arc<dyn EventPublisher>, Some(handle))
            }
        };

    let repo: Arc<dyn TimestampsRepo> = repositories;
    let service = Arc::new(
        TimestampService::new(repo, Arc::clone(&cache), Arc::clone(&publisher))
            .with_publish_timeout(settings.channel.publish_timeout),
    );
    let rate_limiter = Arc::new(ApiRateLimiter::new(
        std::time::Duration::from_secs(u64::from(settings.rate_limit.window_seconds.get())),
        settings.rate_limit.max_requests.get(),
    ));

    let result = serve_http(
        &settings,
        ApiState {
            timestamps: service,
            rate_limiter,
        },
    )
    .await;

    if let Err(err) = publisher.close().await {
        warn!(target = "slastamp::serve", error = %err, "Event publisher did not close cleanly");
    }
    if let Some(handle) = consumer_handle {
        // The in-process subscription ends once the closed channel drains.
        if tokio::time::timeout(settings.server.graceful_shutdown, handle)
            .await
            .is_err()
        {
            warn!(
                target = "slastamp::serve",
                "In-process consumer did not drain before the shutdown deadline"
            );
        }
    }
    cache.close().await;

    result
}

async fn run_consume(settings: config::Settings) -> Result<(), AppError> {
    if settings.channel.backend == ChannelBackend::Memory {
        return Err(AppError::validation(
            "the consume command needs a shared channel; set channel.backend = \"postgres\"",
        ));
    }

    let pool = init_database(&settings).await?;
    let cache = init_cache(&settings).await?;
    let queue = PgEventQueue::new(pool, queue_config(&settings));
    let consumer = EventConsumer::new(CacheInvalidator::new(Arc::clone(&cache)));

    let stats = consumer.run(&queue, shutdown_signal()).await;
    info!(
        target = "slastamp::consume",
        applied = stats.applied,
        dead_lettered = stats.dead_lettered,
        channel_errors = stats.channel_errors,
        "Consumer stopped"
    );

    if let Err(err) = queue.close().await {
        warn!(target = "slastamp::consume", error = %err, "Event queue did not close cleanly");
    }
    cache.close().await;
    Ok(())
}

async fn run_migrate(settings: config::Settings) -> Result<(), AppError> {
    let pool = init_database(&settings).await?;
    pool.close().await;
    info!(target = "slastamp::migrate", "Migrations applied");
    Ok(())
}

async fn init_database(settings: &config::Settings) -> Result<PgPool, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))
        .map_err(AppError::from)?;

    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    Ok(pool)
}

async fn init_cache(settings: &config::Settings) -> Result<Arc<TimestampCache>, AppError> {
    let cache_config = CacheConfig::from(&settings.cache);
    let store: Arc<dyn CacheStore> = match settings.cache.backend {
        CacheBackend::Redis => Arc::new(
            RedisCacheStore::connect(&settings.cache.redis_url)
                .await
                .map_err(|err| AppError::from(InfraError::cache(err.to_string())))?,
        ),
        CacheBackend::Memory => Arc::new(MemoryCacheStore::new(cache_config.memory_capacity)),
    };

    info!(
        target = "slastamp::cache",
        backend = ?settings.cache.backend,
        ttl_seconds = cache_config.ttl.as_secs(),
        "Cache initialised"
    );
    Ok(Arc::new(TimestampCache::new(store, cache_config)))
}

fn queue_config(settings: &config::Settings) -> PgEventQueueConfig {
    PgEventQueueConfig {
        ack_mode: settings.channel.ack_mode,
        max_attempts: settings.channel.max_attempts,
        poll_interval: settings.channel.poll_interval,
        lease: settings.channel.lease,
        backoff: settings.channel.retry_backoff,
    }
}

fn spawn_local_consumer(channel: Arc<MemoryChannel>, cache: Arc<TimestampCache>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let consumer = EventConsumer::new(CacheInvalidator::new(cache));
        consumer
            .run(channel.as_ref(), std::future::pending::<()>())
            .await;
    })
}

async fn serve_http(settings: &config::Settings, api_state: ApiState) -> Result<(), AppError> {
    let router = http::build_router(api_state);
    let listener = TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::Io(err)))?;
    info!(
        target = "slastamp::serve",
        addr = %settings.server.addr,
        "HTTP server listening"
    );

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let mut server = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = stop_rx.changed().await;
        })
        .await
    });

    tokio::select! {
        joined = &mut server => return flatten_server_result(joined),
        _ = shutdown_signal() => {}
    }

    info!(target = "slastamp::serve", "Shutdown requested; draining connections");
    let _ = stop_tx.send(true);

    match tokio::time::timeout(settings.server.graceful_shutdown, &mut server).await {
        Ok(joined) => flatten_server_result(joined),
        Err(_) => {
            server.abort();
            warn!(
                target = "slastamp::serve",
                "Connections still open at the shutdown deadline; aborting"
            );
            Ok(())
        }
    }
}

fn flatten_server_result(
    joined: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), AppError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(AppError::unexpected(format!("server error: {err}"))),
        Err(err) => Err(AppError::unexpected(format!("server task failed: {err}"))),
    }
}

fn shutdown_signal() -> impl Future<Output = ()> {
    async {
        let ctrl_c = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(target = "slastamp::shutdown", error = %err, "Failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(err) => {
                    warn!(target = "slastamp::shutdown", error = %err, "Failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
    }
}
