use std::{process, sync::Arc, time::Duration};

use quire::{
    application::{content::ContentLoader, error::AppError},
    cache::{
        CacheConfig, CacheStore, EventQueue, MemoryStore, PageCacheState, PurgeConsumer,
        PurgeCoordinator, QueryCache,
    },
    config,
    infra::{
        content::HttpContentSource,
        error::InfraError,
        events::EventListener,
        http::{self, HttpState},
        telemetry,
    },
};
use tokio::task::JoinHandle;
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

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match cli_args.command {
        Some(config::Command::Serve(_)) | None => run_serve(settings).await,
    }
}

struct ApplicationContext {
    http_state: HttpState,
    consumer: Option<PurgeConsumer>,
    listener: Option<EventListener>,
}

fn build_application_context(settings: &config::Settings) -> Result<ApplicationContext, AppError> {
    let cache_config = CacheConfig::from(&settings.cache);
    if !cache_config.is_enabled() {
        info!(target = "quire::cache", "Query and page caching disabled");
    }

    // No store means every cache layer degrades to a direct fetch.
    let store: Option<Arc<dyn CacheStore>> = if cache_config.enable_store {
        Some(Arc::new(MemoryStore::new(&cache_config)))
    } else {
        info!(
            target = "quire::cache",
            "Cache store disabled; serving every query from the content source"
        );
        None
    };

    let source = Arc::new(HttpContentSource::new(&settings.content)?);
    let loader = ContentLoader::new(
        source,
        store.clone().map(QueryCache::new),
        cache_config.clone(),
    );
    let coordinator = store.clone().map(PurgeCoordinator::new);

    let queue = Arc::new(EventQueue::new(cache_config.event_queue_limit));
    let consumer = coordinator.clone().map(|coordinator| {
        PurgeConsumer::new(
            queue.clone(),
            coordinator,
            cache_config.consume_batch_limit,
        )
    });

    let listener = match (&consumer, settings.events.enabled) {
        (Some(_), true) => Some(EventListener::new(
            &settings.content,
            &settings.events,
            queue,
        )?),
        (None, true) => {
            warn!(
                target = "quire::events",
                "Push events enabled without a cache store; listener not started"
            );
            None
        }
        (_, false) => None,
    };

    let page = PageCacheState {
        config: cache_config,
        page_index: coordinator
            .as_ref()
            .map(|coordinator| coordinator.page_index().clone()),
    };

    Ok(ApplicationContext {
        http_state: HttpState {
            loader,
            purge: coordinator,
            page,
        },
        consumer,
        listener,
    })
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let app = build_application_context(&settings)?;

    let consume_handle = app
        .consumer
        .clone()
        .map(|consumer| spawn_auto_consume(consumer, settings.cache.auto_consume_interval));
    let listener_handle = app.listener.map(|listener| tokio::spawn(listener.run()));

    let result = serve_http(&settings, app.http_state).await;

    for handle in [listener_handle, consume_handle].into_iter().flatten() {
        handle.abort();
        let _ = handle.await;
    }

    // Drain whatever the listener queued before shutdown.
    if let Some(consumer) = app.consumer {
        match tokio::time::timeout(settings.server.graceful_shutdown, consumer.consume_all()).await
        {
            Ok(batches) => info!(target = "quire::events", batches, "Final purge drain finished"),
            Err(_) => warn!(
                target = "quire::events",
                pending = consumer.queue().len(),
                "Final purge drain timed out"
            ),
        }
    }

    result
}

fn spawn_auto_consume(consumer: PurgeConsumer, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            consumer.consume().await;
        }
    })
}

async fn serve_http(settings: &config::Settings, http_state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(http_state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "quire::http",
        addr = %settings.server.addr,
        "Listening"
    );

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!(target = "quire::http", "Shutdown signal received");
}
