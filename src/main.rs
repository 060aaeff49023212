use std::{future::IntoFuture, process, sync::Arc};

use mqbridge::{
    api::{self, ApiState, RouteDescriptor},
    auth::AuthGate,
    broker, cache,
    config::{self, Command, Settings},
    error::AppError,
    infra::{error::InfraError, telemetry},
    ingest::{ConsumerHandle, IngestionSubsystem},
};
use tokio::{signal, sync::Notify, task::JoinHandle};
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
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    match cli_args.command_or_default() {
        Command::Serve(_) => run_serve(settings).await,
        Command::Check(_) => run_check(settings).await,
    }
}

struct Bridge {
    ingestion: Arc<IngestionSubsystem>,
    routes: Vec<RouteDescriptor>,
    cache_worker: Option<JoinHandle<()>>,
}

/// Connect the cache, resolve handlers and generate routes. Nothing consumes yet.
async fn assemble(settings: &Settings) -> Result<Bridge, AppError> {
    let cache = cache::connect(&settings.cache).await?;
    cache::preheat(cache.store.as_ref(), &settings.cache.preheat).await;

    let broker = broker::connect(&settings.broker);
    info!(broker = %broker.kind(), url = %settings.broker.url, "Broker selected");

    let ingestion = Arc::new(IngestionSubsystem::new(
        settings.queues.clone(),
        cache.store.clone(),
        broker,
        settings.ingest_options(),
    ));
    ingestion.validate()?;
    ingestion.resolve_all();

    let routes = api::build_routes(&settings.queues, &ingestion)?;

    Ok(Bridge {
        ingestion,
        routes,
        cache_worker: cache.worker,
    })
}

async fn run_check(settings: Settings) -> Result<(), AppError> {
    let bridge = assemble(&settings).await?;

    for route in &bridge.routes {
        let methods = if route.write.is_some() { "GET,POST" } else { "GET" };
        println!("{methods:<8} {:<40} {}", route.path, route.description);
    }
    println!(
        "{} queue(s), {} route(s)",
        bridge.ingestion.queues().len(),
        bridge.routes.len()
    );

    if let Some(worker) = bridge.cache_worker {
        worker.abort();
    }
    Ok(())
}

async fn run_serve(settings: Settings) -> Result<(), AppError> {
    let bridge = assemble(&settings).await?;

    let auth = AuthGate::new(&settings.auth.users, settings.auth.master_token.as_deref());
    if auth.user_count() == 0 && settings.auth.master_token.is_none() {
        warn!("No API tokens configured; every protected endpoint will answer 401");
    }

    let consumers = bridge.ingestion.start();
    info!(consumers = consumers.len(), "Ingestion started");

    let state = ApiState::new(bridge.ingestion.clone(), Arc::new(auth));
    let router = api::build_router(state, &bridge.routes);

    let result = serve_http(&settings, router).await;

    stop_consumers(consumers).await;
    if let Some(worker) = bridge.cache_worker {
        worker.abort();
        let _ = worker.await;
    }

    result
}

async fn serve_http(settings: &Settings, router: axum::Router) -> Result<(), AppError> {
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(InfraError::from)?;
    info!(addr = %settings.server.addr, "HTTP listener bound");

    let trigger = Arc::new(Notify::new());
    let drain = trigger.clone();
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move { drain.notified().await })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            return result.map_err(|err| InfraError::server(err.to_string()).into());
        }
        () = shutdown_signal() => trigger.notify_one(),
    }

    let grace = settings.server.graceful_shutdown;
    match tokio::time::timeout(grace, server).await {
        Ok(result) => result.map_err(|err| InfraError::server(err.to_string()).into()),
        Err(_) => {
            warn!(
                timeout_secs = grace.as_secs(),
                "Graceful shutdown timed out; dropping open connections"
            );
            Ok(())
        }
    }
}

async fn stop_consumers(consumers: Vec<ConsumerHandle>) {
    for handle in consumers {
        handle.task.abort();
        let _ = handle.task.await;
        info!(queue = %handle.queue_id, "Consumer stopped");
    }
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
