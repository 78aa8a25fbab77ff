//! Durable workflow execution engine — binary entry point.
//!
//! Boots the store, ports, and dispatcher, then idles until shutdown. This
//! binary has no HTTP surface of its own; embedders drive it through
//! `durable_flow::engine::Engine` from their own process or in-process
//! caller.

mod config;
mod dag;
mod dispatcher;
mod engine;
mod errors;
mod events;
mod orchestrator;
mod ports;
mod refs;
mod step_executor;
mod store;
mod types;

use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::orchestrator::Executor;
use crate::ports::{NullToolInvoker, SystemClock, ToolInvoker};
use crate::store::memory::MemoryStore;
use crate::store::Store;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "durable_flow=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env();

    info!("starting durable workflow engine");
    info!(poll_interval_ms = config.dispatch_poll_interval_ms, "dispatcher configured");

    if config.tool_invoker_endpoint.is_none() {
        warn!("TOOL_INVOKER_ENDPOINT not set — tool steps will fail closed");
    }

    let store: Arc<dyn Store> = build_store(&config).await;
    let tool_invoker: Arc<dyn ToolInvoker> = build_tool_invoker(&config);
    let clock = Arc::new(SystemClock);

    let step_executor = Arc::new(crate::step_executor::StepExecutor::new(
        store.clone(),
        tool_invoker,
        None,
        clock.clone(),
    ));
    let executor = Arc::new(Executor::new(store.clone(), step_executor, clock.clone()));
    let dispatcher = Dispatcher::new(store.clone(), executor, config.dispatch_poll_interval_ms);

    let dispatcher_handle = tokio::spawn(async move {
        dispatcher.run().await;
    });

    info!("dispatcher started");

    shutdown_signal().await;
    info!("shutdown signal received, stopping dispatcher...");

    dispatcher_handle.abort();

    info!("durable workflow engine shutdown complete");
}

#[cfg(feature = "postgres")]
async fn build_store(config: &Config) -> Arc<dyn Store> {
    match &config.database_url {
        Some(url) => {
            let pg = crate::store::postgres::PgStore::new(url)
                .await
                .expect("failed to connect to postgres");
            info!("using postgres store");
            Arc::new(pg)
        }
        None => {
            warn!("DATABASE_URL not set — using in-memory store (state is lost on restart)");
            Arc::new(MemoryStore::new())
        }
    }
}

#[cfg(not(feature = "postgres"))]
async fn build_store(config: &Config) -> Arc<dyn Store> {
    if config.database_url.is_some() {
        warn!("DATABASE_URL is set but this build lacks the `postgres` feature — using in-memory store");
    } else {
        warn!("DATABASE_URL not set — using in-memory store (state is lost on restart)");
    }
    Arc::new(MemoryStore::new())
}

fn build_tool_invoker(config: &Config) -> Arc<dyn ToolInvoker> {
    match &config.tool_invoker_endpoint {
        Some(endpoint) => Arc::new(crate::ports::HttpToolInvoker::new(endpoint.clone(), reqwest::Client::new())),
        None => Arc::new(NullToolInvoker),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
