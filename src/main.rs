use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

mod bus;
mod config;
mod context;
mod engine;
mod event_socket;
mod http_transport;
mod live;
mod schema;
mod subscriptions;
mod types;
mod ws_gateway;

use engine::{ActiveWork, Executor, SchemaExecutor, ValidationRules};

pub struct AppState {
    pub executor: Arc<dyn Executor>,
    pub contexts: context::ContextFactory,
    pub live: live::LiveQueryStore,
    pub active: ActiveWork,
    pub rules: ValidationRules,
    pub socket_rules: ValidationRules,
    pub ws_send_buffer: usize,
    pub ws_init_timeout: Duration,
}

impl AppState {
    pub fn initialize(config: &config::Config) -> Arc<Self> {
        let bus = bus::EventBus::new(config.event_bus_capacity);
        let contexts = context::ContextFactory::new(
            Arc::new(context::DemoState::default()),
            bus,
            config.timings,
        );
        let live = live::LiveQueryStore::new();
        let executor = SchemaExecutor::new(schema::build_schema(), live.clone());
        let active = executor.active_work();

        Arc::new(Self {
            executor: Arc::new(executor),
            contexts,
            live,
            active,
            rules: ValidationRules::default(),
            socket_rules: ValidationRules {
                no_live_mixed_with_defer_stream: config.socket_live_defer_rule,
                ..ValidationRules::default()
            },
            ws_send_buffer: config.ws_send_buffer,
            ws_init_timeout: config.ws_init_timeout,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = config::Config::from_env()?;
    let state = AppState::initialize(&config);
    let shutdown = CancellationToken::new();

    spawn_greetings_rotation(&state, config.greetings_rotate_interval, shutdown.clone());
    spawn_random_hash(&state, config.random_hash_interval, shutdown.clone());

    let graphql_router = http_transport::router(state.clone(), config.cors_enabled);
    let socket_state = state.clone();
    let socket_router = event_socket::router(move |_connection_id| event_socket::SocketParameter {
        executor: socket_state.executor.clone(),
        rules: socket_state.socket_rules,
        context: socket_state.contexts.build(),
        send_buffer: socket_state.ws_send_buffer,
    });

    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid GRAPHQL_BIND_ADDR {}", config.bind_addr))?;
    let socket_addr: SocketAddr = config
        .socket_bind_addr
        .parse()
        .with_context(|| format!("invalid SOCKET_BIND_ADDR {}", config.socket_bind_addr))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    let socket_listener = tokio::net::TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("binding {socket_addr}"))?;
    info!("graphql listening on http://{}/graphql", addr);
    info!("event socket listening on ws://{}", socket_addr);

    let graphql_server = axum::serve(listener, graphql_router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let socket_server = axum::serve(socket_listener, socket_router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    let signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal.cancel();
    });

    let (graphql_result, socket_result) = tokio::join!(graphql_server, socket_server);
    shutdown.cancel();
    graphql_result.map_err(|e| {
        error!(error = %e, "graphql server failed");
        e
    })?;
    socket_result.map_err(|e| {
        error!(error = %e, "event socket server failed");
        e
    })?;

    info!("shut down");
    Ok(())
}

fn spawn_greetings_rotation(state: &Arc<AppState>, every: Duration, shutdown: CancellationToken) {
    let state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    state.contexts.state().rotate_greetings();
                    let signalled = state.live.invalidate(context::GREETINGS_KEY);
                    debug!(signalled, live = state.live.registration_count(), "greetings rotated");
                }
            }
        }
    });
}

fn spawn_random_hash(state: &Arc<AppState>, every: Duration, shutdown: CancellationToken) {
    let bus = state.contexts.bus().clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    bus.publish(context::RANDOM_HASH_TOPIC, &context::random_hash());
                }
            }
        }
    });
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::config::Config;
    use crate::AppState;

    pub fn state() -> Arc<AppState> {
        let config = Config::from_lookup(|key| match key {
            "DEFER_DELAY_MS" => Some("10".into()),
            "STREAM_INTERVAL_MS" | "COUNT_INTERVAL_MS" => Some("1".into()),
            _ => None,
        })
        .expect("test config");
        AppState::initialize(&config)
    }
}
