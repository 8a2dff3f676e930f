use std::time::Duration;

use anyhow::Context;

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: String,
    pub socket_bind_addr: String,
    pub cors_enabled: bool,
    pub ws_send_buffer: usize,
    pub ws_init_timeout: Duration,
    pub event_bus_capacity: usize,
    pub socket_live_defer_rule: bool,
    pub greetings_rotate_interval: Duration,
    pub random_hash_interval: Duration,
    pub timings: Timings,
}

/// Artificial latencies of the demo resolvers.
#[derive(Clone, Copy, Debug)]
pub struct Timings {
    pub defer_delay: Duration,
    pub stream_interval: Duration,
    pub count_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            defer_delay: Duration::from_millis(5000),
            stream_interval: Duration::from_millis(1000),
            count_interval: Duration::from_millis(1000),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.into());

        let bind_addr = var("GRAPHQL_BIND_ADDR", "127.0.0.1:4000");
        let socket_bind_addr = var("SOCKET_BIND_ADDR", "127.0.0.1:4001");
        let cors_enabled = var("CORS_ENABLED", "true")
            .parse()
            .context("CORS_ENABLED must be true or false")?;
        let ws_send_buffer = var("WS_SEND_BUFFER", "64")
            .parse()
            .context("WS_SEND_BUFFER must be a number")?;
        let ws_init_timeout_ms: u64 = var("WS_INIT_TIMEOUT_MS", "3000")
            .parse()
            .context("WS_INIT_TIMEOUT_MS must be a number")?;
        let event_bus_capacity = var("EVENT_BUS_CAPACITY", "256")
            .parse()
            .context("EVENT_BUS_CAPACITY must be a number")?;
        let socket_live_defer_rule = var("SOCKET_LIVE_DEFER_RULE", "true")
            .parse()
            .context("SOCKET_LIVE_DEFER_RULE must be true or false")?;
        let greetings_rotate_ms: u64 = var("GREETINGS_ROTATE_MS", "1000")
            .parse()
            .context("GREETINGS_ROTATE_MS must be a number")?;
        let random_hash_interval_ms: u64 = var("RANDOM_HASH_INTERVAL_MS", "1000")
            .parse()
            .context("RANDOM_HASH_INTERVAL_MS must be a number")?;
        let defer_delay_ms: u64 = var("DEFER_DELAY_MS", "5000")
            .parse()
            .context("DEFER_DELAY_MS must be a number")?;
        let stream_interval_ms: u64 = var("STREAM_INTERVAL_MS", "1000")
            .parse()
            .context("STREAM_INTERVAL_MS must be a number")?;
        let count_interval_ms: u64 = var("COUNT_INTERVAL_MS", "1000")
            .parse()
            .context("COUNT_INTERVAL_MS must be a number")?;

        Ok(Self {
            bind_addr,
            socket_bind_addr,
            cors_enabled,
            ws_send_buffer,
            ws_init_timeout: Duration::from_millis(ws_init_timeout_ms),
            event_bus_capacity,
            socket_live_defer_rule,
            greetings_rotate_interval: Duration::from_millis(greetings_rotate_ms),
            random_hash_interval: Duration::from_millis(random_hash_interval_ms),
            timings: Timings {
                defer_delay: Duration::from_millis(defer_delay_ms),
                stream_interval: Duration::from_millis(stream_interval_ms),
                count_interval: Duration::from_millis(count_interval_ms),
            },
        })
    }
}
