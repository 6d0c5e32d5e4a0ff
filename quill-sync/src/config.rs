//! Typed configuration for the worker, hub, and supervisor roles.

use std::time::Duration;

use crate::store::StoreConfig;

/// Default client-facing port.
pub const DEFAULT_PORT: u16 = 5000;
/// Default hub port.
pub const DEFAULT_HUB_PORT: u16 = 6380;

/// Exponential backoff used by the bus relay when it loses its subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (0-based): doubles, capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Location of the hub that hosts the shared store and bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubEndpoint {
    pub host: String,
    pub port: u16,
}

impl Default for HubEndpoint {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_HUB_PORT,
        }
    }
}

impl HubEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// Worker (client-facing server) configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Supervisor slot, for logging
    pub worker_index: usize,
    /// Buffered outbound messages per local broadcast receiver
    pub broadcast_capacity: usize,
    /// Buffered outbound messages per connection
    pub outbound_capacity: usize,
    /// Bus relay reconnection policy
    pub bus_backoff: BackoffConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            worker_index: 0,
            broadcast_capacity: 256,
            outbound_capacity: 256,
            bus_backoff: BackoffConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Small buffers and fast reconnects.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            worker_index: 0,
            broadcast_capacity: 64,
            outbound_capacity: 64,
            bus_backoff: BackoffConfig {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(100),
            },
        }
    }
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub bind_addr: String,
    pub store: StoreConfig,
    /// Buffered events per subscribed link
    pub broadcast_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{DEFAULT_HUB_PORT}"),
            store: StoreConfig::default(),
            broadcast_capacity: 1024,
        }
    }
}

/// Process supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Number of workers to keep running
    pub workers: usize,
    /// Delay before a dead worker is replaced
    pub restart_delay: Duration,
    /// Restarts tolerated per slot within `restart_window` before slowing down
    pub max_restarts: usize,
    pub restart_window: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            workers: default_worker_count(),
            restart_delay: Duration::from_millis(250),
            max_restarts: 5,
            restart_window: Duration::from_secs(10),
        }
    }
}

/// One worker per available CPU core.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(10), Duration::from_secs(5));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:5000");
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[test]
    fn test_hub_endpoint_url() {
        assert_eq!(HubEndpoint::default().url(), "ws://127.0.0.1:6380");
        assert_eq!(HubEndpoint::new("redis.local", 7000).url(), "ws://redis.local:7000");
    }

    #[test]
    fn test_supervisor_defaults() {
        let config = SupervisorConfig::default();
        assert!(config.workers >= 1);
        assert_eq!(config.restart_delay, Duration::from_millis(250));
    }
}
