//! Service configuration.

use std::time::Duration;

/// Configuration for the node's workloads.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Wait after a lost compare-and-swap race (in milliseconds).
    pub cas_backoff_ms: u64,
    /// Interval between gossip rounds for one value (in milliseconds).
    pub gossip_interval_ms: u64,
    /// KV key holding the counter.
    pub counter_key: String,
    /// KV service holding the counter.
    pub kv_service: String,
}

impl ServiceConfig {
    pub fn cas_backoff(&self) -> Duration {
        Duration::from_millis(self.cas_backoff_ms)
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cas_backoff_ms: 200,
            gossip_interval_ms: 5000,
            counter_key: "value".to_string(),
            kv_service: carnelia_runtime::kv::SEQ_KV.to_string(),
        }
    }
}

/// Builder for service configuration.
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ServiceConfig::default(),
        }
    }

    pub fn cas_backoff(mut self, ms: u64) -> Self {
        self.config.cas_backoff_ms = ms;
        self
    }

    pub fn gossip_interval(mut self, ms: u64) -> Self {
        self.config.gossip_interval_ms = ms.max(1);
        self
    }

    pub fn counter_key(mut self, key: impl Into<String>) -> Self {
        self.config.counter_key = key.into();
        self
    }

    pub fn kv_service(mut self, service: impl Into<String>) -> Self {
        self.config.kv_service = service.into();
        self
    }

    pub fn build(self) -> ServiceConfig {
        self.config
    }
}

impl Default for ServiceConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
