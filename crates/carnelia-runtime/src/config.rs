//! Runtime configuration.

use std::time::Duration;

/// Configuration for a node runtime.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// How long a request waits for its reply (in milliseconds).
    pub rpc_timeout_ms: u64,
    /// Capacity of the outbound message queue.
    pub channel_capacity: usize,
}

impl RuntimeConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: 1000,
            channel_capacity: 1024,
        }
    }
}

/// Builder for runtime configuration.
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
        }
    }

    pub fn rpc_timeout(mut self, ms: u64) -> Self {
        self.config.rpc_timeout_ms = ms;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

impl Default for RuntimeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_config_builder() {
        let config = RuntimeConfigBuilder::new()
            .rpc_timeout(250)
            .channel_capacity(0)
            .build();

        assert_eq!(config.rpc_timeout(), Duration::from_millis(250));
        assert_eq!(config.channel_capacity, 1);
    }

    #[test]
    fn test_runtime_config_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.rpc_timeout_ms, 1000);
        assert_eq!(config.channel_capacity, 1024);
    }
}
