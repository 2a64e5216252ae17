//! Configuration types for the buffer server and the merge reservoirs.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::protocol::DEFAULT_MAX_FRAME_LEN;

/// Default port the buffer server listens on.
pub const DEFAULT_PORT: u16 = 9080;

/// Default reservoir capacity, in items.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Minimum reservoir capacity.
pub const MIN_BUFFER_CAPACITY: usize = 1;

/// Maximum reservoir capacity (prevent excessive memory usage).
pub const MAX_BUFFER_CAPACITY: usize = 1 << 20;

/// Default idle wait between retries on a full or empty reservoir.
pub const DEFAULT_SPIN_INTERVAL: Duration = Duration::from_millis(15);

/// Default outbound backlog at which a connection is reported as slow.
pub const DEFAULT_BACKLOG_WARNING_THRESHOLD: usize = 10_000;

/// Default subscriber backlog at which a publisher's reads are paused.
pub const DEFAULT_MAX_BACKLOG: usize = 100_000;

/// Default wait between backlog checks while a publisher is paused.
pub const DEFAULT_STALL_INTERVAL: Duration = Duration::from_millis(15);

/// Configuration for a buffer server instance.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address the TCP listener binds to.
    pub bind_address: SocketAddr,
    /// Upper bound on an inbound frame body, in bytes.
    pub max_frame_len: usize,
    /// Pending outbound frames on one connection above which a warning is logged.
    pub backlog_warning_threshold: usize,
    /// Pending outbound frames on any subscriber of a publisher's buffer at
    /// which that publisher's socket stops being read.
    pub max_backlog: usize,
    /// Wait between backlog checks while a publisher is paused.
    pub stall_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            backlog_warning_threshold: DEFAULT_BACKLOG_WARNING_THRESHOLD,
            max_backlog: DEFAULT_MAX_BACKLOG,
            stall_interval: DEFAULT_STALL_INTERVAL,
        }
    }
}

impl BrokerConfig {
    /// Creates a configuration listening on the given address.
    #[must_use]
    pub fn with_bind_address(bind_address: SocketAddr) -> Self {
        Self {
            bind_address,
            ..Default::default()
        }
    }
}

/// Configuration for a reservoir (one input port of a consuming node).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservoirConfig {
    /// Maximum number of queued items.
    pub buffer_capacity: usize,
    /// Idle wait between retries when the reservoir is full (producer) or
    /// empty (consumer).
    pub spin_interval: Duration,
}

impl Default for ReservoirConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            spin_interval: DEFAULT_SPIN_INTERVAL,
        }
    }
}

impl ReservoirConfig {
    /// Creates a configuration with the given capacity and the default spin interval.
    #[must_use]
    pub fn with_capacity(buffer_capacity: usize) -> Self {
        Self {
            buffer_capacity: buffer_capacity.clamp(MIN_BUFFER_CAPACITY, MAX_BUFFER_CAPACITY),
            ..Default::default()
        }
    }

    /// Creates a builder for custom configuration.
    #[must_use]
    pub fn builder() -> ReservoirConfigBuilder {
        ReservoirConfigBuilder::default()
    }
}

/// Builder for [`ReservoirConfig`].
#[derive(Debug, Default)]
pub struct ReservoirConfigBuilder {
    buffer_capacity: Option<usize>,
    spin_interval: Option<Duration>,
}

impl ReservoirConfigBuilder {
    /// Sets the buffer capacity.
    #[must_use]
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = Some(capacity);
        self
    }

    /// Sets the spin interval.
    #[must_use]
    pub fn spin_interval(mut self, interval: Duration) -> Self {
        self.spin_interval = Some(interval);
        self
    }

    /// Sets the spin interval in milliseconds.
    #[must_use]
    pub fn spin_millis(self, millis: u64) -> Self {
        self.spin_interval(Duration::from_millis(millis))
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> ReservoirConfig {
        ReservoirConfig {
            buffer_capacity: self
                .buffer_capacity
                .unwrap_or(DEFAULT_BUFFER_CAPACITY)
                .clamp(MIN_BUFFER_CAPACITY, MAX_BUFFER_CAPACITY),
            spin_interval: self.spin_interval.unwrap_or(DEFAULT_SPIN_INTERVAL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_broker_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.bind_address.port(), DEFAULT_PORT);
        assert_eq!(config.max_frame_len, DEFAULT_MAX_FRAME_LEN);
        assert_eq!(
            config.backlog_warning_threshold,
            DEFAULT_BACKLOG_WARNING_THRESHOLD
        );
        assert_eq!(config.max_backlog, DEFAULT_MAX_BACKLOG);
        assert!(config.max_backlog > config.backlog_warning_threshold);
    }

    #[test]
    fn test_broker_config_with_bind_address() {
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let config = BrokerConfig::with_bind_address(addr);
        assert_eq!(config.bind_address, addr);
        assert_eq!(config.max_frame_len, DEFAULT_MAX_FRAME_LEN);
    }

    #[test]
    fn test_default_reservoir_config() {
        let config = ReservoirConfig::default();
        assert_eq!(config.buffer_capacity, 1024);
        assert_eq!(config.spin_interval, Duration::from_millis(15));
    }

    #[test]
    fn test_reservoir_config_builder() {
        let config = ReservoirConfig::builder()
            .buffer_capacity(16)
            .spin_millis(2)
            .build();
        assert_eq!(config.buffer_capacity, 16);
        assert_eq!(config.spin_interval, Duration::from_millis(2));
    }

    #[test]
    fn test_reservoir_capacity_clamping() {
        assert_eq!(ReservoirConfig::with_capacity(0).buffer_capacity, MIN_BUFFER_CAPACITY);
        assert_eq!(
            ReservoirConfig::with_capacity(usize::MAX).buffer_capacity,
            MAX_BUFFER_CAPACITY
        );
        assert_eq!(
            ReservoirConfig::builder().buffer_capacity(0).build().buffer_capacity,
            MIN_BUFFER_CAPACITY
        );
    }
}
