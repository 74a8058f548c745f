//! Fabric configuration
//!
//! All timing, retry and queue knobs recognized by the broker and the
//! client/worker endpoints. One struct is shared by all three roles; each
//! role reads the fields that concern it.

use std::time::{Duration, Instant};

/// Configuration for brokers, workers and clients.
///
/// # Examples
///
/// ```
/// use steward_core::config::FabricConfig;
/// use std::time::Duration;
///
/// let config = FabricConfig::default()
///     .with_heartbeat_interval(Duration::from_millis(1000))
///     .with_request_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Base heartbeat tick period.
    ///
    /// The broker runs its expiry loop on this period and workers emit a
    /// HEARTBEAT whenever it elapses with no other outbound frame.
    /// - Default: 2500 ms
    pub heartbeat_interval: Duration,

    /// Number of missed heartbeat intervals before a peer is considered dead.
    ///
    /// The expiry deadline on a worker is `now + liveness * interval`, which
    /// tolerates occasional packet loss without false eviction.
    /// - Default: 3
    pub heartbeat_liveness: u32,

    /// Initial reconnect back-off for workers and clients.
    ///
    /// - `None` (default): use `heartbeat_interval`
    /// - `Some(duration)`: explicit base interval
    ///
    /// The back-off doubles on every failed attempt up to `reconnect_max`.
    pub reconnect_interval: Option<Duration>,

    /// Cap for the exponential reconnect back-off.
    /// - Default: 32 seconds
    pub reconnect_max: Duration,

    /// Client per-request wait before a retry (or failure).
    /// - Default: 5000 ms
    pub request_timeout: Duration,

    /// Number of times a client re-sends a request that saw no reply.
    /// - Default: 3
    pub request_retries: u32,

    /// Per-service pending-request high-water mark.
    ///
    /// When a service's pending queue exceeds this, the oldest request is
    /// dropped and a warning is logged.
    /// - Default: 1000
    pub service_hwm: usize,

    /// Enable the reserved `mmi.` management namespace inside the broker.
    /// - Default: true
    pub management_enabled: bool,

    /// Read buffer size (bytes) for framed connections.
    /// - Default: 8192 (8KB) - balanced for most workloads
    pub read_buffer_size: usize,

    /// Initial write buffer capacity (bytes) for framed connections.
    /// - Default: 8192 (8KB)
    pub write_buffer_size: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(2500),
            heartbeat_liveness: 3,
            reconnect_interval: None,
            reconnect_max: Duration::from_secs(32),
            request_timeout: Duration::from_millis(5000),
            request_retries: 3,
            service_hwm: 1000,
            management_enabled: true,
            read_buffer_size: 8192,
            write_buffer_size: 8192,
        }
    }
}

impl FabricConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the heartbeat tick period.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the number of missed intervals tolerated before eviction.
    pub fn with_heartbeat_liveness(mut self, liveness: u32) -> Self {
        self.heartbeat_liveness = liveness;
        self
    }

    /// Set an explicit reconnect base interval.
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = Some(interval);
        self
    }

    /// Set the reconnect back-off cap.
    pub fn with_reconnect_max(mut self, max: Duration) -> Self {
        self.reconnect_max = max;
        self
    }

    /// Set the client per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the client retry count.
    pub fn with_request_retries(mut self, retries: u32) -> Self {
        self.request_retries = retries;
        self
    }

    /// Set the per-service pending-queue high-water mark.
    pub fn with_service_hwm(mut self, hwm: usize) -> Self {
        self.service_hwm = hwm;
        self
    }

    /// Enable or disable the management namespace.
    pub fn with_management_enabled(mut self, enabled: bool) -> Self {
        self.management_enabled = enabled;
        self
    }

    /// Set both read and write buffer sizes.
    pub fn with_buffer_sizes(mut self, read_size: usize, write_size: usize) -> Self {
        self.read_buffer_size = read_size;
        self.write_buffer_size = write_size;
        self
    }

    /// Effective reconnect base interval.
    #[must_use]
    pub fn reconnect_base(&self) -> Duration {
        self.reconnect_interval.unwrap_or(self.heartbeat_interval)
    }

    /// How long a peer may stay silent before it is considered dead.
    #[must_use]
    pub fn liveness_window(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_liveness
    }

    /// Compute the expiry deadline for a peer seen at `now`.
    #[must_use]
    pub fn expiry_deadline(&self, now: Instant) -> Instant {
        now + self.liveness_window()
    }
}
