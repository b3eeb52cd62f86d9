//! Control-plane configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Timeouts and limits owned by the control plane.
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// Address the HTTP API binds to.
    pub bind_addr: SocketAddr,
    /// Lease granted by `claim` and by each heartbeat.
    pub lease_duration: Duration,
    /// Pause between monitor sweeps.
    pub sweep_interval: Duration,
    /// Lease expiries tolerated before a task is failed for good.
    pub max_requeues: u32,
    /// List size when the caller gives no `limit`.
    pub default_limit: usize,
    /// Hard cap on any list request.
    pub global_limit: usize,
    /// How long an idle in-process worker waits before polling again.
    pub worker_poll_interval: Duration,
    /// Number of in-process worker agents to run.
    pub local_workers: usize,
}

impl ControlPlaneConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            lease_duration: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
            max_requeues: 3,
            default_limit: 30,
            global_limit: 1000,
            worker_poll_interval: Duration::from_millis(500),
            local_workers: 0,
        }
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_max_requeues(mut self, max: u32) -> Self {
        self.max_requeues = max;
        self
    }

    pub fn with_limits(mut self, default_limit: usize, global_limit: usize) -> Self {
        self.global_limit = global_limit.max(1);
        self.default_limit = default_limit.clamp(1, self.global_limit);
        self
    }

    pub fn with_worker_poll_interval(mut self, interval: Duration) -> Self {
        self.worker_poll_interval = interval;
        self
    }

    pub fn with_local_workers(mut self, count: usize) -> Self {
        self.local_workers = count;
        self
    }

    /// Resolves a caller-supplied list limit: missing or zero falls back to
    /// the default, anything above the global cap is clamped.
    pub fn clamp_limit(&self, requested: Option<usize>) -> usize {
        match requested {
            Some(limit) if limit > 0 => limit.min(self.global_limit),
            _ => self.default_limit,
        }
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 8080)))
    }
}
