//! Bootstrap tuning derived from the node configuration.

use std::path::PathBuf;
use std::time::Duration;

use rucket_core::Config;

/// Settings consumed by the bootstrap state machines.
#[derive(Debug, Clone)]
pub struct BootstrapSettings {
    /// Primary-ID override.
    pub primary_id: Option<String>,
    /// Is-primary override.
    pub is_primary: bool,
    /// Number of targets to wait for before the registration window may close.
    pub expected_targets: usize,
    /// URL of the primary, for nodes without a loaded map.
    pub primary_url: Option<String>,
    /// Skip waiting for registrations (tests).
    pub skip_startup: bool,
    /// Backend override file applied to the global config.
    pub backend_override: Option<PathBuf>,
    /// Overall startup deadline.
    pub startup: Duration,
    /// Control-plane retry interval.
    pub cplane_operation: Duration,
    /// How long membership must stay still before resuming rebalance.
    pub max_host_busy: Duration,
    /// Per-call timeout for peer queries.
    pub call_timeout: Duration,
    /// The registration window is split into this many quiescence intervals.
    pub quiescence_divisor: u32,
    /// Minimum information-channel size.
    pub ic_min_size: usize,
    /// Whether an interrupted rebalance is resumed.
    pub rebalance_enabled: bool,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for BootstrapSettings {
    fn from(config: &Config) -> Self {
        Self {
            primary_id: config.bootstrap.primary_id.clone(),
            is_primary: config.bootstrap.is_primary,
            expected_targets: config.bootstrap.expected_targets,
            primary_url: config.bootstrap.primary_url.clone(),
            skip_startup: config.bootstrap.skip_startup,
            backend_override: config.bootstrap.backend_override.clone(),
            startup: config.timeouts.startup(),
            cplane_operation: config.timeouts.cplane_operation(),
            max_host_busy: config.timeouts.max_host_busy(),
            call_timeout: config.timeouts.call(),
            quiescence_divisor: config.membership.quiescence_divisor.max(1),
            ic_min_size: config.membership.ic_min_size,
            rebalance_enabled: config.rebalance.enabled,
        }
    }
}

impl BootstrapSettings {
    /// Length of one quiescence interval of the registration window.
    #[must_use]
    pub fn quiescence_interval(&self) -> Duration {
        self.startup / self.quiescence_divisor
    }

    /// Polling period used while waiting for membership to settle.
    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        probe_interval(self.max_host_busy)
    }
}

/// A tenth of `window`, clamped to [100ms, 1s].
#[must_use]
pub fn probe_interval(window: Duration) -> Duration {
    (window / 10).clamp(Duration::from_millis(100), Duration::from_secs(1))
}
