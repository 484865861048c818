//! Configuration management for Rucket gateways.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{NodeDescriptor, NodeRole};

/// Environment variable naming the node that must become primary.
pub const ENV_PRIMARY_ID: &str = "RUCKET_PRIMARY_ID";

/// Environment variable marking this node as the primary of a fresh cluster.
pub const ENV_IS_PRIMARY: &str = "RUCKET_IS_PRIMARY";

/// Main configuration for a Rucket gateway.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Identity of this node.
    pub node: NodeConfig,
    /// Bootstrap overrides and startup behavior.
    pub bootstrap: BootstrapConfig,
    /// Timeouts.
    pub timeouts: TimeoutConfig,
    /// Membership tunables.
    pub membership: MembershipConfig,
    /// Rebalance configuration.
    pub rebalance: RebalanceConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(crate::Error::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed.
    pub fn parse(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Loads configuration from `path` if given, defaults otherwise, then
    /// applies environment overrides and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or the result is invalid.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Applies `RUCKET_PRIMARY_ID` and `RUCKET_IS_PRIMARY` overrides.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(pid) = lookup(ENV_PRIMARY_ID).filter(|v| !v.is_empty()) {
            self.bootstrap.primary_id = Some(pid);
        }
        if let Some(flag) = lookup(ENV_IS_PRIMARY) {
            self.bootstrap.is_primary = parse_bool(&flag);
        }
    }

    /// Checks the configuration for values the bootstrap cannot work with.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first problem found.
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id must not be empty".to_string()));
        }
        if self.membership.quiescence_divisor == 0 {
            return Err(crate::Error::Config(
                "membership.quiescence_divisor must be positive".to_string(),
            ));
        }
        if self.timeouts.startup_ms == 0 {
            return Err(crate::Error::Config("timeouts.startup_ms must be positive".to_string()));
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "t" | "true" | "y" | "yes" | "on")
}

/// Identity of this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique node ID.
    pub id: String,
    /// Node role.
    pub role: NodeRole,
    /// Intra-cluster control URL.
    pub control_url: String,
    /// Public URL.
    pub public_url: String,
    /// Directory holding the persisted metadata documents.
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "p1".to_string(),
            role: NodeRole::Proxy,
            control_url: "http://127.0.0.1:51081".to_string(),
            public_url: "http://127.0.0.1:51080".to_string(),
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl NodeConfig {
    /// Builds the descriptor for this node.
    #[must_use]
    pub fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor::new(&self.id, self.role, &self.control_url, &self.public_url)
    }
}

/// Bootstrap overrides and startup behavior.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Node that must become primary (overrides the loaded cluster map).
    pub primary_id: Option<String>,
    /// Become primary of a fresh cluster when no state exists anywhere.
    pub is_primary: bool,
    /// Number of targets to wait for during startup (0 = unconstrained).
    pub expected_targets: usize,
    /// URL of the primary to join when nothing else is known.
    pub primary_url: Option<String>,
    /// Skip waiting for registrations and allow a cluster with no targets.
    pub skip_startup: bool,
    /// JSON file with a `backends` table that replaces the global config backends.
    pub backend_override: Option<PathBuf>,
}

/// Timeouts, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Overall startup deadline.
    pub startup_ms: u64,
    /// Back-off between control-plane retries.
    pub cplane_operation_ms: u64,
    /// Initial quiet period with no joins before resuming rebalance.
    pub max_host_busy_ms: u64,
    /// Per-peer call timeout.
    pub call_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { startup_ms: 60_000, cplane_operation_ms: 2_000, max_host_busy_ms: 20_000, call_ms: 5_000 }
    }
}

impl TimeoutConfig {
    /// Overall startup deadline.
    #[must_use]
    pub fn startup(&self) -> Duration {
        Duration::from_millis(self.startup_ms)
    }

    /// Back-off between control-plane retries.
    #[must_use]
    pub fn cplane_operation(&self) -> Duration {
        Duration::from_millis(self.cplane_operation_ms)
    }

    /// Initial quiet period before resuming rebalance.
    #[must_use]
    pub fn max_host_busy(&self) -> Duration {
        Duration::from_millis(self.max_host_busy_ms)
    }

    /// Per-peer call timeout.
    #[must_use]
    pub fn call(&self) -> Duration {
        Duration::from_millis(self.call_ms)
    }
}

/// Membership tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Minimum size of the information channel.
    pub ic_min_size: usize,
    /// The startup deadline is split into this many quiescence windows.
    pub quiescence_divisor: u32,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self { ic_min_size: 3, quiescence_divisor: 4 }
    }
}

/// Rebalance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalanceConfig {
    /// Whether an interrupted rebalance is resumed after startup.
    pub enabled: bool,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// JSON format.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Log output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}
