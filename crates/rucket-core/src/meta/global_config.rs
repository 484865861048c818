// Copyright 2024 The Rucket Authors
// SPDX-License-Identifier: Apache-2.0

//! Cluster-wide configuration document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{MetaKind, Versioned};

/// Configuration of one backend provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConf {
    /// Provider-specific settings.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

/// Cluster-wide timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalTimeouts {
    /// Control-plane operation timeout in milliseconds.
    pub cplane_operation_ms: u64,
    /// Maximum time a host may stay busy, in milliseconds.
    pub max_host_busy_ms: u64,
    /// Startup timeout in milliseconds.
    pub startup_ms: u64,
}

impl Default for GlobalTimeouts {
    fn default() -> Self {
        Self { cplane_operation_ms: 2_000, max_host_busy_ms: 20_000, startup_ms: 60_000 }
    }
}

/// Cluster-wide configuration, versioned and distributed by the primary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Monotonic version; 0 means unset.
    pub version: i64,
    /// Cluster UUID this configuration belongs to.
    pub uuid: Option<Uuid>,
    /// Public URL of the primary that created this configuration.
    #[serde(default)]
    pub primary_url: String,
    /// Enabled backend providers, keyed by provider name.
    #[serde(default)]
    pub backends: BTreeMap<String, BackendConf>,
    /// Cluster-wide timeouts.
    #[serde(default)]
    pub timeouts: GlobalTimeouts,
}

impl GlobalConfig {
    /// Whether both configurations enable the same backend providers.
    #[must_use]
    pub fn same_backends(&self, other: &BTreeMap<String, BackendConf>) -> bool {
        &self.backends == other
    }
}

impl Versioned for GlobalConfig {
    const KIND: MetaKind = MetaKind::GlobalConfig;

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn uuid(&self) -> Option<Uuid> {
        self.uuid
    }
}

impl std::fmt::Display for GlobalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let uuid = self.uuid.map(|u| u.to_string()).unwrap_or_else(|| "-".to_string());
        write!(f, "config v{}[{}, backends={}]", self.version, uuid, self.backends.len())
    }
}
