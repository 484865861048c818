// Copyright 2024 The Rucket Authors
// SPDX-License-Identifier: Apache-2.0

//! Rebalance metadata document.

use serde::{Deserialize, Serialize};

use super::{MetaKind, Versioned};

/// Version increment that marks a new rebalance epoch.
///
/// Rebalance IDs are derived from this version, so a resumed rebalance must
/// never collide with one that targets may still remember.
pub const REBALANCE_EPOCH_STRIDE: i64 = 100;

/// Rebalance metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceMetadata {
    /// Monotonic version; 0 means unset.
    pub version: i64,
    /// Whether global rebalancing is enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Set when a previous rebalance did not run to completion.
    #[serde(default)]
    pub interrupted: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for RebalanceMetadata {
    fn default() -> Self {
        Self { version: 0, enabled: default_enabled(), interrupted: false }
    }
}

impl RebalanceMetadata {
    /// Starts a new rebalance epoch.
    pub fn next_epoch(&mut self) {
        self.version += REBALANCE_EPOCH_STRIDE;
        self.interrupted = false;
    }
}

impl Versioned for RebalanceMetadata {
    const KIND: MetaKind = MetaKind::RebalanceMetadata;

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }
}

impl std::fmt::Display for RebalanceMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rmd v{}[enabled={}, interrupted={}]", self.version, self.enabled, self.interrupted)
    }
}
