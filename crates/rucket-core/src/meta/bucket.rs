// Copyright 2024 The Rucket Authors
// SPDX-License-Identifier: Apache-2.0

//! Bucket metadata document.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{MetaKind, Versioned};

/// Properties of a single bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketProps {
    /// Backend provider (e.g. `ais`, `aws`, `gcp`).
    pub provider: String,
    /// When the bucket was created.
    pub created_at: DateTime<Utc>,
    /// Whether object versioning is enabled.
    #[serde(default)]
    pub versioning: bool,
}

impl BucketProps {
    /// Creates bucket properties for the given provider.
    #[must_use]
    pub fn new(provider: impl Into<String>) -> Self {
        Self { provider: provider.into(), created_at: Utc::now(), versioning: false }
    }
}

/// All bucket properties, versioned as one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketMetadata {
    /// Monotonic version; 0 means unset.
    pub version: i64,
    /// Cluster UUID this document belongs to.
    pub uuid: Option<Uuid>,
    /// Bucket name to properties.
    #[serde(default)]
    pub buckets: BTreeMap<String, BucketProps>,
}

impl BucketMetadata {
    /// Creates the initial (version 1) document for a cluster.
    #[must_use]
    pub fn initial(uuid: Option<Uuid>) -> Self {
        Self { version: 1, uuid, buckets: BTreeMap::new() }
    }
}

impl Versioned for BucketMetadata {
    const KIND: MetaKind = MetaKind::BucketMetadata;

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

impl std::fmt::Display for BucketMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let uuid = self.uuid.map(|u| u.to_string()).unwrap_or_else(|| "-".to_string());
        write!(f, "bmd v{}[{}, buckets={}]", self.version, uuid, self.buckets.len())
    }
}
