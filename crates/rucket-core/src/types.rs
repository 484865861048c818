// Copyright 2024 The Rucket Authors
// SPDX-License-Identifier: Apache-2.0

//! Common types used throughout Rucket gateways.

use serde::{Deserialize, Serialize};

/// Role of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Gateway node; one of them is the primary.
    Proxy,
    /// Storage node.
    Target,
}

impl NodeRole {
    /// Returns the role as a lowercase string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Proxy => "proxy",
            Self::Target => "target",
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity of a cluster member.
///
/// Descriptors are never mutated in place: a node that restarts with new
/// addresses produces a new descriptor that replaces the old entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeDescriptor {
    id: String,
    role: NodeRole,
    control_url: String,
    public_url: String,
}

impl NodeDescriptor {
    /// Creates a new descriptor.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        role: NodeRole,
        control_url: impl Into<String>,
        public_url: impl Into<String>,
    ) -> Self {
        Self { id: id.into(), role, control_url: control_url.into(), public_url: public_url.into() }
    }

    /// Creates a proxy descriptor.
    #[must_use]
    pub fn proxy(
        id: impl Into<String>,
        control_url: impl Into<String>,
        public_url: impl Into<String>,
    ) -> Self {
        Self::new(id, NodeRole::Proxy, control_url, public_url)
    }

    /// Creates a target descriptor.
    #[must_use]
    pub fn target(
        id: impl Into<String>,
        control_url: impl Into<String>,
        public_url: impl Into<String>,
    ) -> Self {
        Self::new(id, NodeRole::Target, control_url, public_url)
    }

    /// Returns the node ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the node role.
    #[must_use]
    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Returns the intra-cluster control URL.
    #[must_use]
    pub fn control_url(&self) -> &str {
        &self.control_url
    }

    /// Returns the public URL.
    #[must_use]
    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    /// Whether this node is a proxy.
    #[must_use]
    pub fn is_proxy(&self) -> bool {
        self.role == NodeRole::Proxy
    }

    /// Whether this node is a target.
    #[must_use]
    pub fn is_target(&self) -> bool {
        self.role == NodeRole::Target
    }

    /// Whether `other` listens on the same control endpoint.
    #[must_use]
    pub fn same_endpoint(&self, other: &NodeDescriptor) -> bool {
        self.control_url == other.control_url
    }

    /// The URLs to try, in order, when contacting this node.
    #[must_use]
    pub fn urls(&self) -> Vec<String> {
        vec![self.control_url.clone(), self.public_url.clone()]
    }
}

impl std::fmt::Display for NodeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.role {
            NodeRole::Proxy => write!(f, "p[{}]", self.id),
            NodeRole::Target => write!(f, "t[{}]", self.id),
        }
    }
}
