// Copyright 2024 The Rucket Authors
// SPDX-License-Identifier: Apache-2.0

//! Error types shared by Rucket gateway crates.

use thiserror::Error;

/// A specialized `Result` type for Rucket core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading configuration or metadata documents.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A metadata document could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A metadata document failed validation.
    #[error("invalid {kind}: {message}")]
    InvalidMetadata {
        /// The kind of document (e.g. `cluster map`).
        kind: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

impl Error {
    /// Creates a new validation error for the given metadata kind.
    #[must_use]
    pub fn invalid_metadata(kind: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidMetadata { kind, message: message.into() }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
