// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for extractor-repository.

use thiserror::Error;

/// Repository errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RepositoryError {
    /// Transport-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The repository answered with a non-success status code.
    #[error("Request to {url} failed with status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Requested URL (without the secret key).
        url: String,
        /// Response body, truncated.
        body: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The requested file or dataset does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using RepositoryError.
pub type Result<T> = std::result::Result<T, RepositoryError>;
