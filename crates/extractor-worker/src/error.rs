// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for extractor-worker.

use thiserror::Error;

/// Worker errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Repository call failed.
    #[error("Repository error: {0}")]
    Repository(#[from] extractor_repository::RepositoryError),

    /// Input staging failed.
    #[error("Staging error: {0}")]
    Resolve(#[from] crate::resolver::ResolveError),

    /// Broker operation failed.
    #[error("Broker error: {0}")]
    Broker(#[from] crate::broker::BrokerError),

    /// A message handler stopped abnormally.
    #[error("Handler error: {0}")]
    Handler(#[from] crate::handler::HandlerError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the worker Error.
pub type Result<T> = std::result::Result<T, Error>;
