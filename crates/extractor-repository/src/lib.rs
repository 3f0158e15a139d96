// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Extractor Repository - Repository API Client
//!
//! Extractor workers never talk to the hosting repository directly. They go
//! through the [`Repository`] trait, which exposes the handful of operations
//! the dispatch engine needs:
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `file_info` | File record, including the on-disk `filepath` when known |
//! | `dataset_info` | Dataset record |
//! | `dataset_files` | Member file records of a dataset |
//! | `download_file` | Stream a file's bytes to a local path |
//! | `download_dataset` | Stream a dataset's zip archive to a local path |
//! | `file_metadata` / `dataset_metadata` | JSON-LD metadata documents |
//! | `upload_file_metadata` / `upload_dataset_metadata` | Attach metadata |
//! | `upload_file` / `upload_file_reference` | Add a file to a dataset |
//!
//! Every call is parameterized by an [`Endpoint`] (host URL + secret key)
//! taken from the inbound job descriptor, so a single client serves jobs
//! coming from several repository instances.
//!
//! # Implementations
//!
//! | Implementation | Description |
//! |----------------|-------------|
//! | [`HttpRepository`] | REST client over `reqwest` |
//! | [`MockRepository`] | In-memory repository for tests |

#![deny(missing_docs)]

/// Error types for repository operations.
pub mod error;

/// REST implementation of the repository API.
pub mod http;

/// In-memory repository for testing.
pub mod mock;

/// Wire records and the repository trait.
mod types;

pub use error::{RepositoryError, Result};
pub use http::HttpRepository;
pub use mock::{MockRepository, MockUpload};
pub use types::*;
