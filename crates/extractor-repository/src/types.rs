// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Repository trait and wire records.
//!
//! Records keep every field the repository sends: the ones the dispatch
//! engine reads are typed, the rest are carried in `extra` so processing
//! routines can still see them.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Where a job's repository lives and how to authenticate against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Base URL of the repository (e.g. `https://repo.example.org/`)
    pub host: String,
    /// Secret key sent with every request
    pub secret_key: String,
}

impl Endpoint {
    /// Create a new endpoint.
    pub fn new(host: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            secret_key: secret_key.into(),
        }
    }

    /// Build an API URL below this endpoint's host.
    ///
    /// `path` is appended after `/api/`; duplicate slashes are avoided.
    pub fn api_url(&self, path: &str) -> String {
        format!(
            "{}/api/{}",
            self.host.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// A file as described by the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// File ID
    pub id: String,
    /// Declared file name (what downstream tooling should see)
    #[serde(default)]
    pub filename: String,
    /// Path of the file on the repository's storage, when it is stored on disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath: Option<String>,
    /// MIME type
    #[serde(
        default,
        rename = "contentType",
        alias = "content-type",
        skip_serializing_if = "Option::is_none"
    )]
    pub content_type: Option<String>,
    /// Remaining fields, passed through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FileRecord {
    /// Create a record with only an ID and a file name.
    pub fn new(id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            filepath: None,
            content_type: None,
            extra: Map::new(),
        }
    }

    /// Set the on-disk path reported by the repository.
    pub fn with_filepath(mut self, filepath: impl Into<String>) -> Self {
        self.filepath = Some(filepath.into());
        self
    }
}

/// A dataset as described by the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    /// Dataset ID
    pub id: String,
    /// Dataset name
    #[serde(default)]
    pub name: String,
    /// Free-text description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Remaining fields, passed through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DatasetRecord {
    /// Create a record with only an ID and a name.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            extra: Map::new(),
        }
    }
}

/// Operations the dispatch engine needs from the hosting repository.
///
/// Implementations are opaque capability sets: callers never inspect how a
/// record was fetched. Downloads write to a caller-chosen path so the caller
/// stays in charge of temporary-file ownership and cleanup.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Fetch a file record.
    async fn file_info(&self, endpoint: &Endpoint, file_id: &str) -> Result<FileRecord>;

    /// Fetch a dataset record.
    async fn dataset_info(&self, endpoint: &Endpoint, dataset_id: &str) -> Result<DatasetRecord>;

    /// List the member files of a dataset.
    async fn dataset_files(&self, endpoint: &Endpoint, dataset_id: &str)
    -> Result<Vec<FileRecord>>;

    /// Download a file's bytes to `dest`, replacing any existing content.
    async fn download_file(&self, endpoint: &Endpoint, file_id: &str, dest: &Path) -> Result<u64>;

    /// Download a dataset as a zip archive to `dest`.
    async fn download_dataset(
        &self,
        endpoint: &Endpoint,
        dataset_id: &str,
        dest: &Path,
    ) -> Result<u64>;

    /// Fetch the metadata document attached to a file.
    async fn file_metadata(&self, endpoint: &Endpoint, file_id: &str) -> Result<Value>;

    /// Fetch the metadata document attached to a dataset.
    async fn dataset_metadata(&self, endpoint: &Endpoint, dataset_id: &str) -> Result<Value>;

    /// Attach a metadata document to a file.
    async fn upload_file_metadata(
        &self,
        endpoint: &Endpoint,
        file_id: &str,
        metadata: &Value,
    ) -> Result<()>;

    /// Attach a metadata document to a dataset.
    async fn upload_dataset_metadata(
        &self,
        endpoint: &Endpoint,
        dataset_id: &str,
        metadata: &Value,
    ) -> Result<()>;

    /// Upload a local file into a dataset, returning the new file ID.
    async fn upload_file(&self, endpoint: &Endpoint, dataset_id: &str, path: &Path)
    -> Result<String>;

    /// Register a file that the repository can already reach at `remote_path`
    /// without transferring its bytes, returning the new file ID.
    async fn upload_file_reference(
        &self,
        endpoint: &Endpoint,
        dataset_id: &str,
        remote_path: &str,
    ) -> Result<String>;
}
