// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! REST implementation of the [`Repository`] trait.
//!
//! The secret key travels as the `key` query parameter, which is what the
//! repository's v1 API expects. Downloads are streamed chunk by chunk so
//! large files and dataset archives never sit in memory.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{RepositoryError, Result};
use crate::types::{DatasetRecord, Endpoint, FileRecord, Repository};

/// Maximum number of response-body bytes kept in a [`RepositoryError::Status`].
const ERROR_BODY_LIMIT: usize = 512;

/// REST client for the repository API.
#[derive(Debug, Clone)]
pub struct HttpRepository {
    client: Client,
}

impl Default for HttpRepository {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl HttpRepository {
    /// Create a client with the given per-request timeout.
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    /// Create a repository client around an existing `reqwest` client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn get(&self, endpoint: &Endpoint, path: &str) -> RequestBuilder {
        self.client
            .get(endpoint.api_url(path))
            .query(&[("key", endpoint.secret_key.as_str())])
    }

    fn post(&self, endpoint: &Endpoint, path: &str) -> RequestBuilder {
        self.client
            .post(endpoint.api_url(path))
            .query(&[("key", endpoint.secret_key.as_str())])
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &Endpoint, path: &str) -> Result<T> {
        let response = check_status(self.get(endpoint, path).send().await?).await?;
        Ok(response.json::<T>().await?)
    }

    async fn download_to(&self, endpoint: &Endpoint, path: &str, dest: &Path) -> Result<u64> {
        let mut response = check_status(self.get(endpoint, path).send().await?).await?;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;

        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!(
            path = %path,
            dest = %dest.display(),
            bytes = written,
            "Download complete"
        );
        Ok(written)
    }
}

/// Turn a non-success response into [`RepositoryError::Status`].
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let mut url = response.url().clone();
    url.set_query(None);
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }

    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(RepositoryError::NotFound(url.to_string()));
    }

    Err(RepositoryError::Status {
        status: status.as_u16(),
        url: url.to_string(),
        body,
    })
}

/// Pull the new file ID out of an upload response (`{"id": "..."}`).
fn uploaded_id(body: &Value) -> Result<String> {
    body.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RepositoryError::Other(format!("Upload response has no id: {}", body)))
}

#[async_trait]
impl Repository for HttpRepository {
    async fn file_info(&self, endpoint: &Endpoint, file_id: &str) -> Result<FileRecord> {
        self.get_json(endpoint, &format!("files/{}/metadata", file_id))
            .await
    }

    async fn dataset_info(&self, endpoint: &Endpoint, dataset_id: &str) -> Result<DatasetRecord> {
        self.get_json(endpoint, &format!("datasets/{}", dataset_id))
            .await
    }

    async fn dataset_files(
        &self,
        endpoint: &Endpoint,
        dataset_id: &str,
    ) -> Result<Vec<FileRecord>> {
        self.get_json(endpoint, &format!("datasets/{}/files", dataset_id))
            .await
    }

    async fn download_file(&self, endpoint: &Endpoint, file_id: &str, dest: &Path) -> Result<u64> {
        self.download_to(endpoint, &format!("files/{}/blob", file_id), dest)
            .await
    }

    async fn download_dataset(
        &self,
        endpoint: &Endpoint,
        dataset_id: &str,
        dest: &Path,
    ) -> Result<u64> {
        self.download_to(endpoint, &format!("datasets/{}/download", dataset_id), dest)
            .await
    }

    async fn file_metadata(&self, endpoint: &Endpoint, file_id: &str) -> Result<Value> {
        self.get_json(endpoint, &format!("files/{}/metadata.jsonld", file_id))
            .await
    }

    async fn dataset_metadata(&self, endpoint: &Endpoint, dataset_id: &str) -> Result<Value> {
        self.get_json(endpoint, &format!("datasets/{}/metadata.jsonld", dataset_id))
            .await
    }

    async fn upload_file_metadata(
        &self,
        endpoint: &Endpoint,
        file_id: &str,
        metadata: &Value,
    ) -> Result<()> {
        let request = self
            .post(endpoint, &format!("files/{}/metadata.jsonld", file_id))
            .json(metadata);
        check_status(request.send().await?).await?;
        Ok(())
    }

    async fn upload_dataset_metadata(
        &self,
        endpoint: &Endpoint,
        dataset_id: &str,
        metadata: &Value,
    ) -> Result<()> {
        let request = self
            .post(endpoint, &format!("datasets/{}/metadata.jsonld", dataset_id))
            .json(metadata);
        check_status(request.send().await?).await?;
        Ok(())
    }

    async fn upload_file(
        &self,
        endpoint: &Endpoint,
        dataset_id: &str,
        path: &Path,
    ) -> Result<String> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                RepositoryError::Other(format!("Not a file path: {}", path.display()))
            })?;
        let bytes = tokio::fs::read(path).await?;
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename);
        let form = reqwest::multipart::Form::new().part("File", part);

        let response = check_status(
            self.post(endpoint, &format!("uploadToDataset/{}", dataset_id))
                .multipart(form)
                .send()
                .await?,
        )
        .await?;
        uploaded_id(&response.json::<Value>().await?)
    }

    async fn upload_file_reference(
        &self,
        endpoint: &Endpoint,
        dataset_id: &str,
        remote_path: &str,
    ) -> Result<String> {
        let response = check_status(
            self.post(endpoint, &format!("uploadToDataset/{}", dataset_id))
                .json(&json!({ "path": remote_path }))
                .send()
                .await?,
        )
        .await?;
        uploaded_id(&response.json::<Value>().await?)
    }
}
