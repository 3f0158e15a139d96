// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock repository for testing.
//!
//! Holds files and datasets in memory and records every call, so tests can
//! assert not only on results but on which downloads actually happened.

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Value, json};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::error::{RepositoryError, Result};
use crate::types::{DatasetRecord, Endpoint, FileRecord, Repository};

#[derive(Debug, Clone)]
struct MockFile {
    record: FileRecord,
    content: Vec<u8>,
    metadata: Value,
}

#[derive(Debug, Clone)]
struct MockDataset {
    record: DatasetRecord,
    members: Vec<String>,
    metadata: Value,
}

/// A file added to a dataset through one of the upload operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockUpload {
    /// Bytes were transferred from a local path.
    Bytes {
        /// Target dataset
        dataset_id: String,
        /// Uploaded file name
        filename: String,
        /// Uploaded content
        content: Vec<u8>,
    },
    /// Only a remote path was registered.
    Reference {
        /// Target dataset
        dataset_id: String,
        /// Path the repository can reach directly
        remote_path: String,
    },
}

#[derive(Debug, Default)]
struct MockState {
    files: HashMap<String, MockFile>,
    datasets: HashMap<String, MockDataset>,
    calls: Vec<String>,
    uploads: Vec<MockUpload>,
    metadata_uploads: Vec<(String, Value)>,
    next_upload: u64,
}

/// In-memory repository for testing.
#[derive(Debug, Default)]
pub struct MockRepository {
    state: Mutex<MockState>,
}

impl MockRepository {
    /// Create an empty mock repository.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a file with its content. Its metadata document defaults to `{}`.
    pub fn add_file(&self, record: FileRecord, content: impl Into<Vec<u8>>) {
        let id = record.id.clone();
        self.state().files.insert(
            id,
            MockFile {
                record,
                content: content.into(),
                metadata: json!({}),
            },
        );
    }

    /// Replace a file's metadata document.
    pub fn set_file_metadata(&self, file_id: &str, metadata: Value) {
        if let Some(file) = self.state().files.get_mut(file_id) {
            file.metadata = metadata;
        }
    }

    /// Add a dataset whose members are previously added files.
    pub fn add_dataset(&self, record: DatasetRecord, member_ids: &[&str]) {
        let id = record.id.clone();
        self.state().datasets.insert(
            id,
            MockDataset {
                record,
                members: member_ids.iter().map(|m| m.to_string()).collect(),
                metadata: json!({}),
            },
        );
    }

    /// Replace a dataset's metadata document.
    pub fn set_dataset_metadata(&self, dataset_id: &str, metadata: Value) {
        if let Some(dataset) = self.state().datasets.get_mut(dataset_id) {
            dataset.metadata = metadata;
        }
    }

    /// All calls made so far, formatted as `operation:id`.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Number of calls to the given operation.
    pub fn call_count(&self, operation: &str) -> usize {
        let prefix = format!("{}:", operation);
        self.state()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    /// Files uploaded so far.
    pub fn uploads(&self) -> Vec<MockUpload> {
        self.state().uploads.clone()
    }

    /// Metadata documents uploaded so far, keyed by file or dataset ID.
    pub fn metadata_uploads(&self) -> Vec<(String, Value)> {
        self.state().metadata_uploads.clone()
    }

    fn record_call(&self, operation: &str, id: &str) {
        self.state().calls.push(format!("{}:{}", operation, id));
    }

    fn file(&self, file_id: &str) -> Result<MockFile> {
        self.state()
            .files
            .get(file_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("file {}", file_id)))
    }

    fn dataset(&self, dataset_id: &str) -> Result<MockDataset> {
        self.state()
            .datasets
            .get(dataset_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("dataset {}", dataset_id)))
    }

    fn members(&self, dataset: &MockDataset) -> Result<Vec<MockFile>> {
        dataset.members.iter().map(|id| self.file(id)).collect()
    }

    fn next_upload_id(&self) -> String {
        let mut state = self.state();
        state.next_upload += 1;
        format!("uploaded-{}", state.next_upload)
    }
}

/// Pack dataset members the way the repository's archive endpoint does:
/// `<dataset name>/data/<filename>`.
fn build_archive(dataset: &MockDataset, members: &[MockFile]) -> Result<Vec<u8>> {
    let root = if dataset.record.name.is_empty() {
        dataset.record.id.as_str()
    } else {
        dataset.record.name.as_str()
    };

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for member in members {
        writer
            .start_file(
                format!("{}/data/{}", root, member.record.filename),
                SimpleFileOptions::default(),
            )
            .map_err(|e| RepositoryError::Other(format!("Failed to build archive: {}", e)))?;
        writer.write_all(&member.content)?;
    }
    let cursor = writer
        .finish()
        .map_err(|e| RepositoryError::Other(format!("Failed to build archive: {}", e)))?;
    Ok(cursor.into_inner())
}

#[async_trait]
impl Repository for MockRepository {
    async fn file_info(&self, _endpoint: &Endpoint, file_id: &str) -> Result<FileRecord> {
        self.record_call("file_info", file_id);
        Ok(self.file(file_id)?.record)
    }

    async fn dataset_info(&self, _endpoint: &Endpoint, dataset_id: &str) -> Result<DatasetRecord> {
        self.record_call("dataset_info", dataset_id);
        Ok(self.dataset(dataset_id)?.record)
    }

    async fn dataset_files(
        &self,
        _endpoint: &Endpoint,
        dataset_id: &str,
    ) -> Result<Vec<FileRecord>> {
        self.record_call("dataset_files", dataset_id);
        let dataset = self.dataset(dataset_id)?;
        Ok(self
            .members(&dataset)?
            .into_iter()
            .map(|f| f.record)
            .collect())
    }

    async fn download_file(&self, _endpoint: &Endpoint, file_id: &str, dest: &Path) -> Result<u64> {
        self.record_call("download_file", file_id);
        let file = self.file(file_id)?;
        tokio::fs::write(dest, &file.content).await?;
        Ok(file.content.len() as u64)
    }

    async fn download_dataset(
        &self,
        _endpoint: &Endpoint,
        dataset_id: &str,
        dest: &Path,
    ) -> Result<u64> {
        self.record_call("download_dataset", dataset_id);
        let dataset = self.dataset(dataset_id)?;
        let archive = build_archive(&dataset, &self.members(&dataset)?)?;
        tokio::fs::write(dest, &archive).await?;
        Ok(archive.len() as u64)
    }

    async fn file_metadata(&self, _endpoint: &Endpoint, file_id: &str) -> Result<Value> {
        self.record_call("file_metadata", file_id);
        Ok(self.file(file_id)?.metadata)
    }

    async fn dataset_metadata(&self, _endpoint: &Endpoint, dataset_id: &str) -> Result<Value> {
        self.record_call("dataset_metadata", dataset_id);
        Ok(self.dataset(dataset_id)?.metadata)
    }

    async fn upload_file_metadata(
        &self,
        _endpoint: &Endpoint,
        file_id: &str,
        metadata: &Value,
    ) -> Result<()> {
        self.record_call("upload_file_metadata", file_id);
        self.file(file_id)?;
        self.state()
            .metadata_uploads
            .push((file_id.to_string(), metadata.clone()));
        Ok(())
    }

    async fn upload_dataset_metadata(
        &self,
        _endpoint: &Endpoint,
        dataset_id: &str,
        metadata: &Value,
    ) -> Result<()> {
        self.record_call("upload_dataset_metadata", dataset_id);
        self.dataset(dataset_id)?;
        self.state()
            .metadata_uploads
            .push((dataset_id.to_string(), metadata.clone()));
        Ok(())
    }

    async fn upload_file(
        &self,
        _endpoint: &Endpoint,
        dataset_id: &str,
        path: &Path,
    ) -> Result<String> {
        self.record_call("upload_file", dataset_id);
        self.dataset(dataset_id)?;
        let content = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.state().uploads.push(MockUpload::Bytes {
            dataset_id: dataset_id.to_string(),
            filename,
            content,
        });
        Ok(self.next_upload_id())
    }

    async fn upload_file_reference(
        &self,
        _endpoint: &Endpoint,
        dataset_id: &str,
        remote_path: &str,
    ) -> Result<String> {
        self.record_call("upload_file_reference", dataset_id);
        self.dataset(dataset_id)?;
        self.state().uploads.push(MockUpload::Reference {
            dataset_id: dataset_id.to_string(),
            remote_path: remote_path.to_string(),
        });
        Ok(self.next_upload_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn endpoint() -> Endpoint {
        Endpoint::new("https://repo.example", "key")
    }

    fn repo_with_dataset() -> MockRepository {
        let repo = MockRepository::new();
        repo.add_file(FileRecord::new("f1", "a.tif"), b"alpha".to_vec());
        repo.add_file(FileRecord::new("f2", "b.tif"), b"bravo".to_vec());
        repo.add_dataset(DatasetRecord::new("d1", "survey"), &["f1", "f2"]);
        repo
    }

    #[tokio::test]
    async fn test_download_file_writes_content_and_records_call() {
        let repo = repo_with_dataset();
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.tif");

        let written = repo.download_file(&endpoint(), "f1", &dest).await.unwrap();

        assert_eq!(written, 5);
        assert_eq!(std::fs::read(&dest).unwrap(), b"alpha");
        assert_eq!(repo.call_count("download_file"), 1);
        assert_eq!(repo.calls(), vec!["download_file:f1".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let repo = MockRepository::new();
        let err = repo.dataset_info(&endpoint(), "missing").await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(_)));
        let err = repo.file_info(&endpoint(), "missing").await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_dataset_archive_contains_members() {
        let repo = repo_with_dataset();
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("d1.zip");

        repo.download_dataset(&endpoint(), "d1", &dest).await.unwrap();

        let mut archive = zip::ZipArchive::new(std::fs::File::open(&dest).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
        let mut entry = archive.by_name("survey/data/b.tif").unwrap();
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "bravo");
    }

    #[tokio::test]
    async fn test_uploads_are_recorded() {
        let repo = repo_with_dataset();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("result.csv");
        std::fs::write(&path, "x,y\n").unwrap();

        let first = repo.upload_file(&endpoint(), "d1", &path).await.unwrap();
        let second = repo
            .upload_file_reference(&endpoint(), "d1", "/remote/result.csv")
            .await
            .unwrap();

        assert_ne!(first, second);
        let uploads = repo.uploads();
        assert_eq!(uploads.len(), 2);
        assert!(matches!(&uploads[0], MockUpload::Bytes { filename, .. } if filename == "result.csv"));
        assert_eq!(
            uploads[1],
            MockUpload::Reference {
                dataset_id: "d1".to_string(),
                remote_path: "/remote/result.csv".to_string(),
            }
        );
    }
}
