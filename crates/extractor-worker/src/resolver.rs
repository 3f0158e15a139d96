// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource resolver: makes a resource's inputs available on local disk.
//!
//! # Files
//!
//! A file whose repository path falls under a mount prefix is used in place.
//! Otherwise it is downloaded to a temporary file carrying the resource's
//! extension.
//!
//! # Datasets
//!
//! Members are resolved one by one as above. A member found locally under a
//! different on-disk name is exposed through a symlink with its declared
//! name, and its metadata is written next to it as a temporary JSON file.
//!
//! - If at least one member resolved locally, the remaining members are
//!   downloaded individually and the dataset metadata is staged too.
//! - If none did, the dataset archive is downloaded once and extracted; the
//!   extracted files become the local paths.
//!
//! Every temporary file or directory created here is recorded in
//! [`StagedFiles`]. Paths resolved in place are never recorded, so releasing
//! the staged files never touches data the worker does not own.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use extractor_repository::{Endpoint, FileRecord, Repository, RepositoryError};
use serde_json::Value;
use tempfile::{TempDir, TempPath};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::mount::MountTable;
use crate::resource::{Resource, ResourceKind, file_extension};

const TEMP_PREFIX: &str = "extractor-";

/// Staging errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResolveError {
    /// Repository call failed.
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Local filesystem operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The dataset archive could not be read.
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Background extraction task did not complete.
    #[error("Extraction task failed: {0}")]
    Task(String),

    /// Metadata could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Temporary files and directories owned by one job.
///
/// Everything is deleted by [`StagedFiles::release`], or on drop as a
/// fallback.
#[derive(Debug, Default)]
pub struct StagedFiles {
    files: Vec<TempPath>,
    dirs: Vec<TempDir>,
}

impl StagedFiles {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked files and directories.
    pub fn len(&self) -> usize {
        self.files.len() + self.dirs.len()
    }

    /// True when nothing was staged.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }

    /// Tracked paths (files first, then directories).
    pub fn paths(&self) -> Vec<PathBuf> {
        self.files
            .iter()
            .map(|f| f.to_path_buf())
            .chain(self.dirs.iter().map(|d| d.path().to_path_buf()))
            .collect()
    }

    /// Delete everything. Failures are logged and otherwise ignored.
    pub fn release(self) {
        for file in self.files {
            let path = file.to_path_buf();
            if let Err(e) = file.close() {
                warn!(path = %path.display(), error = %e, "Failed to delete staged file");
            }
        }
        for dir in self.dirs {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(path = %path.display(), error = %e, "Failed to delete staging directory");
            }
        }
    }
}

/// Stages resource inputs through the repository and the mount table.
#[derive(Clone)]
pub struct ResourceResolver {
    repository: Arc<dyn Repository>,
    mounts: Arc<MountTable>,
    staging_dir: PathBuf,
}

impl ResourceResolver {
    /// Create a resolver staging temporary files under `staging_dir`.
    pub fn new(
        repository: Arc<dyn Repository>,
        mounts: Arc<MountTable>,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            repository,
            mounts,
            staging_dir: staging_dir.into(),
        }
    }

    /// Mount table used for in-place resolution.
    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    /// Populate `resource.local_paths`, recording temporaries in `staged`.
    ///
    /// On error, whatever was staged before the failure is already in
    /// `staged` and must still be released by the caller.
    pub async fn stage(
        &self,
        endpoint: &Endpoint,
        resource: &mut Resource,
        staged: &mut StagedFiles,
    ) -> Result<(), ResolveError> {
        match resource.kind {
            ResourceKind::File => self.stage_file(endpoint, resource, staged).await,
            ResourceKind::Dataset => self.stage_dataset(endpoint, resource, staged).await,
            ResourceKind::Metadata => Ok(()),
        }
    }

    /// Local path of a repository file, if a mount exposes it on this host.
    pub fn local_path(&self, record: &FileRecord) -> Option<PathBuf> {
        let remote = record.filepath.as_deref()?;
        let local = self.mounts.to_local(remote)?;
        if local.exists() {
            return Some(local);
        }
        debug!(remote = %remote, local = %local.display(), "Mounted path does not exist");
        None
    }

    async fn stage_file(
        &self,
        endpoint: &Endpoint,
        resource: &mut Resource,
        staged: &mut StagedFiles,
    ) -> Result<(), ResolveError> {
        let record = self.repository.file_info(endpoint, &resource.id).await?;
        if let Some(path) = self.local_path(&record) {
            info!(file_id = %resource.id, path = %path.display(), "Using local copy");
            resource.local_paths.push(path);
            return Ok(());
        }

        let path = self
            .download_file(endpoint, &resource.id, &resource.file_ext, staged)
            .await?;
        resource.local_paths.push(path);
        Ok(())
    }

    async fn stage_dataset(
        &self,
        endpoint: &Endpoint,
        resource: &mut Resource,
        staged: &mut StagedFiles,
    ) -> Result<(), ResolveError> {
        let members = if resource.files.is_empty() {
            self.repository.dataset_files(endpoint, &resource.id).await?
        } else {
            resource.files.clone()
        };

        let mut unresolved = Vec::new();
        let mut resolved = 0usize;
        for member in &members {
            let Some(local) = self.local_path(member) else {
                unresolved.push(member);
                continue;
            };
            resolved += 1;
            let path = self.present_as(&local, &member.filename, staged)?;
            resource.local_paths.push(path);

            let metadata = self.repository.file_metadata(endpoint, &member.id).await?;
            let metadata_path = self.write_json(&metadata, "_metadata.json", staged).await?;
            resource.local_paths.push(metadata_path);
        }

        if resolved == 0 {
            let extracted = self.stage_archive(endpoint, &resource.id, staged).await?;
            info!(
                dataset_id = %resource.id,
                files = extracted.len(),
                "Staged dataset from archive"
            );
            resource.local_paths.extend(extracted);
            return Ok(());
        }

        for member in unresolved {
            let path = self
                .download_file(endpoint, &member.id, &file_extension(&member.filename), staged)
                .await?;
            resource.local_paths.push(path);
        }
        let metadata = self
            .repository
            .dataset_metadata(endpoint, &resource.id)
            .await?;
        let metadata_path = self
            .write_json(&metadata, "_dataset_metadata.json", staged)
            .await?;
        resource.local_paths.push(metadata_path);

        info!(
            dataset_id = %resource.id,
            local = resolved,
            downloaded = members.len() - resolved,
            "Staged dataset members"
        );
        Ok(())
    }

    /// Expose `local` under `declared_name`, symlinking when the names differ.
    fn present_as(
        &self,
        local: &Path,
        declared_name: &str,
        staged: &mut StagedFiles,
    ) -> Result<PathBuf, ResolveError> {
        let declared = Path::new(declared_name).file_name();
        let Some(declared) = declared.filter(|d| Some(*d) != local.file_name()) else {
            return Ok(local.to_path_buf());
        };

        let dir = self.temp_dir()?;
        let link = dir.path().join(declared);
        symlink(local, &link)?;
        debug!(target = %local.display(), link = %link.display(), "Linked member under declared name");
        staged.dirs.push(dir);
        Ok(link)
    }

    async fn download_file(
        &self,
        endpoint: &Endpoint,
        file_id: &str,
        extension: &str,
        staged: &mut StagedFiles,
    ) -> Result<PathBuf, ResolveError> {
        let path = self.temp_file(extension)?;
        let local = path.to_path_buf();
        staged.files.push(path);

        let bytes = self
            .repository
            .download_file(endpoint, file_id, &local)
            .await?;
        debug!(file_id = %file_id, bytes, path = %local.display(), "Downloaded file");
        Ok(local)
    }

    async fn write_json(
        &self,
        value: &Value,
        suffix: &str,
        staged: &mut StagedFiles,
    ) -> Result<PathBuf, ResolveError> {
        let path = self.temp_file(suffix)?;
        let local = path.to_path_buf();
        staged.files.push(path);
        tokio::fs::write(&local, serde_json::to_vec_pretty(value)?).await?;
        Ok(local)
    }

    /// Download a dataset archive, extract it, and list the extracted files.
    async fn stage_archive(
        &self,
        endpoint: &Endpoint,
        dataset_id: &str,
        staged: &mut StagedFiles,
    ) -> Result<Vec<PathBuf>, ResolveError> {
        let archive = self.temp_file(".zip")?;
        let bytes = self
            .repository
            .download_dataset(endpoint, dataset_id, &archive)
            .await?;
        debug!(dataset_id = %dataset_id, bytes, "Downloaded dataset archive");

        let dir = self.temp_dir()?;
        let target = dir.path().to_path_buf();
        staged.dirs.push(dir);

        let archive_path = archive.to_path_buf();
        let files = tokio::task::spawn_blocking(move || extract_archive(&archive_path, &target))
            .await
            .map_err(|e| ResolveError::Task(e.to_string()))??;

        if let Err(e) = archive.close() {
            warn!(dataset_id = %dataset_id, error = %e, "Failed to delete dataset archive");
        }
        Ok(files)
    }

    fn temp_file(&self, suffix: &str) -> std::io::Result<TempPath> {
        Ok(tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(suffix)
            .tempfile_in(&self.staging_dir)?
            .into_temp_path())
    }

    fn temp_dir(&self) -> std::io::Result<TempDir> {
        tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempdir_in(&self.staging_dir)
    }
}

#[cfg(unix)]
fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(windows)]
fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(original, link)
}

fn extract_archive(archive: &Path, target: &Path) -> Result<Vec<PathBuf>, ResolveError> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    zip.extract(target)?;

    let mut files = Vec::new();
    collect_files(target, &mut files)?;
    files.sort();
    Ok(files)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Add a produced file to a dataset.
///
/// A file under a mount prefix is registered by its remote path; anything
/// else is uploaded as bytes. Returns the new file's ID.
///
/// Library helper for Rust extractors: a Process closure captures its own
/// repository handle and mount table and drives this with
/// `Handle::current().block_on`, passing `descriptor.endpoint(None)`, whose
/// host already reflects any override.
/// Command-backed extractors upload through the repository API using
/// `EXTRACTOR_HOST` and `EXTRACTOR_SECRET_KEY` instead.
pub async fn upload_to_dataset(
    repository: &dyn Repository,
    mounts: &MountTable,
    endpoint: &Endpoint,
    dataset_id: &str,
    path: &Path,
) -> Result<String, RepositoryError> {
    match mounts.to_remote(path) {
        Some(remote) => {
            info!(dataset_id = %dataset_id, remote = %remote, "Registering file by reference");
            repository
                .upload_file_reference(endpoint, dataset_id, &remote)
                .await
        }
        None => repository.upload_file(endpoint, dataset_id, path).await,
    }
}
