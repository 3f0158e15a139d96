// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The unit of work handed to processing routines.
//!
//! A [`Resource`] is derived from a job descriptor when a message is
//! dispatched. Only the resource resolver mutates it (to fill in
//! `local_paths`); it is dropped when the handler finishes.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use extractor_repository::{DatasetRecord, FileRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Routing-key fragment marking dataset events.
pub const DATASET_MARKER: &str = ".dataset.";

/// Routing-key fragment marking file events.
pub const FILE_MARKER: &str = ".file.";

/// Routing-key fragment marking metadata events.
pub const METADATA_MARKER: &str = "metadata.added";

/// Prefix of the per-extractor manual trigger topic (`extractors.<name>`).
pub const MANUAL_TOPIC_PREFIX: &str = "extractors.";

/// What a resource refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// A single file
    File,
    /// A dataset and its member files
    Dataset,
    /// A metadata document attached to a file or dataset
    Metadata,
}

impl ResourceKind {
    /// Lowercase name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::File => "file",
            ResourceKind::Dataset => "dataset",
            ResourceKind::Metadata => "metadata",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(ResourceKind::File),
            "dataset" => Ok(ResourceKind::Dataset),
            "metadata" => Ok(ResourceKind::Metadata),
            other => Err(format!("unknown resource kind: {}", other)),
        }
    }
}

/// Reference to the resource that contains this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    /// Parent kind
    pub kind: ResourceKind,
    /// Parent ID
    pub id: String,
}

/// A staged unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource kind
    pub kind: ResourceKind,
    /// Resource ID (file, dataset or annotated resource)
    pub id: String,
    /// Display name (file name or dataset name)
    pub name: String,
    /// File extension including the leading dot, empty when unknown
    pub file_ext: String,
    /// Containing resource, if any
    pub parent: Option<ParentRef>,
    /// Local filesystem paths populated during staging
    pub local_paths: Vec<PathBuf>,
    /// Dataset member files (datasets only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileRecord>,
    /// Name of the member file whose event triggered a dataset job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggering_file: Option<String>,
    /// Dataset record (datasets only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_info: Option<DatasetRecord>,
    /// Metadata document carried by metadata events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Resource {
    /// Create a bare resource with nothing staged.
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            name: String::new(),
            file_ext: String::new(),
            parent: None,
            local_paths: Vec::new(),
            files: Vec::new(),
            triggering_file: None,
            dataset_info: None,
            metadata: None,
        }
    }

    /// Set the display name and derive the extension from it.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self.file_ext = file_extension(&self.name);
        self
    }

    /// Set the parent reference.
    pub fn with_parent(mut self, kind: ResourceKind, id: impl Into<String>) -> Self {
        self.parent = Some(ParentRef {
            kind,
            id: id.into(),
        });
        self
    }
}

/// Extension of a file name including the leading dot (`a.tif` -> `.tif`).
///
/// Dot-files and names without a dot have no extension.
pub fn file_extension(name: &str) -> String {
    match name.rfind('.') {
        Some(0) | None => String::new(),
        Some(idx) if name[idx..].contains('/') => String::new(),
        Some(idx) => name[idx..].to_string(),
    }
}

/// Decide what kind of resource a message refers to.
///
/// Precedence: dataset marker, file marker, metadata marker, then this
/// extractor's manual trigger topic (dataset when the target is the dataset
/// itself, file otherwise), then `default_kind`.
pub fn classify_kind(
    routing_key: Option<&str>,
    target_id: &str,
    dataset_id: Option<&str>,
    extractor_name: &str,
    default_kind: ResourceKind,
) -> ResourceKind {
    let Some(routing_key) = routing_key else {
        return default_kind;
    };

    if routing_key.contains(DATASET_MARKER) {
        ResourceKind::Dataset
    } else if routing_key.contains(FILE_MARKER) {
        ResourceKind::File
    } else if routing_key.contains(METADATA_MARKER) {
        ResourceKind::Metadata
    } else if routing_key
        .strip_prefix(MANUAL_TOPIC_PREFIX)
        .is_some_and(|name| name == extractor_name)
    {
        if dataset_id == Some(target_id) {
            ResourceKind::Dataset
        } else {
            ResourceKind::File
        }
    } else {
        default_kind
    }
}
