// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mount table: remote path prefixes that are reachable on a local filesystem.
//!
//! When the repository stores its files on a share that is also mounted on
//! the worker host, a file's reported path can be rewritten to a local path
//! and read in place instead of being downloaded. The reverse translation
//! lets results that already sit on the share be registered by path.
//!
//! Lookups are plain string-prefix matches in table order; the first
//! matching entry wins. The table is immutable once built.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// A (remote prefix, local prefix) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Prefix of paths as the repository reports them
    pub remote: String,
    /// Prefix under which the same files are visible locally
    pub local: String,
}

impl MountEntry {
    /// Create a new entry.
    pub fn new(remote: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            local: local.into(),
        }
    }
}

/// Ordered set of mount entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MountSpec {
    Pairs(Vec<(String, String)>),
    Map(serde_json::Map<String, serde_json::Value>),
}

impl MountTable {
    /// Build a table from entries, keeping their order.
    pub fn new(entries: Vec<MountEntry>) -> Self {
        Self { entries }
    }

    /// Parse `[["remote", "local"], ...]` or `{"remote": "local", ...}`.
    ///
    /// The array form preserves order; the object form is accepted for
    /// compatibility and has no guaranteed order between overlapping prefixes.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let entries = match serde_json::from_str::<MountSpec>(raw)? {
            MountSpec::Pairs(pairs) => pairs
                .into_iter()
                .map(|(remote, local)| MountEntry::new(remote, local))
                .collect(),
            MountSpec::Map(map) => map
                .into_iter()
                .filter_map(|(remote, local)| {
                    local.as_str().map(|local| MountEntry::new(remote, local))
                })
                .collect(),
        };
        Ok(Self { entries })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no mounts are configured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in lookup order.
    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// Translate a repository path to its local counterpart.
    pub fn to_local(&self, remote_path: &str) -> Option<PathBuf> {
        self.entries.iter().find_map(|entry| {
            remote_path
                .strip_prefix(entry.remote.as_str())
                .map(|rest| PathBuf::from(format!("{}{}", entry.local, rest)))
        })
    }

    /// Translate a local path back to the form the repository knows.
    pub fn to_remote(&self, local_path: &Path) -> Option<String> {
        let local_path = local_path.to_string_lossy();
        self.entries.iter().find_map(|entry| {
            local_path
                .strip_prefix(entry.local.as_str())
                .map(|rest| format!("{}{}", entry.remote, rest))
        })
    }
}
