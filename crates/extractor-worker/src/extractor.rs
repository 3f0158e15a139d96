// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Extractor identity and the Check/Process callbacks.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::ConfigError;
use crate::descriptor::JobDescriptor;
use crate::resource::{MANUAL_TOPIC_PREFIX, Resource, ResourceKind};
use crate::retry::ProcessError;

/// Capability descriptor announced in heartbeats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractorInfo {
    /// Registered identity; also the default work queue name
    pub name: String,
    /// Version string
    #[serde(default)]
    pub version: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Events handled, keyed by resource kind (`{"file": ["image/*"]}`)
    #[serde(default)]
    pub process: Map<String, Value>,
    /// Remaining fields, announced untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExtractorInfo {
    /// Minimal descriptor with only a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: String::new(),
            description: String::new(),
            process: Map::new(),
            extra: Map::new(),
        }
    }

    /// Read a descriptor from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let fail = |reason: String| ConfigError::ExtractorInfo {
            path: path.to_path_buf(),
            reason,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| fail(e.to_string()))?;
        let info: Self = serde_json::from_str(&raw).map_err(|e| fail(e.to_string()))?;
        if info.name.trim().is_empty() {
            return Err(fail("name is empty".to_string()));
        }
        Ok(info)
    }

    /// This extractor's manual trigger topic.
    pub fn manual_topic(&self) -> String {
        format!("{}{}", MANUAL_TOPIC_PREFIX, self.name)
    }

    /// Routing keys the work queue is bound to on a topic exchange.
    ///
    /// Each `process` entry `kind: [pattern, ...]` yields `*.kind.pattern`
    /// with `/` turned into `.`; the manual trigger topic is always included.
    pub fn routing_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .process
            .iter()
            .flat_map(|(kind, patterns)| {
                let patterns: Vec<&str> = match patterns {
                    Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
                    Value::String(s) => vec![s.as_str()],
                    _ => Vec::new(),
                };
                patterns
                    .into_iter()
                    .map(move |p| format!("*.{}.{}", kind, p.replace('/', ".")))
                    .collect::<Vec<_>>()
            })
            .collect();
        keys.push(self.manual_topic());
        let mut seen = HashSet::new();
        keys.retain(|key| seen.insert(key.clone()));
        keys
    }
}

/// Outcome of the Check step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Decision {
    /// Skip the message; Process is not called.
    Ignore,
    /// Stage inputs locally, then call Process.
    #[default]
    Download,
    /// Call Process without staging anything.
    Bypass,
}

/// Decides whether and how a message is processed.
pub type CheckFn = Arc<dyn Fn(&Resource, &JobDescriptor) -> Decision + Send + Sync>;

/// Processes a staged resource.
pub type ProcessFn =
    Arc<dyn Fn(&Resource, &JobDescriptor) -> Result<(), ProcessError> + Send + Sync>;

/// An extractor: identity plus callbacks.
///
/// Callbacks are blocking; the handler runs them off the async runtime.
#[derive(Clone)]
pub struct Extractor {
    info: ExtractorInfo,
    default_kind: ResourceKind,
    check: Option<CheckFn>,
    process: ProcessFn,
}

impl Extractor {
    /// Create an extractor that downloads every input before processing.
    pub fn new<P>(info: ExtractorInfo, process: P) -> Self
    where
        P: Fn(&Resource, &JobDescriptor) -> Result<(), ProcessError> + Send + Sync + 'static,
    {
        Self {
            info,
            default_kind: ResourceKind::File,
            check: None,
            process: Arc::new(process),
        }
    }

    /// Install a Check callback.
    pub fn with_check<C>(mut self, check: C) -> Self
    where
        C: Fn(&Resource, &JobDescriptor) -> Decision + Send + Sync + 'static,
    {
        self.check = Some(Arc::new(check));
        self
    }

    /// Set the kind used when the routing key does not determine one.
    pub fn with_default_kind(mut self, kind: ResourceKind) -> Self {
        self.default_kind = kind;
        self
    }

    /// Capability descriptor.
    pub fn info(&self) -> &ExtractorInfo {
        &self.info
    }

    /// Registered name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Default resource kind.
    pub fn default_kind(&self) -> ResourceKind {
        self.default_kind
    }

    /// Check callback, if any.
    pub fn check_fn(&self) -> Option<CheckFn> {
        self.check.clone()
    }

    /// Process callback.
    pub fn process_fn(&self) -> ProcessFn {
        self.process.clone()
    }
}

impl fmt::Debug for Extractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extractor")
            .field("name", &self.info.name)
            .field("default_kind", &self.default_kind)
            .field("has_check", &self.check.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_info() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "name": "ncsa.wordcount",
                "version": "2.0",
                "description": "Counts words",
                "process": {{"file": ["text/*", "application/json"]}},
                "contributors": ["a"]
            }}"#
        )
        .unwrap();

        let info = ExtractorInfo::load(file.path()).unwrap();
        assert_eq!(info.name, "ncsa.wordcount");
        assert_eq!(info.version, "2.0");
        assert!(info.extra.contains_key("contributors"));
        assert_eq!(
            info.routing_keys(),
            vec![
                "*.file.text.*",
                "*.file.application.json",
                "extractors.ncsa.wordcount"
            ]
        );
    }

    #[test]
    fn test_routing_keys_are_unique() {
        let mut info = ExtractorInfo::new("wordcount");
        info.process.insert(
            "file".to_string(),
            serde_json::json!(["text/*", "image/png", "text/*"]),
        );
        info.process
            .insert("dataset".to_string(), serde_json::json!("text/*"));
        assert_eq!(
            info.routing_keys(),
            vec![
                "*.dataset.text.*",
                "*.file.text.*",
                "*.file.image.png",
                "extractors.wordcount"
            ]
        );
    }

    #[test]
    fn test_load_rejects_missing_name() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"name": " "}}"#).unwrap();
        assert!(matches!(
            ExtractorInfo::load(file.path()),
            Err(ConfigError::ExtractorInfo { .. })
        ));
        assert!(ExtractorInfo::load(Path::new("/nonexistent/info.json")).is_err());
    }

    #[test]
    fn test_default_decision_is_download() {
        assert_eq!(Decision::default(), Decision::Download);
    }

    #[test]
    fn test_builder() {
        let extractor = Extractor::new(ExtractorInfo::new("x"), |_, _| Ok(()))
            .with_check(|_, _| Decision::Bypass)
            .with_default_kind(ResourceKind::Dataset);

        assert_eq!(extractor.name(), "x");
        assert_eq!(extractor.default_kind(), ResourceKind::Dataset);
        let check = extractor.check_fn().unwrap();
        let resource = Resource::new(ResourceKind::File, "f1");
        let descriptor: JobDescriptor = serde_json::from_str(r#"{"id": "f1"}"#).unwrap();
        assert_eq!(check(&resource, &descriptor), Decision::Bypass);
        assert!((extractor.process_fn())(&resource, &descriptor).is_ok());
    }
}
