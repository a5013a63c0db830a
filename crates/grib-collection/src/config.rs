use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CollectionError, Result};

/// When an existing index may be reused instead of rebuilt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePolicy {
    /// Rebuild unconditionally.
    Always,
    /// Reuse only when the recorded sources match the current ones.
    #[default]
    Test,
    /// Reuse whenever a readable index exists.
    Nocheck,
    /// Never build; a missing or unreadable index is an error.
    Never,
}

impl UpdatePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::Test => "test",
            Self::Nocheck => "nocheck",
            Self::Never => "never",
        }
    }
}

impl fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdatePolicy {
    type Err = CollectionError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "test" => Ok(Self::Test),
            "nocheck" => Ok(Self::Nocheck),
            "never" => Ok(Self::Never),
            other => Err(CollectionError::InvalidInput(format!(
                "unknown update policy {other:?}"
            ))),
        }
    }
}

/// How the children of a partition are found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    /// Each subdirectory is a child; a subdirectory with subdirectories is a nested partition.
    Directory,
    /// Each data file in the root is a single-file child collection.
    File,
}

/// Which files make up a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CollectionSpec {
    /// Every data file directly under `root`.
    Directory { root: PathBuf },
    /// Files under `root` whose names match `pattern`, e.g. `*.grib2`.
    Glob { root: PathBuf, pattern: String },
    /// One data file.
    File { path: PathBuf },
}

impl CollectionSpec {
    /// Directory the collection lives in.
    pub fn root(&self) -> &Path {
        match self {
            Self::Directory { root } | Self::Glob { root, .. } => root,
            Self::File { path } => path.parent().unwrap_or_else(|| Path::new(".")),
        }
    }

    pub fn pattern(&self) -> Option<&str> {
        match self {
            Self::Glob { pattern, .. } => Some(pattern),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub name: String,
    pub spec: CollectionSpec,
    #[serde(default)]
    pub update: UpdatePolicy,
    #[serde(default)]
    pub child_update: UpdatePolicy,
    #[serde(default)]
    pub partition: Option<PartitionKind>,
    /// Passed unmodified to the record locator.
    #[serde(default)]
    pub aux: serde_json::Value,
}

impl CollectionConfig {
    pub fn new(name: impl Into<String>, spec: CollectionSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            update: UpdatePolicy::default(),
            child_update: UpdatePolicy::default(),
            partition: None,
            aux: serde_json::Value::Null,
        }
    }

    pub fn with_update(mut self, update: UpdatePolicy) -> Self {
        self.update = update;
        self
    }

    pub fn with_child_update(mut self, child_update: UpdatePolicy) -> Self {
        self.child_update = child_update;
        self
    }

    pub fn with_partition(mut self, partition: PartitionKind) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_aux(mut self, aux: serde_json::Value) -> Self {
        self.aux = aux;
        self
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(data).map_err(|error| {
            CollectionError::InvalidInput(format!("failed to parse collection config: {error}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|error| {
            CollectionError::Internal(format!(
                "failed to read collection config {}: {error}",
                path.display()
            ))
        })?;
        Self::from_json(&data)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self).map_err(|error| {
            CollectionError::Serialization(format!("failed to serialize collection config: {error}"))
        })?;
        std::fs::write(path, data).map_err(|error| {
            CollectionError::Internal(format!(
                "failed to write collection config {}: {error}",
                path.display()
            ))
        })
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CollectionError::InvalidInput("collection name is empty".into()));
        }
        if self.partition.is_some() && matches!(self.spec, CollectionSpec::File { .. }) {
            return Err(CollectionError::InvalidInput(format!(
                "collection {} cannot partition a single file",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn parses_json_with_defaults() {
        let config = CollectionConfig::from_json(
            r#"{"name": "gfs", "spec": {"type": "glob", "root": "/data/gfs", "pattern": "*.grib2"}}"#,
        )
        .expect("parse");
        assert_eq!(config.update, UpdatePolicy::Test);
        assert_eq!(config.child_update, UpdatePolicy::Test);
        assert_eq!(config.partition, None);
        assert_eq!(config.spec.pattern(), Some("*.grib2"));
        assert_eq!(config.spec.root(), Path::new("/data/gfs"));
        assert!(config.aux.is_null());
    }

    #[test]
    fn parses_partition_and_policies() {
        let config = CollectionConfig::from_json(
            r#"{
                "name": "nam",
                "spec": {"type": "directory", "root": "/data/nam"},
                "update": "always",
                "child_update": "nocheck",
                "partition": "directory",
                "aux": {"table": "local"}
            }"#,
        )
        .expect("parse");
        assert_eq!(config.update, UpdatePolicy::Always);
        assert_eq!(config.child_update, UpdatePolicy::Nocheck);
        assert_eq!(config.partition, Some(PartitionKind::Directory));
        assert_eq!(config.aux["table"], "local");
    }

    #[test]
    fn rejects_bad_input() {
        assert!(CollectionConfig::from_json("{").is_err());
        assert!(CollectionConfig::from_json(
            r#"{"name": " ", "spec": {"type": "directory", "root": "/x"}}"#
        )
        .is_err());
        assert!(CollectionConfig::from_json(
            r#"{"name": "a", "spec": {"type": "file", "path": "/x/a.grib2"}, "partition": "file"}"#
        )
        .is_err());
    }

    #[test]
    fn policy_parses_case_insensitively() {
        assert_eq!("NoCheck".parse::<UpdatePolicy>().expect("parse"), UpdatePolicy::Nocheck);
        assert!("sometimes".parse::<UpdatePolicy>().is_err());
        assert_eq!(UpdatePolicy::Never.to_string(), "never");
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("collection.json");
        let config = CollectionConfig::new(
            "single",
            CollectionSpec::File {
                path: dir.path().join("a.grib2"),
            },
        )
        .with_update(UpdatePolicy::Never);
        config.save(&path).expect("save");
        assert_eq!(CollectionConfig::load(&path).expect("load"), config);
    }
}
