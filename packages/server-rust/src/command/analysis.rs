//! Analysis inputs and outputs exchanged with the client and the analyzers.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::module::ModuleId;

/// Why an analysis was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Triggered by an edit or save. A newer automatic analysis of the same
    /// files supersedes a queued one.
    #[default]
    Auto,
    /// Explicitly requested by the user. Never superseded.
    Forced,
}

/// A file handed over by the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputFile {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub is_test: bool,
}

impl InputFile {
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            language: None,
            is_test: false,
        }
    }
}

/// Everything an analyzer needs to analyze a set of files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfiguration {
    pub base_dir: Option<PathBuf>,
    pub input_files: Vec<InputFile>,
    pub active_rules: Vec<String>,
    pub extra_properties: BTreeMap<String, String>,
}

impl AnalysisConfiguration {
    /// URIs of the input files, deduplicated and ordered.
    #[must_use]
    pub fn file_uris(&self) -> BTreeSet<String> {
        self.input_files.iter().map(|f| f.uri.clone()).collect()
    }
}

/// Severity reported with an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Minor,
    Major,
    Critical,
    Blocker,
}

/// A finding raised by an analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub rule_key: String,
    pub message: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_uri: Option<String>,
}

/// Outcome of one analysis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResults {
    /// Files the analyzer could not process.
    pub failed_files: Vec<String>,
    /// Number of issues delivered to the issue listener.
    pub issue_count: usize,
    pub duration: Duration,
}

/// Kind of change reported for a module file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEventType {
    Created,
    Modified,
    Deleted,
}

/// A file change inside a registered module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleFileEvent {
    pub file: InputFile,
    pub kind: FileEventType,
}

/// Identity of an automatic analysis for superseding purposes: same target
/// module and same file set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnalysisKey {
    pub module: Option<ModuleId>,
    pub files: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_uris_are_deduplicated() {
        let config = AnalysisConfiguration {
            input_files: vec![
                InputFile::new("file:///b.rs"),
                InputFile::new("file:///a.rs"),
                InputFile::new("file:///b.rs"),
            ],
            ..AnalysisConfiguration::default()
        };
        let uris: Vec<_> = config.file_uris().into_iter().collect();
        assert_eq!(uris, vec!["file:///a.rs", "file:///b.rs"]);
    }

    #[test]
    fn configuration_deserializes_with_defaults() {
        let config: AnalysisConfiguration = serde_json::from_str(
            r#"{ "input_files": [ { "uri": "file:///a.rs", "language": "rust" } ] }"#,
        )
        .unwrap();
        assert_eq!(config.input_files.len(), 1);
        assert_eq!(config.input_files[0].language.as_deref(), Some("rust"));
        assert!(!config.input_files[0].is_test);
        assert!(config.active_rules.is_empty());
        assert_eq!(TriggerType::default(), TriggerType::Auto);
    }
}
