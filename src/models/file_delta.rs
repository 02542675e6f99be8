//! File delta and diff result models.

use serde::{Deserialize, Serialize};

/// Kind of change applied to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Add,
    Modify,
    Delete,
    Rename,
}

impl From<&str> for ChangeType {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "add" | "added" => Self::Add,
            "delete" | "deleted" | "removed" => Self::Delete,
            "rename" | "renamed" => Self::Rename,
            _ => Self::Modify,
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Modify => write!(f, "modify"),
            Self::Delete => write!(f, "delete"),
            Self::Rename => write!(f, "rename"),
        }
    }
}

/// One file change inside a sync request.
///
/// Commit fields describe the commit that last touched the file; the
/// `processing_*` fields describe the commit whose diff carried it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDelta {
    pub path: String,

    /// Previous path for renames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    pub change_type: ChangeType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<String>,

    /// Commit time in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_time_ms: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_mapping_id: Option<String>,

    /// True when the change came from an earlier commit than the one being processed.
    #[serde(default)]
    pub from_another_commit: bool,

    #[serde(default)]
    pub originated_from_git: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_commit_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_commit_time_ms: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_commit_message: Option<String>,
}

impl FileDelta {
    /// Create a delta with no commit metadata.
    pub fn new(path: impl Into<String>, change_type: ChangeType) -> Self {
        Self {
            path: path.into(),
            previous_path: None,
            content: None,
            change_type,
            commit_id: None,
            commit_time_ms: None,
            root_mapping_id: None,
            from_another_commit: false,
            originated_from_git: false,
            processing_commit_id: None,
            processing_commit_time_ms: None,
            processing_commit_message: None,
        }
    }

    /// Attach file content.
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Attach the commit that last touched this file.
    pub fn with_commit(mut self, commit_id: impl Into<String>, commit_time_ms: i64) -> Self {
        self.commit_id = Some(commit_id.into());
        self.commit_time_ms = Some(commit_time_ms);
        self
    }

    /// Attach the previous path of a rename.
    pub fn renamed_from(mut self, previous_path: impl Into<String>) -> Self {
        self.previous_path = Some(previous_path.into());
        self
    }

    /// Check if this delta removes the file.
    pub fn is_deletion(&self) -> bool {
        self.change_type == ChangeType::Delete
    }
}

/// Diff between two commits as delivered by the git gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    /// Request that asked for this diff, when there was one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    pub processing_commit_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_commit_time_ms: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_commit_message: Option<String>,

    pub deltas: Vec<FileDelta>,
}

impl DiffResult {
    /// Create a diff result for a processing commit.
    pub fn new(processing_commit_id: impl Into<String>, deltas: Vec<FileDelta>) -> Self {
        Self {
            request_id: None,
            processing_commit_id: processing_commit_id.into(),
            processing_commit_time_ms: None,
            processing_commit_message: None,
            deltas,
        }
    }

    /// Link this diff to the request that asked for it.
    pub fn for_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}
