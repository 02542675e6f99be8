//! Root mapping and connector models.

use serde::{Deserialize, Serialize};

use super::entity::{normalize_root, relative_to_root};
use super::sync_request::{queue_key, AccountScope};

/// Binds a folder in a repository branch to an account/org/project scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootMapping {
    pub root_folder_id: String,
    pub root_folder: String,
    pub repo: String,
    pub branch: String,
    pub connector_id: String,
    pub account_id: String,
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub project_id: String,
}

impl RootMapping {
    pub fn scope(&self) -> AccountScope {
        AccountScope::new(&self.account_id, &self.org_id, &self.project_id)
    }

    /// Queue key for requests touching this mapping.
    pub fn queue_key(&self) -> String {
        queue_key(&self.account_id, &self.connector_id, &self.branch)
    }

    /// Check if `path` lies under this mapping's root folder.
    pub fn owns_path(&self, path: &str) -> bool {
        relative_to_root(&self.root_folder, path).is_some()
    }

    /// Length of the normalized root folder, used to pick the most specific owner.
    pub fn root_depth(&self) -> usize {
        normalize_root(&self.root_folder).len()
    }

    /// Check if this mapping tracks the given repo and branch.
    pub fn tracks(&self, repo: &str, branch: &str) -> bool {
        self.repo == repo && self.branch == branch
    }
}

/// Pick the mapping with the longest root folder that owns `path`.
pub fn owning_mapping<'a>(mappings: &'a [RootMapping], path: &str) -> Option<&'a RootMapping> {
    mappings
        .iter()
        .filter(|m| m.owns_path(path))
        .max_by_key(|m| m.root_depth())
}

/// Git connector known to the host system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorInfo {
    pub connector_id: String,
    pub account_id: String,
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub project_id: String,
    pub repo_url: String,
    /// Hex SHA-256 of the webhook token assigned to this connector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_token_sha256: Option<String>,
}
