//! Entity types and their file layout under a root folder.
//!
//! An entity lives at `<root_folder>/<type folder>/<entity id>.yaml`.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

const YAML_EXTENSIONS: &[&str] = &[".yaml", ".yml"];

/// Configuration entity kinds that can be synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Pipeline,
    InputSet,
    Template,
    Service,
    Environment,
    Infrastructure,
    Connector,
}

impl EntityType {
    pub const ALL: [EntityType; 7] = [
        Self::Pipeline,
        Self::InputSet,
        Self::Template,
        Self::Service,
        Self::Environment,
        Self::Infrastructure,
        Self::Connector,
    ];

    /// Folder holding entities of this type.
    pub fn folder(&self) -> &'static str {
        match self {
            Self::Pipeline => "pipelines",
            Self::InputSet => "input-sets",
            Self::Template => "templates",
            Self::Service => "services",
            Self::Environment => "environments",
            Self::Infrastructure => "infrastructures",
            Self::Connector => "connectors",
        }
    }

    fn from_folder(folder: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.folder() == folder)
    }

    /// Resolve the entity type of a repository path, if it is an entity file
    /// directly inside a known type folder of `root_folder`.
    pub fn from_path(root_folder: &str, path: &str) -> Option<Self> {
        let relative = relative_to_root(root_folder, path)?;
        let mut parts = relative.split('/');

        let folder = parts.next()?;
        let file = parts.next()?;
        if parts.next().is_some() {
            return None;
        }

        let stem = YAML_EXTENSIONS
            .iter()
            .find_map(|ext| file.strip_suffix(ext))?;
        if stem.is_empty() {
            return None;
        }

        Self::from_folder(folder)
    }

    /// Repository path of an entity.
    pub fn file_path(&self, root_folder: &str, entity_id: &str) -> Result<String, SyncError> {
        validate_entity_id(entity_id)?;
        let root = normalize_root(root_folder);
        if root.is_empty() {
            Ok(format!("{}/{}.yaml", self.folder(), entity_id))
        } else {
            Ok(format!("{}/{}/{}.yaml", root, self.folder(), entity_id))
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.folder())
    }
}

/// Entity ids become file names, so they must be a single path segment.
pub fn validate_entity_id(entity_id: &str) -> Result<(), SyncError> {
    if entity_id.trim().is_empty() {
        return Err(SyncError::invalid_input_field(
            "Entity id cannot be empty",
            "entity_id",
        ));
    }
    if entity_id.trim() != entity_id {
        return Err(SyncError::invalid_input_field(
            format!("Entity id '{}' has surrounding whitespace", entity_id),
            "entity_id",
        ));
    }
    if entity_id.contains(['/', '\\']) || entity_id == "." || entity_id == ".." {
        return Err(SyncError::invalid_input_field(
            format!("Entity id '{}' must not contain path separators", entity_id),
            "entity_id",
        ));
    }
    Ok(())
}

/// Root folder without surrounding slashes.
pub fn normalize_root(root_folder: &str) -> &str {
    root_folder.trim_matches('/')
}

/// Path relative to the root folder, or `None` when outside it.
pub fn relative_to_root<'a>(root_folder: &str, path: &'a str) -> Option<&'a str> {
    let root = normalize_root(root_folder);
    let path = path.trim_start_matches('/');
    if root.is_empty() {
        return Some(path);
    }
    path.strip_prefix(root)?.strip_prefix('/')
}
