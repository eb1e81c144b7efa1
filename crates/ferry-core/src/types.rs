use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Which family of backend a location belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// S3-compatible bucket (keys, synthetic directories)
    Object,
    /// Confined directory tree on the local filesystem
    Local,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Object => f.write_str("object"),
            StorageKind::Local => f.write_str("local"),
        }
    }
}

/// Kind-specific location metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocationMeta {
    Object { region: String },
    Local { root: PathBuf },
}

/// A named storage root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLocation {
    /// Stable, URL-safe identifier (`local-0`, or the bucket name)
    pub id: String,
    pub kind: StorageKind,
    pub display_name: String,
    /// Re-evaluated each time locations are discovered
    pub available: bool,
    pub meta: LocationMeta,
}

/// Type of a listing row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    File,
    Directory,
    Symlink,
}

/// One directory-listing row, presented identically for both storage kinds.
///
/// `path` is location-relative, forward-slash separated, with no leading slash
/// and no `..` segments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    /// Size in bytes (files only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Modification time as Unix timestamp (seconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
}

/// One endpoint of a file transfer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferRef {
    pub location_id: String,
    pub kind: StorageKind,
    pub path: String,
}

impl TransferRef {
    pub fn local(location_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            location_id: location_id.into(),
            kind: StorageKind::Local,
            path: path.into(),
        }
    }

    pub fn object(location_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            location_id: location_id.into(),
            kind: StorageKind::Object,
            path: path.into(),
        }
    }

    /// Same endpoint with a different path
    pub fn with_path(&self, path: impl Into<String>) -> Self {
        Self {
            location_id: self.location_id.clone(),
            kind: self.kind,
            path: path.into(),
        }
    }
}

impl fmt::Display for TransferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.location_id, self.path)
    }
}

/// What to do when a destination path already holds data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    Overwrite,
    Skip,
    Rename,
}

impl std::str::FromStr for ConflictPolicy {
    type Err = crate::FerryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "overwrite" => Ok(ConflictPolicy::Overwrite),
            "skip" => Ok(ConflictPolicy::Skip),
            "rename" => Ok(ConflictPolicy::Rename),
            other => Err(crate::FerryError::InvalidRequest(format!(
                "unknown conflict policy: {other}"
            ))),
        }
    }
}
