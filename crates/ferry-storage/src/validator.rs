//! Path confinement for local storage locations.
//!
//! Every local filesystem path in ferry is produced by [`PathValidator::resolve`]
//! (or [`PathValidator::resolve_parent`]). A caller hands in a location id and a
//! location-relative path; the validator lexically normalizes it, joins it onto
//! the location root, resolves symlinks on the real filesystem, and only then
//! checks that the result is the root or a descendant of it.
//!
//! Lexical normalization rejects the obvious attacks early, but the final word
//! always belongs to the canonicalized comparison: a symlink inside the root
//! pointing elsewhere is caught there, however innocent the relative path looks.

use ferry_core::types::{LocationMeta, StorageKind, StorageLocation};
use ferry_core::{FerryError, FerryResult};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A configured local root
#[derive(Debug, Clone)]
pub struct LocalRoot {
    pub id: String,
    pub display_name: String,
    pub path: PathBuf,
}

/// Resolves `(location id, relative path)` pairs into confined absolute paths.
#[derive(Debug, Clone, Default)]
pub struct PathValidator {
    roots: Vec<LocalRoot>,
}

/// Location id for the local root at `index` in the configured list
pub fn local_location_id(index: usize) -> String {
    format!("local-{index}")
}

impl PathValidator {
    /// Build from the ordered list of configured roots. Ids follow list position.
    pub fn new<P: AsRef<Path>>(roots: &[P]) -> Self {
        let roots = roots
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let path = p.as_ref().to_path_buf();
                let display_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                LocalRoot {
                    id: local_location_id(i),
                    display_name,
                    path,
                }
            })
            .collect();
        Self { roots }
    }

    pub fn roots(&self) -> &[LocalRoot] {
        &self.roots
    }

    /// Local locations in configured order, with availability evaluated now.
    pub async fn locations(&self) -> Vec<StorageLocation> {
        let mut out = Vec::with_capacity(self.roots.len());
        for root in &self.roots {
            let available = tokio::fs::metadata(&root.path)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false);
            if !available {
                warn!(location = %root.id, "local root is not an accessible directory");
            }
            out.push(StorageLocation {
                id: root.id.clone(),
                kind: StorageKind::Local,
                display_name: root.display_name.clone(),
                available,
                meta: LocationMeta::Local {
                    root: root.path.clone(),
                },
            });
        }
        out
    }

    /// Canonical root directory for a location id.
    pub async fn canonical_root(&self, location_id: &str) -> FerryResult<PathBuf> {
        let root = self
            .roots
            .iter()
            .find(|r| r.id == location_id)
            .ok_or_else(|| FerryError::NotFound(format!("unknown location: {location_id}")))?;

        match tokio::fs::canonicalize(&root.path).await {
            Ok(p) => Ok(p),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(FerryError::NotFound(format!(
                "location unavailable: {location_id}"
            ))),
            Err(e) => Err(FerryError::from_io(
                &e,
                format_args!("location root {location_id}"),
            )),
        }
    }

    /// Resolve a location-relative path into a confined, canonical absolute path.
    ///
    /// The target need not exist: the deepest existing ancestor is canonicalized
    /// and the remaining segments are re-appended.
    pub async fn resolve(&self, location_id: &str, relative: &str) -> FerryResult<PathBuf> {
        let root = self.canonical_root(location_id).await?;
        let segments = normalize_segments(location_id, relative)?;

        let mut candidate = root.clone();
        candidate.extend(&segments);

        let canonical = canonicalize_lenient(&candidate, location_id, relative).await?;
        if is_within(&canonical, &root) {
            debug!(location = %location_id, path = %relative, "path resolved");
            Ok(canonical)
        } else {
            warn!(location = %location_id, path = %relative, "path escapes location root");
            Err(escape_error(location_id, relative))
        }
    }

    /// Resolve the parent directory of `relative` and return it with the final
    /// segment, without following the final segment if it is a symlink.
    ///
    /// Used by operations that act on a directory entry itself (delete) rather
    /// than on whatever it points at.
    pub async fn resolve_parent(
        &self,
        location_id: &str,
        relative: &str,
    ) -> FerryResult<(PathBuf, String)> {
        let mut segments = normalize_segments(location_id, relative)?;
        let name = segments.pop().ok_or_else(|| {
            FerryError::InvalidRequest(format!("{location_id}: path refers to the location root"))
        })?;
        let parent = self.resolve(location_id, &segments.join("/")).await?;
        Ok((parent, name))
    }

    /// Whether a directory entry called `name` can be addressed through
    /// [`resolve`](Self::resolve). Listings hide entries that cannot.
    pub fn is_addressable_name(name: &str) -> bool {
        !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0'])
            && !has_encoded_separator(name)
    }

    /// Lexically normalized relative form (`a/b/c`, no leading slash), or a
    /// `Security` error if the path is unacceptable on its face.
    pub fn normalize(location_id: &str, relative: &str) -> FerryResult<String> {
        normalize_segments(location_id, relative).map(|s| s.join("/"))
    }
}

fn escape_error(location_id: &str, relative: &str) -> FerryError {
    FerryError::Security(format!(
        "{location_id}: path escapes location root: {}",
        relative.escape_debug()
    ))
}

/// Component-wise prefix check: equal to root, or root followed by a separator.
fn is_within(path: &Path, root: &Path) -> bool {
    path == root || path.starts_with(root)
}

/// Path separators accepted in relative paths. On Unix a backslash is an
/// ordinary filename byte, so it is refused rather than reinterpreted.
#[cfg(windows)]
const SEPARATORS: &[char] = &['/', '\\'];
#[cfg(not(windows))]
const SEPARATORS: &[char] = &['/'];

fn normalize_segments(location_id: &str, relative: &str) -> FerryResult<Vec<String>> {
    if relative.contains('\0') {
        return Err(FerryError::Security(format!(
            "{location_id}: path contains a null byte"
        )));
    }
    if is_absolute_form(relative) {
        return Err(FerryError::Security(format!(
            "{location_id}: absolute paths are not accepted: {}",
            relative.escape_debug()
        )));
    }
    if has_encoded_separator(relative) {
        return Err(FerryError::Security(format!(
            "{location_id}: path contains encoded traversal characters: {}",
            relative.escape_debug()
        )));
    }

    let mut segments: Vec<String> = Vec::new();
    for seg in relative.split(SEPARATORS) {
        if seg.contains('\\') {
            return Err(FerryError::Security(format!(
                "{location_id}: backslash in path segment: {}",
                relative.escape_debug()
            )));
        }
        match seg {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(escape_error(location_id, relative));
                }
            }
            s => segments.push(s.to_string()),
        }
    }
    Ok(segments)
}

/// Leading separator, drive letter (`C:`), or UNC/device prefix.
fn is_absolute_form(relative: &str) -> bool {
    let bytes = relative.as_bytes();
    if relative.starts_with('/') || relative.starts_with('\\') {
        return true;
    }
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return true;
    }
    Path::new(relative).is_absolute()
}

/// Percent-encoded `.`, `/`, `\`, NUL or `%` (double encoding).
fn has_encoded_separator(relative: &str) -> bool {
    let bytes = relative.as_bytes();
    bytes.windows(3).any(|w| {
        if w[0] != b'%' {
            return false;
        }
        let hex = [w[1], w[2]];
        let Ok(s) = std::str::from_utf8(&hex) else {
            return false;
        };
        matches!(
            u8::from_str_radix(s, 16),
            Ok(b'.') | Ok(b'/') | Ok(b'\\') | Ok(0) | Ok(b'%')
        )
    })
}

/// Canonicalize `path`, tolerating a non-existent tail.
///
/// A dangling symlink anywhere on the path is rejected: its destination cannot
/// be proven to stay inside the root.
async fn canonicalize_lenient(
    path: &Path,
    location_id: &str,
    relative: &str,
) -> FerryResult<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut pending: Vec<OsString> = Vec::new();

    loop {
        match tokio::fs::canonicalize(&existing).await {
            Ok(mut canonical) => {
                for seg in pending.iter().rev() {
                    canonical.push(seg);
                }
                return Ok(canonical);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if let Ok(meta) = tokio::fs::symlink_metadata(&existing).await {
                    if meta.file_type().is_symlink() {
                        return Err(FerryError::Security(format!(
                            "{location_id}: dangling symlink on path: {}",
                            relative.escape_debug()
                        )));
                    }
                }
                let Some(name) = existing.file_name().map(|n| n.to_os_string()) else {
                    return Err(FerryError::Storage(format!(
                        "{location_id}: no existing ancestor for {}",
                        relative.escape_debug()
                    )));
                };
                pending.push(name);
                existing.pop();
            }
            Err(e) => {
                return Err(FerryError::from_io(
                    &e,
                    format_args!("{location_id}:{}", relative.escape_debug()),
                ))
            }
        }
    }
}
