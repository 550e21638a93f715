use std::path::{Path, PathBuf};

use crate::error::StorageError;

/// How a leading separator in a requested path is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Anchor {
    /// Absolute request paths are real filesystem paths and must lie under the root.
    Filesystem,
    /// Leading separators are stripped and the path is taken relative to the root.
    Share,
}

/// A provider base directory that every requested path is confined to.
///
/// Resolution is purely lexical and happens before any I/O: `.` segments are
/// dropped, `..` pops one segment, and popping past the root fails with
/// [`StorageError::PermissionDenied`].
#[derive(Debug, Clone)]
pub struct BasePath {
    root: PathBuf,
    root_segments: Vec<String>,
    anchor: Anchor,
}

impl BasePath {
    /// Base for a local filesystem root. Absolute requests are accepted only
    /// when they point inside `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root_segments = lexical_segments(&root.to_string_lossy());
        Self {
            root,
            root_segments,
            anchor: Anchor::Filesystem,
        }
    }

    /// Base for a remote share directory. `/a.txt` means `a.txt` under the base.
    pub fn share(root: impl Into<PathBuf>) -> Self {
        Self {
            anchor: Anchor::Share,
            ..Self::new(root)
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Normalised segments of `requested` relative to the base.
    pub fn segments(&self, requested: &str) -> Result<Vec<String>, StorageError> {
        if requested.contains('\0') {
            return Err(escape(requested));
        }
        let unified = requested.replace('\\', "/");
        let absolute = unified.starts_with('/') || has_drive_prefix(&unified);

        let relative = if absolute && self.anchor == Anchor::Filesystem {
            let (drive, rest) = split_drive(&unified);
            let root = self.root.to_string_lossy().replace('\\', "/");
            let (root_drive, _) = split_drive(&root);
            if !drive.eq_ignore_ascii_case(root_drive) {
                return Err(escape(requested));
            }
            let full = normalize(rest).ok_or_else(|| escape(requested))?;
            if !full.starts_with(&self.root_segments) {
                return Err(escape(requested));
            }
            full[self.root_segments.len()..].to_vec()
        } else {
            let (_, rest) = split_drive(&unified);
            normalize(rest).ok_or_else(|| escape(requested))?
        };

        Ok(relative)
    }

    /// Relative path string (`/`-separated, empty for the base itself).
    pub fn relative(&self, requested: &str) -> Result<String, StorageError> {
        Ok(self.segments(requested)?.join("/"))
    }

    /// Full filesystem path under the root.
    pub fn resolve(&self, requested: &str) -> Result<PathBuf, StorageError> {
        let mut full = self.root.clone();
        for segment in self.segments(requested)? {
            full.push(segment);
        }
        Ok(full)
    }
}

fn escape(requested: &str) -> StorageError {
    StorageError::PermissionDenied(format!(
        "Path escapes base directory: {}",
        requested.replace('\0', "\\0")
    ))
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn split_drive(path: &str) -> (&str, &str) {
    if has_drive_prefix(path) {
        path.split_at(2)
    } else {
        ("", path)
    }
}

/// Segments of an already trusted path (the root), tolerating `..` at the top.
fn lexical_segments(path: &str) -> Vec<String> {
    let unified = path.replace('\\', "/");
    let (_, rest) = split_drive(&unified);
    let mut out: Vec<String> = Vec::new();
    for segment in rest.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other.to_string()),
        }
    }
    out
}

/// Returns `None` when a `..` would climb above the starting point.
fn normalize(path: &str) -> Option<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                out.pop()?;
            }
            other => out.push(other.to_string()),
        }
    }
    Some(out)
}
