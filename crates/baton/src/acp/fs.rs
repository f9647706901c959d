//! Project-root sandbox for agent-driven file access.
//!
//! `fs/read_text_file` and `fs/write_text_file` requests are only honored
//! when the resolved absolute path lies within the session's project root.
//! Paths are normalized (`.`/`..` components and symlinks on the existing
//! prefix) before the containment check so traversal cannot escape the root.

use std::path::{Component, Path, PathBuf};

/// Resolves `requested` against `root` and rejects paths escaping the root.
///
/// # Errors
/// Returns an error when the root cannot be canonicalized or the resolved
/// path is outside the project root.
pub fn resolve_within_root(root: &Path, requested: &str) -> Result<PathBuf, String> {
    let canonical_root = std::fs::canonicalize(root)
        .map_err(|error| format!("project root is not accessible: {error}"))?;

    let requested_path = Path::new(requested);
    let absolute = if requested_path.is_absolute() {
        requested_path.to_path_buf()
    } else {
        canonical_root.join(requested_path)
    };
    let normalized = canonicalize_allowing_missing(&absolute);

    if normalized.starts_with(&canonical_root) {
        Ok(normalized)
    } else {
        Err(format!(
            "access denied: `{requested}` is outside the project root"
        ))
    }
}

/// Reads a text file after the sandbox check.
///
/// # Errors
/// Returns an error when the path escapes the root or reading fails.
pub fn read_text_file(root: &Path, requested: &str) -> Result<String, String> {
    let path = resolve_within_root(root, requested)?;

    std::fs::read_to_string(&path)
        .map_err(|error| format!("failed to read `{}`: {error}", path.display()))
}

/// Writes a text file after the sandbox check, creating parent directories.
///
/// # Errors
/// Returns an error when the path escapes the root or writing fails.
pub fn write_text_file(root: &Path, requested: &str, content: &str) -> Result<(), String> {
    let path = resolve_within_root(root, requested)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|error| format!("failed to create `{}`: {error}", parent.display()))?;
    }

    std::fs::write(&path, content)
        .map_err(|error| format!("failed to write `{}`: {error}", path.display()))
}

/// Canonicalizes the deepest existing ancestor and lexically appends the
/// rest, so files that do not exist yet can still be checked for containment.
fn canonicalize_allowing_missing(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut remainder: Vec<std::ffi::OsString> = Vec::new();
    loop {
        if let Ok(canonical) = std::fs::canonicalize(&existing) {
            let mut result = canonical;
            for component in remainder.iter().rev() {
                result.push(component);
            }

            return normalize_lexically(&result);
        }
        let parent = existing.parent().map(Path::to_path_buf);
        let name = existing.file_name().map(std::ffi::OsStr::to_os_string);
        match (parent, name) {
            (Some(parent), Some(name)) => {
                remainder.push(name);
                existing = parent;
            }
            _ => return normalize_lexically(path),
        }
    }
}

/// Removes `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                result.pop();
            }
            other => result.push(other.as_os_str()),
        }
    }

    result
}
