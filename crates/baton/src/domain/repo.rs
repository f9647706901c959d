use std::path::{Path, PathBuf};

/// One discoverable repository, addressable by its stable index or name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoEntry {
    /// Stable position in the inventory, usable as a short identifier.
    pub index: usize,
    /// Directory name shown to users.
    pub name: String,
    /// Absolute path used as a session project root.
    pub path: PathBuf,
}

/// Flat repository list built once at startup.
#[derive(Clone, Debug, Default)]
pub struct RepoInventory {
    entries: Vec<RepoEntry>,
}

impl RepoInventory {
    /// Scans `root` for direct subdirectories containing a `.git` entry.
    ///
    /// When none are found, the root itself becomes the single entry so a
    /// plain project directory still works without any git checkouts.
    pub fn scan(root: &Path) -> Self {
        let mut names: Vec<(String, PathBuf)> = Vec::new();
        if let Ok(dir) = std::fs::read_dir(root) {
            for dir_entry in dir.flatten() {
                let path = dir_entry.path();
                if path.is_dir() && path.join(".git").exists() {
                    let name = dir_entry.file_name().to_string_lossy().to_string();
                    names.push((name, path));
                }
            }
        }
        names.sort_by(|a, b| a.0.cmp(&b.0));

        if names.is_empty() {
            let name = root
                .file_name()
                .map_or_else(|| root.display().to_string(), |name| {
                    name.to_string_lossy().to_string()
                });
            names.push((name, root.to_path_buf()));
        }

        let entries = names
            .into_iter()
            .enumerate()
            .map(|(index, (name, path))| RepoEntry { index, name, path })
            .collect();

        Self { entries }
    }

    /// Returns all entries in index order.
    pub fn entries(&self) -> &[RepoEntry] {
        &self.entries
    }

    /// Looks up one entry by index or case-insensitive name.
    pub fn find(&self, ident: &str) -> Option<&RepoEntry> {
        let trimmed = ident.trim();
        if let Ok(index) = trimmed.parse::<usize>() {
            return self.entries.get(index);
        }

        self.entries
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(trimmed))
    }
}
