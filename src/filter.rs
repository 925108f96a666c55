//! Deterministic file discovery for a checked-out repository.
//!
//! Walks the tree under a root directory and yields candidate files, applying
//! in order:
//!
//! 1. hidden paths (any component below the root starting with `.`) are
//!    excluded, and hidden directories are never descended into;
//! 2. paths matched by `<root>/.gitignore` are excluded;
//! 3. if an extension allow-list is given, files whose extension (with the
//!    leading dot, compared exactly) is not listed are excluded.
//!
//! Entries are visited in file-name order at every level, so the output is
//! stable across runs and platforms.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use walkdir::{DirEntry, WalkDir};

/// Selects the files of a repository that should be ingested.
#[derive(Debug)]
pub struct FileFilter {
    root: PathBuf,
    extensions: Vec<String>,
    gitignore: Option<Gitignore>,
}

impl FileFilter {
    /// Build a filter for `root`.
    ///
    /// Reads `<root>/.gitignore` if present. An empty `extensions` list means
    /// every extension is accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` is not a directory or the `.gitignore`
    /// cannot be parsed.
    pub fn new(root: impl AsRef<Path>, extensions: &[String]) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            bail!("Ingestion root is not a directory: {}", root.display());
        }

        let gitignore_path = root.join(".gitignore");
        let gitignore = if gitignore_path.is_file() {
            let mut builder = GitignoreBuilder::new(&root);
            if let Some(err) = builder.add(&gitignore_path) {
                tracing::warn!("Problem reading {}: {}", gitignore_path.display(), err);
            }
            let gi = builder
                .build()
                .with_context(|| format!("Failed to parse {}", gitignore_path.display()))?;
            tracing::debug!("Loaded {} rules from .gitignore", gi.num_ignores());
            Some(gi)
        } else {
            None
        };

        Ok(Self {
            root,
            extensions: extensions.to_vec(),
            gitignore,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazily yield the selected files, in deterministic order.
    pub fn files(&self) -> impl Iterator<Item = PathBuf> + '_ {
        WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| self.keep_entry(entry))
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!("Skipping unreadable directory entry: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter(move |entry| self.extension_allowed(entry.path()))
            .map(DirEntry::into_path)
    }

    /// Path of `path` relative to the root, `/`-separated.
    pub fn relative_path(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Hidden and gitignored entries are pruned here, before descent.
    fn keep_entry(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 {
            return true;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
            return false;
        }
        if let Some(gitignore) = &self.gitignore {
            let relative = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
            let is_dir = entry.file_type().is_dir();
            if gitignore
                .matched_path_or_any_parents(relative, is_dir)
                .is_ignore()
            {
                return false;
            }
        }
        true
    }

    fn extension_allowed(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        match path.extension() {
            Some(ext) => {
                let dotted = format!(".{}", ext.to_string_lossy());
                self.extensions.iter().any(|allowed| *allowed == dotted)
            }
            None => false,
        }
    }
}
