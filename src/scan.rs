//! Project scanning.
//!
//! The scanner walks the project root, hashes every file and assigns it to a
//! build category. Its output, the [`FileInventory`], is the only thing the
//! rest of the pipeline knows about the file system.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::config::Config;
use crate::core::{ArcStr, Hash32};
use crate::error::ScanError;

/// A single scanned file.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path relative to the project root, always `/` separated.
    pub path: ArcStr,
    pub hash: Hash32,
    pub modified: Option<SystemTime>,
    pub size: u64,
    pub category: Option<ArcStr>,
    /// Raw file content, kept for the dependency extractor.
    pub content: Arc<[u8]>,
}

impl FileEntry {
    /// Builds an entry from in-memory content, hashing it on the way.
    pub fn from_content(
        path: impl Into<ArcStr>,
        content: impl Into<Arc<[u8]>>,
        category: Option<&str>,
    ) -> Self {
        let content = content.into();
        Self {
            path: path.into(),
            hash: Hash32::hash(&content),
            modified: None,
            size: content.len() as u64,
            category: category.map(Into::into),
            content,
        }
    }

    pub fn content_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }
}

/// Every file known to a run, keyed and ordered by relative path.
#[derive(Debug, Clone, Default)]
pub struct FileInventory {
    files: BTreeMap<ArcStr, FileEntry>,
}

impl FileInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry, replacing any previous entry with the same path.
    pub fn insert(&mut self, entry: FileEntry) {
        self.files.insert(entry.path.clone(), entry);
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.files.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.values()
    }

    pub fn paths(&self) -> impl Iterator<Item = &ArcStr> {
        self.files.keys()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FromIterator<FileEntry> for FileInventory {
    fn from_iter<I: IntoIterator<Item = FileEntry>>(iter: I) -> Self {
        let mut inventory = FileInventory::new();
        for entry in iter {
            inventory.insert(entry);
        }
        inventory
    }
}

/// Default file system scanner.
pub struct Scanner<'a> {
    config: &'a Config,
}

impl<'a> Scanner<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub fn scan(&self) -> Result<FileInventory, ScanError> {
        let s = Instant::now();
        let root = self.config.root();

        let mut paths = Vec::new();
        self.walk(root, Utf8Path::new(""), &mut paths)?;

        let entries: Result<Vec<FileEntry>, ScanError> = paths
            .into_par_iter()
            .map(|relative| self.read_entry(root, relative))
            .collect();

        let inventory: FileInventory = entries?.into_iter().collect();

        tracing::info!(
            files = inventory.len(),
            elapsed = ?s.elapsed(),
            "Scanned project at {root}"
        );

        Ok(inventory)
    }

    fn walk(
        &self,
        dir: &Utf8Path,
        relative: &Utf8Path,
        acc: &mut Vec<Utf8PathBuf>,
    ) -> Result<(), ScanError> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry
                .file_name()
                .into_string()
                .map_err(|name| ScanError::NonUtf8Name(name.to_string_lossy().into_owned()))?;

            let rel = join_relative(relative, &name);
            let filetype = entry.file_type()?;

            if filetype.is_dir() {
                // directories are matched as `dir/**` so a single pattern prunes them
                if self.config.is_ignored(&rel) || self.config.is_ignored(&rel.join("_")) {
                    continue;
                }
                self.walk(&dir.join(&name), &rel, acc)?;
            } else if filetype.is_file() && !self.config.is_ignored(&rel) {
                acc.push(rel);
            }
        }

        Ok(())
    }

    fn read_entry(&self, root: &Utf8Path, relative: Utf8PathBuf) -> Result<FileEntry, ScanError> {
        let full = root.join(&relative);
        let metadata = fs::metadata(&full)?;
        let content: Arc<[u8]> = fs::read(&full)?.into();
        let category = self.config.categorize(&relative).map(|c| c.name.clone());

        tracing::debug!(path = %relative, size = metadata.len(), "Hashed file");

        Ok(FileEntry {
            path: relative.as_str().into(),
            hash: Hash32::hash(&content),
            modified: metadata.modified().ok(),
            size: metadata.len(),
            category,
            content,
        })
    }
}

fn join_relative(base: &Utf8Path, name: &str) -> Utf8PathBuf {
    if base.as_str().is_empty() {
        Utf8PathBuf::from(name)
    } else {
        Utf8PathBuf::from(format!("{base}/{name}"))
    }
}
