// Staged store - a transactional overlay over a file tree. Nothing touches
// disk until persist(), which writes dirty entries in priority order.

use crate::error::{Result, VellumError};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Default write priority. Lower numbers are flushed first.
pub const DEFAULT_PRIORITY: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Overwrite,
    Append,
}

#[derive(Debug, Clone)]
struct Entry {
    /// None means "deleted" (the file is unlinked on persist).
    content: Option<Vec<u8>>,
    dirty: bool,
    mode: Mode,
    priority: u32,
}

/// Transactional overlay over the filesystem. Reads fall through to disk and
/// are cached; writes stay in memory until `persist`. A frozen snapshot of a
/// store serves as an immutable pre-image while the live store mutates.
#[derive(Debug, Default)]
pub struct Store {
    entries: HashMap<PathBuf, Entry>,
    read_only: bool,
    no_persist: bool,
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    /// Clone the overlay and freeze the copy: read-only, non-persisting.
    pub fn frozen_snapshot(&self) -> Store {
        Store {
            entries: self.entries.clone(),
            read_only: true,
            no_persist: true,
        }
    }

    /// Convert this store into an immutable, non-persisting snapshot.
    pub fn freeze(&mut self) {
        self.read_only = true;
        self.no_persist = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.read_only && self.no_persist
    }

    /// Whether a path currently resolves to content, staged or on disk.
    pub fn has(&self, path: &Path) -> bool {
        match self.entries.get(path) {
            Some(entry) => entry.content.is_some(),
            None => path.is_file(),
        }
    }

    /// Whether a path has an overlay entry (clean or dirty).
    pub fn cached(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    /// Read content through the overlay, caching a clean entry on miss.
    /// A pending append is first materialized against disk content, after
    /// which the entry behaves like an ordinary overwrite.
    pub fn get(&mut self, path: &Path) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.entries.get_mut(path) {
            if entry.mode == Mode::Append {
                let mut full = read_disk(path)?.unwrap_or_default();
                if let Some(buffer) = &entry.content {
                    full.extend_from_slice(buffer);
                }
                entry.content = Some(full);
                entry.mode = Mode::Overwrite;
            }
            return Ok(entry.content.clone());
        }

        let content = read_disk(path)?;
        self.entries.insert(
            path.to_path_buf(),
            Entry {
                content: content.clone(),
                dirty: false,
                mode: Mode::Overwrite,
                priority: DEFAULT_PRIORITY,
            },
        );
        Ok(content)
    }

    /// `get`, decoded as UTF-8 (lossily).
    pub fn get_string(&mut self, path: &Path) -> Result<Option<String>> {
        Ok(self
            .get(path)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Stage a full overwrite at the default priority.
    pub fn put(&mut self, path: &Path, content: impl Into<Vec<u8>>) -> Result<()> {
        self.put_at(path, content, DEFAULT_PRIORITY)
    }

    /// Stage a full overwrite with an explicit flush priority.
    pub fn put_at(&mut self, path: &Path, content: impl Into<Vec<u8>>, priority: u32) -> Result<()> {
        if self.read_only {
            return Err(VellumError::ReadOnlyViolation);
        }

        self.entries.insert(
            path.to_path_buf(),
            Entry {
                content: Some(content.into()),
                dirty: true,
                mode: Mode::Overwrite,
                priority,
            },
        );
        Ok(())
    }

    /// Stage a deletion (alias for putting null content).
    pub fn delete(&mut self, path: &Path) -> Result<()> {
        self.delete_at(path, DEFAULT_PRIORITY)
    }

    pub fn delete_at(&mut self, path: &Path, priority: u32) -> Result<()> {
        if self.read_only {
            return Err(VellumError::ReadOnlyViolation);
        }

        self.entries.insert(
            path.to_path_buf(),
            Entry {
                content: None,
                dirty: true,
                mode: Mode::Overwrite,
                priority,
            },
        );
        Ok(())
    }

    /// Stage an append at the default priority.
    pub fn append(&mut self, path: &Path, content: &[u8]) -> Result<()> {
        self.append_at(path, content, DEFAULT_PRIORITY)
    }

    /// Stage an append. If the path already holds an overwrite entry the
    /// content is concatenated in place; otherwise an append buffer is kept
    /// and flushed with a true file append, never reading the existing file.
    pub fn append_at(&mut self, path: &Path, content: &[u8], priority: u32) -> Result<()> {
        if self.read_only {
            return Err(VellumError::ReadOnlyViolation);
        }

        if content.is_empty() {
            return Ok(());
        }

        match self.entries.get_mut(path) {
            Some(entry) => {
                entry
                    .content
                    .get_or_insert_with(Vec::new)
                    .extend_from_slice(content);
                entry.dirty = true;
                entry.priority = priority;
            }
            None => {
                self.entries.insert(
                    path.to_path_buf(),
                    Entry {
                        content: Some(content.to_vec()),
                        dirty: true,
                        mode: Mode::Append,
                        priority,
                    },
                );
            }
        }
        Ok(())
    }

    /// Drop one entry, dirty or not.
    pub fn revert(&mut self, path: &Path) {
        self.entries.remove(path);
    }

    /// Drop one entry only if clean - forces the next read through to disk.
    pub fn forget(&mut self, path: &Path) {
        if let Some(entry) = self.entries.get(path) {
            if !entry.dirty {
                self.entries.remove(path);
            }
        }
    }

    /// Discard the whole overlay.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn dirty_count(&self) -> usize {
        self.entries.values().filter(|e| e.dirty).count()
    }

    /// Flush dirty entries to disk, grouped by ascending priority so that
    /// ordering constraints between files (write data before advancing a
    /// pointer) are expressible. Append entries perform a true file append
    /// and are evicted so later reads see the disk state.
    pub fn persist(&mut self) -> Result<()> {
        if self.no_persist {
            return Err(VellumError::PersistDisabled);
        }

        let mut dirty: Vec<PathBuf> = self
            .entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(p, _)| p.clone())
            .collect();
        dirty.sort_by_key(|path| {
            let priority = self.entries[path].priority;
            (priority, path.clone())
        });

        for path in dirty {
            let Some(entry) = self.entries.get_mut(&path) else {
                continue;
            };
            match (entry.mode, entry.content.as_deref()) {
                (Mode::Append, Some(buffer)) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let mut file = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)?;
                    file.write_all(buffer)?;
                    self.entries.remove(&path);
                }
                (_, Some(content)) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, content)?;
                    entry.dirty = false;
                }
                (_, None) => {
                    if path.is_file() {
                        std::fs::remove_file(&path)?;
                    }
                    entry.dirty = false;
                }
            }
        }

        Ok(())
    }
}

fn read_disk(path: &Path) -> Result<Option<Vec<u8>>> {
    if path.is_file() {
        Ok(Some(std::fs::read(path)?))
    } else {
        Ok(None)
    }
}
