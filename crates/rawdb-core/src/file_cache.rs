//! Bound data files, keyed by file index
//!
//! Binding is transactional: a file bound by a transaction that rolls back
//! is unbound again. Deleted files leave the cache once the flush after their
//! commit has removed them from disk.

use std::path::{Path, PathBuf};

use hashbrown::HashMap;

use crate::config::RawDbConfig;
use crate::datafile::DataFile;
use crate::error::{RawDbError, RawResult};
use crate::page::Page;

/// Reserved file index of the batch header file.
pub const BATCH_FILE_INDEX: u32 = u32::MAX;

/// How to bind a data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    /// Absolute, or relative to the first configured path
    pub path: PathBuf,
    /// Index into the configured page types
    pub page_type: usize,
    /// Excluded from the logs and removed on close
    pub temporary: bool,
    pub read_only: bool,
}

impl FileSpec {
    pub fn new(path: impl Into<PathBuf>, page_type: usize) -> Self {
        Self { path: path.into(), page_type, temporary: false, read_only: false }
    }

    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// All currently bound data files.
#[derive(Debug)]
pub struct FileCache {
    base: PathBuf,
    drop_behind: bool,
    files: HashMap<u32, DataFile>,
}

impl FileCache {
    pub fn new(config: &RawDbConfig) -> Self {
        Self {
            base: config.primary_path().to_path_buf(),
            drop_behind: config.drop_behind,
            files: HashMap::new(),
        }
    }

    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base.join(path)
        }
    }

    /// Bind `spec` to `index`.
    ///
    /// Returns `true` if a new binding was created. Rebinding the same path is
    /// a no-op; binding a different path to a live index is rejected.
    pub fn bind(
        &mut self,
        index: u32,
        spec: &FileSpec,
        config: &RawDbConfig,
        in_transaction: bool,
    ) -> RawResult<bool> {
        let path = self.resolve_path(&spec.path);
        if let Some(existing) = self.files.get(&index) {
            if existing.path() == path && !existing.is_deleted() {
                return Ok(false);
            }
            return Err(RawDbError::Config {
                reason: format!("file index {} is already bound to {}", index, existing.path().display()),
            });
        }
        let page_type = config.page_types.get(spec.page_type).ok_or_else(|| RawDbError::Config {
            reason: format!("unknown page type {}", spec.page_type),
        })?;
        let mut file = DataFile::open(
            index,
            path,
            spec.page_type,
            page_type,
            spec.read_only,
            spec.temporary,
            self.drop_behind,
        )?;
        if in_transaction {
            file.mark_new();
        }
        tracing::debug!(index, path = %file.path().display(), "data file bound");
        self.files.insert(index, file);
        Ok(true)
    }

    pub fn get(&self, index: u32) -> RawResult<&DataFile> {
        match self.files.get(&index) {
            Some(file) if !file.is_deleted() => Ok(file),
            _ => Err(RawDbError::FileNotFound { file_index: index }),
        }
    }

    pub fn get_mut(&mut self, index: u32) -> RawResult<&mut DataFile> {
        match self.files.get_mut(&index) {
            Some(file) if !file.is_deleted() => Ok(file),
            _ => Err(RawDbError::FileNotFound { file_index: index }),
        }
    }

    /// Access regardless of the deleted flag; used by commit, rollback and flush.
    pub fn raw_mut(&mut self, index: u32) -> Option<&mut DataFile> {
        self.files.get_mut(&index)
    }

    pub fn raw(&self, index: u32) -> Option<&DataFile> {
        self.files.get(&index)
    }

    pub fn contains(&self, index: u32) -> bool {
        self.files.get(&index).map_or(false, |f| !f.is_deleted())
    }

    pub fn indices(&self) -> Vec<u32> {
        self.files.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataFile> {
        self.files.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DataFile> {
        self.files.values_mut()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Roll back one file; a file bound by the transaction is unbound.
    ///
    /// Returns the pages of an unbound file so their regions can be reused.
    pub fn rollback_file(&mut self, index: u32) -> Vec<Page> {
        let unbind = match self.files.get_mut(&index) {
            Some(file) => file.rollback(),
            None => return Vec::new(),
        };
        if !unbind {
            return Vec::new();
        }
        match self.files.remove(&index) {
            Some(mut file) => {
                tracing::debug!(index, "data file unbound by rollback");
                file.close()
            }
            None => Vec::new(),
        }
    }

    /// Drop a file whose deletion reached disk.
    pub fn evict(&mut self, index: u32) -> Option<DataFile> {
        self.files.remove(&index)
    }

    /// Close every file handle and give up all resident pages, keeping the bindings.
    pub fn close_files(&mut self) -> Vec<Page> {
        self.files.values_mut().flat_map(|file| file.close()).collect()
    }

    /// Close every file and drop its pages, keeping the bindings.
    pub fn reset_all(&mut self) -> Vec<Page> {
        let mut pages = Vec::new();
        for file in self.files.values_mut() {
            match file.reset_from_disk() {
                Ok(closed) => pages.extend(closed),
                Err(e) => tracing::warn!(path = %file.path().display(), error = %e, "data file reset failed"),
            }
        }
        pages
    }

    /// Close every file. Temporary files are removed from disk when `remove_temporary`.
    ///
    /// Returns all pages that were resident.
    pub fn close_all(&mut self, remove_temporary: bool) -> Vec<Page> {
        let mut pages = Vec::new();
        for (_, mut file) in self.files.drain() {
            pages.extend(file.close());
            if remove_temporary && file.is_temporary() {
                if let Err(e) = file.remove_from_disk() {
                    tracing::warn!(path = %file.path().display(), error = %e, "failed to remove temporary file");
                }
            }
        }
        pages
    }
}
