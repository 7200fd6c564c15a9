//! Undo and redo transaction logs, and crash recovery
//!
//! The undo log (`tx.log`) protects flushes. Before a group of pages is
//! overwritten in its data files, the pages' on-disk images and the state of
//! the files involved are appended as one record:
//!
//! 1. append undo record, sync
//! 2. point the header at it, sync
//! 3. only now overwrite pages in the data files
//!
//! Once every page of a flush is on disk, a redo-phase record holding the
//! final file manifest is appended and the header flag set. From that point
//! the flush is complete even if the process dies before deletions and
//! truncations are applied: recovery finishes them from the manifest.
//!
//! The redo log (`txr.log`) holds after-images of durable commits that have
//! not been flushed yet. Its header holds the offset one past the last
//! complete record.
//!
//! Both headers store their position three times; see [`crate::format`].
//!
//! Recovery:
//! - the redo log is replayed unless the undo log is in redo phase (then the
//!   finished flush already contains everything the redo log holds)
//! - the undo log is applied: in redo phase, the final manifest; otherwise
//!   every record from the head back to the previous completed flush,
//!   skipping pages and files the redo replay restored
//!
//! The log is in redo phase when the head record the header positions agree
//! on is a redo-phase record. The header flag byte is only a hint.
//! - both logs are truncated
//!
//! Recovery never fails: errors are logged and the remaining work proceeds.
//! Whatever lies beyond a corrupted record is accepted as lost.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use hashbrown::{HashMap, HashSet};

use crate::error::{RawDbError, RawResult};
use crate::format::{
    decode_record, encode_record, framed_len, FileManifestEntry, LogHeader, LogRecord, PageImage, RecordKind,
    LOG_HEADER_SIZE, POSITION_OFFSETS,
};
use crate::page::PageKey;
use crate::platform_durability::{sync_dir, sync_file};

/// Undo log file name, under the first configured path
pub const UNDO_LOG_NAME: &str = "tx.log";

/// Redo log file name, under the first configured path
pub const REDO_LOG_NAME: &str = "txr.log";

/// One append-only log file with a triple-position header.
struct LogFile {
    path: PathBuf,
    file: File,
    end: u64,
}

impl LogFile {
    fn open(path: PathBuf) -> RawResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| RawDbError::io(&path, e, "failed to open log file"))?;
        let end = file
            .metadata()
            .map_err(|e| RawDbError::io(&path, e, "failed to stat log file"))?
            .len();
        Ok(Self { path, file, end })
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> RawResult<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| RawDbError::io(&self.path, e, "log seek failed"))?;
        self.file
            .write_all(data)
            .map_err(|e| RawDbError::io(&self.path, e, "log write failed"))
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> RawResult<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| RawDbError::io(&self.path, e, "log seek failed"))?;
        self.file.read_exact(buf).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                RawDbError::Corrupted {
                    path: self.path.clone(),
                    offset,
                    reason: format!("log ends before {} bytes at this offset", buf.len()),
                }
            } else {
                RawDbError::io(&self.path, e, "log read failed")
            }
        })
    }

    fn sync(&self) -> RawResult<()> {
        sync_file(&self.file, &self.path)
    }

    /// Header, or `None` if the file is shorter than one.
    fn read_header(&mut self) -> RawResult<Option<LogHeader>> {
        if self.end < LOG_HEADER_SIZE as u64 {
            return Ok(None);
        }
        let mut buf = [0u8; LOG_HEADER_SIZE];
        self.read_at(0, &mut buf)?;
        Ok(Some(LogHeader::from_bytes(&buf)))
    }

    /// Write the flag byte, then each position separately, then sync.
    fn write_header(&mut self, header: &LogHeader) -> RawResult<()> {
        let bytes = header.to_bytes();
        self.write_at(0, &bytes[..8])?;
        for offset in POSITION_OFFSETS {
            let at = offset as usize;
            self.write_at(offset, &bytes[at..at + 8])?;
        }
        self.end = self.end.max(LOG_HEADER_SIZE as u64);
        self.sync()
    }

    /// Append a framed record and return its offset. Does not sync.
    fn append(&mut self, framed: &[u8]) -> RawResult<u64> {
        if self.end < LOG_HEADER_SIZE as u64 {
            self.write_at(0, &[0u8; LOG_HEADER_SIZE])?;
            self.end = LOG_HEADER_SIZE as u64;
        }
        let offset = self.end;
        self.write_at(offset, framed)?;
        self.end += framed.len() as u64;
        Ok(offset)
    }

    /// Read and verify the record at `offset`. Returns it with the offset past it.
    fn read_record(&mut self, offset: u64) -> RawResult<(LogRecord, u64)> {
        let mut prefix = [0u8; 4];
        self.read_at(offset, &mut prefix)?;
        let len = framed_len(prefix);
        if offset + len as u64 > self.end {
            return Err(RawDbError::Corrupted {
                path: self.path.clone(),
                offset,
                reason: format!("record of {} bytes runs past end of log ({})", len, self.end),
            });
        }
        let mut framed = vec![0u8; len];
        self.read_at(offset, &mut framed)?;
        let record = decode_record(&framed).map_err(|e| locate(e, &self.path, offset))?;
        Ok((record, offset + len as u64))
    }

    fn clear(&mut self) -> RawResult<()> {
        self.file
            .set_len(0)
            .map_err(|e| RawDbError::io(&self.path, e, "log truncate failed"))?;
        self.end = 0;
        self.sync()
    }

    fn len(&self) -> u64 {
        self.end
    }
}

/// Attach the log path and record offset to a decode error.
fn locate(err: RawDbError, path: &Path, record_offset: u64) -> RawDbError {
    match err {
        RawDbError::Corrupted { offset, reason, .. } => RawDbError::Corrupted {
            path: path.to_path_buf(),
            offset: record_offset + offset,
            reason,
        },
        RawDbError::ChecksumMismatch { expected, actual, offset, .. } => RawDbError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected,
            actual,
            offset: record_offset + offset,
        },
        other => other,
    }
}

/// Undo log: before-images of pages a flush is about to overwrite.
pub struct UndoLog {
    log: LogFile,
    head: u64,
    redo_phase: bool,
}

impl UndoLog {
    fn open(path: PathBuf) -> RawResult<Self> {
        Ok(Self { log: LogFile::open(path)?, head: 0, redo_phase: false })
    }

    pub fn path(&self) -> &Path {
        &self.log.path
    }

    /// Offset of the newest record, 0 when empty.
    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == 0
    }

    pub fn is_redo_phase(&self) -> bool {
        self.redo_phase
    }

    /// Durably append before-images and point the header at them.
    ///
    /// Returns the number of bytes appended.
    pub fn append(&mut self, files: Vec<FileManifestEntry>, pages: Vec<PageImage>) -> RawResult<u64> {
        let mut record = LogRecord::new(RecordKind::Undo, self.head);
        record.files = files;
        record.pages = pages;
        self.write_record(&record, false)
    }

    /// Durably record that a flush wrote all its pages, with the final file state.
    pub fn mark_redo_phase(&mut self, files: Vec<FileManifestEntry>) -> RawResult<u64> {
        let mut record = LogRecord::new(RecordKind::RedoPhase, self.head);
        record.files = files;
        self.write_record(&record, true)
    }

    fn write_record(&mut self, record: &LogRecord, redo_phase: bool) -> RawResult<u64> {
        let framed = encode_record(record)?;
        let offset = self.log.append(&framed)?;
        self.log.sync()?;
        self.log.write_header(&LogHeader::new(redo_phase, offset))?;
        self.head = offset;
        self.redo_phase = redo_phase;
        Ok(framed.len() as u64)
    }

    /// Empty the log after a completed flush.
    pub fn clear(&mut self) -> RawResult<()> {
        self.log.clear()?;
        self.head = 0;
        self.redo_phase = false;
        Ok(())
    }
}

/// Redo log: after-images of durable commits not yet flushed.
pub struct RedoLog {
    log: LogFile,
    committed_end: u64,
}

impl RedoLog {
    fn open(path: PathBuf) -> RawResult<Self> {
        Ok(Self { log: LogFile::open(path)?, committed_end: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.log.path
    }

    pub fn is_empty(&self) -> bool {
        self.committed_end == 0
    }

    /// Durably append after-images and advance the committed end.
    ///
    /// Returns the number of bytes appended.
    pub fn append(&mut self, files: Vec<FileManifestEntry>, pages: Vec<PageImage>) -> RawResult<u64> {
        let mut record = LogRecord::new(RecordKind::Redo, 0);
        record.files = files;
        record.pages = pages;
        let framed = encode_record(&record)?;
        self.log.append(&framed)?;
        self.log.sync()?;
        self.log.write_header(&LogHeader::new(false, self.log.len()))?;
        self.committed_end = self.log.len();
        Ok(framed.len() as u64)
    }

    /// Empty the log; its content is covered by a completed flush.
    pub fn clear(&mut self) -> RawResult<()> {
        if self.committed_end == 0 && self.log.len() == 0 {
            return Ok(());
        }
        self.log.clear()?;
        self.committed_end = 0;
        Ok(())
    }
}

/// What a recovery run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub redo_records: usize,
    pub redo_pages: usize,
    pub redo_discarded: bool,
    pub undo_records: usize,
    pub undo_pages: usize,
    pub redo_phase_applied: bool,
    pub errors: usize,
}

impl RecoveryReport {
    /// True if recovery found nothing to do.
    pub fn is_clean(&self) -> bool {
        self.redo_records == 0 && self.undo_records == 0 && !self.redo_phase_applied && self.errors == 0
    }
}

/// Data files opened by path while recovering.
#[derive(Default)]
struct RecoveryFiles {
    open: HashMap<u32, (PathBuf, File)>,
}

impl RecoveryFiles {
    fn file(&mut self, entry: &FileManifestEntry) -> RawResult<&mut File> {
        if !self.open.contains_key(&entry.file_index) {
            if let Some(parent) = entry.path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| RawDbError::io(parent, e, "create data directory"))?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&entry.path)
                .map_err(|e| RawDbError::io(&entry.path, e, "failed to open data file for recovery"))?;
            self.open.insert(entry.file_index, (entry.path.clone(), file));
        }
        match self.open.get_mut(&entry.file_index) {
            Some((_, file)) => Ok(file),
            None => Err(RawDbError::FileNotFound { file_index: entry.file_index }),
        }
    }

    fn write_page(&mut self, entry: &FileManifestEntry, page_index: u64, data: &[u8]) -> RawResult<u64> {
        let offset = page_index * entry.page_size as u64;
        let file = self.file(entry)?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(data))
            .map_err(|e| RawDbError::io(&entry.path, e, "recovery page write failed"))?;
        Ok(offset + data.len() as u64)
    }

    fn set_len(&mut self, entry: &FileManifestEntry, size: u64) -> RawResult<()> {
        let file = self.file(entry)?;
        file.set_len(size)
            .map_err(|e| RawDbError::io(&entry.path, e, "recovery resize failed"))
    }

    fn remove(&mut self, entry: &FileManifestEntry) -> RawResult<()> {
        self.open.remove(&entry.file_index);
        match std::fs::remove_file(&entry.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RawDbError::io(&entry.path, e, "recovery delete failed")),
        }
    }

    fn sync_all(&mut self) -> RawResult<()> {
        for (path, file) in self.open.values() {
            sync_file(file, path)?;
        }
        Ok(())
    }
}

/// Apply the deletions and truncations a completed flush recorded.
fn finish_manifest(record: &LogRecord, files: &mut RecoveryFiles) -> RawResult<()> {
    for entry in &record.files {
        if entry.exists {
            let on_disk = std::fs::metadata(&entry.path).map(|m| m.len()).unwrap_or(0);
            if on_disk > entry.size {
                files.set_len(entry, entry.size)?;
            }
        } else {
            files.remove(entry)?;
        }
    }
    Ok(())
}

/// Pages and file extents restored by redo replay.
#[derive(Default)]
struct Restored {
    pages: HashSet<PageKey>,
    extents: HashMap<u32, u64>,
}

/// Both logs of one database.
pub struct TransactionLog {
    dir: PathBuf,
    undo: UndoLog,
    redo: RedoLog,
}

impl TransactionLog {
    /// Open (creating if needed) both logs under `dir`.
    pub fn open(dir: &Path) -> RawResult<Self> {
        std::fs::create_dir_all(dir).map_err(|e| RawDbError::io(dir, e, "failed to create log directory"))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            undo: UndoLog::open(dir.join(UNDO_LOG_NAME))?,
            redo: RedoLog::open(dir.join(REDO_LOG_NAME))?,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn undo(&mut self) -> &mut UndoLog {
        &mut self.undo
    }

    pub fn redo(&mut self) -> &mut RedoLog {
        &mut self.redo
    }

    pub fn is_empty(&self) -> bool {
        self.undo.is_empty() && self.redo.is_empty()
    }

    /// Bring every logged data file back to a consistent state.
    ///
    /// The caller must have closed all data files first.
    pub fn recover(&mut self) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let mut files = RecoveryFiles::default();
        let mut restored = Restored::default();

        let undo_header = match self.undo.log.read_header() {
            Ok(header) => header,
            Err(e) => {
                tracing::error!(error = %e, "undo log header unreadable");
                report.errors += 1;
                None
            }
        };
        let undo_head = undo_header.and_then(|h| {
            let head = h.resolve();
            if head.is_none() {
                tracing::error!(positions = ?h.positions, "undo log header positions disagree");
            }
            head
        });
        let flagged = undo_header.map_or(false, |h| h.redo_phase);
        let redo_phase = match undo_head.filter(|h| *h != 0) {
            Some(head) => self.head_is_redo_phase(head, flagged),
            None => false,
        };

        if redo_phase {
            report.redo_discarded = self.redo.log.len() > 0;
        } else if let Err(e) = self.replay_redo(&mut files, &mut restored, &mut report) {
            tracing::error!(error = %e, "redo replay stopped");
            report.errors += 1;
        }

        if let Some(head) = undo_head.filter(|h| *h != 0) {
            let result = if redo_phase {
                self.apply_redo_phase(head, &mut files, &mut report)
            } else {
                self.rewind_undo(head, &mut files, &restored, &mut report)
            };
            if let Err(e) = result {
                tracing::error!(error = %e, "undo processing stopped");
                report.errors += 1;
            }
        }

        if let Err(e) = files.sync_all() {
            tracing::error!(error = %e, "recovered data files failed to sync");
            report.errors += 1;
        }
        if let Err(e) = self.redo.clear().and_then(|_| self.undo.clear()) {
            tracing::error!(error = %e, "failed to clear transaction logs after recovery");
            report.errors += 1;
        }
        if let Err(e) = sync_dir(&self.dir) {
            tracing::warn!(error = %e, "log directory sync failed");
        }

        if !report.is_clean() {
            tracing::info!(
                redo_records = report.redo_records,
                redo_pages = report.redo_pages,
                undo_records = report.undo_records,
                undo_pages = report.undo_pages,
                redo_phase = report.redo_phase_applied,
                errors = report.errors,
                "transaction log recovery finished"
            );
        }
        report
    }

    /// The voted head record decides the phase; the flag byte is written
    /// separately and may be torn.
    fn head_is_redo_phase(&mut self, head: u64, flagged: bool) -> bool {
        match self.undo.log.read_record(head) {
            Ok((record, _)) => {
                let redo_phase = record.kind == RecordKind::RedoPhase;
                if redo_phase != flagged {
                    tracing::warn!(head, flagged, "undo header flag disagrees with head record");
                }
                redo_phase
            }
            Err(e) => {
                tracing::warn!(error = %e, head, "undo head record unreadable");
                false
            }
        }
    }

    fn replay_redo(
        &mut self,
        files: &mut RecoveryFiles,
        restored: &mut Restored,
        report: &mut RecoveryReport,
    ) -> RawResult<()> {
        let Some(header) = self.redo.log.read_header()? else {
            return Ok(());
        };
        let Some(end) = header.resolve() else {
            return Err(RawDbError::Corrupted {
                path: self.redo.log.path.clone(),
                offset: 0,
                reason: format!("redo header positions disagree: {:?}", header.positions),
            });
        };

        let mut offset = LOG_HEADER_SIZE as u64;
        while offset < end {
            let (record, next) = self.redo.log.read_record(offset)?;
            for image in &record.pages {
                let Some(entry) = record.file(image.file_index) else {
                    tracing::warn!(file = image.file_index, "redo page without manifest entry");
                    continue;
                };
                let extent = files.write_page(entry, image.page_index, &image.data)?;
                let known = restored.extents.entry(image.file_index).or_insert(0);
                *known = (*known).max(extent);
                restored.pages.insert(PageKey::new(image.file_index, image.page_index));
                report.redo_pages += 1;
            }
            files.sync_all()?;
            report.redo_records += 1;
            offset = next;
        }
        Ok(())
    }

    fn apply_redo_phase(
        &mut self,
        head: u64,
        files: &mut RecoveryFiles,
        report: &mut RecoveryReport,
    ) -> RawResult<()> {
        let (record, _) = self.undo.log.read_record(head)?;
        if record.kind != RecordKind::RedoPhase {
            return Err(RawDbError::Corrupted {
                path: self.undo.log.path.clone(),
                offset: head,
                reason: format!("expected redo-phase record, found {:?}", record.kind),
            });
        }
        finish_manifest(&record, files)?;
        report.redo_phase_applied = true;
        Ok(())
    }

    fn rewind_undo(
        &mut self,
        head: u64,
        files: &mut RecoveryFiles,
        restored: &Restored,
        report: &mut RecoveryReport,
    ) -> RawResult<()> {
        let mut offset = head;
        while offset != 0 {
            let (record, _) = self.undo.log.read_record(offset)?;
            if record.prev >= offset {
                return Err(RawDbError::Corrupted {
                    path: self.undo.log.path.clone(),
                    offset,
                    reason: format!("undo chain points forward to {}", record.prev),
                });
            }
            if record.kind == RecordKind::RedoPhase {
                // Everything older belongs to a flush that completed; only its
                // deletions and truncations may still be missing.
                finish_manifest(&record, files)?;
                report.redo_phase_applied = true;
                break;
            }
            if record.kind == RecordKind::Undo {
                for entry in &record.files {
                    if !entry.exists && !restored.extents.contains_key(&entry.file_index) {
                        files.remove(entry)?;
                        continue;
                    }
                    let keep = restored.extents.get(&entry.file_index).copied().unwrap_or(0);
                    files.set_len(entry, entry.size.max(keep))?;
                }
                for image in &record.pages {
                    if restored.pages.contains(&PageKey::new(image.file_index, image.page_index)) {
                        continue;
                    }
                    let Some(entry) = record.file(image.file_index) else {
                        tracing::warn!(file = image.file_index, "undo page without manifest entry");
                        continue;
                    };
                    files.write_page(entry, image.page_index, &image.data)?;
                    report.undo_pages += 1;
                }
                files.sync_all()?;
            }
            report.undo_records += 1;
            offset = record.prev;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(dir: &Path, exists: bool, size: u64) -> FileManifestEntry {
        FileManifestEntry { file_index: 1, page_size: 64, exists, size, path: dir.join("data.db") }
    }

    fn image(page_index: u64, byte: u8) -> PageImage {
        PageImage { file_index: 1, page_index, data: vec![byte; 64] }
    }

    #[test]
    fn test_rewind_restores_before_images() {
        let tmp = TempDir::new().unwrap();
        let data = tmp.path().join("data.db");
        std::fs::write(&data, vec![1u8; 128]).unwrap();

        let mut log = TransactionLog::open(tmp.path()).unwrap();
        log.undo().append(vec![entry(tmp.path(), true, 128)], vec![image(0, 1), image(1, 1)]).unwrap();
        // flush dies half way, after growing the file
        std::fs::write(&data, vec![2u8; 192]).unwrap();

        let report = log.recover();
        assert_eq!(report.undo_records, 1);
        assert_eq!(report.undo_pages, 2);
        assert_eq!(std::fs::read(&data).unwrap(), vec![1u8; 128]);
        assert!(log.is_empty());
        assert_eq!(std::fs::metadata(tmp.path().join(UNDO_LOG_NAME)).unwrap().len(), 0);
    }

    #[test]
    fn test_rewind_removes_file_created_by_flush() {
        let tmp = TempDir::new().unwrap();
        let mut log = TransactionLog::open(tmp.path()).unwrap();
        log.undo().append(vec![entry(tmp.path(), false, 0)], Vec::new()).unwrap();
        std::fs::write(tmp.path().join("data.db"), vec![5u8; 64]).unwrap();

        log.recover();
        assert!(!tmp.path().join("data.db").exists());
    }

    #[test]
    fn test_redo_phase_applies_final_manifest_only() {
        let tmp = TempDir::new().unwrap();
        let data = tmp.path().join("data.db");
        std::fs::write(&data, vec![3u8; 256]).unwrap();

        let mut log = TransactionLog::open(tmp.path()).unwrap();
        log.undo().append(vec![entry(tmp.path(), true, 256)], vec![image(0, 9)]).unwrap();
        log.undo().mark_redo_phase(vec![entry(tmp.path(), true, 64)]).unwrap();
        log.redo().append(vec![entry(tmp.path(), true, 64)], vec![image(0, 7)]).unwrap();

        let report = log.recover();
        assert!(report.redo_phase_applied);
        assert!(report.redo_discarded);
        assert_eq!(report.undo_pages, 0);
        assert_eq!(std::fs::read(&data).unwrap(), vec![3u8; 64]);
    }

    #[test]
    fn test_redo_replay_wins_over_undo() {
        let tmp = TempDir::new().unwrap();
        let data = tmp.path().join("data.db");
        std::fs::write(&data, vec![0u8; 128]).unwrap();

        let mut log = TransactionLog::open(tmp.path()).unwrap();
        log.redo().append(vec![entry(tmp.path(), true, 192)], vec![image(2, 8)]).unwrap();
        log.undo().append(vec![entry(tmp.path(), true, 128)], vec![image(0, 4), image(2, 4)]).unwrap();

        let report = log.recover();
        assert_eq!(report.redo_pages, 1);
        assert_eq!(report.undo_pages, 1);
        let content = std::fs::read(&data).unwrap();
        assert_eq!(content.len(), 192);
        assert!(content[..64].iter().all(|b| *b == 4));
        assert!(content[128..].iter().all(|b| *b == 8));
    }

    #[test]
    fn test_torn_header_uses_majority() {
        let tmp = TempDir::new().unwrap();
        let data = tmp.path().join("data.db");
        std::fs::write(&data, vec![1u8; 64]).unwrap();

        let mut log = TransactionLog::open(tmp.path()).unwrap();
        log.undo().append(vec![entry(tmp.path(), true, 64)], vec![image(0, 1)]).unwrap();
        std::fs::write(&data, vec![6u8; 64]).unwrap();

        // tear the middle position
        let mut raw = OpenOptions::new().write(true).open(tmp.path().join(UNDO_LOG_NAME)).unwrap();
        raw.seek(SeekFrom::Start(POSITION_OFFSETS[1])).unwrap();
        raw.write_all(&999u64.to_le_bytes()).unwrap();
        drop(raw);

        let mut log = TransactionLog::open(tmp.path()).unwrap();
        let report = log.recover();
        assert_eq!(report.undo_records, 1);
        assert_eq!(std::fs::read(&data).unwrap(), vec![1u8; 64]);
    }

    #[test]
    fn test_torn_redo_phase_flag_rewinds() {
        let tmp = TempDir::new().unwrap();
        let data = tmp.path().join("data.db");
        std::fs::write(&data, vec![1u8; 128]).unwrap();

        let mut log = TransactionLog::open(tmp.path()).unwrap();
        log.undo().append(vec![entry(tmp.path(), true, 128)], vec![image(0, 1), image(1, 1)]).unwrap();
        std::fs::write(&data, vec![2u8; 256]).unwrap();
        log.undo().mark_redo_phase(vec![entry(tmp.path(), true, 64)]).unwrap();

        // flag byte landed, positions still name the undo record
        let first = LOG_HEADER_SIZE as u64;
        let mut raw = OpenOptions::new().write(true).open(tmp.path().join(UNDO_LOG_NAME)).unwrap();
        for offset in POSITION_OFFSETS {
            raw.seek(SeekFrom::Start(offset)).unwrap();
            raw.write_all(&first.to_le_bytes()).unwrap();
        }
        drop(raw);

        let mut log = TransactionLog::open(tmp.path()).unwrap();
        let report = log.recover();
        assert!(!report.redo_phase_applied);
        assert_eq!(report.undo_records, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(std::fs::read(&data).unwrap(), vec![1u8; 128]);
    }

    #[test]
    fn test_rewind_stops_at_completed_flush() {
        let tmp = TempDir::new().unwrap();
        let data = tmp.path().join("data.db");
        std::fs::write(&data, vec![1u8; 192]).unwrap();

        let mut log = TransactionLog::open(tmp.path()).unwrap();
        // first flush completes but its truncation never ran
        log.undo().append(vec![entry(tmp.path(), true, 192)], vec![image(0, 1)]).unwrap();
        log.undo().mark_redo_phase(vec![entry(tmp.path(), true, 128)]).unwrap();
        // second flush dies after writing its pages
        log.undo().append(vec![entry(tmp.path(), true, 192)], vec![image(1, 1)]).unwrap();
        std::fs::write(&data, vec![2u8; 192]).unwrap();

        let report = log.recover();
        assert_eq!(report.undo_records, 1);
        assert_eq!(report.undo_pages, 1);
        assert!(report.redo_phase_applied);
        let content = std::fs::read(&data).unwrap();
        assert_eq!(content.len(), 128);
        assert!(content[..64].iter().all(|b| *b == 2), "completed flush was rewound");
        assert!(content[64..].iter().all(|b| *b == 1));
    }

    #[test]
    fn test_corrupted_record_stops_recovery_without_failing() {
        let tmp = TempDir::new().unwrap();
        let mut log = TransactionLog::open(tmp.path()).unwrap();
        log.undo().append(vec![entry(tmp.path(), true, 64)], vec![image(0, 1)]).unwrap();

        let path = tmp.path().join(UNDO_LOG_NAME);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 6;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let mut log = TransactionLog::open(tmp.path()).unwrap();
        let report = log.recover();
        assert_eq!(report.errors, 1);
        assert!(log.is_empty());
    }

    #[test]
    fn test_clean_logs_recover_to_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut log = TransactionLog::open(tmp.path()).unwrap();
        assert!(log.recover().is_clean());
    }
}
