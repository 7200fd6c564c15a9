//! Binary format definitions for the RawDb transaction logs and batch header
//!
//! All integers are little-endian.
//!
//! Log file header (32 bytes, both `tx.log` and `txr.log`):
//!   [0]      redo_phase: u8  - undo log only: 1 when the tail record is a redo-phase manifest
//!   [1..8]   reserved
//!   [8..16]  pos1: u64
//!   [16..24] pos2: u64
//!   [24..32] pos3: u64
//!
//! The three positions hold the same value. They are written one after the
//! other, so a crash can leave at most one of them disagreeing; readers take
//! the value at least two of them agree on.
//!
//! Log record framing: body_len(u32) + body + crc32c(body)(u32)
//!
//! Record body:
//!   kind(u8) + prev(u64) + file_count(u32) + files + page_count(u32) + pages
//!   file:  file_index(u32) + page_size(u32) + exists(u8) + size(u64) + path_len(u16) + path
//!   page:  file_index(u32) + page_index(u64) + page_size(u32) + compressed_len(u32) + lz4 bytes

use std::path::PathBuf;

use crate::error::{RawDbError, RawResult};

/// Size of the log file header
pub const LOG_HEADER_SIZE: usize = 32;

/// Offsets of the three redundant position fields
pub const POSITION_OFFSETS: [u64; 3] = [8, 16, 24];

/// Framing overhead around a record body: length prefix + trailing checksum
pub const RECORD_FRAME_SIZE: usize = 8;

/// Batch header magic, stored little-endian in bytes [0..2)
pub const BATCH_MAGIC: u16 = 0x170E;

/// Batch header format version, byte [2]
pub const BATCH_VERSION: u8 = 0x01;

/// Fixed part of the batch header: magic + version + present flag
pub const BATCH_HEADER_SIZE: usize = 4;

/// Kinds of log records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Undo log: before-images of pages about to be overwritten
    Undo = 1,
    /// Undo log: final file manifest of a flush whose page writes completed
    RedoPhase = 2,
    /// Redo log: after-images of a durable commit
    Redo = 3,
}

impl RecordKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordKind::Undo),
            2 => Some(RecordKind::RedoPhase),
            3 => Some(RecordKind::Redo),
            _ => None,
        }
    }
}

/// Decoded log file header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogHeader {
    pub redo_phase: bool,
    pub positions: [u64; 3],
}

impl LogHeader {
    /// A header whose three positions agree on `pos`.
    pub fn new(redo_phase: bool, pos: u64) -> Self {
        Self { redo_phase, positions: [pos; 3] }
    }

    pub fn to_bytes(&self) -> [u8; LOG_HEADER_SIZE] {
        let mut buf = [0u8; LOG_HEADER_SIZE];
        buf[0] = self.redo_phase as u8;
        for (slot, pos) in self.positions.iter().enumerate() {
            let at = POSITION_OFFSETS[slot] as usize;
            buf[at..at + 8].copy_from_slice(&pos.to_le_bytes());
        }
        buf
    }

    pub fn from_bytes(buf: &[u8; LOG_HEADER_SIZE]) -> Self {
        let mut positions = [0u64; 3];
        for (slot, pos) in positions.iter_mut().enumerate() {
            let at = POSITION_OFFSETS[slot] as usize;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[at..at + 8]);
            *pos = u64::from_le_bytes(raw);
        }
        Self { redo_phase: buf[0] != 0, positions }
    }

    /// The position at least two of the three fields agree on.
    pub fn resolve(&self) -> Option<u64> {
        let [a, b, c] = self.positions;
        majority(a, b, c)
    }
}

/// 2-of-3 majority vote.
pub fn majority(a: u64, b: u64, c: u64) -> Option<u64> {
    if a == b || a == c {
        Some(a)
    } else if b == c {
        Some(b)
    } else {
        None
    }
}

/// State of one data file as recorded in a log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileManifestEntry {
    pub file_index: u32,
    pub page_size: u32,
    pub exists: bool,
    pub size: u64,
    pub path: PathBuf,
}

/// One page image. `data` holds the uncompressed page bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub file_index: u32,
    pub page_index: u64,
    pub data: Vec<u8>,
}

/// A complete decoded log record
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub kind: RecordKind,
    /// Undo log: offset of the previous record, 0 for the first one
    pub prev: u64,
    pub files: Vec<FileManifestEntry>,
    pub pages: Vec<PageImage>,
}

impl LogRecord {
    pub fn new(kind: RecordKind, prev: u64) -> Self {
        Self { kind, prev, files: Vec::new(), pages: Vec::new() }
    }

    /// Manifest entry for `file_index`, if recorded.
    pub fn file(&self, file_index: u32) -> Option<&FileManifestEntry> {
        self.files.iter().find(|f| f.file_index == file_index)
    }
}

/// Serialize a record into its framed on-disk form.
///
/// Page images are LZ4-compressed here.
pub fn encode_record(record: &LogRecord) -> RawResult<Vec<u8>> {
    let mut body = Vec::with_capacity(64 + record.pages.len() * 128);
    body.push(record.kind as u8);
    body.extend_from_slice(&record.prev.to_le_bytes());

    body.extend_from_slice(&(record.files.len() as u32).to_le_bytes());
    for file in &record.files {
        let path = file.path.to_string_lossy();
        let path = path.as_bytes();
        if path.len() > u16::MAX as usize {
            return Err(RawDbError::Corrupted {
                path: file.path.clone(),
                offset: 0,
                reason: format!("path of {} bytes does not fit a manifest entry", path.len()),
            });
        }
        body.extend_from_slice(&file.file_index.to_le_bytes());
        body.extend_from_slice(&file.page_size.to_le_bytes());
        body.push(file.exists as u8);
        body.extend_from_slice(&file.size.to_le_bytes());
        body.extend_from_slice(&(path.len() as u16).to_le_bytes());
        body.extend_from_slice(path);
    }

    body.extend_from_slice(&(record.pages.len() as u32).to_le_bytes());
    for page in &record.pages {
        let compressed = lz4_flex::block::compress(&page.data);
        body.extend_from_slice(&page.file_index.to_le_bytes());
        body.extend_from_slice(&page.page_index.to_le_bytes());
        body.extend_from_slice(&(page.data.len() as u32).to_le_bytes());
        body.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        body.extend_from_slice(&compressed);
    }

    let checksum = crc32c::crc32c(&body);
    let mut framed = Vec::with_capacity(body.len() + RECORD_FRAME_SIZE);
    framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
    framed.extend_from_slice(&body);
    framed.extend_from_slice(&checksum.to_le_bytes());
    Ok(framed)
}

/// Length of the framed record starting with `prefix`, read from its length field.
pub fn framed_len(prefix: [u8; 4]) -> usize {
    u32::from_le_bytes(prefix) as usize + RECORD_FRAME_SIZE
}

/// Deserialize a framed record, verifying its checksum and every page image length.
pub fn decode_record(framed: &[u8]) -> RawResult<LogRecord> {
    if framed.len() < RECORD_FRAME_SIZE {
        return Err(corrupted(0, format!("record too short: {} bytes", framed.len())));
    }
    let body_len = u32::from_le_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
    if framed.len() < body_len + RECORD_FRAME_SIZE {
        return Err(corrupted(
            0,
            format!("record needs {} bytes, only {} available", body_len + RECORD_FRAME_SIZE, framed.len()),
        ));
    }
    let body = &framed[4..4 + body_len];
    let stored = u32::from_le_bytes([
        framed[4 + body_len],
        framed[5 + body_len],
        framed[6 + body_len],
        framed[7 + body_len],
    ]);
    let computed = crc32c::crc32c(body);
    if stored != computed {
        return Err(RawDbError::ChecksumMismatch {
            path: PathBuf::from("<buffer>"),
            expected: stored,
            actual: computed,
            offset: 4,
        });
    }

    let mut reader = ByteReader::new(body);
    let kind_byte = reader.u8()?;
    let kind = RecordKind::from_u8(kind_byte)
        .ok_or_else(|| corrupted(0, format!("invalid record kind: {}", kind_byte)))?;
    let prev = reader.u64()?;

    let file_count = reader.u32()? as usize;
    let mut files = Vec::with_capacity(file_count.min(1024));
    for _ in 0..file_count {
        let file_index = reader.u32()?;
        let page_size = reader.u32()?;
        let exists = reader.u8()? != 0;
        let size = reader.u64()?;
        let path_len = reader.u16()? as usize;
        let path = String::from_utf8_lossy(reader.bytes(path_len)?).into_owned();
        files.push(FileManifestEntry { file_index, page_size, exists, size, path: PathBuf::from(path) });
    }

    let page_count = reader.u32()? as usize;
    let mut pages = Vec::with_capacity(page_count.min(1024));
    for _ in 0..page_count {
        let file_index = reader.u32()?;
        let page_index = reader.u64()?;
        let page_size = reader.u32()? as usize;
        let compressed_len = reader.u32()? as usize;
        let at = reader.pos as u64;
        let compressed = reader.bytes(compressed_len)?;

        let mut data = vec![0u8; page_size];
        let written = lz4_flex::block::decompress_into(compressed, &mut data)
            .map_err(|e| corrupted(at, format!("page image decompression failed: {}", e)))?;
        if written != page_size {
            return Err(corrupted(
                at,
                format!("page image decompressed to {} bytes, expected {}", written, page_size),
            ));
        }
        pages.push(PageImage { file_index, page_index, data });
    }

    Ok(LogRecord { kind, prev, files, pages })
}

/// Encode the batch header page contents (without padding to page size).
pub fn encode_batch_header(state: Option<&[u8]>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(BATCH_HEADER_SIZE + 4 + state.map_or(0, |s| s.len()));
    buf.extend_from_slice(&BATCH_MAGIC.to_le_bytes());
    buf.push(BATCH_VERSION);
    match state {
        Some(state) => {
            buf.push(1);
            buf.extend_from_slice(&(state.len() as u32).to_le_bytes());
            buf.extend_from_slice(state);
        }
        None => buf.push(0),
    }
    buf
}

/// Decode a batch header page. An all-zero page means no header was ever written.
pub fn decode_batch_header(page: &[u8]) -> RawResult<Option<Vec<u8>>> {
    if page.len() < BATCH_HEADER_SIZE {
        return Err(corrupted(0, "batch header page too small".to_string()));
    }
    if page[..BATCH_HEADER_SIZE].iter().all(|b| *b == 0) {
        return Ok(None);
    }
    let magic = u16::from_le_bytes([page[0], page[1]]);
    if magic != BATCH_MAGIC {
        return Err(RawDbError::BadMagic { found: magic });
    }
    if page[2] != BATCH_VERSION {
        return Err(RawDbError::UnsupportedVersion { found: page[2] });
    }
    if page[3] == 0 {
        return Ok(None);
    }
    let mut reader = ByteReader::new(&page[BATCH_HEADER_SIZE..]);
    let len = reader.u32()? as usize;
    Ok(Some(reader.bytes(len)?.to_vec()))
}

fn corrupted(offset: u64, reason: String) -> RawDbError {
    RawDbError::Corrupted { path: PathBuf::from("<buffer>"), offset, reason }
}

/// Bounds-checked little-endian cursor over a byte slice.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn bytes(&mut self, len: usize) -> RawResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(corrupted(
                self.pos as u64,
                format!("need {} bytes, {} remaining", len, self.remaining()),
            ));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> RawResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> RawResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> RawResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> RawResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> RawResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> LogRecord {
        let mut record = LogRecord::new(RecordKind::Undo, 4096);
        record.files.push(FileManifestEntry {
            file_index: 3,
            page_size: 256,
            exists: true,
            size: 1024,
            path: PathBuf::from("/data/f3.db"),
        });
        let mut data = vec![0u8; 256];
        data[10] = 0xAA;
        data[255] = 0x55;
        record.pages.push(PageImage { file_index: 3, page_index: 2, data });
        record
    }

    #[test]
    fn test_header_majority_vote_every_torn_position() {
        // Whichever single field is torn, the other two win.
        for torn in 0..3 {
            let mut header = LogHeader::new(false, 777);
            header.positions[torn] = 12345;
            assert_eq!(header.resolve(), Some(777), "torn slot {}", torn);
        }
        let header = LogHeader { redo_phase: false, positions: [1, 2, 3] };
        assert_eq!(header.resolve(), None);
    }

    #[test]
    fn test_header_layout() {
        let header = LogHeader::new(true, 0x0102);
        let bytes = header.to_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[8], 0x02);
        assert_eq!(bytes[16], 0x02);
        assert_eq!(bytes[24], 0x02);
        assert_eq!(LogHeader::from_bytes(&bytes), header);
    }

    #[test]
    fn test_record_encode_decode() {
        let record = sample_record();
        let framed = encode_record(&record).unwrap();
        assert_eq!(framed_len([framed[0], framed[1], framed[2], framed[3]]), framed.len());

        let decoded = decode_record(&framed).unwrap();
        assert_eq!(decoded.kind, RecordKind::Undo);
        assert_eq!(decoded.prev, 4096);
        assert_eq!(decoded.files, record.files);
        assert_eq!(decoded.pages, record.pages);
        assert_eq!(decoded.file(3).unwrap().size, 1024);
    }

    #[test]
    fn test_record_corruption_detected() {
        let mut framed = encode_record(&sample_record()).unwrap();
        let mid = framed.len() / 2;
        framed[mid] ^= 0xFF;
        assert!(matches!(decode_record(&framed), Err(RawDbError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_record_detected() {
        let framed = encode_record(&sample_record()).unwrap();
        let result = decode_record(&framed[..framed.len() - 3]);
        assert!(matches!(result, Err(RawDbError::Corrupted { .. })));
    }

    #[test]
    fn test_batch_header() {
        let encoded = encode_batch_header(Some(b"state"));
        assert_eq!(&encoded[..2], &[0x0E, 0x17]);
        assert_eq!(encoded[2], BATCH_VERSION);

        let mut page = vec![0u8; 128];
        page[..encoded.len()].copy_from_slice(&encoded);
        assert_eq!(decode_batch_header(&page).unwrap(), Some(b"state".to_vec()));

        let empty = vec![0u8; 128];
        assert_eq!(decode_batch_header(&empty).unwrap(), None);

        let mut cleared = vec![0u8; 128];
        let none = encode_batch_header(None);
        cleared[..none.len()].copy_from_slice(&none);
        assert_eq!(decode_batch_header(&cleared).unwrap(), None);
    }

    #[test]
    fn test_batch_header_rejects_bad_magic_and_version() {
        let mut page = vec![0u8; 64];
        page[..4].copy_from_slice(&[0x01, 0x02, BATCH_VERSION, 0]);
        assert!(matches!(decode_batch_header(&page), Err(RawDbError::BadMagic { found: 0x0201 })));

        let mut page = vec![0u8; 64];
        let encoded = encode_batch_header(None);
        page[..encoded.len()].copy_from_slice(&encoded);
        page[2] = 9;
        assert!(matches!(decode_batch_header(&page), Err(RawDbError::UnsupportedVersion { found: 9 })));
    }
}
