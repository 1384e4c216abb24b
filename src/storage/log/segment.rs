use std::{
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, warn};

use crate::{error::StorageError, message::LogEntry, traits::StorageResult};

// Segment layout:
// {start}-{end}-{version}-data : | len u32 | entry bytes | len u32 | entry bytes | ...
// {start}-{end}-{version}-idx  : | data offset u64 | data offset u64 | ...
// The open tail segment carries OPEN_SEGMENT_END as its end index.

pub const OPEN_SEGMENT_END: u64 = u64::MAX;
pub const RECORD_HEADER_SIZE: u64 = 4;
pub const OFFSET_SIZE: u64 = 8;

const DATA_SUFFIX: &str = "data";
const INDEX_SUFFIX: &str = "idx";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFileKind {
    Data,
    Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentName {
    pub start_index: u64,
    pub end_index: u64,
    pub version: u64,
}

impl SegmentName {
    pub fn open(start_index: u64, version: u64) -> Self {
        Self {
            start_index,
            end_index: OPEN_SEGMENT_END,
            version,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_index == OPEN_SEGMENT_END
    }

    pub fn sealed(&self, end_index: u64) -> Self {
        Self { end_index, ..*self }
    }

    pub fn reopened(&self) -> Self {
        Self {
            end_index: OPEN_SEGMENT_END,
            ..*self
        }
    }

    pub fn data_file_name(&self) -> String {
        self.file_name(DATA_SUFFIX)
    }

    pub fn index_file_name(&self) -> String {
        self.file_name(INDEX_SUFFIX)
    }

    fn file_name(&self, suffix: &str) -> String {
        format!(
            "{}-{}-{}-{}",
            self.start_index, self.end_index, self.version, suffix
        )
    }

    pub fn parse(file_name: &str) -> Option<(Self, SegmentFileKind)> {
        let mut parts = file_name.split('-');
        let start_index = parts.next()?.parse().ok()?;
        let end_index = parts.next()?.parse().ok()?;
        let version = parts.next()?.parse().ok()?;
        let kind = match parts.next()? {
            DATA_SUFFIX => SegmentFileKind::Data,
            INDEX_SUFFIX => SegmentFileKind::Index,
            _ => return None,
        };
        if parts.next().is_some() {
            return None;
        }
        Some((
            Self {
                start_index,
                end_index,
                version,
            },
            kind,
        ))
    }
}

/// A data/index file pair. Clones share the file handles.
#[derive(Debug, Clone)]
pub struct LogSegment {
    pub(crate) name: SegmentName,
    pub(crate) data: Arc<File>,
    pub(crate) index: Arc<File>,
    pub(crate) data_len: u64,
    pub(crate) entry_count: u64,
}

fn open_file(path: &Path, create: bool) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .truncate(false)
        .open(path)
        .map_err(|e| {
            warn!("Failed to open log segment file {:?}: {}", path, e);
            e
        })
}

impl LogSegment {
    pub fn create(dir: &Path, name: SegmentName) -> StorageResult<Self> {
        let data = open_file(&dir.join(name.data_file_name()), true)?;
        let index = open_file(&dir.join(name.index_file_name()), true)?;
        data.set_len(0)?;
        index.set_len(0)?;
        Ok(Self {
            name,
            data: Arc::new(data),
            index: Arc::new(index),
            data_len: 0,
            entry_count: 0,
        })
    }

    pub fn open(dir: &Path, name: SegmentName) -> StorageResult<Self> {
        let data = open_file(&dir.join(name.data_file_name()), false)?;
        let index = open_file(&dir.join(name.index_file_name()), false)?;
        let data_len = data.metadata()?.len();
        let entry_count = index.metadata()?.len() / OFFSET_SIZE;
        Ok(Self {
            name,
            data: Arc::new(data),
            index: Arc::new(index),
            data_len,
            entry_count,
        })
    }

    pub fn data_path(&self, dir: &Path) -> PathBuf {
        dir.join(self.name.data_file_name())
    }

    pub fn index_path(&self, dir: &Path) -> PathBuf {
        dir.join(self.name.index_file_name())
    }

    pub fn start_index(&self) -> u64 {
        self.name.start_index
    }

    /// Index following the last entry held by this segment.
    pub fn next_index(&self) -> u64 {
        self.name.start_index + self.entry_count
    }

    pub fn contains(&self, index: u64) -> bool {
        index >= self.name.start_index && index < self.next_index()
    }

    /// Writes buffered records and offsets at the current tail. Positions are explicit so a
    /// failed attempt can be retried without duplicating bytes.
    pub fn write_tail(&self, data: &[u8], offsets: &[u8]) -> io::Result<()> {
        self.data.write_all_at(data, self.data_len)?;
        self.index
            .write_all_at(offsets, self.entry_count * OFFSET_SIZE)
            .map_err(|e| {
                warn!(
                    "Failed to write index of log segment {}: {}",
                    self.name.index_file_name(),
                    e
                );
                e
            })
    }

    pub fn sync(&self) -> io::Result<()> {
        self.data.sync_data()?;
        self.index.sync_data()
    }

    pub fn read_offset(&self, index: u64) -> StorageResult<u64> {
        if !self.contains(index) {
            return Err(StorageError::LogNotFound(index));
        }
        let mut raw = [0u8; OFFSET_SIZE as usize];
        self.index
            .read_exact_at(&mut raw, (index - self.name.start_index) * OFFSET_SIZE)?;
        Ok(u64::from_le_bytes(raw))
    }

    pub fn read_offsets(&self) -> StorageResult<Vec<u64>> {
        let mut raw = vec![0u8; (self.entry_count * OFFSET_SIZE) as usize];
        self.index.read_exact_at(&mut raw, 0)?;
        Ok(raw
            .chunks_exact(OFFSET_SIZE as usize)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                u64::from_le_bytes(b)
            })
            .collect())
    }

    pub fn read_bytes(&self, offset: u64, len: u64) -> StorageResult<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        self.data.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    pub fn read_entry(&self, index: u64) -> StorageResult<LogEntry> {
        let offset = self.read_offset(index)?;
        let end = if index + 1 < self.next_index() {
            self.read_offset(index + 1)?
        } else {
            self.data_len
        };
        let buf = self.read_bytes(offset, end.saturating_sub(offset))?;
        let mut entries = decode_records(&buf, index, 1)?;
        entries.pop().ok_or(StorageError::LogNotFound(index))
    }

    /// Keeps the first `keep` entries and cuts both files accordingly.
    pub fn truncate(&mut self, keep: u64) -> StorageResult<()> {
        if keep >= self.entry_count {
            return Ok(());
        }
        let data_len = self.read_offset(self.name.start_index + keep)?;
        self.data.set_len(data_len)?;
        self.index.set_len(keep * OFFSET_SIZE)?;
        self.data_len = data_len;
        self.entry_count = keep;
        Ok(())
    }

    pub fn rename(&mut self, dir: &Path, to: SegmentName) -> StorageResult<()> {
        fs::rename(self.data_path(dir), dir.join(to.data_file_name()))?;
        fs::rename(self.index_path(dir), dir.join(to.index_file_name()))?;
        self.name = to;
        Ok(())
    }

    /// Validates the indexed records against the data file and cuts both files after the last
    /// complete, decodable record. Returns the number of entries kept.
    pub fn repair(&mut self) -> StorageResult<u64> {
        let offsets = self.read_offsets()?;
        let data_len = self.data.metadata()?.len();
        let mut valid_end = 0u64;
        let mut kept = 0u64;
        for (i, offset) in offsets.iter().enumerate() {
            if *offset != valid_end {
                warn!(
                    "Log segment {} offset {} breaks the record chain at {}",
                    self.name.data_file_name(),
                    offset,
                    valid_end
                );
                break;
            }
            match check_record(&self.data, *offset, data_len, self.name.start_index + i as u64) {
                Some(end) => {
                    valid_end = end;
                    kept += 1;
                }
                None => break,
            }
        }
        if kept < offsets.len() as u64 || valid_end < data_len {
            warn!(
                "Repairing log segment {}: {} of {} entries valid, data cut from {} to {} bytes",
                self.name.data_file_name(),
                kept,
                offsets.len(),
                data_len,
                valid_end
            );
            self.data.set_len(valid_end)?;
            self.index.set_len(kept * OFFSET_SIZE)?;
        }
        self.data_len = valid_end;
        self.entry_count = kept;
        Ok(kept)
    }

    /// Rebuilds a lost index file by walking the data file record by record.
    pub fn rebuild_index(dir: &Path, name: SegmentName) -> StorageResult<()> {
        let data = open_file(&dir.join(name.data_file_name()), false)?;
        let data_len = data.metadata()?.len();
        let mut offsets = Vec::new();
        let mut offset = 0u64;
        let mut index = name.start_index;
        while let Some(end) = check_record(&data, offset, data_len, index) {
            offsets.extend_from_slice(&offset.to_le_bytes());
            offset = end;
            index += 1;
        }
        let idx = open_file(&dir.join(name.index_file_name()), true)?;
        idx.set_len(0)?;
        idx.write_all_at(&offsets, 0)?;
        idx.sync_data()?;
        debug!(
            "Rebuilt index of log segment {} with {} entries",
            name.data_file_name(),
            index - name.start_index
        );
        Ok(())
    }

    pub fn remove_files(dir: &Path, name: &SegmentName) -> (io::Result<()>, io::Result<()>) {
        (
            remove_if_exists(&dir.join(name.data_file_name())),
            remove_if_exists(&dir.join(name.index_file_name())),
        )
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Returns the end offset of the record at `offset` if it is complete and holds entry `index`.
fn check_record(data: &File, offset: u64, data_len: u64, index: u64) -> Option<u64> {
    if offset + RECORD_HEADER_SIZE > data_len {
        return None;
    }
    let mut header = [0u8; RECORD_HEADER_SIZE as usize];
    data.read_exact_at(&mut header, offset).ok()?;
    let len = u32::from_le_bytes(header) as u64;
    let end = offset + RECORD_HEADER_SIZE + len;
    if end > data_len {
        return None;
    }
    let mut payload = vec![0u8; len as usize];
    data.read_exact_at(&mut payload, offset + RECORD_HEADER_SIZE)
        .ok()?;
    match LogEntry::deserialize(&payload) {
        Ok(entry) if entry.curr_log_index == index => Some(end),
        Ok(entry) => {
            warn!(
                "Record at offset {} holds index {}, expected {}",
                offset, entry.curr_log_index, index
            );
            None
        }
        Err(e) => {
            warn!("Undecodable record at offset {}: {}", offset, e);
            None
        }
    }
}

/// Splits `u32 len || payload` records and checks they hold `count` consecutive entries.
pub fn decode_records(buf: &[u8], first_index: u64, count: u64) -> StorageResult<Vec<LogEntry>> {
    let mut entries = Vec::with_capacity(count as usize);
    let mut pos = 0usize;
    let header = RECORD_HEADER_SIZE as usize;
    for i in 0..count {
        let index = first_index + i;
        if pos + header > buf.len() {
            return Err(StorageError::DataCorruption(index));
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&buf[pos..pos + header]);
        let len = u32::from_le_bytes(raw) as usize;
        pos += header;
        if pos + len > buf.len() {
            return Err(StorageError::DataCorruption(index));
        }
        let entry = LogEntry::deserialize(&buf[pos..pos + len])?;
        if entry.curr_log_index != index {
            return Err(StorageError::DataCorruption(index));
        }
        entries.push(entry);
        pos += len;
    }
    Ok(entries)
}
