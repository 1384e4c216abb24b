use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use bincode::{Decode, Encode};
use tracing::{info, warn};

use crate::{
    error::StorageError,
    message::{HardState, LogManagerMeta},
    traits::StorageResult,
};

pub const META_FILE_NAME: &str = "meta";
pub const META_TMP_FILE_NAME: &str = "meta.tmp";

// meta file: | crc32 u32 | len u32 | bincode(PersistedMeta) |
const META_HEADER_SIZE: usize = 8;

/// Everything the log directory persists besides the segments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct PersistedMeta {
    pub log: LogManagerMeta,
    pub hard_state: HardState,
    /// Segments with a version outside `[min_version, max_version]` are leftovers.
    pub min_version: u64,
    pub max_version: u64,
}

#[derive(Debug, Clone)]
pub struct MetaFile {
    dir: PathBuf,
}

impl MetaFile {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(META_FILE_NAME)
    }

    pub fn tmp_path(&self) -> PathBuf {
        self.dir.join(META_TMP_FILE_NAME)
    }

    /// Writes `meta.tmp`, syncs it and renames it over `meta`.
    pub fn persist(&self, meta: &PersistedMeta) -> StorageResult<()> {
        let frame = encode_frame(meta)?;
        let tmp = self.tmp_path();
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&frame)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.path()).map_err(|e| {
            warn!("Failed to replace meta file in {:?}: {}", self.dir, e);
            e
        })?;
        sync_dir(&self.dir)?;
        Ok(())
    }

    /// Loads the last complete meta. A complete `meta.tmp` means the process stopped between
    /// writing it and the rename, so it wins; an incomplete one is discarded.
    pub fn recover(&self) -> StorageResult<PersistedMeta> {
        let tmp = self.tmp_path();
        if tmp.exists() {
            let valid = fs::read(&tmp)
                .ok()
                .is_some_and(|bytes| decode_frame(&bytes).is_ok());
            if valid {
                info!("Recovering meta from {:?}", tmp);
                fs::rename(&tmp, self.path())?;
            } else {
                warn!("Discarding incomplete meta file {:?}", tmp);
                fs::remove_file(&tmp)?;
            }
        }

        let path = self.path();
        if !path.exists() {
            return Ok(PersistedMeta::default());
        }
        decode_frame(&fs::read(&path)?)
    }
}

fn encode_frame(meta: &PersistedMeta) -> StorageResult<Vec<u8>> {
    let payload = bincode::encode_to_vec(meta, bincode::config::standard())
        .map_err(|e| StorageError::MetaCorruption(e.to_string()))?;
    let mut frame = Vec::with_capacity(META_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn decode_frame(bytes: &[u8]) -> StorageResult<PersistedMeta> {
    if bytes.len() < META_HEADER_SIZE {
        return Err(StorageError::MetaCorruption(format!(
            "{} bytes is shorter than the header",
            bytes.len()
        )));
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[0..4]);
    let crc = u32::from_le_bytes(raw);
    raw.copy_from_slice(&bytes[4..8]);
    let len = u32::from_le_bytes(raw) as usize;
    let payload = bytes
        .get(META_HEADER_SIZE..META_HEADER_SIZE + len)
        .ok_or_else(|| StorageError::MetaCorruption("payload truncated".to_string()))?;
    if crc32fast::hash(payload) != crc {
        return Err(StorageError::MetaCorruption("checksum mismatch".to_string()));
    }
    let (meta, _) = bincode::decode_from_slice(payload, bincode::config::standard())
        .map_err(|e| StorageError::MetaCorruption(e.to_string()))?;
    Ok(meta)
}

fn sync_dir(dir: &Path) -> StorageResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_meta(term: u64) -> PersistedMeta {
        PersistedMeta {
            log: LogManagerMeta {
                last_log_index: 20,
                last_log_term: term,
                commit_log_index: 18,
                commit_log_term: term,
                max_have_applied_commit_index: 15,
            },
            hard_state: HardState {
                current_term: term,
                voted_for: None,
            },
            min_version: 1,
            max_version: 4,
        }
    }

    #[test]
    fn test_meta_persist_and_recover() {
        let dir = TempDir::new().unwrap();
        let file = MetaFile::new(dir.path());
        assert_eq!(file.recover().unwrap(), PersistedMeta::default());

        file.persist(&sample_meta(3)).unwrap();
        assert!(!file.tmp_path().exists());
        assert_eq!(file.recover().unwrap(), sample_meta(3));
    }

    #[test]
    fn test_complete_tmp_replaces_meta() {
        let dir = TempDir::new().unwrap();
        let file = MetaFile::new(dir.path());
        file.persist(&sample_meta(3)).unwrap();
        // crash after writing the tmp file, before the rename
        fs::write(file.tmp_path(), encode_frame(&sample_meta(4)).unwrap()).unwrap();

        assert_eq!(file.recover().unwrap(), sample_meta(4));
        assert!(!file.tmp_path().exists());
    }

    #[test]
    fn test_torn_tmp_is_discarded() {
        let dir = TempDir::new().unwrap();
        let file = MetaFile::new(dir.path());
        file.persist(&sample_meta(3)).unwrap();
        let frame = encode_frame(&sample_meta(4)).unwrap();
        fs::write(file.tmp_path(), &frame[..frame.len() / 2]).unwrap();

        assert_eq!(file.recover().unwrap(), sample_meta(3));
        assert!(!file.tmp_path().exists());
    }

    #[test]
    fn test_corrupted_meta_is_reported() {
        let dir = TempDir::new().unwrap();
        let file = MetaFile::new(dir.path());
        let mut frame = encode_frame(&sample_meta(3)).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        fs::write(file.path(), frame).unwrap();
        assert!(matches!(
            file.recover(),
            Err(StorageError::MetaCorruption(_))
        ));
    }
}
