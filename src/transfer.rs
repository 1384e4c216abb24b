//! Chunked file transfer between members.

use std::{
    fs::{self, File},
    io::{self, Write},
    os::unix::fs::FileExt,
    path::{Component, Path, PathBuf},
};

use tracing::{error, info};

use crate::error::{RpcError, StorageError};
use crate::message::ReadFileRequest;
use crate::traits::{RaftClient, SnapshotResult};
use crate::types::{GroupId, Node};

/// Resolves a request path beneath `root`. Absolute paths and `..` are rejected.
fn resolve(root: &Path, requested: &str) -> io::Result<PathBuf> {
    let relative = Path::new(requested);
    if relative.as_os_str().is_empty()
        || !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path {:?} escapes the transfer root", requested),
        ));
    }
    Ok(root.join(relative))
}

/// Reads at most `length` bytes at `offset`. An offset at or past the end yields no bytes.
pub fn read_file(root: &Path, request: &ReadFileRequest) -> io::Result<Vec<u8>> {
    let path = resolve(root, &request.path)?;
    let file = File::open(&path)?;
    let len = file.metadata()?.len();
    if request.offset >= len {
        return Ok(Vec::new());
    }
    let want = (request.length as u64).min(len - request.offset);
    let mut buf = vec![0u8; want as usize];
    file.read_exact_at(&mut buf, request.offset)?;
    Ok(buf)
}

/// Downloads `remote_path` from `node` into `dest` in chunks of `chunk_size` bytes. A partial
/// download is removed. Returns the number of bytes written.
pub async fn pull_remote_file(
    client: &dyn RaftClient,
    node: &Node,
    group: &GroupId,
    remote_path: &str,
    dest: &Path,
    chunk_size: u32,
) -> SnapshotResult<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(StorageError::from)?;
    }
    let mut file = File::create(dest).map_err(StorageError::from)?;
    let mut offset = 0u64;
    loop {
        let request = ReadFileRequest {
            group: group.clone(),
            path: remote_path.to_string(),
            offset,
            length: chunk_size.max(1),
        };
        let chunk = match client.read_file(node, request).await {
            Ok(chunk) => chunk,
            Err(e) => {
                error!("Cannot pull file {} from {}: {}", remote_path, node, e);
                let _ = fs::remove_file(dest);
                return Err(e.into());
            }
        };
        if chunk.is_empty() {
            break;
        }
        if let Err(e) = file.write_all(&chunk) {
            let _ = fs::remove_file(dest);
            return Err(StorageError::from(e).into());
        }
        offset += chunk.len() as u64;
    }
    file.sync_all().map_err(StorageError::from)?;
    info!("Remote file {} is pulled from {} to {:?}", remote_path, node, dest);
    Ok(offset)
}

/// Maps a local read failure to the error a remote caller sees.
pub(crate) fn remote_error(e: io::Error) -> RpcError {
    RpcError::Remote(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(path: &str, offset: u64, length: u32) -> ReadFileRequest {
        ReadFileRequest {
            group: "g".to_string(),
            path: path.to_string(),
            offset,
            length,
        }
    }

    #[test]
    fn test_read_file_chunks() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("seq")).unwrap();
        fs::write(dir.path().join("seq/1.tsfile"), b"0123456789").unwrap();

        assert_eq!(read_file(dir.path(), &request("seq/1.tsfile", 0, 4)).unwrap(), b"0123");
        assert_eq!(read_file(dir.path(), &request("seq/1.tsfile", 8, 4)).unwrap(), b"89");
        assert!(read_file(dir.path(), &request("seq/1.tsfile", 10, 4)).unwrap().is_empty());
    }

    #[test]
    fn test_read_file_rejects_escaping_paths() {
        let dir = TempDir::new().unwrap();
        for path in ["../secret", "/etc/passwd", "seq/../../x", ""] {
            let err = read_file(dir.path(), &request(path, 0, 1)).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "{}", path);
        }
    }
}
