// 分片落盘
//
// 序号 0 的分片截断重建文件，其余分片追加写入。

use crate::error::SinkError;
use crate::transport::ClientId;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// 一次上传对应的临时文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSink {
    path: PathBuf,
}

impl ChunkSink {
    /// `<dir>/hashd-<client_id>-<generation>.part`
    pub fn new(dir: &Path, client_id: ClientId, generation: u64) -> Self {
        Self {
            path: dir.join(format!("hashd-{}-{}.part", client_id, generation)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 写入一个分片
    pub fn write_chunk(&self, chunk_index: u32, data: &[u8]) -> Result<(), SinkError> {
        let mut options = OpenOptions::new();
        if chunk_index == 0 {
            options.write(true).create(true).truncate(true);
        } else {
            options.append(true);
        }

        options
            .open(&self.path)
            .and_then(|mut file| {
                file.write_all(data)?;
                file.flush()
            })
            .map_err(|source| SinkError {
                path: self.path.clone(),
                source,
            })
    }

    /// 删除临时文件（不存在视为成功）
    pub fn remove(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_first_chunk_truncates() {
        let dir = TempDir::new().unwrap();
        let sink = ChunkSink::new(dir.path(), 4321, 7);
        assert!(sink.path().ends_with("hashd-4321-7.part"));

        sink.write_chunk(0, b"stale data").unwrap();
        sink.write_chunk(0, b"abcd").unwrap();
        sink.write_chunk(1, b"ef").unwrap();

        assert_eq!(std::fs::read(sink.path()).unwrap(), b"abcdef");
    }

    #[test]
    fn test_append_without_first_chunk_fails() {
        let dir = TempDir::new().unwrap();
        let sink = ChunkSink::new(dir.path(), 4321, 1);

        let err = sink.write_chunk(1, b"xx").unwrap_err();
        assert_eq!(err.path, sink.path());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let sink = ChunkSink::new(dir.path(), 4321, 1);
        sink.write_chunk(0, b"x").unwrap();

        sink.remove().unwrap();
        assert!(!sink.path().exists());
        sink.remove().unwrap();
    }
}
