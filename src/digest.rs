// 摘要计算
//
// SHA-256，按 64KB 缓冲区流式读取临时文件，输出小写十六进制字符串。

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::debug;

/// 读取缓冲区大小
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// 文件摘要结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    /// 十六进制摘要
    pub hex: String,
    /// 参与计算的字节数
    pub size: u64,
}

/// 计算内存数据的 SHA-256
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// 流式计算文件的 SHA-256
pub fn sha256_file(path: &Path) -> Result<FileDigest> {
    let file = File::open(path).with_context(|| format!("无法打开文件: {:?}", path))?;
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut size: u64 = 0;

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .with_context(|| format!("读取文件失败: {:?}", path))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        size += bytes_read as u64;
    }

    let hex = hex::encode(hasher.finalize());
    debug!("摘要计算完成: path={:?}, size={}, sha256={}", path, size, hex);

    Ok(FileDigest { hex, size })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_known_vectors() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_file_matches_buffer() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let digest = sha256_file(file.path()).unwrap();
        assert_eq!(digest.hex, sha256_hex(&data));
        assert_eq!(digest.size, data.len() as u64);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(sha256_file(Path::new("/nonexistent/hashd-digest")).is_err());
    }
}
