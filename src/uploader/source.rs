// 上传源：本地文件或内存缓冲区
//
// 按需读取指定字节范围，不在内存中保留整个文件

use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// 上传源
#[derive(Debug, Clone)]
pub enum ChunkSource {
    /// 本地文件
    File(PathBuf),
    /// 内存缓冲区
    Memory(Arc<Vec<u8>>),
}

impl ChunkSource {
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        ChunkSource::File(path.as_ref().to_path_buf())
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        ChunkSource::Memory(Arc::new(data))
    }

    /// 源的总字节数
    pub async fn len(&self) -> io::Result<u64> {
        match self {
            ChunkSource::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
            ChunkSource::Memory(data) => Ok(data.len() as u64),
        }
    }

    /// 读取 `[offset, offset + size)`，不足 size 字节视为错误
    pub async fn read_range(&self, offset: u64, size: u64) -> io::Result<Vec<u8>> {
        match self {
            ChunkSource::File(path) => {
                let path = path.clone();
                tokio::task::spawn_blocking(move || read_file_range(&path, offset, size))
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            }
            ChunkSource::Memory(data) => {
                let start = usize::try_from(offset)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset 溢出"))?;
                let end = start
                    .checked_add(size as usize)
                    .filter(|end| *end <= data.len())
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!(
                                "读取范围越界: offset={}, size={}, len={}",
                                offset,
                                size,
                                data.len()
                            ),
                        )
                    })?;
                Ok(data[start..end].to_vec())
            }
        }
    }
}

fn read_file_range(path: &Path, offset: u64, size: u64) -> io::Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;

    let mut buffer = vec![0u8; size as usize];
    file.read_exact(&mut buffer)?;

    debug!(
        "读取文件范围: {:?}, offset={}, size={}",
        path, offset, size
    );
    Ok(buffer)
}
