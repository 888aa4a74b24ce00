//! 上传文件存储：每个上传 id 对应上传目录下的一个文件。

use std::io::{self, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, ErrorKind};

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 解析上传 id 对应的文件路径，拒绝符号链接与目录。
    pub async fn resolve_upload(&self, id: &str) -> Result<PathBuf, StorageError> {
        let target = self.resolve(id)?;
        match fs::symlink_metadata(&target).await {
            Ok(metadata) => {
                if metadata.file_type().is_symlink() || metadata.is_dir() {
                    return Err(StorageError::InvalidPath);
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(StorageError::Io(err)),
        }
        Ok(target)
    }

    fn resolve(&self, id: &str) -> Result<PathBuf, StorageError> {
        if id.is_empty() || id.contains(['/', '\\', '\0']) {
            return Err(StorageError::InvalidPath);
        }
        let mut components = Path::new(id).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(segment)), None) => Ok(self.root.join(segment)),
            _ => Err(StorageError::InvalidPath),
        }
    }

    /// Byte length of the stored file, `None` when nothing was written yet.
    pub async fn stored_len(&self, id: &str) -> Result<Option<u64>, StorageError> {
        let target = self.resolve_upload(id).await?;
        match fs::metadata(&target).await {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// 打开分片写入句柄：起点为 0 时覆盖写，否则定位到起点。
    pub async fn open_chunk_writer(&self, id: &str, start: u64) -> Result<File, StorageError> {
        let target = self.resolve_upload(id).await?;
        if start == 0 {
            return Ok(File::create(&target).await?);
        }
        let mut file = OpenOptions::new().write(true).open(&target).await?;
        file.seek(SeekFrom::Start(start)).await?;
        Ok(file)
    }
}

/// 在同一写入句柄上回滚到 `len` 字节，等待未完成的写入落盘后再截断。
pub async fn rollback_chunk(file: &mut File, len: u64) -> io::Result<()> {
    // a failed write may still be in flight on the blocking pool
    let _ = file.flush().await;
    file.set_len(len).await?;
    file.sync_all().await
}

#[derive(Debug)]
pub enum StorageError {
    InvalidPath,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::InvalidPath => f.write_str("invalid upload id"),
            StorageError::Io(err) => write!(f, "{err}"),
        }
    }
}
