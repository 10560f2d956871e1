//! Firmware image storage.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hap_core::error::{Error, Result};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Destination for a streamed firmware image.
///
/// Erasing the target before an upload is the owner's job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FirmwareSink: Send + Sync {
    /// Write `data` at `*cursor` and advance the cursor past it.
    async fn write(&self, cursor: &mut u32, data: &[u8]) -> Result<()>;
}

/// Writes the image to a file at the cursor offset.
#[derive(Debug, Clone)]
pub struct FileFirmwareSink {
    path: PathBuf,
}

impl FileFirmwareSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncate the image file.
    pub async fn erase(&self) -> Result<()> {
        tokio::fs::File::create(&self.path)
            .await
            .map_err(|e| storage_error(&self.path, e))?;
        Ok(())
    }
}

#[async_trait]
impl FirmwareSink for FileFirmwareSink {
    async fn write(&self, cursor: &mut u32, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len())
            .map_err(|_| Error::Size(format!("{} byte firmware chunk", data.len())))?;
        let end = cursor
            .checked_add(len)
            .ok_or_else(|| Error::Size("firmware image exceeds 4 GiB".to_string()))?;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .await
            .map_err(|e| storage_error(&self.path, e))?;
        file.seek(SeekFrom::Start(u64::from(*cursor)))
            .await
            .map_err(|e| storage_error(&self.path, e))?;
        file.write_all(data)
            .await
            .map_err(|e| storage_error(&self.path, e))?;
        file.flush().await.map_err(|e| storage_error(&self.path, e))?;

        *cursor = end;
        Ok(())
    }
}

fn storage_error(path: &Path, e: std::io::Error) -> Error {
    Error::Storage(format!("{}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_at_cursor_and_advances() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileFirmwareSink::new(dir.path().join("firmware.bin"));
        sink.erase().await.unwrap();

        let mut cursor = 0u32;
        sink.write(&mut cursor, b"abcd").await.unwrap();
        sink.write(&mut cursor, b"efg").await.unwrap();
        assert_eq!(cursor, 7);
        assert_eq!(tokio::fs::read(sink.path()).await.unwrap(), b"abcdefg");
    }

    #[tokio::test]
    async fn erase_truncates_previous_image() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileFirmwareSink::new(dir.path().join("firmware.bin"));
        let mut cursor = 0u32;
        sink.write(&mut cursor, b"old image").await.unwrap();

        sink.erase().await.unwrap();
        let mut cursor = 0u32;
        sink.write(&mut cursor, b"new").await.unwrap();
        assert_eq!(tokio::fs::read(sink.path()).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn missing_directory_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileFirmwareSink::new(dir.path().join("no/such/dir/firmware.bin"));
        let mut cursor = 0u32;
        let err = sink.write(&mut cursor, b"x").await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert_eq!(cursor, 0);
    }

    #[tokio::test]
    async fn cursor_overflow_is_size_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileFirmwareSink::new(dir.path().join("firmware.bin"));
        let mut cursor = u32::MAX - 1;
        let err = sink.write(&mut cursor, b"abc").await.unwrap_err();
        assert!(matches!(err, Error::Size(_)));
    }
}
