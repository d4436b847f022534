//! Plain POSIX-filesystem driver: the default, unbundled resource kind.

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{driver_io_error, DriverOp, Error, Result};

use super::{DriverKind, L3Driver, NativeHandle, OpenFlags, PhysicalStat, Whence};

/// Driver for `DriverKind::Unix` resources: opens files directly under the
/// resource's vault using `tokio::fs`, same as a cache or primary member
/// would.
#[derive(Debug, Default)]
pub struct UnixFsDriver;

fn as_file(handle: &mut NativeHandle) -> Result<&mut tokio::fs::File> {
    match handle {
        NativeHandle::File(f) => Ok(f),
        NativeHandle::Memory { .. } => {
            Err(Error::InvariantViolated("unix driver received an in-memory handle"))
        }
    }
}

fn whence_to_std(whence: Whence) -> std::io::SeekFrom {
    match whence {
        Whence::Set => std::io::SeekFrom::Start(0),
        Whence::Cur => std::io::SeekFrom::Current(0),
        Whence::End => std::io::SeekFrom::End(0),
    }
}

#[async_trait]
impl L3Driver for UnixFsDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Unix
    }

    async fn open(&self, phy_path: &str, flags: OpenFlags, _mode: u32) -> Result<NativeHandle> {
        if let Some(parent) = std::path::Path::new(phy_path).parent() {
            if flags.create {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| driver_io_error(DriverOp::Open, DriverKind::Unix, e))?;
            }
        }
        let file = OpenOptions::new()
            .read(flags.read)
            .write(flags.write)
            .create(flags.create)
            .truncate(flags.truncate)
            .append(flags.append)
            .open(phy_path)
            .await
            .map_err(|e| driver_io_error(DriverOp::Open, DriverKind::Unix, e))?;
        Ok(NativeHandle::File(file))
    }

    async fn close(&self, handle: &mut NativeHandle) -> Result<()> {
        let file = as_file(handle)?;
        file.flush().await.map_err(|e| driver_io_error(DriverOp::Write, DriverKind::Unix, e))
    }

    async fn read(&self, handle: &mut NativeHandle, buf: &mut [u8]) -> Result<usize> {
        let file = as_file(handle)?;
        file.read(buf).await.map_err(|e| driver_io_error(DriverOp::Read, DriverKind::Unix, e))
    }

    async fn write(&self, handle: &mut NativeHandle, buf: &[u8]) -> Result<usize> {
        let file = as_file(handle)?;
        file.write(buf).await.map_err(|e| driver_io_error(DriverOp::Write, DriverKind::Unix, e))
    }

    async fn lseek(&self, handle: &mut NativeHandle, offset: i64, whence: Whence) -> Result<i64> {
        let file = as_file(handle)?;
        let base = match whence_to_std(whence) {
            std::io::SeekFrom::Start(_) => std::io::SeekFrom::Start(offset.max(0) as u64),
            std::io::SeekFrom::Current(_) => std::io::SeekFrom::Current(offset),
            std::io::SeekFrom::End(_) => std::io::SeekFrom::End(offset),
        };
        file.seek(base).await.map(|v| v as i64).map_err(|e| driver_io_error(DriverOp::Seek, DriverKind::Unix, e))
    }

    async fn unlink(&self, phy_path: &str) -> Result<()> {
        tokio::fs::remove_file(phy_path)
            .await
            .map_err(|e| driver_io_error(DriverOp::Unlink, DriverKind::Unix, e))
    }

    async fn stat(&self, phy_path: &str) -> Result<PhysicalStat> {
        let meta = tokio::fs::metadata(phy_path)
            .await
            .map_err(|e| driver_io_error(DriverOp::Stat, DriverKind::Unix, e))?;
        let mtime_unix = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(PhysicalStat { size: meta.len(), mtime_unix })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obj.bin");
        let driver = UnixFsDriver;

        let mut handle = driver.open(path.to_str().unwrap(), OpenFlags::write_create(), 0o644).await.unwrap();
        let written = driver.write(&mut handle, b"hello").await.unwrap();
        assert_eq!(written, 5);
        driver.close(&mut handle).await.unwrap();

        let mut handle = driver.open(path.to_str().unwrap(), OpenFlags::read_only(), 0).await.unwrap();
        let mut buf = [0u8; 5];
        let read = driver.read(&mut handle, &mut buf).await.unwrap();
        assert_eq!(read, 5);
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn stat_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obj.bin");
        let driver = UnixFsDriver;
        let mut handle = driver.open(path.to_str().unwrap(), OpenFlags::write_create(), 0o644).await.unwrap();
        driver.write(&mut handle, b"0123456789").await.unwrap();
        driver.close(&mut handle).await.unwrap();

        let stat = driver.stat(path.to_str().unwrap()).await.unwrap();
        assert_eq!(stat.size, 10);
    }

    #[tokio::test]
    async fn unlink_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obj.bin");
        let driver = UnixFsDriver;
        let mut handle = driver.open(path.to_str().unwrap(), OpenFlags::write_create(), 0o644).await.unwrap();
        driver.close(&mut handle).await.unwrap();

        driver.unlink(path.to_str().unwrap()).await.unwrap();
        assert!(driver.stat(path.to_str().unwrap()).await.is_err());
    }
}
