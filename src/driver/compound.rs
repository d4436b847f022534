//! Compound-archive driver: the archive member of a CACHE+ARCHIVE resource
//! pair (spec §3 "Resource", §4.3 compound capability set, §4.8 step 2:
//! "stage: allocate cache-side replica row, open both L3s ... issue
//! stage_to_cache, update cache replica to GOOD").
//!
//! Grounded on `original_source/iRODS/lib/api/include/dataObjRepl.h`'s
//! `stageDataFromCompToCache`/`replToCacheRescOfCompObj`.

use async_trait::async_trait;

use crate::error::{driver_io_error, DriverOp, Result};

use super::{CompoundStageDriver, DriverKind, L3Driver, NativeHandle, OpenFlags, PhysicalStat, UnixFsDriver, Whence};

/// Archive-member driver for a compound resource. Base file operations are
/// identical to a plain POSIX resource (the archive member still stores
/// flat files in its vault); what distinguishes it is [`CompoundStageDriver`]:
/// staging copies archive bytes into the paired cache member, and syncing
/// copies them back.
#[derive(Debug, Default)]
pub struct CompoundDriver {
    inner: UnixFsDriver,
}

#[async_trait]
impl L3Driver for CompoundDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::CompoundArchive
    }

    async fn open(&self, phy_path: &str, flags: OpenFlags, mode: u32) -> Result<NativeHandle> {
        self.inner.open(phy_path, flags, mode).await
    }

    async fn close(&self, handle: &mut NativeHandle) -> Result<()> {
        self.inner.close(handle).await
    }

    async fn read(&self, handle: &mut NativeHandle, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(handle, buf).await
    }

    async fn write(&self, handle: &mut NativeHandle, buf: &[u8]) -> Result<usize> {
        self.inner.write(handle, buf).await
    }

    async fn lseek(&self, handle: &mut NativeHandle, offset: i64, whence: Whence) -> Result<i64> {
        self.inner.lseek(handle, offset, whence).await
    }

    async fn unlink(&self, phy_path: &str) -> Result<()> {
        self.inner.unlink(phy_path).await
    }

    async fn stat(&self, phy_path: &str) -> Result<PhysicalStat> {
        self.inner.stat(phy_path).await
    }
}

#[async_trait]
impl CompoundStageDriver for CompoundDriver {
    async fn stage(&self, archive_phy_path: &str, cache_phy_path: &str) -> Result<()> {
        if let Some(parent) = std::path::Path::new(cache_phy_path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| driver_io_error(DriverOp::Stage, DriverKind::CompoundArchive, e))?;
        }
        tokio::fs::copy(archive_phy_path, cache_phy_path)
            .await
            .map_err(|e| driver_io_error(DriverOp::Stage, DriverKind::CompoundArchive, e))?;
        Ok(())
    }

    async fn sync(&self, cache_phy_path: &str, archive_phy_path: &str) -> Result<()> {
        if let Some(parent) = std::path::Path::new(archive_phy_path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| driver_io_error(DriverOp::Sync, DriverKind::CompoundArchive, e))?;
        }
        tokio::fs::copy(cache_phy_path, archive_phy_path)
            .await
            .map_err(|e| driver_io_error(DriverOp::Sync, DriverKind::CompoundArchive, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stage_then_sync_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("archive/obj.bin");
        tokio::fs::create_dir_all(archive.parent().unwrap()).await.unwrap();
        tokio::fs::write(&archive, b"archived-bytes").await.unwrap();
        let cache = dir.path().join("cache/obj.bin");

        let driver = CompoundDriver::default();
        driver.stage(archive.to_str().unwrap(), cache.to_str().unwrap()).await.unwrap();
        assert_eq!(tokio::fs::read(&cache).await.unwrap(), b"archived-bytes");

        tokio::fs::write(&cache, b"edited-bytes").await.unwrap();
        driver.sync(cache.to_str().unwrap(), archive.to_str().unwrap()).await.unwrap();
        assert_eq!(tokio::fs::read(&archive).await.unwrap(), b"edited-bytes");
    }
}
