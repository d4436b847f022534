//! Mounted-filesystem driver: a special collection backed directly by a
//! host directory tree rather than by cataloged rows (spec §3 "Special
//! collection", §4.9 `MOUNTED_FS`).

use async_trait::async_trait;

use crate::error::{driver_io_error, DriverOp, Result};

use super::{DriverKind, L3Driver, NativeHandle, OpenFlags, PhysicalStat, UnixFsDriver, Whence};

/// A single entry found while scanning a mounted directory (spec §4.9:
/// "for MOUNTED_FS the driver performs a directory scan against the
/// underlying filesystem").
#[derive(Debug, Clone)]
pub struct MountedEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Driver for `DriverKind::MountedFs` resources. File I/O is delegated to
/// the same POSIX semantics as [`UnixFsDriver`]; the only thing this type
/// adds is [`MountedFsDriver::scan`], used by the collection cursor (C10)
/// to materialize children that have no catalog row.
#[derive(Debug, Default)]
pub struct MountedFsDriver {
    inner: UnixFsDriver,
}

impl MountedFsDriver {
    /// Lists the immediate children of a mounted directory path.
    pub async fn scan(&self, mount_phy_path: &str) -> Result<Vec<MountedEntry>> {
        let mut read_dir = tokio::fs::read_dir(mount_phy_path)
            .await
            .map_err(|e| driver_io_error(DriverOp::Stat, DriverKind::MountedFs, e))?;

        let mut entries = Vec::new();
        while let Some(entry) =
            read_dir.next_entry().await.map_err(|e| driver_io_error(DriverOp::Stat, DriverKind::MountedFs, e))?
        {
            let meta = entry
                .metadata()
                .await
                .map_err(|e| driver_io_error(DriverOp::Stat, DriverKind::MountedFs, e))?;
            entries.push(MountedEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: meta.is_dir(),
                size: meta.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

#[async_trait]
impl L3Driver for MountedFsDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::MountedFs
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
