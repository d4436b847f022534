//! L3 driver dispatch (C3): the capability-typed interface every resource
//! kind implements (spec §4.3).

mod bundle;
mod compound;
mod mounted;
mod unix;

pub use bundle::BundleDriver;
pub use compound::CompoundDriver;
pub use mounted::MountedFsDriver;
pub use unix::UnixFsDriver;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Origin point for an `lseek` call, mirroring POSIX `SEEK_SET`/`SEEK_CUR`/
/// `SEEK_END` (spec §4.3).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// Open-time flags, re-encoded as a named set rather than the source's raw
/// bitfield (spec §9 design note on `oprType`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenFlags {
    pub const fn read_only() -> Self {
        Self { read: true, write: false, create: false, truncate: false, append: false }
    }

    pub const fn write_create() -> Self {
        Self { read: false, write: true, create: true, truncate: false, append: false }
    }
}

/// Driver kind a resource advertises (spec §3 "Resource").
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DriverKind {
    Unix,
    Hpss,
    S3,
    HaawBundle,
    TarBundle,
    MountedFs,
    CompoundCache,
    CompoundArchive,
}

impl DriverKind {
    pub fn is_bundle(&self) -> bool {
        matches!(self, DriverKind::HaawBundle | DriverKind::TarBundle)
    }

    pub fn is_compound(&self) -> bool {
        matches!(self, DriverKind::CompoundCache | DriverKind::CompoundArchive)
    }
}

/// Opaque handle to a native open file, as returned by [`L3Driver::open`].
/// Plain-filesystem drivers stash a `tokio::fs::File`; bundle drivers stash
/// an index into a pre-parsed archive entry table. The type itself is a
/// black box to everything above C3 — C4 just holds one per descriptor.
pub enum NativeHandle {
    File(tokio::fs::File),
    /// Fully materialized in-memory content with a read/write cursor, used
    /// by the bundle driver for subfiles read directly out of an archive
    /// index rather than a staged cache copy.
    Memory { data: Vec<u8>, pos: usize },
}

/// Result of [`L3Driver::stat`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PhysicalStat {
    pub size: u64,
    pub mtime_unix: i64,
}

/// Per-resource-kind physical-file driver (spec §4.3). Every kind
/// implements the base six operations; bundle and compound kinds
/// additionally implement [`StageDriver`].
#[async_trait]
pub trait L3Driver: Send + Sync {
    fn kind(&self) -> DriverKind;

    async fn open(&self, phy_path: &str, flags: OpenFlags, mode: u32) -> Result<NativeHandle>;
    async fn close(&self, handle: &mut NativeHandle) -> Result<()>;
    async fn read(&self, handle: &mut NativeHandle, buf: &mut [u8]) -> Result<usize>;
    async fn write(&self, handle: &mut NativeHandle, buf: &[u8]) -> Result<usize>;
    async fn lseek(&self, handle: &mut NativeHandle, offset: i64, whence: Whence) -> Result<i64>;
    async fn unlink(&self, phy_path: &str) -> Result<()>;
    async fn stat(&self, phy_path: &str) -> Result<PhysicalStat>;
}

/// Additional capability set for bundle drivers (HAAW/TAR): staging a
/// subfile's bytes into a cache-resource physical file and syncing edits
/// back into the bundle (spec §4.3).
#[async_trait]
pub trait BundleStageDriver: L3Driver {
    async fn stage_to_cache(&self, bundle_phy_path: &str, cache_phy_path: &str) -> Result<()>;
    async fn sync_from_cache(&self, cache_phy_path: &str, bundle_phy_path: &str) -> Result<()>;
}

/// Additional capability set for compound-archive drivers: staging the
/// archive member's bytes into the paired cache member and syncing back
/// (spec §4.3, §4.8 step 2).
#[async_trait]
pub trait CompoundStageDriver: L3Driver {
    async fn stage(&self, archive_phy_path: &str, cache_phy_path: &str) -> Result<()>;
    async fn sync(&self, cache_phy_path: &str, archive_phy_path: &str) -> Result<()>;
}

/// Maps a [`Whence`] + current offset + requested offset onto a validated
/// new absolute offset, catching the `i64` overflow boundary case from
/// spec §8 ("offset 2^63-1 lseek on SEEK_CUR with non-zero value must
/// return an overflow error").
pub fn resolve_seek(current: i64, len_hint: Option<i64>, offset: i64, whence: Whence) -> Result<i64> {
    let base = match whence {
        Whence::Set => 0i64,
        Whence::Cur => current,
        Whence::End => len_hint.unwrap_or(0),
    };
    base.checked_add(offset)
        .filter(|v| *v >= 0)
        .ok_or(Error::InvariantViolated("lseek offset overflow"))
}

/// Hashes a handle's full contents by seeking to the start and streaming it
/// through sha2-256 (spec §4.7 close semantics, §4.10 recursive checksum).
/// Leaves the handle positioned at end-of-stream.
pub async fn hash_handle(driver: &dyn L3Driver, handle: &mut NativeHandle) -> Result<String> {
    use sha2::{Digest, Sha256};

    driver.lseek(handle, 0, Whence::Set).await?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = driver.read(handle, &mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha2:{:x}", hasher.finalize()))
}

/// Resolves a resource's driver kind to its base [`L3Driver`] (spec §4.3).
/// The compound cache member uses plain POSIX semantics, same as the unix
/// driver; `Hpss`/`S3` name real driver kinds a resource can declare but
/// have no backing implementation here (out of scope, same footing as wire
/// framing in spec.md §1 — a real deployment would load them the way the
/// rest of this crate loads `Unix`/`MountedFs`/bundle/compound).
pub fn dispatch(kind: DriverKind) -> Result<Arc<dyn L3Driver>> {
    match kind {
        DriverKind::Unix | DriverKind::CompoundCache => Ok(Arc::new(UnixFsDriver) as Arc<dyn L3Driver>),
        DriverKind::MountedFs => Ok(Arc::new(MountedFsDriver::default()) as Arc<dyn L3Driver>),
        DriverKind::CompoundArchive => Ok(Arc::new(CompoundDriver::default()) as Arc<dyn L3Driver>),
        DriverKind::TarBundle | DriverKind::HaawBundle => Ok(Arc::new(BundleDriver) as Arc<dyn L3Driver>),
        DriverKind::Hpss | DriverKind::S3 => {
            Err(Error::InvariantViolated("driver kind has no implementation in this build"))
        }
    }
}
