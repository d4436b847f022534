//! L1 descriptor table (C5): opened-logical-object handles.

use crate::catalog::{DataObjectMeta, ReplicaMeta, ReplicaStatus};
use crate::driver::OpenFlags;
use crate::error::{Error, Result};

use super::FIRST_VALID_INDEX;

/// Named operation-type flags, re-encoded from the source's raw `oprType`
/// bitfield (spec §9 design note).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct OperationType {
    pub put: bool,
    pub get: bool,
    pub replicate: bool,
    pub copy_src: bool,
    pub copy_dest: bool,
    pub stage: bool,
    pub purge_cache: bool,
}

/// Reference to the owning server when an L1 entry proxies a remote-zone
/// or remote-host operation (spec §3 "L1 descriptor entry",
/// §4.6 cross-zone forwarder). The connection itself is owned by the
/// session's [`crate::forwarder::Forwarder`]; this is just enough to find
/// it again and to know which remote L1 index to address.
#[derive(Debug, Clone)]
pub struct RemoteRef {
    pub zone: String,
    pub host: String,
    pub remote_l1_index: i32,
}

/// Checksum behavior requested at open time via `FORCE_CHKSUM`/
/// `VERIFY_CHKSUM` (spec §4.7 close semantics, §6 condition-keyword table).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChecksumMode {
    /// Compute and store a checksum on close regardless of any existing one.
    Force,
    /// Compute on close and compare against the cataloged checksum, if any.
    Verify,
}

/// One opened logical data object (spec §3 "L1 descriptor entry").
pub struct L1Entry {
    pub operation: OperationType,
    pub open_flags: OpenFlags,
    pub data_object: DataObjectMeta,
    /// The replica this L1 is reading/writing.
    pub replica: ReplicaMeta,
    /// Index into the session's L3 table, or `-1` if this entry proxies a
    /// remote operation and has no local physical file open.
    pub l3_index: i32,
    pub bytes_written: u64,
    pub remote: Option<RemoteRef>,
    pub stage_flag: bool,
    /// Number of sibling replicas still to be updated in an ALL-mode
    /// write (spec §4.7).
    pub copies_needed: i32,
    /// Status to persist to the catalog when this L1 closes.
    pub status_to_set_on_close: Option<ReplicaStatus>,
    /// Sibling L1 indices chained for ALL-mode fan-out, or the paired
    /// destination L1 for a copy operation (spec §3: "optional
    /// destination-replica L1 index (for copy pairs)").
    pub copy_pair: Vec<i32>,
    /// Checksum behavior to apply when this L1 closes.
    pub checksum_mode: Option<ChecksumMode>,
    /// Replica numbers to mark STALE on close without their own L1 entry —
    /// used by the FORCE_FLAG overwrite path, whose siblings are never
    /// individually opened (spec §4.7 "force/overwrite semantics").
    pub force_stale_replicas: Vec<i32>,
}

impl L1Entry {
    pub fn new(operation: OperationType, open_flags: OpenFlags, data_object: DataObjectMeta, replica: ReplicaMeta) -> Self {
        Self {
            operation,
            open_flags,
            data_object,
            replica,
            l3_index: -1,
            bytes_written: 0,
            remote: None,
            stage_flag: false,
            copies_needed: 0,
            status_to_set_on_close: None,
            copy_pair: Vec::new(),
            checksum_mode: None,
            force_stale_replicas: Vec::new(),
        }
    }
}

/// Fixed-capacity table of [`L1Entry`] slots (spec §4.4), same allocation
/// discipline as [`super::l3::L3Table`].
pub struct L1Table {
    slots: Vec<Option<L1Entry>>,
}

impl L1Table {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots }
    }

    pub fn allocate(&mut self, entry: L1Entry) -> Result<i32> {
        let start = FIRST_VALID_INDEX as usize;
        for (idx, slot) in self.slots.iter_mut().enumerate().skip(start) {
            if slot.is_none() {
                *slot = Some(entry);
                return Ok(idx as i32);
            }
        }
        Err(Error::ResourceExhausted("L1"))
    }

    pub fn get(&self, index: i32) -> Result<&L1Entry> {
        self.validate_index(index)?;
        self.slots[index as usize].as_ref().ok_or(Error::BadDescriptorIndex(index))
    }

    pub fn get_mut(&mut self, index: i32) -> Result<&mut L1Entry> {
        self.validate_index(index)?;
        self.slots[index as usize].as_mut().ok_or(Error::BadDescriptorIndex(index))
    }

    /// Releases a slot. An entry whose `copy_pair` is non-empty must have
    /// every paired index already released by the caller (spec §3: "An L1
    /// with a non-null copy-pair pointer is released only when both ends
    /// have been released") — enforced by the I/O state machine's close
    /// path, not by the table itself. Same for an entry whose `remote` is
    /// `Some`: dropping the pooled connection when its refcount reaches
    /// zero is the I/O close path's job (`crate::io::finalize_entry`), not
    /// this table's.
    pub fn release(&mut self, index: i32) -> Result<L1Entry> {
        self.validate_index(index)?;
        self.slots[index as usize].take().ok_or(Error::BadDescriptorIndex(index))
    }

    pub fn is_in_use(&self, index: i32) -> bool {
        self.validate_index(index).is_ok() && self.slots[index as usize].is_some()
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// All currently in-use indices, used by session teardown to cancel
    /// every outstanding L1 (spec §5 "Cancellation").
    pub fn in_use_indices(&self) -> Vec<i32> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i as i32))
            .collect()
    }

    fn validate_index(&self, index: i32) -> Result<()> {
        if index < FIRST_VALID_INDEX || index as usize >= self.slots.len() {
            return Err(Error::BadDescriptorIndex(index));
        }
        Ok(())
    }
}
