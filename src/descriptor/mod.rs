//! Descriptor tables (C4, C5): fixed-capacity per-session arenas indexed by
//! a small integer, re-architected from the source's process-wide globals
//! into state owned by a [`crate::session::SessionContext`] (spec §9).

pub mod l1;
pub mod l3;

pub use l1::{ChecksumMode, L1Entry, L1Table, OperationType, RemoteRef};
pub use l3::{L3Entry, L3Table};

/// Indices below this are reserved and must be rejected by every handler
/// (spec §4.4: "Indices 0 and 1 are reserved").
pub const FIRST_VALID_INDEX: i32 = 2;
