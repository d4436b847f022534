//! Error taxonomy for the data-object I/O core.
//!
//! A single flat enum rather than a nested hierarchy: every error that can
//! cross a component boundary in this crate is a variant here, tagged with
//! the information needed to both make a control-flow decision (is this
//! USER_INPUT, and so safe to short-circuit before any state change?) and to
//! log a diagnosable message (path, descriptor index, resource, driver
//! kind).

use std::fmt;

use crate::driver::DriverKind;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A single driver operation that can fail.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DriverOp {
    Open,
    Read,
    Write,
    Seek,
    Unlink,
    Stat,
    Stage,
    Sync,
}

impl fmt::Display for DriverOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriverOp::Open => "open",
            DriverOp::Read => "read",
            DriverOp::Write => "write",
            DriverOp::Seek => "seek",
            DriverOp::Unlink => "unlink",
            DriverOp::Stat => "stat",
            DriverOp::Stage => "stage",
            DriverOp::Sync => "sync",
        };
        f.write_str(s)
    }
}

/// Stable error taxonomy (spec §7). Each variant carries a fixed numeric
/// code via [`Error::code`], mirroring the iRODS convention of returning a
/// negative status instead of an opaque error type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // --- USER_INPUT ---------------------------------------------------
    /// Null or otherwise missing required input.
    NullInput,
    /// Path failed validation (empty, not absolute, contains NUL, etc).
    BadPath(String),
    /// A descriptor index was out of the valid range for the table.
    BadDescriptorIndex(i32),
    /// Two or more options on the same call are mutually exclusive.
    MutuallyExclusiveOptions(&'static str, &'static str),
    /// An option's value failed validation.
    InvalidOptionValue { keyword: &'static str, value: String },
    /// Server/resource bootstrap configuration failed to parse or
    /// referenced an unknown driver kind.
    InvalidConfig(String),

    // --- CATALOG ---------------------------------------------------------
    /// No rows matched the query. Callers decide whether this terminates a
    /// stream cleanly or is a hard miss for a point lookup.
    CatNoRowsFound,
    /// A uniqueness constraint was violated (duplicate replica number, etc).
    CatDuplicate(String),
    /// The catalog rejected the credentials used for this session.
    CatInvalidAuthentication,
    /// Catalog backend failed in a way not covered by the above.
    CatSqlErr(String),

    // --- DRIVER ------------------------------------------------------
    /// A driver call failed. Carries the operation, the driver kind, and a
    /// driver-specific negative code.
    Driver { op: DriverOp, kind: DriverKind, code: i64, detail: String },

    // --- RESOURCE ----------------------------------------------------
    /// A descriptor table (L1 or L3) has no free slots.
    ResourceExhausted(&'static str),
    /// Replica placement would violate the one-replica-per-resource
    /// invariant, or a compound resource's cache/archive split is broken.
    HierarchyError(String),
    /// A resource- or user-level quota was exceeded.
    QuotaExceeded,

    // --- FEDERATION --------------------------------------------------
    /// Could not establish or reuse a server-to-server connection.
    RemoteConnFail(String),
    /// The remote server's reply was not in the expected shape/version.
    RemoteProtocolMismatch(String),

    // --- CONCURRENCY ---------------------------------------------------
    /// A concurrent replication already holds the per-object-id advisory
    /// lock (spec §4.8 "the loser receives LOCK_CONTENTION and may retry").
    LockContention(i64),

    // --- INTERNAL ------------------------------------------------------
    /// A detectable programming-bug-level invariant was violated.
    InvariantViolated(&'static str),
}

impl Error {
    /// Stable numeric status code, analogous to the rods error codes this
    /// taxonomy is modeled on. Negative by convention; 0 is never returned.
    pub fn code(&self) -> i32 {
        match self {
            Error::NullInput => -1000,
            Error::BadPath(_) => -1001,
            Error::BadDescriptorIndex(_) => -1002,
            Error::MutuallyExclusiveOptions(..) => -1003,
            Error::InvalidOptionValue { .. } => -1004,
            Error::InvalidConfig(_) => -1005,

            Error::CatNoRowsFound => -2000,
            Error::CatDuplicate(_) => -2001,
            Error::CatInvalidAuthentication => -2002,
            Error::CatSqlErr(_) => -2003,

            Error::Driver { op, .. } => match op {
                DriverOp::Open => -3000,
                DriverOp::Read => -3001,
                DriverOp::Write => -3002,
                DriverOp::Seek => -3003,
                DriverOp::Unlink => -3004,
                DriverOp::Stat => -3005,
                DriverOp::Stage => -3006,
                DriverOp::Sync => -3007,
            },

            Error::ResourceExhausted(_) => -4000,
            Error::HierarchyError(_) => -4001,
            Error::QuotaExceeded => -4002,

            Error::RemoteConnFail(_) => -5000,
            Error::RemoteProtocolMismatch(_) => -5001,

            Error::LockContention(_) => -5500,

            Error::InvariantViolated(_) => -6000,
        }
    }

    /// True for errors that must short-circuit before any state change
    /// (spec §7: "USER_INPUT errors short-circuit before any state
    /// change").
    pub fn is_user_input(&self) -> bool {
        matches!(
            self,
            Error::NullInput
                | Error::BadPath(_)
                | Error::BadDescriptorIndex(_)
                | Error::MutuallyExclusiveOptions(..)
                | Error::InvalidOptionValue { .. }
                | Error::InvalidConfig(_)
        )
    }

    /// True for catalog-no-rows, the one error that is sometimes not an
    /// error at all (a clean stream terminator).
    pub fn is_no_rows(&self) -> bool {
        matches!(self, Error::CatNoRowsFound)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NullInput => write!(f, "null input"),
            Error::BadPath(p) => write!(f, "bad path: {p}"),
            Error::BadDescriptorIndex(i) => write!(f, "invalid descriptor index {i}"),
            Error::MutuallyExclusiveOptions(a, b) => {
                write!(f, "mutually exclusive options: {a} and {b}")
            }
            Error::InvalidOptionValue { keyword, value } => {
                write!(f, "invalid value {value:?} for {keyword}")
            }
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Error::CatNoRowsFound => write!(f, "no rows found"),
            Error::CatDuplicate(what) => write!(f, "duplicate: {what}"),
            Error::CatInvalidAuthentication => write!(f, "invalid catalog authentication"),
            Error::CatSqlErr(msg) => write!(f, "catalog error: {msg}"),
            Error::Driver { op, kind, code, detail } => {
                write!(f, "{kind:?} driver {op} failed ({code}): {detail}")
            }
            Error::ResourceExhausted(table) => write!(f, "{table} descriptor table exhausted"),
            Error::HierarchyError(msg) => write!(f, "replica hierarchy error: {msg}"),
            Error::QuotaExceeded => write!(f, "quota exceeded"),
            Error::RemoteConnFail(msg) => write!(f, "remote connection failed: {msg}"),
            Error::RemoteProtocolMismatch(msg) => write!(f, "remote protocol mismatch: {msg}"),
            Error::LockContention(object_id) => write!(f, "object {object_id} is locked by a concurrent replication"),
            Error::InvariantViolated(what) => write!(f, "invariant violated: {what}"),
        }
    }
}

impl std::error::Error for Error {}

/// Wraps a raw I/O failure into a tagged [`Error::Driver`] for the given
/// operation and driver kind. Used instead of a blanket `From<io::Error>`
/// because the same `io::Error` means a different [`DriverOp`] depending on
/// which driver call produced it.
pub fn driver_io_error(op: DriverOp, kind: DriverKind, err: std::io::Error) -> Error {
    Error::Driver { op, kind, code: err.raw_os_error().unwrap_or(-1) as i64, detail: err.to_string() }
}
