// vim: tw=80
//! Common type definitions used throughout eoraid

use divbuf::{DivBuf, DivBufMut};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Indexes a data column within a stripe.
pub type ColT = u16;

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so it
/// can have more than one owner.
pub type IoVec = DivBuf;

/// Mutable version of `IoVec`.  Uniquely owned.
pub type IoVecMut = DivBufMut;

/// Indexes a logical sector of the whole array.
pub type LbaT = u64;

/// Identifies one parity log region.
pub type RegionT = u32;

/// Indexes a sector on one unit.
pub type SectorT = u64;

/// Indexes a stripe of the array.
pub type StripeT = u64;

/// Indexes a physical unit (disk) of the array.
pub type UnitT = u16;

/// Which units of one stripe are unavailable.
///
/// `data` counts failed data units, `p` and `e` flag the two redundancy units.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct FaultPattern {
    pub data: u8,
    pub p: bool,
    pub e: bool,
}

impl FaultPattern {
    pub const NONE: FaultPattern = FaultPattern{data: 0, p: false, e: false};

    pub fn new(data: u8, p: bool, e: bool) -> Self {
        FaultPattern{data, p, e}
    }

    /// Total number of unavailable units
    pub fn total(&self) -> usize {
        usize::from(self.data) + usize::from(self.p) + usize::from(self.e)
    }

    pub fn is_fault_free(&self) -> bool {
        self.total() == 0
    }
}

impl Display for FaultPattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.data, u8::from(self.p), u8::from(self.e))
    }
}

/// eoraid's error type
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum Error {
    /// The stripe has lost more units than EvenOdd can tolerate.
    #[error("Fault tolerance exceeded with fault pattern {0}")]
    Config(FaultPattern),

    /// A physical read or write failed on the given unit.
    #[error("I/O error on unit {0}")]
    Io(UnitT),

    /// Every parity log buffer is in use.
    #[error("No parity log buffer available")]
    NoBufferAvailable,

    /// The region's parity log is being reintegrated.
    #[error("Reintegration in progress")]
    ReintInProgress,

    /// Parity logging is not enabled for the region.
    #[error("Parity logging is disabled")]
    LoggingDisabled,

    /// The on-disk parity log could not be parsed.
    #[error("Inconsistent parity log in region {region} at byte {offset}")]
    ReplayInconsistency {
        region: RegionT,
        offset: u64
    },

    /// The array configuration is unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// A request was malformed, for example misaligned or out of range.
    #[error("Invalid request: {0}")]
    InvalidRequest(&'static str),

    /// A dependency graph violated its structural invariants.
    #[error("Malformed DAG: {0}")]
    MalformedDag(&'static str),

    /// A buffer was still borrowed when a node tried to use it.
    #[error("Buffer busy")]
    BufferBusy,

    /// The operation's waiter was dropped before completion.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Is this error fatal for the whole array, as opposed to one request?
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ReplayInconsistency{..})
    }
}

/// eoraid's `Result` type
pub type Result<T = ()> = std::result::Result<T, Error>;

// LCOV_EXCL_STOP
