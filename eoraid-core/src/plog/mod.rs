// vim: tw=80

//! Parity logging
//!
//! Defers redundancy updates for fault-free stripes to per-region append
//! logs, which are later reintegrated into P and E.

pub mod format;
mod plog;
mod region;

pub use self::format::{LogAddr, RecordKind};
pub use self::plog::ParityLogging;
pub use self::region::{LogHandle, RegionState, RegionStats};
