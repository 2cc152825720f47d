// vim: tw=80
//! EvenOdd RAID reconstruction engine
//!
//! Requests are mapped onto stripes, turned into dependency graphs of I/O and
//! XOR nodes according to the stripe's fault pattern, and executed against an
//! [`IoSubmitter`](vdev::IoSubmitter).  Redundancy updates may optionally be
//! deferred to a per-region parity log.

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

// I use a common pattern of naming a module's main file after the module.
#![allow(clippy::module_inception)]

pub mod config;
pub mod dag;
pub mod plog;
pub mod raid;
pub mod types;
pub mod util;
pub mod vdev;
pub mod vdev_mem;

pub use crate::types::*;
pub use crate::util::*;
