// vim: tw=80

//! eoraid RAID layer
//!
//! The EvenOdd code, the mapping from logical requests to stripes, and the
//! array front end that executes requests as DAGs.

mod asm;
mod codec;
mod layout;
mod vdev_raid;

pub use self::asm::{
    AccessStripeMap,
    Column,
    PhysDiskAddr,
    RedundancyView,
    Role
};
pub use self::codec::{Code, EvenOdd};
pub use self::layout::EvenOddLayout;
pub use self::vdev_raid::VdevRaid;
