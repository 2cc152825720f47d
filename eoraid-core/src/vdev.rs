// vim: tw=80
//! The physical I/O seam
//!
//! Everything above this module addresses storage as `(unit, sector)` pairs.
//! Whatever actually moves the bytes implements [`IoSubmitter`].

use divbuf::DivBufShared;
use std::{
    fmt,
    num::NonZeroU8,
    pin::Pin
};
#[cfg(test)] use mockall::automock;
use crate::types::*;

/// Represents the health of an array
///
/// The ordering reflects which Health is "sicker".  That is, a degraded array
/// is sicker than an online one, a doubly-degraded array is sicker than a
/// singly-degraded one, etc.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum Health {
    /// Perfectly healthy
    Online,
    /// Operating with reduced redundancy
    Degraded(NonZeroU8),
    /// More units have failed than the code can tolerate.  No I/O is possible.
    Faulted,
}

impl Health {
    /// If this array is degraded, how many levels of redundancy is it missing?
    pub fn as_degraded(self) -> Option<NonZeroU8> {
        if let Health::Degraded(d) = self {
            Some(d)
        } else {
            None
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Online => "Online".fmt(f),
            Self::Degraded(n) => write!(f, "Degraded({})", n),
            Self::Faulted => "Faulted".fmt(f),
        }
    }
}

/// Future representing one physical I/O
pub type IoFut = dyn futures::Future<Output = Result<()>> + Send;

/// Boxed `IoFut`
pub type BoxIoFut = Pin<Box<IoFut>>;

/// Issues sector reads and writes to the units of an array.
///
/// Buffer lengths are always a whole number of sectors.  Implementations must
/// not retry failed operations; the engine never does either.
#[cfg_attr(test, automock)]
pub trait IoSubmitter: Send + Sync {
    /// Size of one sector in bytes
    fn bytes_per_sector(&self) -> usize;

    /// Number of units this submitter can address
    fn nunits(&self) -> usize;

    /// Read `buf.len()` bytes from `unit`, starting at `sector`.
    fn read_at(&self, buf: IoVecMut, unit: UnitT, sector: SectorT) -> BoxIoFut;

    /// Write all of `buf` to `unit`, starting at `sector`.
    fn write_at(&self, buf: IoVec, unit: UnitT, sector: SectorT) -> BoxIoFut;
}

/// Read `len` bytes into a new vector
pub async fn read_vec(io: &dyn IoSubmitter, unit: UnitT, sector: SectorT,
                      len: usize) -> Result<Vec<u8>>
{
    let dbs = DivBufShared::from(vec![0u8; len]);
    let dbm = dbs.try_mut().map_err(|_| Error::BufferBusy)?;
    io.read_at(dbm, unit, sector).await?;
    let db = dbs.try_const().map_err(|_| Error::BufferBusy)?;
    Ok(db[..].to_vec())
}

/// Write an owned vector
pub async fn write_vec(io: &dyn IoSubmitter, unit: UnitT, sector: SectorT,
                       data: Vec<u8>) -> Result<()>
{
    let dbs = DivBufShared::from(data);
    let db = dbs.try_const().map_err(|_| Error::BufferBusy)?;
    io.write_at(db, unit, sector).await
}

// LCOV_EXCL_STOP
