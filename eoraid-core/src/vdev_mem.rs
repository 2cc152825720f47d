// vim: tw=80
//! An array of units backed by memory
//!
//! Used by the test suites and by the command line tool, which loads unit
//! images from files.  Supports simple fault injection.

use fixedbitset::FixedBitSet;
use std::sync::{Arc, Mutex};
use tracing::debug;
use crate::{
    types::*,
    vdev::{BoxIoFut, IoSubmitter}
};

#[derive(Debug)]
struct Inner {
    bytes_per_sector: usize,
    units: Mutex<Vec<Vec<u8>>>,
    /// Units that fail every operation
    faulted: Mutex<FixedBitSet>,
    /// One-shot write failures, by `(unit, sector)`
    write_faults: Mutex<Vec<(UnitT, SectorT)>>,
    reads: Mutex<Vec<u64>>,
    writes: Mutex<Vec<u64>>,
}

impl Inner {
    fn check_bounds(&self, unit: UnitT, sector: SectorT, len: usize,
                    units: &[Vec<u8>]) -> Result<usize>
    {
        let u = units.get(usize::from(unit))
            .ok_or(Error::InvalidRequest("unit out of range"))?;
        if len % self.bytes_per_sector != 0 {
            return Err(Error::InvalidRequest("partial-sector I/O"));
        }
        let start = usize::try_from(sector)
            .map_err(|_| Error::InvalidRequest("sector out of range"))?
            * self.bytes_per_sector;
        if start + len > u.len() {
            return Err(Error::InvalidRequest("I/O past end of unit"));
        }
        Ok(start)
    }

    fn is_faulted(&self, unit: UnitT) -> bool {
        self.faulted.lock().unwrap().contains(usize::from(unit))
    }

    fn read(&self, mut buf: IoVecMut, unit: UnitT, sector: SectorT)
        -> Result<()>
    {
        if self.is_faulted(unit) {
            return Err(Error::Io(unit));
        }
        let units = self.units.lock().unwrap();
        let start = self.check_bounds(unit, sector, buf.len(), &units)?;
        let len = buf.len();
        buf[..].copy_from_slice(&units[usize::from(unit)][start..start + len]);
        self.reads.lock().unwrap()[usize::from(unit)] += 1;
        Ok(())
    }

    fn write(&self, buf: IoVec, unit: UnitT, sector: SectorT) -> Result<()> {
        if self.is_faulted(unit) {
            return Err(Error::Io(unit));
        }
        let nsectors = (buf.len() / self.bytes_per_sector) as SectorT;
        {
            let mut faults = self.write_faults.lock().unwrap();
            let hit = faults.iter().position(|&(u, s)| {
                u == unit && s >= sector && s < sector + nsectors
            });
            if let Some(i) = hit {
                faults.remove(i);
                debug!(unit, sector, "injected write fault");
                return Err(Error::Io(unit));
            }
        }
        let mut units = self.units.lock().unwrap();
        let start = self.check_bounds(unit, sector, buf.len(), &units)?;
        units[usize::from(unit)][start..start + buf.len()]
            .copy_from_slice(&buf[..]);
        self.writes.lock().unwrap()[usize::from(unit)] += 1;
        Ok(())
    }
}

/// In-memory implementation of [`IoSubmitter`].
///
/// Cloning a `VdevMem` yields another handle to the same units.
#[derive(Clone, Debug)]
pub struct VdevMem {
    inner: Arc<Inner>
}

impl VdevMem {
    /// Create `nunits` zero-filled units.
    ///
    /// # Parameters
    ///
    /// - `nunits`:             Number of units, including any log unit
    /// - `sectors_per_unit`:   Size of each unit, in sectors
    /// - `bytes_per_sector`:   Sector size
    pub fn new(nunits: usize, sectors_per_unit: SectorT,
               bytes_per_sector: usize) -> Self
    {
        let len = sectors_per_unit as usize * bytes_per_sector;
        Self::from_parts(vec![vec![0u8; len]; nunits], bytes_per_sector)
    }

    /// Create units from existing images, one per unit.
    pub fn from_images(images: Vec<Vec<u8>>, bytes_per_sector: usize)
        -> Result<Self>
    {
        if bytes_per_sector == 0 {
            return Err(Error::InvalidConfig("zero-length sectors"));
        }
        if images.iter().any(|i| i.len() % bytes_per_sector != 0) {
            return Err(Error::InvalidConfig(
                "unit image is not a whole number of sectors"));
        }
        Ok(Self::from_parts(images, bytes_per_sector))
    }

    fn from_parts(units: Vec<Vec<u8>>, bytes_per_sector: usize) -> Self {
        let nunits = units.len();
        let inner = Inner {
            bytes_per_sector,
            units: Mutex::new(units),
            faulted: Mutex::new(FixedBitSet::with_capacity(nunits)),
            write_faults: Mutex::new(Vec::new()),
            reads: Mutex::new(vec![0; nunits]),
            writes: Mutex::new(vec![0; nunits]),
        };
        VdevMem{inner: Arc::new(inner)}
    }

    /// Make every subsequent operation on `unit` fail.
    pub fn fail_unit(&self, unit: UnitT) {
        self.inner.faulted.lock().unwrap().insert(usize::from(unit));
    }

    /// Make the next write covering `sector` of `unit` fail, without
    /// modifying the unit.
    pub fn fail_write_at(&self, unit: UnitT, sector: SectorT) {
        self.inner.write_faults.lock().unwrap().push((unit, sector));
    }

    /// Copy of a unit's current contents
    pub fn image(&self, unit: UnitT) -> Vec<u8> {
        self.inner.units.lock().unwrap()[usize::from(unit)].clone()
    }

    /// Overwrite part of a unit directly, bypassing fault injection.
    pub fn poke(&self, unit: UnitT, offset: usize, data: &[u8]) {
        let mut units = self.inner.units.lock().unwrap();
        units[usize::from(unit)][offset..offset + data.len()]
            .copy_from_slice(data);
    }

    /// Swap in a blank unit for a failed one, and let I/O reach it again.
    pub fn replace_unit(&self, unit: UnitT) {
        {
            let mut units = self.inner.units.lock().unwrap();
            let u = &mut units[usize::from(unit)];
            u.iter_mut().for_each(|b| *b = 0);
        }
        self.inner.faulted.lock().unwrap().set(usize::from(unit), false);
    }

    /// Number of successful reads issued to `unit`
    pub fn reads(&self, unit: UnitT) -> u64 {
        self.inner.reads.lock().unwrap()[usize::from(unit)]
    }

    /// Number of successful writes issued to `unit`
    pub fn writes(&self, unit: UnitT) -> u64 {
        self.inner.writes.lock().unwrap()[usize::from(unit)]
    }

    pub fn total_reads(&self) -> u64 {
        self.inner.reads.lock().unwrap().iter().sum()
    }

    pub fn total_writes(&self) -> u64 {
        self.inner.writes.lock().unwrap().iter().sum()
    }

    pub fn reset_counters(&self) {
        self.inner.reads.lock().unwrap().iter_mut().for_each(|c| *c = 0);
        self.inner.writes.lock().unwrap().iter_mut().for_each(|c| *c = 0);
    }
}

impl IoSubmitter for VdevMem {
    fn bytes_per_sector(&self) -> usize {
        self.inner.bytes_per_sector
    }

    fn nunits(&self) -> usize {
        self.inner.units.lock().unwrap().len()
    }

    fn read_at(&self, buf: IoVecMut, unit: UnitT, sector: SectorT) -> BoxIoFut
    {
        let inner = self.inner.clone();
        Box::pin(async move { inner.read(buf, unit, sector) })
    }

    fn write_at(&self, buf: IoVec, unit: UnitT, sector: SectorT) -> BoxIoFut {
        let inner = self.inner.clone();
        Box::pin(async move { inner.write(buf, unit, sector) })
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use divbuf::DivBufShared;
    use futures::FutureExt;
    use pretty_assertions::assert_eq;
    use super::*;

    #[test]
    fn read_after_write() {
        let vm = VdevMem::new(3, 4, 16);
        let dbs = DivBufShared::from(vec![0xa5u8; 32]);
        vm.write_at(dbs.try_const().unwrap(), 1, 2)
            .now_or_never().unwrap().unwrap();
        let rdbs = DivBufShared::from(vec![0u8; 48]);
        vm.read_at(rdbs.try_mut().unwrap(), 1, 1)
            .now_or_never().unwrap().unwrap();
        let rbuf = rdbs.try_const().unwrap();
        assert_eq!(&rbuf[0..16], &[0u8; 16][..]);
        assert_eq!(&rbuf[16..48], &[0xa5u8; 32][..]);
        assert_eq!(vm.writes(1), 1);
        assert_eq!(vm.reads(1), 1);
        assert_eq!(vm.total_reads(), 1);
    }

    #[test]
    fn out_of_bounds() {
        let vm = VdevMem::new(2, 4, 16);
        let dbs = DivBufShared::from(vec![0u8; 32]);
        let r = vm.read_at(dbs.try_mut().unwrap(), 0, 3)
            .now_or_never().unwrap();
        assert_eq!(r, Err(Error::InvalidRequest("I/O past end of unit")));
        let dbs = DivBufShared::from(vec![0u8; 32]);
        let r = vm.read_at(dbs.try_mut().unwrap(), 5, 0)
            .now_or_never().unwrap();
        assert_eq!(r, Err(Error::InvalidRequest("unit out of range")));
    }

    #[test]
    fn faulted_unit() {
        let vm = VdevMem::new(3, 4, 16);
        vm.fail_unit(2);
        let dbs = DivBufShared::from(vec![0u8; 16]);
        let r = vm.read_at(dbs.try_mut().unwrap(), 2, 0)
            .now_or_never().unwrap();
        assert_eq!(r, Err(Error::Io(2)));
        vm.replace_unit(2);
        let r = vm.read_at(dbs.try_mut().unwrap(), 2, 0)
            .now_or_never().unwrap();
        assert_eq!(r, Ok(()));
    }

    #[test]
    fn one_shot_write_fault() {
        let vm = VdevMem::new(1, 4, 16);
        vm.fail_write_at(0, 2);
        let dbs = DivBufShared::from(vec![1u8; 32]);
        // Doesn't cover sector 2
        let r = vm.write_at(dbs.try_const().unwrap(), 0, 0)
            .now_or_never().unwrap();
        assert_eq!(r, Ok(()));
        let r = vm.write_at(dbs.try_const().unwrap(), 0, 1)
            .now_or_never().unwrap();
        assert_eq!(r, Err(Error::Io(0)));
        assert_eq!(&vm.image(0)[32..48], &[0u8; 16][..]);
        let r = vm.write_at(dbs.try_const().unwrap(), 0, 1)
            .now_or_never().unwrap();
        assert_eq!(r, Ok(()));
    }

    #[test]
    fn from_images_misaligned() {
        let r = VdevMem::from_images(vec![vec![0u8; 17]], 16);
        assert!(matches!(r, Err(Error::InvalidConfig(_))));
    }
}
// LCOV_EXCL_STOP
