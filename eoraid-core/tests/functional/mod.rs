// vim: tw=80
//! End-to-end tests of whole arrays, backed by memory

use std::sync::Arc;

use divbuf::DivBufShared;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use eoraid_core::{
    config::{ArrayConfig, ParityLogConfig},
    raid::VdevRaid,
    types::*,
    vdev_mem::VdevMem,
};

macro_rules! t {
    ($e:expr) => (match $e {
        Ok(e) => e,
        Err(e) => panic!("{} failed with {:?}", stringify!($e), e),
    })
}

/// Helper to create a fresh array
#[derive(Debug)]
struct ArrayBuilder {
    ndata: usize,
    prime: usize,
    sectors_per_unit: SectorT,
    bytes_per_sector: usize,
    stripes: StripeT,
    parity_log: Option<ParityLogConfig>,
}

impl ArrayBuilder {
    fn new() -> Self {
        Self {
            ndata: 5,
            prime: 5,
            sectors_per_unit: 4,
            bytes_per_sector: 64,
            stripes: 16,
            parity_log: None,
        }
    }

    fn config(&self) -> ArrayConfig {
        ArrayConfig {
            ndata: self.ndata,
            prime: self.prime,
            sectors_per_unit: self.sectors_per_unit,
            bytes_per_sector: self.bytes_per_sector,
            stripes: self.stripes,
            parity_log: self.parity_log.clone(),
        }
    }

    fn geometry(&mut self, ndata: usize, prime: usize) -> &mut Self {
        self.ndata = ndata;
        self.prime = prime;
        self
    }

    fn parity_log(&mut self, regions: RegionT) -> &mut Self {
        self.parity_log = Some(ParityLogConfig {
            regions,
            region_log_sectors: 64,
            core_log_bytes: 1024,
            pool_size: 2,
        });
        self
    }

    /// Returns the backing store too, so tests can inject faults
    async fn build(&self) -> (VdevMem, VdevRaid) {
        let config = self.config();
        let sectors = config.unit_sectors().max(config.log_sectors());
        let mem = VdevMem::new(config.backing_units(), sectors,
            config.bytes_per_sector);
        let raid = t!(VdevRaid::create(config, Arc::new(mem.clone())).await);
        (mem, raid)
    }
}

fn random(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = XorShiftRng::seed_from_u64(seed);
    let mut v = vec![0u8; len];
    rng.fill(&mut v[..]);
    v
}

async fn write(raid: &VdevRaid, lba: LbaT, data: &[u8]) -> Result<()> {
    let dbs = DivBufShared::from(data.to_vec());
    let db = dbs.try_const().unwrap();
    raid.write_at(db, lba).await
}

async fn read(raid: &VdevRaid, lba: LbaT, len: usize) -> Result<Vec<u8>> {
    let dbs = DivBufShared::from(vec![0u8; len]);
    raid.read_at(dbs.try_mut().unwrap(), lba).await?;
    Ok(dbs.try_const().unwrap()[..].to_vec())
}

async fn verify_all(raid: &VdevRaid) {
    for s in 0..raid.layout().stripes() {
        assert!(t!(raid.verify_stripe(s).await), "stripe {s} is inconsistent");
    }
}

mod parity_log;
mod vdev_raid;
