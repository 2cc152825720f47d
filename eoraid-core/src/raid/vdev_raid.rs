// vim: tw=80
//! The array front end
//!
//! Splits requests at stripe boundaries, builds one DAG per stripe according
//! to the current set of failed units, and runs them concurrently.

use divbuf::DivBufShared;
use fixedbitset::FixedBitSet;
use futures::{
    TryStreamExt,
    stream::{FuturesOrdered, FuturesUnordered},
};
use std::{
    collections::BTreeSet,
    num::NonZeroU8,
    sync::{Arc, Mutex, RwLock},
};
use tracing::{debug, info, warn};
use crate::{
    config::ArrayConfig,
    dag::{DagOptions, Request, build_dag},
    plog::ParityLogging,
    types::*,
    vdev::{self, Health, IoSubmitter},
};
use super::{
    asm::{AccessStripeMap, Role},
    codec::{Code, EvenOdd},
    layout::EvenOddLayout,
};

/// `VdevRaid`: an EvenOdd array
///
/// Tolerates the loss of any two units.
pub struct VdevRaid {
    config: ArrayConfig,

    codec: EvenOdd,

    layout: EvenOddLayout,

    /// Underlying units, plus the parity log's unit if configured
    io: Arc<dyn IoSubmitter>,

    /// Units that are currently unavailable.  They are neither read nor
    /// written until rebuilt.
    failed: RwLock<FixedBitSet>,

    /// Redundancy updates for fault-free stripes go here, if configured
    plog: Option<Arc<ParityLogging>>,

    /// Stripes written while both redundancy units were missing
    unprotected: Mutex<BTreeSet<StripeT>>,
}

impl VdevRaid {
    /// Construct an array on top of some units.  Performs no I/O.
    ///
    /// Most callers want [`create`](Self::create) or [`open`](Self::open).
    pub fn new(config: ArrayConfig, io: Arc<dyn IoSubmitter>) -> Result<Self>
    {
        config.validate()?;
        if io.nunits() < config.backing_units() {
            return Err(Error::InvalidConfig("too few units"));
        }
        if io.bytes_per_sector() != config.bytes_per_sector {
            return Err(Error::InvalidConfig("sector size mismatch"));
        }
        let plog = if config.parity_log.is_some() {
            Some(Arc::new(ParityLogging::new(&config, io.clone())?))
        } else {
            None
        };
        Ok(VdevRaid {
            codec: config.codec()?,
            layout: EvenOddLayout::new(&config),
            failed: RwLock::new(FixedBitSet::with_capacity(config.nunits())),
            config,
            io,
            plog,
            unprotected: Mutex::new(BTreeSet::new()),
        })
    }

    /// Create a new array, formatting its parity log.
    ///
    /// The units' contents must already be consistent, for example all
    /// zeros.
    pub async fn create(config: ArrayConfig, io: Arc<dyn IoSubmitter>)
        -> Result<Self>
    {
        let raid = Self::new(config, io)?;
        if let Some(plog) = raid.plog.as_ref() {
            plog.format().await?;
        }
        Ok(raid)
    }

    /// Open an existing array, reintegrating anything left in its parity
    /// log.
    pub async fn open(config: ArrayConfig, io: Arc<dyn IoSubmitter>)
        -> Result<Self>
    {
        let raid = Self::new(config, io)?;
        if let Some(plog) = raid.plog.as_ref() {
            for r in 0..plog.nregions() {
                plog.recover(r).await?;
                plog.reintegrate(r).await?;
            }
        }
        Ok(raid)
    }

    pub fn config(&self) -> &ArrayConfig {
        &self.config
    }

    pub fn layout(&self) -> &EvenOddLayout {
        &self.layout
    }

    pub fn parity_log(&self) -> Option<&Arc<ParityLogging>> {
        self.plog.as_ref()
    }

    /// Usable size, in sectors
    pub fn size(&self) -> LbaT {
        self.layout.size()
    }

    pub fn health(&self) -> Health {
        let nfailed = self.failed.read().unwrap().count_ones(..);
        match nfailed {
            0 => Health::Online,
            1 | 2 => NonZeroU8::new(nfailed as u8)
                .map(Health::Degraded)
                .unwrap_or(Health::Online),
            _ => Health::Faulted
        }
    }

    /// Number of stripes that were written without redundancy, and remain
    /// unprotected until their redundancy units are rebuilt
    pub fn needs_rebuild(&self) -> usize {
        self.unprotected.lock().unwrap().len()
    }

    fn check_unit(&self, unit: UnitT) -> Result<()> {
        if usize::from(unit) < self.config.nunits() {
            Ok(())
        } else {
            Err(Error::InvalidRequest("unit out of range"))
        }
    }

    /// Stop using a unit.
    ///
    /// Everything in the parity log is reintegrated first, and logging stays
    /// off until the array is healthy again, so that reconstruction never
    /// sees stale redundancy.
    #[tracing::instrument(skip(self))]
    pub async fn fault(&self, unit: UnitT) -> Result<()> {
        self.check_unit(unit)?;
        if let Some(plog) = self.plog.as_ref() {
            plog.set_unit_failed(unit, true);
            for r in 0..plog.nregions() {
                plog.disable_logging(r).await?;
            }
        }
        self.failed.write().unwrap().insert(usize::from(unit));
        warn!(unit, health = %self.health(), "unit faulted");
        Ok(())
    }

    fn map(&self, lba: LbaT, len: usize) -> Result<Vec<AccessStripeMap>> {
        let bps = self.config.bytes_per_sector;
        if len % bps != 0 {
            return Err(Error::InvalidRequest("partial-sector I/O"));
        }
        let failed = self.failed.read().unwrap();
        self.layout.map(lba, (len / bps) as SectorT, &failed)
    }

    fn dag_options(&self) -> DagOptions {
        DagOptions{parity_log: self.plog.clone()}
    }

    /// Build one DAG per stripe and run them all concurrently
    async fn run(&self, asms: &[AccessStripeMap], requests: Vec<Request>)
        -> Result<()>
    {
        let opts = self.dag_options();
        let dags = asms.iter()
            .zip(requests)
            .map(|(asm, req)| build_dag(&self.config, asm, req, &opts))
            .collect::<Result<Vec<_>>>()?;
        let io = &*self.io;
        dags.into_iter()
            .zip(asms.iter())
            .map(|(mut dag, asm)| async move {
                dag.execute(io).await?;
                if dag.is_unprotected() {
                    self.unprotected.lock().unwrap().insert(asm.stripe);
                }
                Ok(())
            }).collect::<FuturesUnordered<_>>()
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }

    /// Read `buf.len()` bytes starting at logical sector `lba`.
    pub async fn read_at(&self, mut buf: IoVecMut, lba: LbaT) -> Result<()> {
        let asms = self.map(lba, buf.len())?;
        let bps = self.config.bytes_per_sector;
        let requests = asms.iter()
            .map(|asm| Request::Read(buf.split_to(asm.len(bps))))
            .collect::<Vec<_>>();
        self.run(&asms, requests).await
    }

    /// Write all of `buf` starting at logical sector `lba`.
    pub async fn write_at(&self, mut buf: IoVec, lba: LbaT) -> Result<()> {
        let asms = self.map(lba, buf.len())?;
        let bps = self.config.bytes_per_sector;
        let requests = asms.iter()
            .map(|asm| Request::Write(buf.split_to(asm.len(bps))))
            .collect::<Vec<_>>();
        self.run(&asms, requests).await
    }

    /// Make every logged redundancy update durable.
    pub async fn sync_all(&self) -> Result<()> {
        if let Some(plog) = self.plog.as_ref() {
            for r in 0..plog.nregions() {
                plog.flush(r).await?;
            }
        }
        Ok(())
    }

    /// Read one stripe unit of every unit in a stripe
    async fn read_stripe(&self, stripe: StripeT) -> Result<Vec<Vec<u8>>> {
        let spu = self.config.sectors_per_unit;
        let len = self.config.unit_bytes();
        let io = &*self.io;
        (0..self.config.nunits() as UnitT)
            .map(|unit| vdev::read_vec(io, unit, stripe * spu, len))
            .collect::<FuturesOrdered<_>>()
            .try_collect::<Vec<_>>()
            .await
    }

    /// Check that a stripe's redundancy matches its data.
    ///
    /// Any logged redundancy updates for the stripe are reintegrated first.
    /// Every unit must be available.
    ///
    /// # Returns
    ///
    /// `true` if P and E are both correct
    pub async fn verify_stripe(&self, stripe: StripeT) -> Result<bool> {
        if stripe >= self.layout.stripes() {
            return Err(Error::InvalidRequest("stripe out of range"));
        }
        if self.failed.read().unwrap().count_ones(..) > 0 {
            return Err(Error::InvalidRequest("cannot verify a degraded array"));
        }
        if let Some(plog) = self.plog.as_ref() {
            plog.reintegrate(plog.region_of_stripe(stripe)).await?;
        }
        let units = self.read_stripe(stripe).await?;
        let data = (0..self.config.ndata as ColT)
            .map(|col| self.layout.data_unit(stripe, col))
            .map(|unit| &units[usize::from(unit)][..])
            .collect::<Vec<_>>();
        let p = &units[usize::from(self.layout.p_unit(stripe))];
        let e = &units[usize::from(self.layout.e_unit(stripe))];
        let ok = self.codec.verify(&data, p, e);
        if !ok {
            warn!(stripe, "inconsistent redundancy");
        }
        Ok(ok)
    }

    /// Read one whole stripe unit of data, reconstructing it if necessary
    async fn read_column(&self, stripe: StripeT, col: ColT) -> Result<Vec<u8>> {
        let asm = {
            let failed = self.failed.read().unwrap();
            self.layout.map_column(stripe, col, &failed)?
        };
        let dbs = DivBufShared::from(vec![0u8; self.config.unit_bytes()]);
        let dbm = dbs.try_mut().map_err(|_| Error::BufferBusy)?;
        self.run(std::slice::from_ref(&asm), vec![Request::Read(dbm)]).await?;
        let db = dbs.try_const().map_err(|_| Error::BufferBusy)?;
        Ok(db[..].to_vec())
    }

    /// Compute one code of a stripe from its data, reconstructing lost data
    /// as necessary
    async fn encode_stripe(&self, stripe: StripeT, code: Code)
        -> Result<Vec<u8>>
    {
        let ss = self.config.stripe_sectors();
        let unit_bytes = self.config.unit_bytes();
        let dbs = DivBufShared::from(vec![0u8; ss as usize *
            self.config.bytes_per_sector]);
        let dbm = dbs.try_mut().map_err(|_| Error::BufferBusy)?;
        self.read_at(dbm, stripe * ss).await?;
        let db = dbs.try_const().map_err(|_| Error::BufferBusy)?;
        let cols = db.chunks_exact(unit_bytes).collect::<Vec<_>>();
        let mut out = vec![0u8; unit_bytes];
        self.codec.encode(code, &cols, &mut out);
        Ok(out)
    }

    /// Reconstruct the contents of a failed unit, which must have been
    /// replaced by a blank one, and return it to service.
    ///
    /// Must not run concurrently with writes.
    #[tracing::instrument(skip(self))]
    pub async fn rebuild(&self, unit: UnitT) -> Result<()> {
        self.check_unit(unit)?;
        if !self.failed.read().unwrap().contains(usize::from(unit)) {
            return Err(Error::InvalidRequest("unit is not failed"));
        }
        info!(unit, "rebuilding");
        let spu = self.config.sectors_per_unit;
        for stripe in 0..self.layout.stripes() {
            let image = match self.layout.role_of(stripe, unit) {
                Role::Data(col) => self.read_column(stripe, col).await?,
                Role::P => self.encode_stripe(stripe, Code::P).await?,
                Role::E => self.encode_stripe(stripe, Code::E).await?,
            };
            vdev::write_vec(&*self.io, unit, stripe * spu, image).await?;
            debug!(unit, stripe, "rebuilt stripe unit");
        }
        let healthy = {
            let mut failed = self.failed.write().unwrap();
            failed.set(usize::from(unit), false);
            failed.count_ones(..) == 0
        };
        if let Some(plog) = self.plog.as_ref() {
            plog.set_unit_failed(unit, false);
        }
        if healthy {
            self.unprotected.lock().unwrap().clear();
            if let Some(plog) = self.plog.as_ref() {
                for r in 0..plog.nregions() {
                    plog.enable_logging(r)?;
                }
            }
        }
        info!(unit, health = %self.health(), "rebuild complete");
        Ok(())
    }
}

// LCOV_EXCL_STOP
