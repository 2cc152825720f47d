// vim: tw=80
//! The parity logging engine
//!
//! Rather than updating P and E in place, fault-free writes may append the
//! redundancy changes to a log.  The array's stripes are divided into
//! regions, each with its own on-disk log area on a dedicated log unit.
//! Records accumulate in in-core logs drawn from a shared, bounded buffer
//! pool.  Full in-core logs are flushed to the region's on-disk log, and
//! when that fills it is reintegrated: applied to the redundancy units and
//! cleared.
//!
//! Each region passes work through four FIFO queues, strictly in order:
//! appenders waiting for a buffer, full in-core logs waiting to be flushed,
//! logs being flushed, and appenders waiting for reintegration to finish.

use fixedbitset::FixedBitSet;
use futures::{
    StreamExt,
    TryStreamExt,
    channel::oneshot,
    stream::{FuturesOrdered, FuturesUnordered},
};
use std::{
    collections::{BTreeMap, VecDeque, btree_map::Entry},
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{debug, error, info, warn};
use crate::{
    config::ArrayConfig,
    types::*,
    util::{div_roundup, xor_into},
    vdev::{self, IoSubmitter},
};
use super::{
    format::{self, LogAddr, LogHeader, RECORD_HEADER_LEN, RecordKind},
    region::*,
};

/// The shared pool of in-core log buffers
#[derive(Debug, Default)]
struct Pool {
    free: Vec<Vec<u8>>,
    /// Regions with appenders waiting for a buffer, one entry per appender
    waiting: VecDeque<RegionT>,
}

/// The redundancy for a contiguous run of sectors, merged from log records
#[derive(Debug)]
struct Extent {
    addr: LogAddr,
    /// One entry per sector
    sectors: Vec<(RecordKind, Vec<u8>)>,
}

impl Extent {
    fn needs_old(&self) -> bool {
        self.sectors.iter().any(|(kind, _)| *kind == RecordKind::Update)
    }

    fn len(&self, bytes_per_sector: usize) -> usize {
        self.sectors.len() * bytes_per_sector
    }

    /// Compute the final redundancy from its old contents, if needed
    fn apply(&self, old: Option<&[u8]>, bytes_per_sector: usize) -> Vec<u8> {
        let mut image = Vec::with_capacity(self.len(bytes_per_sector));
        for (i, (kind, data)) in self.sectors.iter().enumerate() {
            let start = image.len();
            image.extend_from_slice(data);
            if *kind == RecordKind::Update {
                if let Some(old) = old {
                    let o = &old[i * bytes_per_sector..][..bytes_per_sector];
                    xor_into(&mut image[start..], o);
                }
            }
        }
        image
    }
}

/// Merge records in log order, sector by sector.  Later Overwrites win, and
/// Updates accumulate.
fn merge(records: &[format::LogRecord], bytes_per_sector: usize)
    -> Vec<Extent>
{
    let mut merged = BTreeMap::<LogAddr, (RecordKind, Vec<u8>)>::new();
    for rec in records.iter() {
        let chunks = rec.payload.chunks_exact(bytes_per_sector);
        for (i, chunk) in chunks.enumerate() {
            match merged.entry(rec.addr.offset(i as SectorT)) {
                Entry::Vacant(v) => {
                    v.insert((rec.kind, chunk.to_vec()));
                }
                Entry::Occupied(mut o) => {
                    let (kind, data) = o.get_mut();
                    if rec.kind == RecordKind::Overwrite {
                        *kind = RecordKind::Overwrite;
                        data.copy_from_slice(chunk);
                    } else {
                        xor_into(data, chunk);
                    }
                }
            }
        }
    }
    let mut extents: Vec<Extent> = Vec::new();
    for (addr, sector) in merged.into_iter() {
        match extents.last_mut() {
            Some(ext) if ext.addr.unit == addr.unit &&
                ext.addr.sector + ext.sectors.len() as SectorT == addr.sector =>
            {
                ext.sectors.push(sector);
            }
            _ => extents.push(Extent{addr, sectors: vec![sector]})
        }
    }
    extents
}

/// Parity logging for one array
pub struct ParityLogging {
    bytes_per_sector: usize,
    sectors_per_unit: SectorT,
    core_log_bytes: usize,
    stripes_per_region: StripeT,
    log_unit: UnitT,
    io: Arc<dyn IoSubmitter>,
    pool: Mutex<Pool>,
    regions: Vec<Mutex<Region>>,
    /// Serializes each region's flushes, reintegrations and write-throughs
    io_locks: Vec<futures_locks::Mutex<()>>,
    /// Redundancy on these units is never read or written.  It will be
    /// rebuilt from the data.
    failed: Mutex<FixedBitSet>,
}

impl ParityLogging {
    /// Create the parity logging engine for an array.
    ///
    /// No I/O is performed.  Call [`format`](Self::format) for a new array,
    /// or [`recover`](Self::recover) for every region of an existing one.
    pub fn new(config: &ArrayConfig, io: Arc<dyn IoSubmitter>) -> Result<Self>
    {
        let plc = config.parity_log.as_ref()
            .ok_or(Error::InvalidConfig("parity logging is not configured"))?;
        let log_unit = config.log_unit()
            .ok_or(Error::InvalidConfig("parity logging is not configured"))?;
        if io.nunits() < config.backing_units() {
            return Err(Error::InvalidConfig("no unit for the parity log"));
        }
        if io.bytes_per_sector() != config.bytes_per_sector {
            return Err(Error::InvalidConfig("sector size mismatch"));
        }
        let bps = config.bytes_per_sector;
        let capacity = plc.region_log_sectors as usize * bps;
        let regions = (0..plc.regions)
            .map(|r| {
                let start = SectorT::from(r) * plc.region_log_sectors;
                Mutex::new(Region::new(r, capacity, start))
            }).collect::<Vec<_>>();
        let io_locks = (0..plc.regions)
            .map(|_| futures_locks::Mutex::new(()))
            .collect::<Vec<_>>();
        let free = (0..plc.pool_size)
            .map(|_| Vec::with_capacity(plc.core_log_bytes))
            .collect::<Vec<_>>();
        Ok(ParityLogging {
            bytes_per_sector: bps,
            sectors_per_unit: config.sectors_per_unit,
            core_log_bytes: plc.core_log_bytes,
            stripes_per_region: div_roundup(config.stripes,
                StripeT::from(plc.regions)),
            log_unit,
            io,
            pool: Mutex::new(Pool{free, waiting: VecDeque::new()}),
            regions,
            io_locks,
            failed: Mutex::new(FixedBitSet::with_capacity(config.nunits())),
        })
    }

    pub fn nregions(&self) -> RegionT {
        self.regions.len() as RegionT
    }

    /// The region that holds a stripe
    pub fn region_of_stripe(&self, stripe: StripeT) -> RegionT {
        (stripe / self.stripes_per_region) as RegionT
    }

    /// The region that holds a redundancy sector
    pub fn region_of(&self, addr: LogAddr) -> RegionT {
        self.region_of_stripe(addr.sector / self.sectors_per_unit)
    }

    fn region(&self, r: RegionT) -> Result<MutexGuard<'_, Region>> {
        self.regions.get(r as usize)
            .map(|m| m.lock().unwrap())
            .ok_or(Error::InvalidRequest("no such region"))
    }

    fn io_lock(&self, r: RegionT) -> Result<&futures_locks::Mutex<()>> {
        self.io_locks.get(r as usize)
            .ok_or(Error::InvalidRequest("no such region"))
    }

    /// Will writes to this region's stripes be logged?
    pub fn is_logging(&self, r: RegionT) -> bool {
        self.region(r).map(|reg| reg.logging_enabled).unwrap_or(false)
    }

    /// Mark a unit as failed, or as rebuilt.
    pub fn set_unit_failed(&self, unit: UnitT, failed: bool) {
        let mut fbs = self.failed.lock().unwrap();
        fbs.grow(usize::from(unit) + 1);
        fbs.set(usize::from(unit), failed);
    }

    fn is_unit_failed(&self, unit: UnitT) -> bool {
        self.failed.lock().unwrap().contains(usize::from(unit))
    }

    pub fn stats(&self, r: RegionT) -> Result<RegionStats> {
        self.region(r).map(|reg| reg.stats())
    }

    /// Return a buffer to the pool, or hand it to the longest waiter
    fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        loop {
            let waiter = {
                let mut pool = self.pool.lock().unwrap();
                match pool.waiting.pop_front() {
                    Some(r) => r,
                    None => {
                        pool.free.push(buf);
                        return;
                    }
                }
            };
            let tx = self.regions[waiter as usize].lock().unwrap()
                .buffer_wait
                .pop_front();
            if let Some(tx) = tx {
                match tx.send(buf) {
                    Ok(()) => return,
                    // That waiter gave up
                    Err(b) => buf = b
                }
            }
        }
    }

    fn append_locked(&self, reg: &mut Region, kind: RecordKind, addr: LogAddr,
                     payload: &[u8]) -> Result<LogHandle>
    {
        if kind == RecordKind::Stop {
            return Err(Error::InvalidRequest("cannot append a Stop record"));
        }
        if payload.is_empty() || payload.len() % self.bytes_per_sector != 0 {
            return Err(Error::InvalidRequest("partial-sector log record"));
        }
        let len = format::record_len(payload.len());
        if len > self.core_log_bytes {
            return Err(Error::InvalidRequest(
                "record larger than a log buffer"));
        }
        if reg.reint_in_progress {
            return Err(Error::ReintInProgress);
        }
        if !reg.logging_enabled {
            return Err(Error::LoggingDisabled);
        }
        if reg.core_log.as_ref()
            .is_some_and(|log| log.buf.len() + len > self.core_log_bytes)
        {
            reg.seal();
        }
        if reg.core_log.is_none() {
            if !reg.buffer_wait.is_empty() {
                // Don't cut in line
                return Err(Error::NoBufferAvailable);
            }
            let buf = self.pool.lock().unwrap().free.pop()
                .ok_or(Error::NoBufferAvailable)?;
            reg.core_log = Some(ParityLog::new(buf));
        }
        let seq = reg.next_seq;
        reg.next_seq += 1;
        let nsectors = (payload.len() / self.bytes_per_sector) as SectorT;
        if let Some(log) = reg.core_log.as_mut() {
            log.push(seq, kind, addr, payload, nsectors);
        }
        Ok(LogHandle{region: reg.id, seq})
    }

    /// Append a record to the in-core log without blocking.
    ///
    /// The record is not durable until [`sync`](Self::sync) completes.
    ///
    /// # Errors
    ///
    /// - `NoBufferAvailable`:  The in-core log is full and the pool is empty
    /// - `ReintInProgress`:    The region is being reintegrated
    /// - `LoggingDisabled`:    Logging is disabled for the region
    pub fn try_append(&self, kind: RecordKind, addr: LogAddr, payload: &[u8])
        -> Result<LogHandle>
    {
        let mut reg = self.region(self.region_of(addr))?;
        self.append_locked(&mut reg, kind, addr, payload)
    }

    /// Append a record to the in-core log, waiting for a buffer or for
    /// reintegration if necessary.
    pub async fn append(&self, kind: RecordKind, addr: LogAddr,
                        payload: &[u8]) -> Result<LogHandle>
    {
        enum Wait {
            Buffer(oneshot::Receiver<Vec<u8>>),
            Reint(oneshot::Receiver<()>),
        }

        let r = self.region_of(addr);
        loop {
            let wait = {
                let mut reg = self.region(r)?;
                match self.append_locked(&mut reg, kind, addr, payload) {
                    Err(Error::NoBufferAvailable) => {
                        let (tx, rx) = oneshot::channel();
                        reg.buffer_wait.push_back(tx);
                        self.pool.lock().unwrap().waiting.push_back(r);
                        Wait::Buffer(rx)
                    }
                    Err(Error::ReintInProgress) => {
                        let (tx, rx) = oneshot::channel();
                        reg.reint_wait.push_back(tx);
                        Wait::Reint(rx)
                    }
                    res => return res
                }
            };
            match wait {
                Wait::Buffer(rx) => {
                    debug!(region = r, "waiting for a log buffer");
                    self.reclaim(r).await?;
                    let buf = rx.await.map_err(|_| Error::Cancelled)?;
                    let spare = {
                        let mut reg = self.region(r)?;
                        if reg.core_log.is_none() && reg.logging_enabled {
                            reg.core_log = Some(ParityLog::new(buf));
                            None
                        } else {
                            Some(buf)
                        }
                    };
                    if let Some(buf) = spare {
                        self.release(buf);
                    }
                }
                Wait::Reint(rx) => {
                    // A dropped sender also means that reintegration is over
                    let _ = rx.await;
                }
            }
        }
    }

    /// Make room in the buffer pool by flushing this region's full logs, or
    /// else the region with the most buffered records.
    async fn reclaim(&self, r: RegionT) -> Result<()> {
        let own = !self.region(r)?.log_queue.is_empty();
        if own {
            return self.flush(r).await;
        }
        let victim = (0..self.nregions())
            .filter(|v| *v != r)
            .map(|v| (v, self.regions[v as usize].lock().unwrap()
                .buffered_bytes()))
            .filter(|(_, bytes)| *bytes > 0)
            .max_by_key(|(_, bytes)| *bytes)
            .map(|(v, _)| v);
        match victim {
            Some(v) => self.flush(v).await,
            None => Ok(())
        }
    }

    /// Wait until the record identified by `handle` is on disk.
    ///
    /// Flushes the region's in-core log if needed.  Concurrent callers share
    /// a single flush.
    pub async fn sync(&self, handle: LogHandle) -> Result<()> {
        let r = handle.region;
        let durable = self.region(r)?.durable_seq;
        if durable >= handle.seq {
            return Ok(());
        }
        let _guard = self.io_lock(r)?.lock().await;
        {
            let mut reg = self.region(r)?;
            if reg.durable_seq >= handle.seq {
                return Ok(());
            }
            reg.seal();
        }
        self.flush_locked(r).await
    }

    /// Append a record and wait until it is durable.
    ///
    /// If the region has stopped logging, apply the record directly to the
    /// redundancy instead.
    pub async fn log_and_sync(&self, kind: RecordKind, addr: LogAddr,
                              payload: IoVec) -> Result<()>
    {
        match self.append(kind, addr, &payload[..]).await {
            Ok(handle) => self.sync(handle).await,
            Err(Error::LoggingDisabled) =>
                self.write_through(kind, addr, &payload[..]).await,
            Err(e) => Err(e)
        }
    }

    async fn write_through(&self, kind: RecordKind, addr: LogAddr,
                           payload: &[u8]) -> Result<()>
    {
        let _guard = self.io_lock(self.region_of(addr))?.lock().await;
        if self.is_unit_failed(addr.unit) {
            return Ok(());
        }
        let image = match kind {
            RecordKind::Overwrite => payload.to_vec(),
            RecordKind::Update => {
                let mut old = self.read_sectors(addr.unit, addr.sector,
                    payload.len()).await?;
                xor_into(&mut old, payload);
                old
            }
            RecordKind::Stop =>
                return Err(Error::InvalidRequest("cannot apply a Stop record"))
        };
        debug!(%addr, ?kind, "writing redundancy through");
        self.write_sectors(addr.unit, addr.sector, image).await
    }

    /// Write the region's in-core log to its on-disk log.
    pub async fn flush(&self, r: RegionT) -> Result<()> {
        let _guard = self.io_lock(r)?.lock().await;
        self.region(r)?.seal();
        self.flush_locked(r).await
    }

    /// Flush every full in-core log.  The caller must hold the region's I/O
    /// lock.
    async fn flush_locked(&self, r: RegionT) -> Result<()> {
        loop {
            let prepared = self.region(r)?
                .prepare_flush(self.bytes_per_sector)?;
            let job = match prepared {
                Flushable::Nothing => return Ok(()),
                Flushable::Full => {
                    debug!(region = r, "parity log is full");
                    self.reintegrate_locked(r).await?;
                    continue;
                }
                Flushable::Ready(job) => job
            };
            let result = self.write_sectors(self.log_unit, job.sector,
                job.image.clone()).await;
            let bufs = {
                let mut reg = self.region(r)?;
                match result {
                    Ok(()) => reg.flushed(job),
                    Err(e) => {
                        error!(region = r, error = %e,
                               "failed to flush parity log");
                        reg.flush_failed();
                        return Err(e);
                    }
                }
            };
            for buf in bufs {
                self.release(buf);
            }
        }
    }

    /// Apply the region's log to the redundancy and clear it.
    ///
    /// Records still in memory are flushed first.
    #[tracing::instrument(skip(self))]
    pub async fn reintegrate(&self, r: RegionT) -> Result<()> {
        let _guard = self.io_lock(r)?.lock().await;
        self.region(r)?.seal();
        self.flush_locked(r).await?;
        self.reintegrate_locked(r).await
    }

    /// Reintegrate the on-disk log.  The caller must hold the region's I/O
    /// lock.  Appends fail with `ReintInProgress` meanwhile.
    async fn reintegrate_locked(&self, r: RegionT) -> Result<()> {
        self.region(r)?.reint_in_progress = true;
        let result = self.replay(r).await;
        let waiters = {
            let mut reg = self.region(r)?;
            reg.reint_in_progress = false;
            if result.is_ok() {
                reg.reintegrations += 1;
            }
            reg.take_reint_waiters()
        };
        for tx in waiters {
            let _ = tx.send(());
        }
        if let Err(e) = result {
            error!(region = r, error = %e, "parity log reintegration failed");
        }
        result
    }

    /// Replay the on-disk log against the redundancy.
    ///
    /// If the log contains any Updates, it is first rewritten as the
    /// equivalent Overwrites.  Replaying a log of Overwrites is idempotent, so
    /// a crash at any point leaves a log that can safely be replayed again.
    async fn replay(&self, r: RegionT) -> Result<()> {
        let bps = self.bytes_per_sector;
        let (log_start, tail, generation) = {
            let reg = self.region(r)?;
            (reg.log_start, reg.tail, reg.generation)
        };
        let len = div_roundup(tail + RECORD_HEADER_LEN, bps) * bps;
        let image = self.read_sectors(self.log_unit, log_start, len).await?;
        let log = format::parse(Some(r), &image, bps)?;
        if log.header.generation != generation {
            warn!(region = r, expected = generation,
                  found = log.header.generation,
                  "parity log generation changed underfoot");
        }
        let mut extents = merge(&log.records, bps);
        extents.retain(|ext| {
            let failed = self.is_unit_failed(ext.addr.unit);
            if failed {
                debug!(region = r, addr = %ext.addr,
                       "skipping redundancy on a failed unit");
            }
            !failed
        });

        let olds = extents.iter()
            .map(|ext| async move {
                if ext.needs_old() {
                    self.read_sectors(ext.addr.unit, ext.addr.sector,
                        ext.len(bps)).await.map(Some)
                } else {
                    Ok(None)
                }
            }).collect::<FuturesOrdered<_>>()
            .try_collect::<Vec<_>>()
            .await?;
        let images = extents.iter()
            .zip(olds.iter())
            .map(|(ext, old)| (ext.addr, ext.apply(old.as_deref(), bps)))
            .collect::<Vec<_>>();

        if extents.iter().any(Extent::needs_old) {
            let mut ckpt = Vec::with_capacity(len);
            LogHeader{region: r, generation: log.header.generation}
                .encode(&mut ckpt);
            for (addr, data) in images.iter() {
                format::encode_record(&mut ckpt, *addr, RecordKind::Overwrite,
                    data);
            }
            let ckpt_tail = ckpt.len();
            format::encode_stop(&mut ckpt);
            format::pad(&mut ckpt, bps);
            self.write_sectors(self.log_unit, log_start, ckpt.clone()).await?;
            self.region(r)?.set_tail(ckpt_tail, &ckpt, bps);
            debug!(region = r, records = log.records.len(),
                   extents = images.len(), "checkpointed parity log");
        }

        // Finish every write, even if one fails, so no surviving unit is left
        // out of date
        images.iter()
            .map(|(addr, data)| {
                self.write_sectors(addr.unit, addr.sector, data.clone())
            }).collect::<FuturesUnordered<_>>()
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        let next = log.header.generation + 1;
        let empty = format::empty_log(LogHeader{region: r, generation: next},
            bps);
        self.write_sectors(self.log_unit, log_start, empty).await?;
        self.region(r)?.reset(next);
        let sectors = images.iter().map(|(_, d)| d.len() / bps).sum::<usize>();
        info!(region = r, records = log.records.len(), sectors,
              "reintegrated parity log");
        Ok(())
    }

    /// Read a region's on-disk log and adopt its state, after a crash or a
    /// clean shutdown.
    ///
    /// Must be called before any records are appended to the region.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self, r: RegionT) -> Result<()> {
        let _guard = self.io_lock(r)?.lock().await;
        let (log_start, capacity) = {
            let reg = self.region(r)?;
            (reg.log_start, reg.capacity)
        };
        let image = self.read_sectors(self.log_unit, log_start, capacity)
            .await?;
        let log = format::parse(Some(r), &image, self.bytes_per_sector)
            .map_err(|e| {
                error!(region = r, error = %e, "unreadable parity log");
                e
            })?;
        debug!(region = r, generation = log.header.generation,
               records = log.records.len(), "recovered parity log");
        self.region(r)?.load(&log, &image, self.bytes_per_sector);
        Ok(())
    }

    /// Write an empty log for every region.
    pub async fn format(&self) -> Result<()> {
        for r in 0..self.nregions() {
            let _guard = self.io_lock(r)?.lock().await;
            let log_start = self.region(r)?.log_start;
            let empty = format::empty_log(LogHeader{region: r, generation: 0},
                self.bytes_per_sector);
            self.write_sectors(self.log_unit, log_start, empty).await?;
            self.region(r)?.reset(0);
        }
        Ok(())
    }

    /// Stop logging for a region, after reintegrating everything logged so
    /// far.
    ///
    /// Later records for this region are written through to the redundancy.
    #[tracing::instrument(skip(self))]
    pub async fn disable_logging(&self, r: RegionT) -> Result<()> {
        let _guard = self.io_lock(r)?.lock().await;
        {
            let mut reg = self.region(r)?;
            reg.logging_enabled = false;
            reg.seal();
        }
        self.flush_locked(r).await?;
        self.reintegrate_locked(r).await?;
        info!(region = r, "parity logging disabled");
        Ok(())
    }

    pub fn enable_logging(&self, r: RegionT) -> Result<()> {
        self.region(r)?.logging_enabled = true;
        Ok(())
    }

    async fn read_sectors(&self, unit: UnitT, sector: SectorT, len: usize)
        -> Result<Vec<u8>>
    {
        vdev::read_vec(&*self.io, unit, sector, len).await
    }

    async fn write_sectors(&self, unit: UnitT, sector: SectorT, data: Vec<u8>)
        -> Result<()>
    {
        vdev::write_vec(&*self.io, unit, sector, data).await
    }
}

// LCOV_EXCL_STOP
