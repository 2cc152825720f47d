// vim: tw=80
//! Per-region parity log state

use futures::channel::oneshot;
use std::{
    collections::{BTreeSet, VecDeque},
    mem,
};
use crate::{
    types::*,
    util::div_roundup,
};
use super::format::{
    self,
    HEADER_LEN,
    LogAddr,
    LogHeader,
    ParsedLog,
    RECORD_HEADER_LEN,
    RecordKind,
};

/// Identifies one appended record, so its caller can wait for it to become
/// durable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LogHandle {
    pub(super) region: RegionT,
    pub(super) seq: u64,
}

impl LogHandle {
    pub fn region(&self) -> RegionT {
        self.region
    }
}

/// What a region is currently doing
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegionState {
    /// No records are buffered in memory
    Idle,
    /// Records are buffered in memory, but not yet being written
    Logging,
    /// Buffered records are being written to the on-disk log
    Flushing,
    /// The on-disk log is being applied to the redundancy
    Reintegrating,
}

/// Read-only statistics about one region
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegionStats {
    pub state: RegionState,
    pub logging_enabled: bool,
    /// Appenders waiting for a log buffer
    pub buffer_waiters: usize,
    /// Full in-core logs waiting to be flushed
    pub queued_logs: usize,
    /// In-core logs currently being flushed
    pub flushing_logs: usize,
    /// Appenders waiting for reintegration to finish
    pub reint_waiters: usize,
    /// Bytes used by the on-disk log, excluding the Stop record
    pub log_bytes: usize,
    pub log_capacity: usize,
    /// Redundancy sectors with records in the on-disk log
    pub dirty_sectors: usize,
    pub generation: u64,
    pub records_logged: u64,
    pub reintegrations: u64,
}

/// An in-core log: encoded records bound for one region's on-disk log
#[derive(Debug)]
pub(super) struct ParityLog {
    pub buf: Vec<u8>,
    /// Sequence number of the newest record
    pub last_seq: u64,
    pub nrecords: u64,
    /// Redundancy covered by the records, as `(first sector, count)`
    pub extents: Vec<(LogAddr, SectorT)>,
}

impl ParityLog {
    pub fn new(buf: Vec<u8>) -> Self {
        ParityLog{buf, last_seq: 0, nrecords: 0, extents: Vec::new()}
    }

    pub fn push(&mut self, seq: u64, kind: RecordKind, addr: LogAddr,
                payload: &[u8], nsectors: SectorT)
    {
        format::encode_record(&mut self.buf, addr, kind, payload);
        self.last_seq = seq;
        self.nrecords += 1;
        self.extents.push((addr, nsectors));
    }
}

/// A batch of in-core logs, encoded and ready to write
#[derive(Debug)]
pub(super) struct FlushJob {
    /// Starts with the partial sector already on disk at the old tail
    pub image: Vec<u8>,
    pub sector: SectorT,
    tail: usize,
    tail_buf: Vec<u8>,
}

/// What `Region::prepare_flush` found to do
#[derive(Debug)]
pub(super) enum Flushable {
    /// No logs are queued
    Nothing,
    /// The on-disk log must be reintegrated before the next queued log will
    /// fit
    Full,
    Ready(FlushJob),
}

/// One region: a range of stripes that share an on-disk log
#[derive(Debug)]
pub(super) struct Region {
    pub id: RegionT,
    /// Size of the on-disk log area, in bytes
    pub capacity: usize,
    /// First sector of the on-disk log area, on the log unit
    pub log_start: SectorT,
    /// Byte offset of the on-disk log's Stop record
    pub tail: usize,
    /// The on-disk contents of the sector containing `tail`, up to `tail`
    pub tail_buf: Vec<u8>,
    pub generation: u64,
    pub logging_enabled: bool,
    pub reint_in_progress: bool,
    /// The log currently accepting records
    pub core_log: Option<ParityLog>,
    pub next_seq: u64,
    /// Every record with a sequence number at most this is on disk
    pub durable_seq: u64,
    pub buffer_wait: VecDeque<oneshot::Sender<Vec<u8>>>,
    pub log_queue: VecDeque<ParityLog>,
    pub flush_queue: VecDeque<ParityLog>,
    pub reint_wait: VecDeque<oneshot::Sender<()>>,
    /// Redundancy sectors that have records in the on-disk log
    pub disk_map: BTreeSet<LogAddr>,
    pub records_logged: u64,
    pub reintegrations: u64,
}

impl Region {
    pub fn new(id: RegionT, capacity: usize, log_start: SectorT) -> Self {
        let mut region = Region {
            id,
            capacity,
            log_start,
            tail: 0,
            tail_buf: Vec::new(),
            generation: 0,
            logging_enabled: true,
            reint_in_progress: false,
            core_log: None,
            next_seq: 1,
            durable_seq: 0,
            buffer_wait: VecDeque::new(),
            log_queue: VecDeque::new(),
            flush_queue: VecDeque::new(),
            reint_wait: VecDeque::new(),
            disk_map: BTreeSet::new(),
            records_logged: 0,
            reintegrations: 0,
        };
        region.reset(0);
        region
    }

    /// Record that the on-disk log was just cleared
    pub fn reset(&mut self, generation: u64) {
        self.generation = generation;
        self.tail = HEADER_LEN;
        self.tail_buf.clear();
        LogHeader{region: self.id, generation}.encode(&mut self.tail_buf);
        self.disk_map.clear();
    }

    /// Adopt the on-disk log that was just read and parsed
    pub fn load(&mut self, log: &ParsedLog, image: &[u8],
                bytes_per_sector: usize)
    {
        self.generation = log.header.generation;
        self.set_tail(log.tail, image, bytes_per_sector);
        self.disk_map.clear();
        for rec in log.records.iter() {
            for i in 0..rec.nsectors(bytes_per_sector) {
                self.disk_map.insert(rec.addr.offset(i));
            }
        }
    }

    /// Set the tail from a log image that starts at the log's first sector
    pub fn set_tail(&mut self, tail: usize, image: &[u8],
                    bytes_per_sector: usize)
    {
        let floor = tail / bytes_per_sector * bytes_per_sector;
        self.tail = tail;
        self.tail_buf = image[floor..tail].to_vec();
    }

    /// Retire the core log, so the next record starts a new one
    pub fn seal(&mut self) {
        if let Some(log) = self.core_log.take() {
            self.log_queue.push_back(log);
        }
    }

    /// Bytes of records buffered in memory
    pub fn buffered_bytes(&self) -> usize {
        self.core_log.iter()
            .chain(self.log_queue.iter())
            .map(|log| log.buf.len())
            .sum()
    }

    /// Move as many queued logs as will fit onto the flush queue, and encode
    /// them.
    pub fn prepare_flush(&mut self, bytes_per_sector: usize)
        -> Result<Flushable>
    {
        if self.log_queue.is_empty() {
            return Ok(Flushable::Nothing);
        }
        let mut len = 0;
        let mut n = 0;
        for log in self.log_queue.iter() {
            if self.tail + len + log.buf.len() + RECORD_HEADER_LEN >
                self.capacity
            {
                break;
            }
            len += log.buf.len();
            n += 1;
        }
        if n == 0 {
            if self.tail == HEADER_LEN {
                return Err(Error::InvalidConfig(
                    "in-core log is larger than the region log"));
            }
            return Ok(Flushable::Full);
        }
        let floor = self.tail / bytes_per_sector * bytes_per_sector;
        let mut image = Vec::with_capacity(self.tail - floor + len +
            RECORD_HEADER_LEN + bytes_per_sector);
        image.extend_from_slice(&self.tail_buf);
        for _ in 0..n {
            if let Some(log) = self.log_queue.pop_front() {
                image.extend_from_slice(&log.buf);
                self.flush_queue.push_back(log);
            }
        }
        let tail = self.tail + len;
        let new_floor = tail / bytes_per_sector * bytes_per_sector;
        let tail_buf = image[new_floor - floor..tail - floor].to_vec();
        format::encode_stop(&mut image);
        format::pad(&mut image, bytes_per_sector);
        debug_assert_eq!(image.len(),
            div_roundup(tail + RECORD_HEADER_LEN, bytes_per_sector) *
            bytes_per_sector - floor);
        let sector = self.log_start + (floor / bytes_per_sector) as SectorT;
        Ok(Flushable::Ready(FlushJob{image, sector, tail, tail_buf}))
    }

    /// The flush job succeeded.
    ///
    /// # Returns
    ///
    /// The flushed logs' buffers, for return to the pool
    pub fn flushed(&mut self, job: FlushJob) -> Vec<Vec<u8>> {
        self.tail = job.tail;
        self.tail_buf = job.tail_buf;
        let mut bufs = Vec::with_capacity(self.flush_queue.len());
        for log in self.flush_queue.drain(..) {
            self.durable_seq = self.durable_seq.max(log.last_seq);
            self.records_logged += log.nrecords;
            for (addr, n) in log.extents.iter() {
                for i in 0..*n {
                    self.disk_map.insert(addr.offset(i));
                }
            }
            bufs.push(log.buf);
        }
        debug_assert!(self.tail <= self.capacity);
        bufs
    }

    /// The flush job failed.  Put its logs back at the head of the queue.
    pub fn flush_failed(&mut self) {
        while let Some(log) = self.flush_queue.pop_back() {
            self.log_queue.push_front(log);
        }
    }

    /// Take everybody waiting for reintegration to finish
    pub fn take_reint_waiters(&mut self) -> VecDeque<oneshot::Sender<()>> {
        mem::take(&mut self.reint_wait)
    }

    pub fn state(&self) -> RegionState {
        if self.reint_in_progress {
            RegionState::Reintegrating
        } else if !self.flush_queue.is_empty() {
            RegionState::Flushing
        } else if self.core_log.is_some() || !self.log_queue.is_empty() {
            RegionState::Logging
        } else {
            RegionState::Idle
        }
    }

    pub fn stats(&self) -> RegionStats {
        RegionStats {
            state: self.state(),
            logging_enabled: self.logging_enabled,
            buffer_waiters: self.buffer_wait.len(),
            queued_logs: self.log_queue.len(),
            flushing_logs: self.flush_queue.len(),
            reint_waiters: self.reint_wait.len(),
            log_bytes: self.tail,
            log_capacity: self.capacity,
            dirty_sectors: self.disk_map.len(),
            generation: self.generation,
            records_logged: self.records_logged,
            reintegrations: self.reintegrations,
        }
    }
}

// LCOV_EXCL_STOP
