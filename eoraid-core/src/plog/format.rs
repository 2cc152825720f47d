// vim: tw=80
//! On-disk format of a region's parity log

use byteorder::{BigEndian, ByteOrder};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;
use crate::{types::*, util::div_roundup};

/*
 * On-disk Region Log Format:
 *
 * Magic:       8 bytes     "EOPARLOG"
 * Region:      4 bytes     Region id
 * Generation:  8 bytes     Incremented each time the log is cleared
 * Records:     variable
 * Stop:        13 bytes    A record header of kind Stop and length 0
 * Pad:         variable    Garbage fills the remainder of the sector
 *
 * Record Format:
 *
 * Address:     8 bytes     Unit in the high 16 bits, sector in the low 48
 * Kind:        1 byte      1: Update, 2: Overwrite
 * Length:      4 bytes     Length of Payload in bytes.  A whole number of
 *                          sectors.
 * Payload:     variable    Redundancy contents, or their XOR delta
 *
 * All integers are big-endian.
 */
pub const MAGIC: &[u8; MAGIC_LEN] = b"EOPARLOG";
const MAGIC_LEN: usize = 8;
pub const HEADER_LEN: usize = MAGIC_LEN + 4 + 8;
pub const RECORD_HEADER_LEN: usize = 8 + 1 + 4;
const SECTOR_BITS: u32 = 48;
const SECTOR_MASK: u64 = (1 << SECTOR_BITS) - 1;

/// How a record's payload combines with the redundancy it describes
#[derive(Clone, Copy, Debug, Eq, IntoPrimitive, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum RecordKind {
    /// Terminates the log.  Never stored in memory.
    Stop = 0,
    /// XOR the payload into the redundancy
    Update = 1,
    /// Replace the redundancy with the payload
    Overwrite = 2,
}

/// Physical address of a redundancy sector
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct LogAddr {
    pub unit: UnitT,
    pub sector: SectorT,
}

impl LogAddr {
    pub fn to_u64(self) -> u64 {
        debug_assert!(self.sector <= SECTOR_MASK);
        (u64::from(self.unit) << SECTOR_BITS) | (self.sector & SECTOR_MASK)
    }

    pub fn from_u64(raw: u64) -> Self {
        LogAddr {
            unit: (raw >> SECTOR_BITS) as UnitT,
            sector: raw & SECTOR_MASK
        }
    }

    /// The address `n` sectors later on the same unit
    pub fn offset(self, n: SectorT) -> Self {
        LogAddr{unit: self.unit, sector: self.sector + n}
    }
}

impl fmt::Display for LogAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.unit, self.sector)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LogHeader {
    pub region: RegionT,
    pub generation: u64,
}

impl LogHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        buf.extend_from_slice(&MAGIC[..]);
        buf.resize(start + HEADER_LEN, 0);
        let fields = &mut buf[start + MAGIC_LEN..];
        BigEndian::write_u32(&mut fields[0..4], self.region);
        BigEndian::write_u64(&mut fields[4..12], self.generation);
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN || buf[0..MAGIC_LEN] != MAGIC[..] {
            return None;
        }
        let region = BigEndian::read_u32(&buf[MAGIC_LEN..MAGIC_LEN + 4]);
        let generation = BigEndian::read_u64(&buf[MAGIC_LEN + 4..HEADER_LEN]);
        Some(LogHeader{region, generation})
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogRecord {
    pub addr: LogAddr,
    pub kind: RecordKind,
    pub payload: Vec<u8>,
}

impl LogRecord {
    /// Number of sectors that the payload covers
    pub fn nsectors(&self, bytes_per_sector: usize) -> SectorT {
        (self.payload.len() / bytes_per_sector) as SectorT
    }
}

/// Encoded length of a record with a payload of `len` bytes
pub fn record_len(len: usize) -> usize {
    RECORD_HEADER_LEN + len
}

fn encode_record_header(buf: &mut Vec<u8>, addr: u64, kind: RecordKind,
                        len: u32)
{
    let start = buf.len();
    buf.resize(start + RECORD_HEADER_LEN, 0);
    let hdr = &mut buf[start..];
    BigEndian::write_u64(&mut hdr[0..8], addr);
    hdr[8] = kind.into();
    BigEndian::write_u32(&mut hdr[9..13], len);
}

/// Append one record to `buf`.
pub fn encode_record(buf: &mut Vec<u8>, addr: LogAddr, kind: RecordKind,
                     payload: &[u8])
{
    debug_assert_ne!(kind, RecordKind::Stop);
    encode_record_header(buf, addr.to_u64(), kind, payload.len() as u32);
    buf.extend_from_slice(payload);
}

/// Append a Stop record to `buf`.
pub fn encode_stop(buf: &mut Vec<u8>) {
    encode_record_header(buf, 0, RecordKind::Stop, 0);
}

/// Zero-pad `buf` to a whole number of sectors
pub fn pad(buf: &mut Vec<u8>, bytes_per_sector: usize) {
    let len = div_roundup(buf.len(), bytes_per_sector) * bytes_per_sector;
    buf.resize(len, 0);
}

/// The image of an empty log, padded to a whole number of sectors
pub fn empty_log(header: LogHeader, bytes_per_sector: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(bytes_per_sector);
    header.encode(&mut buf);
    encode_stop(&mut buf);
    pad(&mut buf, bytes_per_sector);
    buf
}

/// A log read back from disk
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParsedLog {
    pub header: LogHeader,
    pub records: Vec<LogRecord>,
    /// Byte offset of the Stop record, where the next record will go
    pub tail: usize,
}

/// Parse a region's log.
///
/// Any deviation from the format is an error, reported with the byte offset
/// of the offending field.  Records are never skipped.
///
/// # Parameters
///
/// - `expected`:           The region that should own this log, if known
/// - `buf`:                The log image, starting at its header
/// - `bytes_per_sector`:   Every payload must be a whole number of sectors
pub fn parse(expected: Option<RegionT>, buf: &[u8], bytes_per_sector: usize)
    -> Result<ParsedLog>
{
    let bad = |offset: usize| Error::ReplayInconsistency {
        region: expected.unwrap_or(RegionT::MAX),
        offset: offset as u64
    };
    let header = LogHeader::decode(buf).ok_or_else(|| bad(0))?;
    if expected.is_some_and(|r| r != header.region) {
        return Err(bad(MAGIC_LEN));
    }
    let mut records = Vec::new();
    let mut off = HEADER_LEN;
    loop {
        if off + RECORD_HEADER_LEN > buf.len() {
            // Ran off the end without finding a Stop record
            return Err(bad(off));
        }
        let hdr = &buf[off..off + RECORD_HEADER_LEN];
        let raw_addr = BigEndian::read_u64(&hdr[0..8]);
        let kind = RecordKind::try_from(hdr[8]).map_err(|_| bad(off + 8))?;
        let len = BigEndian::read_u32(&hdr[9..13]) as usize;
        if kind == RecordKind::Stop {
            if len != 0 {
                return Err(bad(off + 9));
            }
            break;
        }
        if len == 0 || len % bytes_per_sector != 0 ||
            off + RECORD_HEADER_LEN + len > buf.len()
        {
            return Err(bad(off + 9));
        }
        let pstart = off + RECORD_HEADER_LEN;
        records.push(LogRecord {
            addr: LogAddr::from_u64(raw_addr),
            kind,
            payload: buf[pstart..pstart + len].to_vec()
        });
        off = pstart + len;
    }
    Ok(ParsedLog{header, records, tail: off})
}

// LCOV_EXCL_STOP
