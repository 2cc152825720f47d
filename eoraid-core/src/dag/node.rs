// vim: tw=80
//! DAG nodes and the operations they perform

use divbuf::DivBufShared;
use enum_dispatch::enum_dispatch;
use std::{fmt, sync::Arc};
use crate::{
    plog::{LogAddr, ParityLogging, RecordKind},
    raid::{Code, EvenOdd},
    types::*,
    vdev::{BoxIoFut, IoSubmitter},
};

/// Index of a node within its `Dag`
pub type NodeId = usize;

/// Index of a buffer within its `Dag`'s `BufArena`
pub type BufId = usize;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeStatus {
    /// Waiting for predecessors
    Pending,
    /// Started but not yet complete
    Running,
    Succeeded,
    Failed,
    /// Never started, because the DAG failed first
    Skipped,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NodeKind {
    Read,
    Write,
    XorCombine,
    RecoveryXor,
    Log,
    Terminate,
    NoOp,
}

/// A byte range within one arena buffer
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BufSlice {
    pub buf: BufId,
    pub offset: usize,
    pub len: usize,
}

impl BufSlice {
    pub fn whole(buf: BufId, len: usize) -> Self {
        BufSlice{buf, offset: 0, len}
    }

    /// A sub-range, relative to this slice
    pub fn sub(&self, offset: usize, len: usize) -> Self {
        assert!(offset + len <= self.len, "sub-slice out of range");
        BufSlice{buf: self.buf, offset: self.offset + offset, len}
    }
}

enum Buffer {
    /// Allocated by the DAG
    Owned(DivBufShared),
    /// The caller's write data
    Borrowed(IoVec),
}

/// All buffers used by one DAG
#[derive(Default)]
pub struct BufArena {
    bufs: Vec<(Buffer, usize)>,
}

impl fmt::Debug for BufArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.bufs.iter().map(|(_, len)| len))
            .finish()
    }
}

impl BufArena {
    /// Allocate a zero-filled buffer
    pub fn alloc(&mut self, len: usize) -> BufId {
        let dbs = DivBufShared::from(vec![0u8; len]);
        self.bufs.push((Buffer::Owned(dbs), len));
        self.bufs.len() - 1
    }

    /// Register a caller-owned, read-only buffer
    pub fn borrowed(&mut self, iovec: IoVec) -> BufId {
        let len = iovec.len();
        self.bufs.push((Buffer::Borrowed(iovec), len));
        self.bufs.len() - 1
    }

    pub fn len(&self, id: BufId) -> usize {
        self.bufs[id].1
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// Get read-only access to a slice.
    ///
    /// Fails if some node is still filling the buffer.
    pub fn get(&self, s: BufSlice) -> Result<IoVec> {
        let (buf, len) = self.bufs.get(s.buf)
            .ok_or(Error::MalformedDag("no such buffer"))?;
        if s.offset + s.len > *len {
            return Err(Error::MalformedDag("slice past end of buffer"));
        }
        let db = match buf {
            Buffer::Owned(dbs) => dbs.try_const()
                .map_err(|_| Error::BufferBusy)?,
            Buffer::Borrowed(iovec) => iovec.clone()
        };
        Ok(db.slice(s.offset, s.offset + s.len))
    }

    /// Get exclusive access to a whole buffer.
    pub fn get_mut(&self, id: BufId) -> Result<IoVecMut> {
        match self.bufs.get(id) {
            Some((Buffer::Owned(dbs), _)) => dbs.try_mut()
                .map_err(|_| Error::BufferBusy),
            Some((Buffer::Borrowed(_), _)) =>
                Err(Error::MalformedDag("borrowed buffers are read-only")),
            None => Err(Error::MalformedDag("no such buffer"))
        }
    }
}

/// The outcome of starting a node
pub enum Started {
    /// The node finished synchronously
    Done,
    /// The node issued I/O, which completes with this future
    InFlight(BoxIoFut),
}

/// Operations that a DAG node can perform.
#[enum_dispatch]
pub trait Schedulable {
    fn kind(&self) -> NodeKind;

    /// Begin the operation.
    ///
    /// Compute nodes finish before returning.  I/O nodes return a future.
    fn start(&self, bufs: &BufArena, io: &dyn IoSubmitter) -> Result<Started>;
}

/// Read a whole arena buffer from one unit
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReadOp {
    pub unit: UnitT,
    pub sector: SectorT,
    pub buf: BufId,
}

impl Schedulable for ReadOp {
    fn kind(&self) -> NodeKind {
        NodeKind::Read
    }

    fn start(&self, bufs: &BufArena, io: &dyn IoSubmitter) -> Result<Started> {
        let dbm = bufs.get_mut(self.buf)?;
        Ok(Started::InFlight(io.read_at(dbm, self.unit, self.sector)))
    }
}

/// Write a slice to one unit
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WriteOp {
    pub unit: UnitT,
    pub sector: SectorT,
    pub src: BufSlice,
}

impl Schedulable for WriteOp {
    fn kind(&self) -> NodeKind {
        NodeKind::Write
    }

    fn start(&self, bufs: &BufArena, io: &dyn IoSubmitter) -> Result<Started> {
        let db = bufs.get(self.src)?;
        Ok(Started::InFlight(io.write_at(db, self.unit, self.sector)))
    }
}

/// One data column's contribution to a redundancy column
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Term {
    pub code: Code,
    pub col: ColT,
    pub src: BufSlice,
    /// Byte offset within the destination
    pub at: usize,
}

/// Compute redundancy: `dst = init ^ encode(terms)`.
///
/// With no `init`, this encodes from scratch.  With the old redundancy as
/// `init` and old and new data as terms, it performs a read-modify-write
/// update.
#[derive(Clone, Debug)]
pub struct XorOp {
    pub codec: EvenOdd,
    pub dst: BufId,
    pub init: Option<BufSlice>,
    pub terms: Vec<Term>,
}

impl Schedulable for XorOp {
    fn kind(&self) -> NodeKind {
        NodeKind::XorCombine
    }

    fn start(&self, bufs: &BufArena, _io: &dyn IoSubmitter) -> Result<Started>
    {
        let mut dst = bufs.get_mut(self.dst)?;
        match self.init {
            Some(init) => {
                let src = bufs.get(init)?;
                if src.len() != dst.len() {
                    return Err(Error::MalformedDag(
                        "XOR of mismatched lengths"));
                }
                dst[..].copy_from_slice(&src[..]);
            }
            None => dst[..].fill(0)
        }
        for t in self.terms.iter() {
            let src = bufs.get(t.src)?;
            if t.at + src.len() > dst.len() {
                return Err(Error::MalformedDag("XOR term out of range"));
            }
            self.codec.encode_col(t.code, usize::from(t.col), &src[..],
                &mut dst[t.at..t.at + src.len()]);
        }
        Ok(Started::Done)
    }
}

/// How a `RecoveryOp` reconstructs lost data
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Recovery {
    /// Reconstruct `col` from the other data columns and one code
    Single {
        code: Code,
        col: ColT,
    },
    /// Reconstruct `want` when both it and `other` are lost.  Needs P and E.
    Double {
        want: ColT,
        other: ColT,
    },
}

/// Reconstruct one lost data column
#[derive(Clone, Debug)]
pub struct RecoveryOp {
    pub codec: EvenOdd,
    pub recovery: Recovery,
    /// Every data column, `None` where lost
    pub data: Vec<Option<BufSlice>>,
    pub p: Option<BufSlice>,
    pub e: Option<BufSlice>,
    pub out: BufId,
}

impl Schedulable for RecoveryOp {
    fn kind(&self) -> NodeKind {
        NodeKind::RecoveryXor
    }

    fn start(&self, bufs: &BufArena, _io: &dyn IoSubmitter) -> Result<Started>
    {
        let data = self.data.iter()
            .map(|s| s.map(|s| bufs.get(s)).transpose())
            .collect::<Result<Vec<_>>>()?;
        let refs = data.iter()
            .map(|d| d.as_deref())
            .collect::<Vec<_>>();
        let red = |s: Option<BufSlice>| {
            s.ok_or(Error::MalformedDag("recovery lacks redundancy"))
                .and_then(|s| bufs.get(s))
        };
        let mut out = bufs.get_mut(self.out)?;
        match self.recovery {
            Recovery::Single{code, col} => {
                let r = match code {
                    Code::P => red(self.p)?,
                    Code::E => red(self.e)?,
                };
                self.codec.decode_one(code, usize::from(col), &refs, &r[..],
                    &mut out[..]);
            }
            Recovery::Double{want, other} => {
                let p = red(self.p)?;
                let e = red(self.e)?;
                let mut scratch = vec![0u8; out.len()];
                let (want, other) = (usize::from(want), usize::from(other));
                if want < other {
                    self.codec.decode_two((want, other), &refs, &p[..], &e[..],
                        &mut out[..], &mut scratch);
                } else {
                    self.codec.decode_two((other, want), &refs, &p[..], &e[..],
                        &mut scratch, &mut out[..]);
                }
            }
        }
        Ok(Started::Done)
    }
}

/// Append a redundancy record to the parity log and wait until it's durable
#[derive(Clone)]
pub struct LogOp {
    pub plog: Arc<ParityLogging>,
    pub kind: RecordKind,
    pub addr: LogAddr,
    pub src: BufSlice,
}

impl fmt::Debug for LogOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogOp")
            .field("kind", &self.kind)
            .field("addr", &self.addr)
            .field("src", &self.src)
            .finish()
    }
}

impl Schedulable for LogOp {
    fn kind(&self) -> NodeKind {
        NodeKind::Log
    }

    fn start(&self, bufs: &BufArena, _io: &dyn IoSubmitter) -> Result<Started>
    {
        let payload = bufs.get(self.src)?;
        let plog = self.plog.clone();
        let kind = self.kind;
        let addr = self.addr;
        Ok(Started::InFlight(Box::pin(async move {
            plog.log_and_sync(kind, addr, payload).await
        })))
    }
}

/// The DAG's single sink
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Terminate;

impl Schedulable for Terminate {
    fn kind(&self) -> NodeKind {
        NodeKind::Terminate
    }

    fn start(&self, _bufs: &BufArena, _io: &dyn IoSubmitter) -> Result<Started>
    {
        Ok(Started::Done)
    }
}

/// Does nothing.  Used for the DAG's header.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NoOp;

impl Schedulable for NoOp {
    fn kind(&self) -> NodeKind {
        NodeKind::NoOp
    }

    fn start(&self, _bufs: &BufArena, _io: &dyn IoSubmitter) -> Result<Started>
    {
        Ok(Started::Done)
    }
}

#[enum_dispatch(Schedulable)]
#[derive(Clone, Debug)]
pub enum NodeOp {
    ReadOp,
    WriteOp,
    XorOp,
    RecoveryOp,
    LogOp,
    Terminate,
    NoOp,
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use futures::FutureExt;
    use pretty_assertions::assert_eq;
    use crate::vdev::MockIoSubmitter;
    use super::*;

    #[test]
    fn arena_exclusive() {
        let mut arena = BufArena::default();
        let b = arena.alloc(16);
        let dbm = arena.get_mut(b).unwrap();
        assert_eq!(arena.get(BufSlice::whole(b, 16)).err(),
                   Some(Error::BufferBusy));
        drop(dbm);
        let db = arena.get(BufSlice::whole(b, 16)).unwrap();
        assert_eq!(arena.get_mut(b).err(), Some(Error::BufferBusy));
        drop(db);
    }

    #[test]
    fn arena_borrowed() {
        let dbs = DivBufShared::from(vec![1u8, 2, 3, 4]);
        let mut arena = BufArena::default();
        let b = arena.borrowed(dbs.try_const().unwrap());
        let s = arena.get(BufSlice{buf: b, offset: 1, len: 2}).unwrap();
        assert_eq!(&s[..], &[2, 3]);
        assert!(arena.get_mut(b).is_err());
        assert!(arena.get(BufSlice{buf: b, offset: 3, len: 2}).is_err());
        drop(s);
        drop(arena);
    }

    #[test]
    fn read_op() {
        let mut arena = BufArena::default();
        let b = arena.alloc(64);
        let mut io = MockIoSubmitter::new();
        io.expect_read_at()
            .once()
            .withf(|buf, unit, sector| {
                buf.len() == 64 && *unit == 3 && *sector == 9
            }).returning(|_, _, _| Box::pin(futures::future::ok(())));
        let op = NodeOp::from(ReadOp{unit: 3, sector: 9, buf: b});
        assert_eq!(op.kind(), NodeKind::Read);
        match op.start(&arena, &io).unwrap() {
            Started::InFlight(fut) => fut.now_or_never().unwrap().unwrap(),
            Started::Done => panic!("Reads shouldn't complete synchronously")
        }
    }

    #[test]
    fn xor_op_encodes() {
        let codec = EvenOdd::new(2, 3, 2).unwrap();
        let dbs = DivBufShared::from(vec![1u8, 2, 4, 8]);
        let mut arena = BufArena::default();
        let data = arena.borrowed(dbs.try_const().unwrap());
        let dst = arena.alloc(2);
        let terms = vec![
            Term{code: Code::E, col: 0, src: BufSlice{buf: data, offset: 0,
                 len: 2}, at: 0},
            Term{code: Code::E, col: 1, src: BufSlice{buf: data, offset: 2,
                 len: 2}, at: 0},
        ];
        let op = NodeOp::from(XorOp{codec, dst, init: None, terms});
        let io = MockIoSubmitter::new();
        assert!(matches!(op.start(&arena, &io), Ok(Started::Done)));
        let e = arena.get(BufSlice::whole(dst, 2)).unwrap();
        assert_eq!(&e[..], &[9, 14]);
        drop(e);
        drop(arena);
    }

    #[test]
    fn recovery_op_single() {
        let codec = EvenOdd::new(2, 3, 2).unwrap();
        let dbs = DivBufShared::from(vec![4u8, 8, 5, 10]);
        let mut arena = BufArena::default();
        let src = arena.borrowed(dbs.try_const().unwrap());
        let out = arena.alloc(2);
        let op = NodeOp::from(RecoveryOp {
            codec,
            recovery: Recovery::Single{code: Code::P, col: 0},
            data: vec![None, Some(BufSlice{buf: src, offset: 0, len: 2})],
            p: Some(BufSlice{buf: src, offset: 2, len: 2}),
            e: None,
            out
        });
        let io = MockIoSubmitter::new();
        assert!(matches!(op.start(&arena, &io), Ok(Started::Done)));
        let a0 = arena.get(BufSlice::whole(out, 2)).unwrap();
        assert_eq!(&a0[..], &[1, 2]);
        drop(a0);
        drop(arena);
    }

    #[test]
    fn recovery_op_without_redundancy() {
        let codec = EvenOdd::new(2, 3, 2).unwrap();
        let mut arena = BufArena::default();
        let src = arena.alloc(2);
        let out = arena.alloc(2);
        let op = NodeOp::from(RecoveryOp {
            codec,
            recovery: Recovery::Single{code: Code::E, col: 0},
            data: vec![None, Some(BufSlice::whole(src, 2))],
            p: None,
            e: None,
            out
        });
        let io = MockIoSubmitter::new();
        assert_eq!(op.start(&arena, &io).err(),
            Some(Error::MalformedDag("recovery lacks redundancy")));
    }
}
// LCOV_EXCL_STOP
