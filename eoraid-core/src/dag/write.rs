// vim: tw=80
//! DAG builders for writes
//!
//! Every builder except the large write works over the smallest range of
//! stripe-unit offsets that covers the request.  Redundancy for sectors
//! outside of that range is unaffected.

use tracing::warn;
use crate::{
    plog::{LogAddr, RecordKind},
    raid::{AccessStripeMap, Code, PhysDiskAddr, RedundancyView},
    types::*,
};
use super::{
    Dag,
    dispatch::{BuildCtx, Builder},
    node::*,
    read::double_recovery,
};

/// A surviving code, the node that reads it, and its old contents
type OldRedundancy = (Code, NodeId, BufSlice);

fn read_name(code: Code) -> &'static str {
    match code {
        Code::P => "Rp",
        Code::E => "Re",
    }
}

fn write_name(code: Code) -> &'static str {
    match code {
        Code::P => "Wnp",
        Code::E => "Wne",
    }
}

/// The request's new data for one run
fn new_data(ctx: &BuildCtx, req: BufId, pda: &PhysDiskAddr) -> BufSlice {
    BufSlice{buf: req, offset: pda.buf_offset, len: ctx.bytes(pda.nsectors)}
}

/// Data column of a run, which must be a data run
fn col_of(pda: &PhysDiskAddr) -> Result<ColT> {
    pda.col().ok_or(Error::InvalidRequest("redundancy run among data runs"))
}

/// Byte range of the redundancy that the request affects, relative to the
/// stripe unit
fn range(ctx: &BuildCtx, asm: &AccessStripeMap) -> (SectorT, usize) {
    let (r0, r1) = asm.data_range();
    (r0, ctx.bytes(r1 - r0))
}

/// Write the request's data to every surviving unit it touches
fn write_data(ctx: &BuildCtx, asm: &AccessStripeMap, dag: &mut Dag,
              req: BufId, preds: &[NodeId]) -> Result<()>
{
    for pda in asm.pdas.iter() {
        if asm.columns[usize::from(col_of(pda)?)].failed {
            continue;
        }
        dag.add_node("Wnd", WriteOp {
            unit: pda.unit,
            sector: pda.sector,
            src: new_data(ctx, req, pda)
        }, preds);
    }
    Ok(())
}

/// Persist one freshly computed redundancy range, either in place or through
/// the parity log.
///
/// # Parameters
///
/// - `kind`:       How the log should combine `src` with the old redundancy.
///                 Ignored when not logging.
/// - `src`:        New redundancy, or with `RecordKind::Update` the delta.
fn put_redundancy(ctx: &BuildCtx, asm: &AccessStripeMap, dag: &mut Dag,
                  code: Code, kind: RecordKind, src: BufSlice, pred: NodeId)
    -> Result<NodeId>
{
    let red = asm.redundancy(code)?;
    let id = if let Some(plog) = ctx.plog {
        let name = match kind {
            RecordKind::Overwrite => "Lpo",
            _ => "Lpu"
        };
        dag.add_node(name, LogOp {
            plog: plog.clone(),
            kind,
            addr: LogAddr{unit: red.unit, sector: red.sector},
            src
        }, &[pred])
    } else {
        dag.add_node(write_name(code),
            WriteOp{unit: red.unit, sector: red.sector, src}, &[pred])
    };
    Ok(id)
}

/// Read-modify-write of a few data units.
///
/// Reads the old data and the old redundancy, folds the difference between
/// old and new data into the redundancy, then writes both.  With parity
/// logging, the old redundancy isn't read.  Instead the difference itself is
/// logged, and the new data isn't written until every record is durable.
pub(super) fn small(ctx: &BuildCtx, asm: &AccessStripeMap,
                    view: RedundancyView, buf: IoVec) -> Result<Dag>
{
    let mut dag = Dag::new(Builder::SmallWrite(view));
    let hdr = dag.header();
    let req = dag.borrow_buf(buf);
    let (r0, rlen) = range(ctx, asm);

    let mut old = Vec::with_capacity(asm.pdas.len());
    let mut reads = Vec::with_capacity(asm.pdas.len());
    for pda in asm.pdas.iter() {
        let len = ctx.bytes(pda.nsectors);
        let b = dag.alloc(len);
        reads.push(dag.add_node("Rod",
            ReadOp{unit: pda.unit, sector: pda.sector, buf: b}, &[hdr]));
        old.push(BufSlice::whole(b, len));
    }

    let mut xors = Vec::new();
    let mut puts = Vec::new();
    for code in view.codes() {
        let mut preds = reads.clone();
        let init = if ctx.plog.is_some() {
            None
        } else {
            let red = asm.redundancy(code)?;
            let b = dag.alloc(rlen);
            preds.push(dag.add_node(read_name(code),
                ReadOp{unit: red.unit, sector: red.sector, buf: b}, &[hdr]));
            Some(BufSlice::whole(b, rlen))
        };
        let mut terms = Vec::with_capacity(2 * asm.pdas.len());
        for (pda, old) in asm.pdas.iter().zip(old.iter()) {
            let col = col_of(pda)?;
            let at = ctx.bytes(pda.offset - r0);
            terms.push(Term{code, col, src: *old, at});
            terms.push(Term{code, col, src: new_data(ctx, req, pda), at});
        }
        let dst = dag.alloc(rlen);
        let xor = dag.add_node("Xor",
            XorOp{codec: ctx.codec, dst, init, terms}, &preds);
        xors.push(xor);
        puts.push((code, BufSlice::whole(dst, rlen), xor));
    }
    let mut logged = Vec::new();
    for (code, src, xor) in puts {
        let id = put_redundancy(ctx, asm, &mut dag, code, RecordKind::Update,
            src, xor)?;
        if ctx.plog.is_some() {
            logged.push(id);
        }
    }
    let preds = if logged.is_empty() { xors } else { logged };
    write_data(ctx, asm, &mut dag, req, &preds)?;
    Ok(dag)
}

/// Overwrite an entire stripe.
///
/// Computes redundancy from the new data alone, so nothing need be read.
/// Lost data units are simply not written.  As with [`small`], logged
/// redundancy is durable before any data is written.
pub(super) fn large(ctx: &BuildCtx, asm: &AccessStripeMap,
                    view: RedundancyView, buf: IoVec) -> Result<Dag>
{
    let mut dag = Dag::new(Builder::LargeWrite(view));
    let hdr = dag.header();
    let req = dag.borrow_buf(buf);
    let len = ctx.unit_bytes();
    let mut logged = Vec::new();
    for code in view.codes() {
        let terms = asm.pdas.iter()
            .map(|pda| Ok(Term {
                code,
                col: col_of(pda)?,
                src: new_data(ctx, req, pda),
                at: 0
            })).collect::<Result<Vec<_>>>()?;
        let dst = dag.alloc(len);
        let xor = dag.add_node("Xor",
            XorOp{codec: ctx.codec, dst, init: None, terms}, &[hdr]);
        let id = put_redundancy(ctx, asm, &mut dag, code,
            RecordKind::Overwrite, BufSlice::whole(dst, len), xor)?;
        if ctx.plog.is_some() {
            logged.push(id);
        }
    }
    let preds = if logged.is_empty() { vec![hdr] } else { logged };
    write_data(ctx, asm, &mut dag, req, &preds)?;
    Ok(dag)
}

/// Read the request's range of every surviving data column and of the
/// surviving redundancy.
///
/// # Returns
///
/// The read nodes, each data column's old contents (`None` where lost), and
/// each surviving code's old contents.
fn read_range(ctx: &BuildCtx, asm: &AccessStripeMap, dag: &mut Dag,
              view: RedundancyView)
    -> Result<(Vec<NodeId>, Vec<Option<BufSlice>>, Vec<OldRedundancy>)>
{
    let hdr = dag.header();
    let (r0, rlen) = range(ctx, asm);
    let mut reads = Vec::new();
    let mut columns = Vec::with_capacity(asm.columns.len());
    for col in asm.columns.iter() {
        if col.failed {
            columns.push(None);
        } else {
            let b = dag.alloc(rlen);
            reads.push(dag.add_node("Rud",
                ReadOp{unit: col.unit, sector: asm.base + r0, buf: b},
                &[hdr]));
            columns.push(Some(BufSlice::whole(b, rlen)));
        }
    }
    let mut reds = Vec::new();
    for code in view.codes() {
        let red = asm.redundancy(code)?;
        let b = dag.alloc(rlen);
        let id = dag.add_node(read_name(code),
            ReadOp{unit: red.unit, sector: red.sector, buf: b}, &[hdr]);
        reds.push((code, id, BufSlice::whole(b, rlen)));
    }
    Ok((reads, columns, reds))
}

/// Update each surviving code from the old data in `columns`, once `pred` has
/// finished, and write the results and the new data.
fn update_redundancy(ctx: &BuildCtx, asm: &AccessStripeMap, dag: &mut Dag,
                     req: BufId, columns: &[Option<BufSlice>],
                     reds: &[OldRedundancy], pred: NodeId)
    -> Result<()>
{
    let (r0, _) = range(ctx, asm);
    let mut xors = Vec::with_capacity(reds.len());
    for (code, _, old_red) in reds.iter() {
        let mut terms = Vec::with_capacity(2 * asm.pdas.len());
        for pda in asm.pdas.iter() {
            let col = col_of(pda)?;
            let at = ctx.bytes(pda.offset - r0);
            let old = columns[usize::from(col)]
                .ok_or(Error::MalformedDag("column was never reconstructed"))?
                .sub(at, ctx.bytes(pda.nsectors));
            terms.push(Term{code: *code, col, src: old, at});
            terms.push(Term{code: *code, col, src: new_data(ctx, req, pda),
                            at});
        }
        let dst = dag.alloc(old_red.len);
        let xor = dag.add_node("Xor", XorOp {
            codec: ctx.codec,
            dst,
            init: Some(*old_red),
            terms
        }, &[pred]);
        put_redundancy(ctx, asm, dag, *code, RecordKind::Overwrite,
            BufSlice::whole(dst, old_red.len), xor)?;
        xors.push(xor);
    }
    write_data(ctx, asm, dag, req, &xors)
}

/// Write to a stripe that has lost the data unit being written.
///
/// The lost unit's old contents are first reconstructed, so the surviving
/// redundancy can be updated as if by a small write.  The new data for the
/// lost unit is then represented only by the redundancy.
pub(super) fn degraded(ctx: &BuildCtx, asm: &AccessStripeMap,
                       view: RedundancyView, buf: IoVec) -> Result<Dag>
{
    let failed = asm.failed_cols();
    let &[lost] = &failed[..] else {
        return Err(Error::Config(asm.fault));
    };
    let mut dag = Dag::new(Builder::DegradedWrite(view));
    let req = dag.borrow_buf(buf);
    let (_, rlen) = range(ctx, asm);
    let (mut reads, mut columns, reds) = read_range(ctx, asm, &mut dag, view)?;
    let (_, rp, red) = reds.iter()
        .find(|(code, _, _)| *code == view.primary)
        .copied()
        .ok_or(Error::MalformedDag("primary code was not read"))?;
    reads.push(rp);
    let (p, e) = match view.primary {
        Code::P => (Some(red), None),
        Code::E => (None, Some(red)),
    };
    let out = dag.alloc(rlen);
    let xrc = dag.add_node("Xrc", RecoveryOp {
        codec: ctx.codec,
        recovery: Recovery::Single{code: view.primary, col: lost},
        data: columns.clone(),
        p,
        e,
        out
    }, &reads);
    columns[usize::from(lost)] = Some(BufSlice::whole(out, rlen));
    // Every other read must finish before the updates start, too
    for (_, id, _) in reds.iter().filter(|(c, _, _)| *c != view.primary) {
        dag.add_edge(*id, xrc);
    }
    update_redundancy(ctx, asm, &mut dag, req, &columns, &reds, xrc)?;
    Ok(dag)
}

/// Write to a stripe that has lost two data units, at least one of which is
/// being written.
pub(super) fn double_degraded(ctx: &BuildCtx, asm: &AccessStripeMap,
                              buf: IoVec) -> Result<Dag>
{
    let failed = asm.failed_cols();
    let &[i, j] = &failed[..] else {
        return Err(Error::Config(asm.fault));
    };
    let view = RedundancyView::new(asm.fault)
        .ok_or(Error::Config(asm.fault))?;
    let mut dag = Dag::new(Builder::DoubleDegradedWrite);
    let req = dag.borrow_buf(buf);
    let (mut reads, mut columns, reds) = read_range(ctx, asm, &mut dag, view)?;
    let red = |code| reds.iter()
        .find(|(c, _, _)| *c == code)
        .copied()
        .ok_or(Error::Config(asm.fault));
    let (_, rp, p) = red(Code::P)?;
    let (_, re, e) = red(Code::E)?;
    reads.push(rp);
    let preads = reads.clone();
    reads.push(re);
    let (_, stage_b) = double_recovery(ctx, &mut dag, (i, j), &reads, &preads,
        &mut columns, p, e);
    update_redundancy(ctx, asm, &mut dag, req, &columns, &reds, stage_b)?;
    Ok(dag)
}

/// Write a stripe that has lost both redundancy units.
///
/// Nothing can be kept consistent, so just write the data.
pub(super) fn non_redundant(ctx: &BuildCtx, asm: &AccessStripeMap,
                            buf: IoVec) -> Result<Dag>
{
    warn!(stripe = asm.stripe, fault = %asm.fault,
          "writing without redundancy");
    let mut dag = Dag::new(Builder::NonRedundantWrite);
    let hdr = dag.header();
    let req = dag.borrow_buf(buf);
    dag.set_unprotected();
    write_data(ctx, asm, &mut dag, req, &[hdr])?;
    Ok(dag)
}

// LCOV_EXCL_STOP
