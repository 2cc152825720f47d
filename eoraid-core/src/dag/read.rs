// vim: tw=80
//! DAG builders for reads

use crate::{
    raid::{AccessStripeMap, Code, RedundancyView},
    types::*,
};
use super::{
    Dag,
    dispatch::{BuildCtx, Builder},
    node::*,
};

fn read_name(code: Code) -> &'static str {
    match code {
        Code::P => "Rp",
        Code::E => "Re",
    }
}

/// Read the requested data and nothing else
pub(super) fn fault_free(ctx: &BuildCtx, asm: &AccessStripeMap,
                         target: IoVecMut) -> Result<Dag>
{
    let mut dag = Dag::new(Builder::FaultFreeRead);
    let hdr = dag.header();
    for pda in asm.pdas.iter() {
        let len = ctx.bytes(pda.nsectors);
        let buf = dag.alloc(len);
        dag.add_node("Rod", ReadOp{unit: pda.unit, sector: pda.sector, buf},
            &[hdr]);
        dag.gather(pda.buf_offset, BufSlice::whole(buf, len));
    }
    dag.set_target(target);
    Ok(dag)
}

/// Read whole stripe units of every surviving data column.
///
/// # Returns
///
/// The read nodes and, for every data column, its buffer or `None` if lost
fn read_survivors(ctx: &BuildCtx, asm: &AccessStripeMap, dag: &mut Dag)
    -> (Vec<NodeId>, Vec<Option<BufSlice>>)
{
    let hdr = dag.header();
    let len = ctx.unit_bytes();
    let mut reads = Vec::with_capacity(asm.columns.len());
    let mut slices = Vec::with_capacity(asm.columns.len());
    for col in asm.columns.iter() {
        if col.failed {
            slices.push(None);
        } else {
            let buf = dag.alloc(len);
            reads.push(dag.add_node("Rud",
                ReadOp{unit: col.unit, sector: asm.base, buf}, &[hdr]));
            slices.push(Some(BufSlice::whole(buf, len)));
        }
    }
    (reads, slices)
}

/// Read a whole stripe unit of one redundancy column
fn read_redundancy(ctx: &BuildCtx, asm: &AccessStripeMap, dag: &mut Dag,
                   code: Code) -> Result<(NodeId, BufSlice)>
{
    let hdr = dag.header();
    let len = ctx.unit_bytes();
    let unit = asm.redundancy(code)?.unit;
    let buf = dag.alloc(len);
    let id = dag.add_node(read_name(code),
        ReadOp{unit, sector: asm.base, buf}, &[hdr]);
    Ok((id, BufSlice::whole(buf, len)))
}

/// Copy the requested sub-ranges out of whole-unit buffers
fn gather_columns(ctx: &BuildCtx, asm: &AccessStripeMap, dag: &mut Dag,
                  columns: &[Option<BufSlice>]) -> Result<()>
{
    for pda in asm.pdas.iter() {
        let col = pda.col()
            .ok_or(Error::InvalidRequest("redundancy run among data runs"))?;
        let src = columns[usize::from(col)]
            .ok_or(Error::MalformedDag("column was never reconstructed"))?;
        dag.gather(pda.buf_offset,
            src.sub(ctx.bytes(pda.offset), ctx.bytes(pda.nsectors)));
    }
    Ok(())
}

/// Reconstruct one lost data unit using the view's primary code.
///
/// Reads whole stripe units of every survivor and of the redundancy, so a
/// single RecoveryXor node can rebuild the lost unit, then copies out the
/// requested range.
pub(super) fn degraded(ctx: &BuildCtx, asm: &AccessStripeMap,
                       view: RedundancyView, target: IoVecMut) -> Result<Dag>
{
    let failed = asm.failed_cols();
    let &[lost] = &failed[..] else {
        return Err(Error::Config(asm.fault));
    };
    let mut dag = Dag::new(Builder::DegradedRead(view));
    let (mut reads, mut columns) = read_survivors(ctx, asm, &mut dag);
    let (rr, red) = read_redundancy(ctx, asm, &mut dag, view.primary)?;
    reads.push(rr);
    let len = ctx.unit_bytes();
    let out = dag.alloc(len);
    let (p, e) = match view.primary {
        Code::P => (Some(red), None),
        Code::E => (None, Some(red)),
    };
    dag.add_node("Xrc", RecoveryOp {
        codec: ctx.codec,
        recovery: Recovery::Single{code: view.primary, col: lost},
        data: columns.clone(),
        p,
        e,
        out
    }, &reads);
    columns[usize::from(lost)] = Some(BufSlice::whole(out, len));
    gather_columns(ctx, asm, &mut dag, &columns)?;
    dag.set_target(target);
    Ok(dag)
}

/// Add the two recovery stages for a stripe missing two data units.
///
/// Stage A recovers the lower column from both codes.  Stage B recovers the
/// higher one from P, the survivors, and stage A's output.
///
/// # Parameters
///
/// - `reads`:      Read nodes for every survivor and for P
/// - `preads`:     The subset of `reads` that stage B needs
/// - `columns`:    Per-column buffers, `None` for the lost ones.  Updated
///                 with the reconstructed columns.
///
/// # Returns
///
/// The node ids of both stages
pub(super) fn double_recovery(ctx: &BuildCtx, dag: &mut Dag,
                              lost: (ColT, ColT), reads: &[NodeId],
                              preads: &[NodeId],
                              columns: &mut [Option<BufSlice>],
                              p: BufSlice, e: BufSlice)
    -> (NodeId, NodeId)
{
    let (i, j) = lost;
    let len = p.len;
    let out_i = dag.alloc(len);
    let stage_a = dag.add_node("Xdc", RecoveryOp {
        codec: ctx.codec,
        recovery: Recovery::Double{want: i, other: j},
        data: columns.to_vec(),
        p: Some(p),
        e: Some(e),
        out: out_i
    }, reads);
    columns[usize::from(i)] = Some(BufSlice::whole(out_i, len));

    let out_j = dag.alloc(len);
    let mut bpreds = preads.to_vec();
    bpreds.push(stage_a);
    let stage_b = dag.add_node("Xrc", RecoveryOp {
        codec: ctx.codec,
        recovery: Recovery::Single{code: Code::P, col: j},
        data: columns.to_vec(),
        p: Some(p),
        e: None,
        out: out_j
    }, &bpreds);
    columns[usize::from(j)] = Some(BufSlice::whole(out_j, len));
    (stage_a, stage_b)
}

/// Reconstruct two lost data units
pub(super) fn double_degraded(ctx: &BuildCtx, asm: &AccessStripeMap,
                              target: IoVecMut) -> Result<Dag>
{
    let failed = asm.failed_cols();
    let &[i, j] = &failed[..] else {
        return Err(Error::Config(asm.fault));
    };
    let mut dag = Dag::new(Builder::DoubleDegradedRead);
    let (mut reads, mut columns) = read_survivors(ctx, asm, &mut dag);
    let (rp, p) = read_redundancy(ctx, asm, &mut dag, Code::P)?;
    reads.push(rp);
    let preads = reads.clone();
    let (re, e) = read_redundancy(ctx, asm, &mut dag, Code::E)?;
    reads.push(re);
    double_recovery(ctx, &mut dag, (i, j), &reads, &preads, &mut columns, p,
        e);
    gather_columns(ctx, asm, &mut dag, &columns)?;
    dag.set_target(target);
    Ok(dag)
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use divbuf::DivBufShared;
    use fixedbitset::FixedBitSet;
    use pretty_assertions::assert_eq;
    use crate::{
        config::ArrayConfig,
        dag::{DagOptions, Request, build_dag},
        raid::EvenOddLayout,
    };
    use super::*;

    fn config(ndata: usize) -> ArrayConfig {
        ArrayConfig {
            ndata,
            prime: 5,
            sectors_per_unit: 4,
            bytes_per_sector: 64,
            stripes: 8,
            parity_log: None
        }
    }

    fn build(config: &ArrayConfig, failed: &[usize], lba: LbaT,
             nsectors: SectorT) -> Dag
    {
        let layout = EvenOddLayout::new(config);
        let mut fbs = FixedBitSet::with_capacity(config.nunits());
        for f in failed {
            fbs.insert(*f);
        }
        let asm = layout.map(lba, nsectors, &fbs).unwrap().pop().unwrap();
        let len = nsectors as usize * config.bytes_per_sector;
        let dbs = DivBufShared::from(vec![0u8; len]);
        build_dag(config, &asm, Request::Read(dbs.try_mut().unwrap()),
            &DagOptions::default()).unwrap()
    }

    #[test]
    fn fault_free_shape() {
        let dag = build(&config(5), &[], 2, 8);
        assert_eq!(dag.builder(), Builder::FaultFreeRead);
        assert_eq!(dag.count(NodeKind::Read), 3);
        assert_eq!(dag.count(NodeKind::Terminate), 1);
        assert_eq!(dag.len(), 5);
        assert_eq!(dag.validate(), Ok(()));
    }

    /// With five data units and unit 2 failed, a degraded read reads the four
    /// survivors plus P, and recovers with one node that depends on all five.
    #[test]
    fn degraded_five_reads() {
        let dag = build(&config(5), &[2], 8, 2);
        assert_eq!(dag.count(NodeKind::Read), 5);
        assert_eq!(dag.count(NodeKind::RecoveryXor), 1);
        let (xrc, node) = dag.nodes()
            .find(|(_, n)| n.kind() == NodeKind::RecoveryXor)
            .unwrap();
        assert_eq!(node.preds().len(), 5);
        assert!(node.preds().iter()
            .all(|p| dag.node(*p).kind() == NodeKind::Read));
        assert_eq!(node.succs(), &[dag.terminal().unwrap()]);
        match node.op() {
            NodeOp::RecoveryOp(op) => {
                assert_eq!(op.recovery,
                    Recovery::Single{code: Code::P, col: 2});
                assert!(op.p.is_some());
                assert!(op.e.is_none());
            }
            _ => panic!("Wrong node type at {}", xrc)
        }
    }

    #[test]
    fn degraded_four_reads() {
        let dag = build(&config(4), &[2], 8, 2);
        assert_eq!(dag.count(NodeKind::Read), 4);
    }

    /// With P lost, E is relabeled as the recovery code
    #[test]
    fn degraded_relabeled() {
        // Stripe 0 of a 5+2 array: P is unit 5
        let dag = build(&config(5), &[2, 5], 8, 2);
        assert_eq!(dag.builder(), Builder::DegradedRead(RedundancyView {
            primary: Code::E,
            secondary: None
        }));
        let reads = dag.nodes()
            .filter_map(|(_, n)| match n.op() {
                NodeOp::ReadOp(op) => Some(op.unit),
                _ => None
            }).collect::<Vec<_>>();
        assert_eq!(reads, vec![0, 1, 3, 4, 6]);
    }

    #[test]
    fn double_degraded_shape() {
        let dag = build(&config(5), &[1, 3], 4, 4);
        assert_eq!(dag.builder(), Builder::DoubleDegradedRead);
        // Three survivors, P and E
        assert_eq!(dag.count(NodeKind::Read), 5);
        assert_eq!(dag.count(NodeKind::RecoveryXor), 2);
        let stages = dag.nodes()
            .filter(|(_, n)| n.kind() == NodeKind::RecoveryXor)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        let (a, b) = (stages[0], stages[1]);
        assert_eq!(dag.node(a).preds().len(), 5);
        // Stage B needs stage A, the three survivors and P, but not E
        assert!(dag.node(b).preds().contains(&a));
        assert_eq!(dag.node(b).preds().len(), 5);
        assert_eq!(dag.node(a).succs(), &[b]);
    }

    #[test]
    fn untouched_failure_reads_directly() {
        let dag = build(&config(5), &[1, 3], 0, 4);
        assert_eq!(dag.builder(), Builder::FaultFreeRead);
        assert_eq!(dag.count(NodeKind::Read), 1);
    }
}
// LCOV_EXCL_STOP
