// vim: tw=80
//! The per-request dependency graph and its executor

use futures::{
    FutureExt,
    StreamExt,
    stream::FuturesUnordered
};
use std::{collections::VecDeque, fmt};
use tracing::{debug, warn};
use crate::{
    types::*,
    vdev::IoSubmitter,
};
use super::{
    dispatch::Builder,
    node::*,
};

/// One node of a DAG.
///
/// A node's operation starts through its [`Schedulable`] op, but completion
/// is handled by the owning [`Dag`], which updates the node's status and
/// releases its successors, since that touches other nodes.
#[derive(Debug)]
pub struct DagNode {
    name: &'static str,
    op: NodeOp,
    preds: Vec<NodeId>,
    succs: Vec<NodeId>,
    /// Predecessors that haven't yet completed
    npending: usize,
    status: NodeStatus,
}

impl DagNode {
    /// Short mnemonic, like "Rod" for "Read Old Data"
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.op.kind()
    }

    pub fn op(&self) -> &NodeOp {
        &self.op
    }

    pub fn preds(&self) -> &[NodeId] {
        &self.preds
    }

    pub fn succs(&self) -> &[NodeId] {
        &self.succs
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DagStatus {
    /// Not yet executed
    Ready,
    Running,
    Succeeded,
    Failed(Error),
}

/// A directed acyclic graph of operations implementing one stripe's share of
/// one request.
///
/// Node 0 is always the header.  A complete DAG has exactly one node with no
/// predecessors, the header, and exactly one with no successors, a
/// `Terminate` node.
pub struct Dag {
    nodes: Vec<DagNode>,
    bufs: BufArena,
    builder: Builder,
    status: DagStatus,
    /// Copies into `target` performed after success: `(target offset, src)`
    gather: Vec<(usize, BufSlice)>,
    target: Option<IoVecMut>,
    unprotected: bool,
}

impl fmt::Debug for Dag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dag")
            .field("builder", &self.builder)
            .field("status", &self.status)
            .field("nodes", &self.nodes)
            .field("bufs", &self.bufs)
            .finish()
    }
}

impl Dag {
    pub(crate) fn new(builder: Builder) -> Self {
        let hdr = DagNode {
            name: "Hdr",
            op: NodeOp::from(NoOp),
            preds: Vec::new(),
            succs: Vec::new(),
            npending: 0,
            status: NodeStatus::Pending
        };
        Dag {
            nodes: vec![hdr],
            bufs: BufArena::default(),
            builder,
            status: DagStatus::Ready,
            gather: Vec::new(),
            target: None,
            unprotected: false
        }
    }

    /// Add a node that runs after all of `preds` complete.
    pub(crate) fn add_node<O>(&mut self, name: &'static str, op: O,
                              preds: &[NodeId]) -> NodeId
        where O: Into<NodeOp>
    {
        let id = self.nodes.len();
        self.nodes.push(DagNode {
            name,
            op: op.into(),
            preds: Vec::with_capacity(preds.len()),
            succs: Vec::new(),
            npending: 0,
            status: NodeStatus::Pending
        });
        for p in preds {
            self.add_edge(*p, id);
        }
        id
    }

    /// Make `to` depend on `from`
    pub(crate) fn add_edge(&mut self, from: NodeId, to: NodeId) {
        self.nodes[from].succs.push(to);
        self.nodes[to].preds.push(from);
        self.nodes[to].npending += 1;
    }

    pub(crate) fn alloc(&mut self, len: usize) -> BufId {
        self.bufs.alloc(len)
    }

    pub(crate) fn borrow_buf(&mut self, iovec: IoVec) -> BufId {
        self.bufs.borrowed(iovec)
    }

    /// After success, copy `src` into the target at `offset`
    pub(crate) fn gather(&mut self, offset: usize, src: BufSlice) {
        self.gather.push((offset, src));
    }

    pub(crate) fn set_target(&mut self, target: IoVecMut) {
        self.target = Some(target);
    }

    pub(crate) fn set_unprotected(&mut self) {
        self.unprotected = true;
    }

    /// Add the terminal node, succeeding every current sink.
    pub(crate) fn terminate(&mut self) -> NodeId {
        let sinks = self.nodes.iter()
            .enumerate()
            .filter(|(_, n)| n.succs.is_empty())
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        self.add_node("Trm", Terminate, &sinks)
    }

    pub fn builder(&self) -> Builder {
        self.builder
    }

    pub fn header(&self) -> NodeId {
        0
    }

    /// The `Terminate` node, if one has been added
    pub fn terminal(&self) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.kind() == NodeKind::Terminate)
    }

    /// Does this DAG write data without updating any redundancy?
    pub fn is_unprotected(&self) -> bool {
        self.unprotected
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &DagNode {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> impl Iterator<Item=(NodeId, &DagNode)> {
        self.nodes.iter().enumerate()
    }

    /// Count the nodes of one kind
    pub fn count(&self, kind: NodeKind) -> usize {
        self.nodes.iter().filter(|n| n.kind() == kind).count()
    }

    pub fn status(&self) -> DagStatus {
        self.status
    }

    /// Check the structural invariants: one header, one terminal, no cycles.
    pub fn validate(&self) -> Result<()> {
        let roots = self.nodes.iter().filter(|n| n.preds.is_empty()).count();
        if roots != 1 || !self.nodes[0].preds.is_empty() {
            return Err(Error::MalformedDag("DAG must have exactly one header"));
        }
        let sinks = self.nodes.iter()
            .filter(|n| n.succs.is_empty())
            .collect::<Vec<_>>();
        if sinks.len() != 1 {
            return Err(Error::MalformedDag(
                "DAG must have exactly one terminal"));
        }
        if sinks[0].kind() != NodeKind::Terminate {
            return Err(Error::MalformedDag("terminal is not a Terminate node"));
        }
        // Kahn's algorithm.  Any node never reached lies on a cycle.
        let mut indegree = self.nodes.iter()
            .map(|n| n.preds.len())
            .collect::<Vec<_>>();
        let mut queue = VecDeque::from([0]);
        let mut visited = 0;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for s in self.nodes[id].succs.iter() {
                indegree[*s] -= 1;
                if indegree[*s] == 0 {
                    queue.push_back(*s);
                }
            }
        }
        if visited != self.nodes.len() {
            return Err(Error::MalformedDag("DAG contains a cycle"));
        }
        Ok(())
    }

    fn start_node(&mut self, id: NodeId, io: &dyn IoSubmitter)
        -> Result<Started>
    {
        self.nodes[id].status = NodeStatus::Running;
        self.nodes[id].op.start(&self.bufs, io)
    }

    /// Record a node's completion.
    ///
    /// # Returns
    ///
    /// The successors that became eligible to start
    fn on_complete(&mut self, id: NodeId, result: Result<()>) -> Vec<NodeId> {
        match result {
            Ok(()) => {
                self.nodes[id].status = NodeStatus::Succeeded;
                if let DagStatus::Failed(_) = self.status {
                    return Vec::new();
                }
                let mut ready = Vec::new();
                for i in 0..self.nodes[id].succs.len() {
                    let s = self.nodes[id].succs[i];
                    self.nodes[s].npending -= 1;
                    if self.nodes[s].npending == 0 {
                        ready.push(s);
                    }
                }
                ready
            }
            Err(e) => {
                self.nodes[id].status = NodeStatus::Failed;
                if !matches!(self.status, DagStatus::Failed(_)) {
                    warn!(node = self.nodes[id].name, error = %e,
                          "DAG node failed");
                    self.status = DagStatus::Failed(e);
                }
                for n in self.nodes.iter_mut() {
                    if n.status == NodeStatus::Pending {
                        n.status = NodeStatus::Skipped;
                    }
                }
                Vec::new()
            }
        }
    }

    /// Run the DAG to completion.
    ///
    /// Nodes start as soon as all of their predecessors have succeeded.
    /// Compute nodes run inline; I/O nodes run concurrently.  If any node
    /// fails, no further nodes start, but I/O already in flight is allowed to
    /// finish.  Failed I/O is never retried.
    pub async fn execute(&mut self, io: &dyn IoSubmitter) -> Result<()> {
        if self.status != DagStatus::Ready {
            return Err(Error::MalformedDag("DAG already executed"));
        }
        self.validate()?;
        self.status = DagStatus::Running;
        debug!(builder = ?self.builder, nodes = self.nodes.len(),
               "executing DAG");
        let mut inflight = FuturesUnordered::new();
        let mut ready = VecDeque::from([self.header()]);
        loop {
            while let Some(id) = ready.pop_front() {
                if self.nodes[id].status != NodeStatus::Pending {
                    continue;
                }
                match self.start_node(id, io) {
                    Ok(Started::Done) => {
                        ready.extend(self.on_complete(id, Ok(())));
                    }
                    Ok(Started::InFlight(fut)) => {
                        inflight.push(fut.map(move |r| (id, r)));
                    }
                    Err(e) => {
                        self.on_complete(id, Err(e));
                    }
                }
            }
            match inflight.next().await {
                Some((id, r)) => ready.extend(self.on_complete(id, r)),
                None => break
            }
        }
        if let DagStatus::Failed(e) = self.status {
            self.target = None;
            return Err(e);
        }
        let terminal = self.terminal()
            .ok_or(Error::MalformedDag("DAG has no terminal"))?;
        if self.nodes[terminal].status != NodeStatus::Succeeded {
            let e = Error::MalformedDag("terminal never ran");
            self.status = DagStatus::Failed(e);
            return Err(e);
        }
        if let Some(mut target) = self.target.take() {
            for (offset, src) in self.gather.iter() {
                let db = self.bufs.get(*src)?;
                target[*offset..*offset + db.len()].copy_from_slice(&db[..]);
            }
        }
        self.status = DagStatus::Succeeded;
        Ok(())
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use divbuf::DivBufShared;
    use futures::{FutureExt, future};
    use mockall::Sequence;
    use pretty_assertions::assert_eq;
    use crate::{
        raid::RedundancyView,
        vdev::MockIoSubmitter,
    };
    use super::*;

    fn dag() -> Dag {
        Dag::new(Builder::FaultFreeRead)
    }

    #[test]
    fn validate_ok() {
        let mut dag = dag();
        let b = dag.alloc(16);
        let r = dag.add_node("Rod", ReadOp{unit: 0, sector: 0, buf: b}, &[0]);
        dag.add_node("Nop", NoOp, &[0, r]);
        let t = dag.terminate();
        assert_eq!(dag.validate(), Ok(()));
        assert_eq!(dag.terminal(), Some(t));
        assert_eq!(dag.node(t).preds(), &[2]);
    }

    #[test]
    fn validate_no_terminal() {
        let mut dag = dag();
        dag.add_node("Nop", NoOp, &[0]);
        assert_eq!(dag.validate(),
            Err(Error::MalformedDag("terminal is not a Terminate node")));
    }

    #[test]
    fn validate_two_sinks() {
        let mut dag = dag();
        dag.add_node("Nop", NoOp, &[0]);
        dag.add_node("Trm", Terminate, &[0]);
        assert_eq!(dag.validate(),
            Err(Error::MalformedDag("DAG must have exactly one terminal")));
    }

    #[test]
    fn validate_cycle() {
        let mut dag = dag();
        let a = dag.add_node("A", NoOp, &[0]);
        let b = dag.add_node("B", NoOp, &[a]);
        dag.add_edge(b, a);
        dag.terminate();
        assert_eq!(dag.validate(),
            Err(Error::MalformedDag("DAG contains a cycle")));
    }

    #[test]
    fn execute_gathers() {
        let mut dag = dag();
        let b0 = dag.alloc(4);
        let b1 = dag.alloc(4);
        dag.add_node("Rod", ReadOp{unit: 1, sector: 0, buf: b0}, &[0]);
        dag.add_node("Rod", ReadOp{unit: 2, sector: 0, buf: b1}, &[0]);
        dag.gather(4, BufSlice::whole(b0, 4));
        dag.gather(0, BufSlice::whole(b1, 4));
        let dbs = DivBufShared::from(vec![0u8; 8]);
        dag.set_target(dbs.try_mut().unwrap());
        dag.terminate();

        let mut io = MockIoSubmitter::new();
        io.expect_read_at()
            .times(2)
            .returning(|mut buf, unit, _| {
                buf[..].fill(unit as u8);
                Box::pin(future::ok(()))
            });
        dag.execute(&io).now_or_never().unwrap().unwrap();
        assert_eq!(dag.status(), DagStatus::Succeeded);
        assert_eq!(&dbs.try_const().unwrap()[..], &[2, 2, 2, 2, 1, 1, 1, 1]);
        assert!(dag.nodes().all(|(_, n)| n.status() == NodeStatus::Succeeded));
    }

    /// A write must not start before the read it depends on completes
    #[test]
    fn execute_respects_dependencies() {
        let mut dag = Dag::new(Builder::SmallWrite(
            RedundancyView::new(FaultPattern::NONE).unwrap()));
        let b = dag.alloc(4);
        let r = dag.add_node("Rod", ReadOp{unit: 0, sector: 0, buf: b}, &[0]);
        dag.add_node("Wnd", WriteOp{unit: 1, sector: 0,
            src: BufSlice::whole(b, 4)}, &[r]);
        dag.terminate();

        let mut seq = Sequence::new();
        let mut io = MockIoSubmitter::new();
        io.expect_read_at()
            .once()
            .in_sequence(&mut seq)
            .returning(|_, _, _| Box::pin(future::ok(())));
        io.expect_write_at()
            .once()
            .in_sequence(&mut seq)
            .returning(|_, _, _| Box::pin(future::ok(())));
        dag.execute(&io).now_or_never().unwrap().unwrap();
    }

    /// After a failure, nodes that haven't started are skipped
    #[test]
    fn execute_failure_skips() {
        let mut dag = dag();
        let b = dag.alloc(4);
        let r = dag.add_node("Rod", ReadOp{unit: 0, sector: 0, buf: b}, &[0]);
        let w = dag.add_node("Wnd", WriteOp{unit: 1, sector: 0,
            src: BufSlice::whole(b, 4)}, &[r]);
        let t = dag.terminate();

        let mut io = MockIoSubmitter::new();
        io.expect_read_at()
            .once()
            .returning(|_, unit, _| Box::pin(future::err(Error::Io(unit))));
        io.expect_write_at().never();
        let r2 = dag.execute(&io).now_or_never().unwrap();
        assert_eq!(r2, Err(Error::Io(0)));
        assert_eq!(dag.status(), DagStatus::Failed(Error::Io(0)));
        assert_eq!(dag.node(r).status(), NodeStatus::Failed);
        assert_eq!(dag.node(w).status(), NodeStatus::Skipped);
        assert_eq!(dag.node(t).status(), NodeStatus::Skipped);
    }

    /// A failed DAG must not copy anything into the caller's buffer
    #[test]
    fn execute_failure_no_gather() {
        let mut dag = dag();
        let b0 = dag.alloc(4);
        let b1 = dag.alloc(4);
        dag.add_node("Rod", ReadOp{unit: 0, sector: 0, buf: b0}, &[0]);
        dag.add_node("Rod", ReadOp{unit: 1, sector: 0, buf: b1}, &[0]);
        dag.gather(0, BufSlice::whole(b0, 4));
        dag.gather(4, BufSlice::whole(b1, 4));
        let dbs = DivBufShared::from(vec![0u8; 8]);
        dag.set_target(dbs.try_mut().unwrap());
        dag.terminate();

        let mut io = MockIoSubmitter::new();
        io.expect_read_at()
            .times(2)
            .returning(|mut buf, unit, _| {
                buf[..].fill(0xff);
                if unit == 1 {
                    Box::pin(future::err(Error::Io(unit)))
                } else {
                    Box::pin(future::ok(()))
                }
            });
        let r = dag.execute(&io).now_or_never().unwrap();
        assert_eq!(r, Err(Error::Io(1)));
        assert_eq!(&dbs.try_const().unwrap()[..], &[0u8; 8][..]);
    }

    #[test]
    fn execute_twice() {
        let mut dag = dag();
        dag.terminate();
        let io = MockIoSubmitter::new();
        dag.execute(&io).now_or_never().unwrap().unwrap();
        assert_eq!(dag.execute(&io).now_or_never().unwrap(),
            Err(Error::MalformedDag("DAG already executed")));
    }
}
// LCOV_EXCL_STOP
