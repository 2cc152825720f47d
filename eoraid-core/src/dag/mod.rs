// vim: tw=80

//! Request DAGs
//!
//! Each stripe's share of a request is expressed as a directed acyclic graph
//! of reads, writes, XOR computations, and parity log appends.  A builder is
//! chosen from the stripe's fault pattern, and the resulting graph runs with
//! maximal concurrency.

mod dag;
mod dispatch;
mod node;
mod read;
mod write;

pub use self::dag::{Dag, DagNode, DagStatus};
pub use self::dispatch::{
    Builder,
    DagOptions,
    Request,
    RequestKind,
    build_dag,
    select_builder
};
pub use self::node::{
    BufArena,
    BufId,
    BufSlice,
    LogOp,
    NodeId,
    NodeKind,
    NodeOp,
    NodeStatus,
    NoOp,
    ReadOp,
    Recovery,
    RecoveryOp,
    Schedulable,
    Started,
    Term,
    Terminate,
    WriteOp,
    XorOp
};
