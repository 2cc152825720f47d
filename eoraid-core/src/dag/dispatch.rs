// vim: tw=80
//! Selection of a DAG builder from a stripe's fault pattern

use std::sync::Arc;
use tracing::trace;
use crate::{
    config::ArrayConfig,
    plog::ParityLogging,
    raid::{AccessStripeMap, EvenOdd, RedundancyView},
    types::*,
};
use super::{Dag, read, write};

/// The strategy used to build a DAG
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Builder {
    /// Read only the requested data
    FaultFreeRead,
    /// Reconstruct one lost data unit with the view's primary code
    DegradedRead(RedundancyView),
    /// Reconstruct two lost data units with both codes
    DoubleDegradedRead,
    /// Read-modify-write of the view's codes
    SmallWrite(RedundancyView),
    /// Encode the view's codes from a whole stripe of new data
    LargeWrite(RedundancyView),
    /// Update the surviving codes, accounting for one lost data unit
    DegradedWrite(RedundancyView),
    /// Update both codes, accounting for two lost data units
    DoubleDegradedWrite,
    /// Write data only.  Both redundancy units are lost.
    NonRedundantWrite,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestKind {
    Read,
    Write,
}

/// One stripe's share of a request, with its buffer
#[derive(Debug)]
pub enum Request {
    /// Read into this buffer
    Read(IoVecMut),
    /// Write this data
    Write(IoVec),
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Read(_) => RequestKind::Read,
            Request::Write(_) => RequestKind::Write,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Request::Read(b) => b.len(),
            Request::Write(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn into_read(self) -> Result<IoVecMut> {
        match self {
            Request::Read(b) => Ok(b),
            Request::Write(_) => Err(Error::InvalidRequest("expected a read"))
        }
    }

    fn into_write(self) -> Result<IoVec> {
        match self {
            Request::Write(b) => Ok(b),
            Request::Read(_) => Err(Error::InvalidRequest("expected a write"))
        }
    }
}

/// Optional behavior for DAG construction
#[derive(Clone, Default)]
pub struct DagOptions {
    /// Log redundancy updates instead of writing them in place, for stripes
    /// with no failures whose region has logging enabled
    pub parity_log: Option<Arc<ParityLogging>>,
}

/// Everything a builder needs besides the stripe map
pub(super) struct BuildCtx<'a> {
    pub codec: EvenOdd,
    pub bytes_per_sector: usize,
    pub sectors_per_unit: SectorT,
    pub plog: Option<&'a Arc<ParityLogging>>,
}

impl BuildCtx<'_> {
    /// Convert sectors to bytes
    pub fn bytes(&self, nsectors: SectorT) -> usize {
        nsectors as usize * self.bytes_per_sector
    }

    pub fn unit_bytes(&self) -> usize {
        self.bytes(self.sectors_per_unit)
    }
}

/// How many lost data units the request must contend with
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DataLoss {
    None,
    One,
    Two,
}

/// Choose the builder for a request against one stripe.
///
/// Lost data units only matter if the request touches one of them; but if
/// it does, every lost data unit in the stripe matters.
pub fn select_builder(kind: RequestKind, asm: &AccessStripeMap)
    -> Result<Builder>
{
    let fault = asm.fault;
    if fault.total() > 2 {
        return Err(Error::Config(fault));
    }
    let loss = if !asm.accesses_failed_data() {
        DataLoss::None
    } else {
        match fault.data {
            0 => DataLoss::None,
            1 => DataLoss::One,
            2 => DataLoss::Two,
            _ => return Err(Error::Config(fault))
        }
    };
    let view = RedundancyView::new(fault);
    match (kind, loss, view) {
        (RequestKind::Read, DataLoss::None, _) => Ok(Builder::FaultFreeRead),
        (RequestKind::Read, DataLoss::One, Some(v)) =>
            Ok(Builder::DegradedRead(v)),
        (RequestKind::Read, DataLoss::Two, Some(_)) =>
            Ok(Builder::DoubleDegradedRead),
        (RequestKind::Write, _, Some(v)) if asm.is_full_stripe() =>
            Ok(Builder::LargeWrite(v)),
        (RequestKind::Write, DataLoss::None, Some(v)) =>
            Ok(Builder::SmallWrite(v)),
        (RequestKind::Write, DataLoss::None, None) =>
            Ok(Builder::NonRedundantWrite),
        (RequestKind::Write, DataLoss::One, Some(v)) =>
            Ok(Builder::DegradedWrite(v)),
        (RequestKind::Write, DataLoss::Two, Some(_)) =>
            Ok(Builder::DoubleDegradedWrite),
        (_, DataLoss::One | DataLoss::Two, None) => Err(Error::Config(fault)),
    }
}

/// Build the DAG for one stripe's share of a request.
///
/// # Parameters
///
/// - `config`:     Array geometry
/// - `asm`:        The stripe map.  It is never modified.
/// - `request`:    The request's buffer for this stripe
/// - `options`:    Optional behaviors, like parity logging
pub fn build_dag(config: &ArrayConfig, asm: &AccessStripeMap,
                 request: Request, options: &DagOptions) -> Result<Dag>
{
    let builder = select_builder(request.kind(), asm)?;
    if request.len() != asm.len(config.bytes_per_sector) {
        return Err(Error::InvalidRequest("buffer doesn't match stripe map"));
    }
    let plog = options.parity_log.as_ref().filter(|pl| {
        asm.fault.is_fault_free() &&
            pl.is_logging(pl.region_of_stripe(asm.stripe))
    });
    let ctx = BuildCtx {
        codec: config.codec()?,
        bytes_per_sector: config.bytes_per_sector,
        sectors_per_unit: config.sectors_per_unit,
        plog,
    };
    trace!(stripe = asm.stripe, fault = %asm.fault, ?builder, "building DAG");
    let mut dag = match builder {
        Builder::FaultFreeRead =>
            read::fault_free(&ctx, asm, request.into_read()?),
        Builder::DegradedRead(v) =>
            read::degraded(&ctx, asm, v, request.into_read()?),
        Builder::DoubleDegradedRead =>
            read::double_degraded(&ctx, asm, request.into_read()?),
        Builder::SmallWrite(v) =>
            write::small(&ctx, asm, v, request.into_write()?),
        Builder::LargeWrite(v) =>
            write::large(&ctx, asm, v, request.into_write()?),
        Builder::DegradedWrite(v) =>
            write::degraded(&ctx, asm, v, request.into_write()?),
        Builder::DoubleDegradedWrite =>
            write::double_degraded(&ctx, asm, request.into_write()?),
        Builder::NonRedundantWrite =>
            write::non_redundant(&ctx, asm, request.into_write()?),
    }?;
    dag.terminate();
    dag.validate()?;
    Ok(dag)
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use fixedbitset::FixedBitSet;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use crate::raid::{Code, EvenOddLayout};
    use super::*;

    // Stripe 0 of a 5+2 array: data on units 0-4, P on 5, E on 6
    fn asm(failed_data: u8, p: bool, e: bool, nsectors: SectorT)
        -> AccessStripeMap
    {
        let config = ArrayConfig {
            ndata: 5,
            prime: 5,
            sectors_per_unit: 4,
            bytes_per_sector: 64,
            stripes: 8,
            parity_log: None
        };
        let layout = EvenOddLayout::new(&config);
        let mut failed = FixedBitSet::with_capacity(7);
        for u in 0..usize::from(failed_data) {
            failed.insert(u);
        }
        failed.set(5, p);
        failed.set(6, e);
        layout.map(0, nsectors, &failed).unwrap().pop().unwrap()
    }

    fn both() -> RedundancyView {
        RedundancyView{primary: Code::P, secondary: Some(Code::E)}
    }

    fn p_only() -> RedundancyView {
        RedundancyView{primary: Code::P, secondary: None}
    }

    fn e_only() -> RedundancyView {
        RedundancyView{primary: Code::E, secondary: None}
    }

    #[rstest]
    #[case(0, false, false, 1, Builder::FaultFreeRead)]
    #[case(0, true, true, 1, Builder::FaultFreeRead)]
    #[case(1, false, false, 1, Builder::DegradedRead(both()))]
    #[case(1, false, true, 1, Builder::DegradedRead(p_only()))]
    #[case(1, true, false, 1, Builder::DegradedRead(e_only()))]
    #[case(2, false, false, 1, Builder::DoubleDegradedRead)]
    fn reads(#[case] d: u8, #[case] p: bool, #[case] e: bool,
             #[case] nsectors: SectorT, #[case] expected: Builder)
    {
        let asm = asm(d, p, e, nsectors);
        assert_eq!(select_builder(RequestKind::Read, &asm), Ok(expected));
    }

    #[rstest]
    #[case(0, false, false, 1, Builder::SmallWrite(both()))]
    #[case(0, false, true, 1, Builder::SmallWrite(p_only()))]
    #[case(0, true, false, 1, Builder::SmallWrite(e_only()))]
    #[case(0, true, true, 1, Builder::NonRedundantWrite)]
    #[case(1, false, false, 1, Builder::DegradedWrite(both()))]
    #[case(1, false, true, 1, Builder::DegradedWrite(p_only()))]
    #[case(1, true, false, 1, Builder::DegradedWrite(e_only()))]
    #[case(2, false, false, 1, Builder::DoubleDegradedWrite)]
    #[case(0, false, false, 20, Builder::LargeWrite(both()))]
    #[case(0, true, false, 20, Builder::LargeWrite(e_only()))]
    #[case(2, false, false, 20, Builder::LargeWrite(both()))]
    #[case(0, true, true, 20, Builder::NonRedundantWrite)]
    fn writes(#[case] d: u8, #[case] p: bool, #[case] e: bool,
              #[case] nsectors: SectorT, #[case] expected: Builder)
    {
        let asm = asm(d, p, e, nsectors);
        assert_eq!(select_builder(RequestKind::Write, &asm), Ok(expected));
    }

    /// A failed data unit that the request doesn't touch doesn't matter
    #[test]
    fn untouched_failure() {
        // Unit 0 is column 0; read column 4 instead.
        let config = ArrayConfig {
            ndata: 5,
            prime: 5,
            sectors_per_unit: 4,
            bytes_per_sector: 64,
            stripes: 8,
            parity_log: None
        };
        let layout = EvenOddLayout::new(&config);
        let mut failed = FixedBitSet::with_capacity(7);
        failed.insert(0);
        let asm = layout.map(16, 1, &failed).unwrap().pop().unwrap();
        assert_eq!(select_builder(RequestKind::Read, &asm),
                   Ok(Builder::FaultFreeRead));
        assert_eq!(select_builder(RequestKind::Write, &asm),
                   Ok(Builder::SmallWrite(both())));
    }

    /// Every pattern with at most two losses has exactly one builder, and
    /// every pattern with more is a configuration error.
    #[test]
    fn coverage() {
        for d in 0..=3u8 {
            for p in [false, true] {
                for e in [false, true] {
                    let fault = FaultPattern::new(d, p, e);
                    for nsectors in [1, 20] {
                        let asm = asm(d, p, e, nsectors);
                        for kind in [RequestKind::Read, RequestKind::Write] {
                            let r = select_builder(kind, &asm);
                            if fault.total() > 2 {
                                assert_eq!(r, Err(Error::Config(fault)));
                            } else {
                                assert!(r.is_ok(), "{:?} {} {:?}", kind,
                                    fault, r);
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn mismatched_buffer() {
        let config = ArrayConfig {
            ndata: 5,
            prime: 5,
            sectors_per_unit: 4,
            bytes_per_sector: 64,
            stripes: 8,
            parity_log: None
        };
        let asm = asm(0, false, false, 1);
        let dbs = divbuf::DivBufShared::from(vec![0u8; 128]);
        let req = Request::Write(dbs.try_const().unwrap());
        let r = build_dag(&config, &asm, req, &DagOptions::default());
        assert_eq!(r.err(),
            Some(Error::InvalidRequest("buffer doesn't match stripe map")));
    }
}
// LCOV_EXCL_STOP
