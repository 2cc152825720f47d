// vim: tw=80
//! Physical addresses and access stripe maps

use super::codec::Code;
use crate::types::*;

/// What a unit holds within one stripe
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Role {
    Data(ColT),
    P,
    E,
}

impl From<Code> for Role {
    fn from(code: Code) -> Self {
        match code {
            Code::P => Role::P,
            Code::E => Role::E,
        }
    }
}

/// One contiguous run of sectors on one unit
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PhysDiskAddr {
    pub unit: UnitT,
    pub role: Role,
    /// First sector on the unit
    pub sector: SectorT,
    pub nsectors: SectorT,
    /// Offset of `sector` within its stripe unit
    pub offset: SectorT,
    /// Byte offset of this run within this stripe's share of the request's
    /// buffer.  Meaningless for redundancy units.
    pub buf_offset: usize,
}

impl PhysDiskAddr {
    /// The data column, if this is a data unit
    pub fn col(&self) -> Option<ColT> {
        match self.role {
            Role::Data(c) => Some(c),
            _ => None
        }
    }

    /// Length in bytes
    pub fn len(&self, bytes_per_sector: usize) -> usize {
        self.nsectors as usize * bytes_per_sector
    }
}

/// One unit's place in a stripe
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Column {
    pub unit: UnitT,
    pub failed: bool,
}

/// Everything the engine needs to know about one stripe of one request.
///
/// Built by the layout and treated as read-only thereafter.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AccessStripeMap {
    pub stripe: StripeT,
    /// First sector of this stripe on every unit
    pub base: SectorT,
    pub sectors_per_unit: SectorT,
    /// Data runs touched by the request, in column order
    pub pdas: Vec<PhysDiskAddr>,
    /// Runs touched by the request that land on unavailable units, including
    /// redundancy runs
    pub failed_pdas: Vec<PhysDiskAddr>,
    /// P run covering the sectors of the data runs
    pub parity: Option<PhysDiskAddr>,
    /// E run covering the sectors of the data runs
    pub eparity: Option<PhysDiskAddr>,
    /// Every data column of the stripe, whether accessed or not
    pub columns: Vec<Column>,
    pub units_accessed: usize,
    /// Unavailable units across the whole stripe
    pub fault: FaultPattern,
}

impl AccessStripeMap {
    /// Does the request touch a failed data unit?
    pub fn accesses_failed_data(&self) -> bool {
        self.failed_pdas.iter().any(|pda| pda.col().is_some())
    }

    /// Indices of the failed data columns of the whole stripe, ascending
    pub fn failed_cols(&self) -> Vec<ColT> {
        self.columns.iter()
            .enumerate()
            .filter(|(_, c)| c.failed)
            .map(|(i, _)| i as ColT)
            .collect()
    }

    /// Does the request overwrite every data unit completely?
    pub fn is_full_stripe(&self) -> bool {
        self.pdas.len() == self.columns.len() &&
            self.pdas.iter().all(|pda| pda.nsectors == self.sectors_per_unit)
    }

    /// Length of the request's portion of this stripe, in bytes
    pub fn len(&self, bytes_per_sector: usize) -> usize {
        self.pdas.iter().map(|pda| pda.len(bytes_per_sector)).sum()
    }

    /// Smallest range of stripe-unit offsets that covers every data run
    pub fn data_range(&self) -> (SectorT, SectorT) {
        let start = self.pdas.iter().map(|pda| pda.offset).min().unwrap_or(0);
        let end = self.pdas.iter()
            .map(|pda| pda.offset + pda.nsectors)
            .max()
            .unwrap_or(0);
        (start, end)
    }

    /// The run for one of the redundancy units
    pub fn redundancy(&self, code: Code) -> Result<&PhysDiskAddr> {
        let pda = match code {
            Code::P => self.parity.as_ref(),
            Code::E => self.eparity.as_ref(),
        };
        pda.ok_or(Error::InvalidRequest("stripe map lacks a redundancy unit"))
    }

    pub fn is_failed(&self, code: Code) -> bool {
        match code {
            Code::P => self.fault.p,
            Code::E => self.fault.e,
        }
    }
}

/// Which redundancy units a DAG may use, and which one recovers data.
///
/// Fault patterns that differ only by which of P and E has failed are handled
/// by the same builders, which consult this view instead of the stripe map's
/// own labels.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RedundancyView {
    /// The code used to reconstruct a single lost data unit
    pub primary: Code,
    /// The other surviving code, if any
    pub secondary: Option<Code>,
}

impl RedundancyView {
    /// The view for a stripe, or `None` if both redundancy units are lost
    pub fn new(fault: FaultPattern) -> Option<Self> {
        match (fault.p, fault.e) {
            (false, false) => Some(Self{primary: Code::P,
                                        secondary: Some(Code::E)}),
            (false, true) => Some(Self{primary: Code::P, secondary: None}),
            (true, false) => Some(Self{primary: Code::E, secondary: None}),
            (true, true) => None
        }
    }

    /// Every surviving code, primary first
    pub fn codes(&self) -> impl Iterator<Item=Code> {
        std::iter::once(self.primary).chain(self.secondary)
    }

    /// Has E been relabeled to play P's part?
    pub fn is_relabeled(&self) -> bool {
        self.primary == Code::E
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use pretty_assertions::assert_eq;
    use super::*;

    fn pda(unit: UnitT, col: ColT, offset: SectorT, nsectors: SectorT)
        -> PhysDiskAddr
    {
        PhysDiskAddr {
            unit,
            role: Role::Data(col),
            sector: 100 + offset,
            nsectors,
            offset,
            buf_offset: 0
        }
    }

    fn asm(pdas: Vec<PhysDiskAddr>) -> AccessStripeMap {
        AccessStripeMap {
            stripe: 0,
            base: 100,
            sectors_per_unit: 8,
            pdas,
            failed_pdas: Vec::new(),
            parity: None,
            eparity: None,
            columns: vec![Column{unit: 0, failed: false}; 3],
            units_accessed: 0,
            fault: FaultPattern::NONE
        }
    }

    #[test]
    fn data_range() {
        let asm = asm(vec![pda(0, 0, 6, 2), pda(1, 1, 0, 3)]);
        assert_eq!(asm.data_range(), (0, 8));
        assert!(!asm.is_full_stripe());
        assert_eq!(asm.len(16), 80);
    }

    #[test]
    fn full_stripe() {
        let asm = asm(vec![pda(0, 0, 0, 8), pda(1, 1, 0, 8), pda(2, 2, 0, 8)]);
        assert!(asm.is_full_stripe());
    }

    #[test]
    fn missing_redundancy() {
        let asm = asm(vec![pda(0, 0, 0, 8)]);
        assert!(asm.redundancy(Code::E).is_err());
    }

    #[test]
    fn view() {
        let v = RedundancyView::new(FaultPattern::new(1, true, false))
            .unwrap();
        assert!(v.is_relabeled());
        assert_eq!(v.codes().collect::<Vec<_>>(), vec![Code::E]);
        let v = RedundancyView::new(FaultPattern::NONE).unwrap();
        assert_eq!(v.codes().collect::<Vec<_>>(), vec![Code::P, Code::E]);
        assert_eq!(RedundancyView::new(FaultPattern::new(0, true, true)),
                   None);
    }
}
// LCOV_EXCL_STOP
