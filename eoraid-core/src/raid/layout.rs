// vim: tw=80
//! Placement of data and redundancy on the units of an array
//!
//! Every stripe uses all `ndata + 2` units.  The redundancy rotates: stripe
//! `s` puts E on unit `n - 1 - (s mod n)`, P on the unit before it, and the
//! data columns on the units after it, wrapping around.

use fixedbitset::FixedBitSet;
use crate::{
    config::ArrayConfig,
    types::*,
};
use super::asm::*;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EvenOddLayout {
    ndata: usize,
    sectors_per_unit: SectorT,
    stripes: StripeT,
    bytes_per_sector: usize,
}

impl EvenOddLayout {
    pub fn new(config: &ArrayConfig) -> Self {
        EvenOddLayout {
            ndata: config.ndata,
            sectors_per_unit: config.sectors_per_unit,
            stripes: config.stripes,
            bytes_per_sector: config.bytes_per_sector,
        }
    }

    pub fn nunits(&self) -> usize {
        self.ndata + 2
    }

    /// Logical size of the array, in sectors
    pub fn size(&self) -> LbaT {
        self.stripes * self.stripe_sectors()
    }

    pub fn stripes(&self) -> StripeT {
        self.stripes
    }

    fn stripe_sectors(&self) -> SectorT {
        self.ndata as SectorT * self.sectors_per_unit
    }

    /// Unit holding E for the given stripe
    pub fn e_unit(&self, stripe: StripeT) -> UnitT {
        let n = self.nunits() as StripeT;
        (n - 1 - stripe % n) as UnitT
    }

    /// Unit holding P for the given stripe
    pub fn p_unit(&self, stripe: StripeT) -> UnitT {
        let n = self.nunits() as UnitT;
        (self.e_unit(stripe) + n - 1) % n
    }

    /// Unit holding data column `col` of the given stripe
    pub fn data_unit(&self, stripe: StripeT, col: ColT) -> UnitT {
        let n = self.nunits() as UnitT;
        (self.e_unit(stripe) + 1 + col) % n
    }

    /// What `unit` holds in the given stripe
    pub fn role_of(&self, stripe: StripeT, unit: UnitT) -> Role {
        let n = self.nunits() as UnitT;
        let e = self.e_unit(stripe);
        if unit == e {
            Role::E
        } else if unit == self.p_unit(stripe) {
            Role::P
        } else {
            Role::Data((unit + n - e - 1) % n)
        }
    }

    /// The LBA of the first sector of one data column of one stripe
    pub fn lba_of(&self, stripe: StripeT, col: ColT) -> LbaT {
        stripe * self.stripe_sectors() +
            SectorT::from(col) * self.sectors_per_unit
    }

    /// Map a logical request onto the stripes it touches.
    ///
    /// # Parameters
    ///
    /// - `lba`:        First logical sector
    /// - `nsectors`:   Length of the request, in sectors
    /// - `failed`:     Units that are currently unavailable
    ///
    /// # Returns
    ///
    /// One `AccessStripeMap` per stripe, in ascending order
    pub fn map(&self, lba: LbaT, nsectors: SectorT, failed: &FixedBitSet)
        -> Result<Vec<AccessStripeMap>>
    {
        if nsectors == 0 {
            return Err(Error::InvalidRequest("empty request"));
        }
        if lba.checked_add(nsectors).map_or(true, |end| end > self.size()) {
            return Err(Error::InvalidRequest("request past end of array"));
        }
        let ss = self.stripe_sectors();
        let spu = self.sectors_per_unit;
        let end = lba + nsectors;
        let mut asms = Vec::new();
        let mut cur = lba;
        while cur < end {
            let stripe = cur / ss;
            let mut buf_offset = 0;
            let stripe_end = end.min((stripe + 1) * ss);
            let mut pdas = Vec::new();
            while cur < stripe_end {
                let within = cur - stripe * ss;
                let col = (within / spu) as ColT;
                let offset = within % spu;
                let n = (spu - offset).min(stripe_end - cur);
                pdas.push(PhysDiskAddr {
                    unit: self.data_unit(stripe, col),
                    role: Role::Data(col),
                    sector: stripe * spu + offset,
                    nsectors: n,
                    offset,
                    buf_offset,
                });
                buf_offset += n as usize * self.bytes_per_sector;
                cur += n;
            }
            asms.push(self.stripe_map(stripe, pdas, failed));
        }
        Ok(asms)
    }

    /// Map one whole stripe unit of one column, as a rebuild would read it.
    pub fn map_column(&self, stripe: StripeT, col: ColT,
                      failed: &FixedBitSet) -> Result<AccessStripeMap>
    {
        let mut asms = self.map(self.lba_of(stripe, col), self.sectors_per_unit,
            failed)?;
        asms.pop().ok_or(Error::InvalidRequest("empty request"))
    }

    fn stripe_map(&self, stripe: StripeT, pdas: Vec<PhysDiskAddr>,
                  failed: &FixedBitSet) -> AccessStripeMap
    {
        let base = stripe * self.sectors_per_unit;
        let columns = (0..self.ndata as ColT)
            .map(|col| {
                let unit = self.data_unit(stripe, col);
                Column{unit, failed: failed.contains(usize::from(unit))}
            }).collect::<Vec<_>>();
        let (start, end) = pdas.iter().fold((SectorT::MAX, 0), |(s, e), pda| {
            (s.min(pda.offset), e.max(pda.offset + pda.nsectors))
        });
        let redundancy = |unit: UnitT, role: Role| PhysDiskAddr {
            unit,
            role,
            sector: base + start,
            nsectors: end - start,
            offset: start,
            buf_offset: 0
        };
        let parity = redundancy(self.p_unit(stripe), Role::P);
        let eparity = redundancy(self.e_unit(stripe), Role::E);
        let p_failed = failed.contains(usize::from(parity.unit));
        let e_failed = failed.contains(usize::from(eparity.unit));
        let fault = FaultPattern::new(
            columns.iter().filter(|c| c.failed).count() as u8,
            p_failed,
            e_failed
        );
        let mut failed_pdas = pdas.iter()
            .filter(|pda| failed.contains(usize::from(pda.unit)))
            .copied()
            .collect::<Vec<_>>();
        if p_failed {
            failed_pdas.push(parity);
        }
        if e_failed {
            failed_pdas.push(eparity);
        }
        let units_accessed = pdas.len();
        AccessStripeMap {
            stripe,
            base,
            sectors_per_unit: self.sectors_per_unit,
            pdas,
            failed_pdas,
            parity: Some(parity),
            eparity: Some(eparity),
            columns,
            units_accessed,
            fault,
        }
    }
}

// LCOV_EXCL_STOP
