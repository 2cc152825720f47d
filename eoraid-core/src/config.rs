// vim: tw=80
//! Array configuration
//!
//! An array is described by a small YAML document, for example:
//!
//! ```yaml
//! ndata: 5
//! prime: 5
//! sectors_per_unit: 8
//! bytes_per_sector: 512
//! stripes: 64
//! parity_log:
//!   regions: 4
//!   region_log_sectors: 64
//!   core_log_bytes: 8192
//!   pool_size: 2
//! ```

use serde_derive::{Deserialize, Serialize};
use tracing::error;
use crate::{
    plog::format::{HEADER_LEN, RECORD_HEADER_LEN},
    raid::EvenOdd,
    types::*,
    util::is_prime,
};

fn default_prime() -> usize {
    17
}

fn default_bytes_per_sector() -> usize {
    512
}

/// Geometry of an EvenOdd array
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ArrayConfig {
    /// Number of data units in each stripe
    pub ndata: usize,
    /// The EvenOdd prime.  Must be at least `ndata`.
    #[serde(default = "default_prime")]
    pub prime: usize,
    /// Size of one stripe unit, in sectors
    pub sectors_per_unit: SectorT,
    #[serde(default = "default_bytes_per_sector")]
    pub bytes_per_sector: usize,
    /// Number of stripes in the array
    pub stripes: StripeT,
    /// Defer redundancy updates to a parity log, if set
    #[serde(default)]
    pub parity_log: Option<ParityLogConfig>,
}

/// Parity logging parameters
///
/// The log lives on one extra unit, just past the array's data and
/// redundancy units.  That unit is divided evenly among the regions.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ParityLogConfig {
    /// Number of regions.  Each covers a contiguous range of stripes.
    pub regions: RegionT,
    /// Size of each region's on-disk log, in sectors
    pub region_log_sectors: SectorT,
    /// Capacity of each in-core log buffer, in bytes
    pub core_log_bytes: usize,
    /// Number of in-core log buffers shared by all regions
    pub pool_size: usize,
}

impl ArrayConfig {
    /// Parse and validate a YAML configuration.
    pub fn from_yaml(s: &str) -> Result<Self> {
        let config: ArrayConfig = serde_yaml_ng::from_str(s)
            .map_err(|e| {
                error!("Cannot parse array configuration: {}", e);
                Error::InvalidConfig("cannot parse YAML")
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the geometry is usable.
    pub fn validate(&self) -> Result<()> {
        if self.ndata < 2 {
            return Err(Error::InvalidConfig("need at least two data units"));
        }
        if !is_prime(self.prime) || self.prime < 3 {
            return Err(Error::InvalidConfig("prime must be an odd prime"));
        }
        if self.ndata > self.prime {
            return Err(Error::InvalidConfig("ndata may not exceed the prime"));
        }
        if self.bytes_per_sector == 0 ||
            self.bytes_per_sector % (self.prime - 1) != 0
        {
            return Err(Error::InvalidConfig(
                "bytes_per_sector must be a multiple of prime - 1"));
        }
        if self.sectors_per_unit == 0 || self.stripes == 0 {
            return Err(Error::InvalidConfig("empty array"));
        }
        if self.nunits() > usize::from(UnitT::MAX) {
            return Err(Error::InvalidConfig("too many units"));
        }
        if let Some(plc) = &self.parity_log {
            if plc.regions == 0 || StripeT::from(plc.regions) > self.stripes {
                return Err(Error::InvalidConfig(
                    "regions must be between 1 and the number of stripes"));
            }
            if plc.pool_size == 0 {
                return Err(Error::InvalidConfig("empty log buffer pool"));
            }
            // The largest record is a whole stripe unit of redundancy
            let max_record = RECORD_HEADER_LEN + self.unit_bytes();
            if plc.core_log_bytes < max_record {
                return Err(Error::InvalidConfig(
                    "core_log_bytes cannot hold a whole-unit record"));
            }
            let region_bytes = plc.region_log_sectors as usize *
                self.bytes_per_sector;
            if region_bytes < HEADER_LEN + plc.core_log_bytes +
                RECORD_HEADER_LEN + self.bytes_per_sector
            {
                return Err(Error::InvalidConfig(
                    "region_log_sectors cannot hold a full in-core log"));
            }
        }
        Ok(())
    }

    /// Construct the EvenOdd codec for this geometry
    pub fn codec(&self) -> Result<EvenOdd> {
        EvenOdd::new(self.ndata, self.prime, self.bytes_per_sector)
    }

    /// Index of the unit holding the parity log, if any
    pub fn log_unit(&self) -> Option<UnitT> {
        self.parity_log.as_ref().map(|_| self.nunits() as UnitT)
    }

    /// Units per stripe: the data units plus P and E
    pub fn nunits(&self) -> usize {
        self.ndata + 2
    }

    /// Data sectors in one stripe
    pub fn stripe_sectors(&self) -> SectorT {
        self.ndata as SectorT * self.sectors_per_unit
    }

    /// Usable size of the array, in sectors
    pub fn size(&self) -> LbaT {
        self.stripes * self.stripe_sectors()
    }

    /// Size of one stripe unit, in bytes
    pub fn unit_bytes(&self) -> usize {
        self.sectors_per_unit as usize * self.bytes_per_sector
    }

    /// Size of each unit's image, in sectors
    pub fn unit_sectors(&self) -> SectorT {
        self.stripes * self.sectors_per_unit
    }

    /// Size of the log unit's image, in sectors
    pub fn log_sectors(&self) -> SectorT {
        self.parity_log.as_ref()
            .map(|plc| SectorT::from(plc.regions) * plc.region_log_sectors)
            .unwrap_or(0)
    }

    /// Number of units backing the array, including any log unit
    pub fn backing_units(&self) -> usize {
        self.nunits() + usize::from(self.parity_log.is_some())
    }
}

// LCOV_EXCL_STOP
