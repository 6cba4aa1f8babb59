//! # ADC Data-Rate and Gain Tables
//!
//! The six transducer channels are digitized by ADS1255/6-class converters.
//! Their self-calibration registers are scaled by a pair of constants that
//! depend on the selected data rate:
//!
//! | Data rate (SPS)           | α        | β      |
//! |---------------------------|----------|--------|
//! | 30000, 15000, 7500, 3750  | 0x400000 | 1.8639 |
//! | 2000, 1000, 500           | 0x3C0000 | 1.7474 |
//! | 100, 50, 25               | 0x4B0000 | 1.3980 |
//! | 60, 30, 15                | 0x3E8000 | 1.4913 |
//! | 10, 5, 2.5                | 0x5DC000 | 1.6777 |

use std::fmt;

use crate::error::{OptoFtError, Result};

/// Supported converter data rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataRate {
    Sps30000,
    Sps15000,
    Sps7500,
    Sps3750,
    #[default]
    Sps2000,
    Sps1000,
    Sps500,
    Sps100,
    Sps60,
    Sps50,
    Sps30,
    Sps25,
    Sps15,
    Sps10,
    Sps5,
    Sps2_5,
}

struct RateEntry {
    rate: DataRate,
    sps: f64,
    alpha: u32,
    beta: f64,
}

const RATE_TABLE: [RateEntry; 16] = [
    RateEntry { rate: DataRate::Sps30000, sps: 30000.0, alpha: 0x40_0000, beta: 1.8639 },
    RateEntry { rate: DataRate::Sps15000, sps: 15000.0, alpha: 0x40_0000, beta: 1.8639 },
    RateEntry { rate: DataRate::Sps7500, sps: 7500.0, alpha: 0x40_0000, beta: 1.8639 },
    RateEntry { rate: DataRate::Sps3750, sps: 3750.0, alpha: 0x40_0000, beta: 1.8639 },
    RateEntry { rate: DataRate::Sps2000, sps: 2000.0, alpha: 0x3C_0000, beta: 1.7474 },
    RateEntry { rate: DataRate::Sps1000, sps: 1000.0, alpha: 0x3C_0000, beta: 1.7474 },
    RateEntry { rate: DataRate::Sps500, sps: 500.0, alpha: 0x3C_0000, beta: 1.7474 },
    RateEntry { rate: DataRate::Sps100, sps: 100.0, alpha: 0x4B_0000, beta: 1.3980 },
    RateEntry { rate: DataRate::Sps60, sps: 60.0, alpha: 0x3E_8000, beta: 1.4913 },
    RateEntry { rate: DataRate::Sps50, sps: 50.0, alpha: 0x4B_0000, beta: 1.3980 },
    RateEntry { rate: DataRate::Sps30, sps: 30.0, alpha: 0x3E_8000, beta: 1.4913 },
    RateEntry { rate: DataRate::Sps25, sps: 25.0, alpha: 0x4B_0000, beta: 1.3980 },
    RateEntry { rate: DataRate::Sps15, sps: 15.0, alpha: 0x3E_8000, beta: 1.4913 },
    RateEntry { rate: DataRate::Sps10, sps: 10.0, alpha: 0x5D_C000, beta: 1.6777 },
    RateEntry { rate: DataRate::Sps5, sps: 5.0, alpha: 0x5D_C000, beta: 1.6777 },
    RateEntry { rate: DataRate::Sps2_5, sps: 2.5, alpha: 0x5D_C000, beta: 1.6777 },
];

impl DataRate {
    fn entry(self) -> &'static RateEntry {
        &RATE_TABLE[self.index() as usize]
    }

    /// Position in the rate table; sent as the data-rate command parameter
    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        RATE_TABLE.get(index as usize).map(|e| e.rate)
    }

    /// Look up a rate given in samples per second
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for rates the converter does not support
    ///
    /// # Examples
    ///
    /// ```
    /// use opto_ft::calibration::adc::DataRate;
    ///
    /// assert_eq!(DataRate::from_sps(2.5).unwrap(), DataRate::Sps2_5);
    /// assert!(DataRate::from_sps(1200.0).is_err());
    /// ```
    pub fn from_sps(sps: f64) -> Result<Self> {
        RATE_TABLE
            .iter()
            .find(|e| (e.sps - sps).abs() < 1e-9)
            .map(|e| e.rate)
            .ok_or_else(|| {
                OptoFtError::InvalidArgument(format!("Unsupported ADC data rate {} SPS", sps))
            })
    }

    pub fn sps(self) -> f64 {
        self.entry().sps
    }

    /// Offset calibration scale α
    pub fn alpha(self) -> f64 {
        f64::from(self.entry().alpha)
    }

    /// Full-scale calibration scale β
    pub fn beta(self) -> f64 {
        self.entry().beta
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} SPS", self.sps())
    }
}

/// Programmable-gain amplifier setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PgaGain {
    #[default]
    X1,
    X2,
    X4,
    X8,
    X16,
    X32,
    X64,
}

impl PgaGain {
    pub const ALL: [PgaGain; 7] = [
        PgaGain::X1,
        PgaGain::X2,
        PgaGain::X4,
        PgaGain::X8,
        PgaGain::X16,
        PgaGain::X32,
        PgaGain::X64,
    ];

    /// log2 of the gain; sent as the gain command parameter
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn factor(self) -> u32 {
        1 << self.code()
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` unless `factor` is a power of two in 1..=64
    pub fn from_factor(factor: u32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|g| g.factor() == factor)
            .ok_or_else(|| OptoFtError::InvalidArgument(format!("Unsupported PGA gain {}", factor)))
    }
}

impl fmt::Display for PgaGain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.factor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_table_order_matches_enum() {
        for (i, entry) in RATE_TABLE.iter().enumerate() {
            assert_eq!(entry.rate.index() as usize, i);
            assert_eq!(DataRate::from_index(i as u8), Some(entry.rate));
        }
        assert_eq!(DataRate::from_index(16), None);
    }

    #[test]
    fn test_alpha_beta_groups() {
        assert_eq!(DataRate::Sps3750.alpha(), 4_194_304.0);
        assert_eq!(DataRate::Sps1000.alpha(), 3_932_160.0);
        assert_eq!(DataRate::Sps1000.beta(), 1.7474);
        assert_eq!(DataRate::Sps50.beta(), 1.3980);
        assert_eq!(DataRate::Sps60.alpha(), f64::from(0x3E_8000u32));
        assert_eq!(DataRate::Sps2_5.beta(), 1.6777);
    }

    #[test]
    fn test_from_sps() {
        assert_eq!(DataRate::from_sps(30000.0).unwrap(), DataRate::Sps30000);
        assert_eq!(DataRate::from_sps(15.0).unwrap(), DataRate::Sps15);
        assert!(DataRate::from_sps(0.0).is_err());
        assert!(DataRate::from_sps(-10.0).is_err());
    }

    #[test]
    fn test_gain_codes() {
        assert_eq!(PgaGain::X1.factor(), 1);
        assert_eq!(PgaGain::X64.factor(), 64);
        assert_eq!(PgaGain::X16.code(), 4);
        assert_eq!(PgaGain::from_factor(8).unwrap(), PgaGain::X8);
        assert!(PgaGain::from_factor(3).is_err());
        assert!(PgaGain::from_factor(128).is_err());
    }
}
