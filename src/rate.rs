//! Relative rate: items produced per item consumed.
//!
//! A rate is either a fast `f64` or an exact [`BigRational`]. Both forms
//! share one rounding rule (nearest, ties away from zero) so that tag
//! offsets rescaled through either path land on the same item for
//! moderate offsets, while the exact form stays drift-free for offsets of
//! any size.

#![forbid(unsafe_code)]

use crate::error::RateError;
use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{One, Signed, ToPrimitive, Zero};

/// Tolerance used to snap float quotients that land a hair away from an integer.
const FLOAT_SNAP: f64 = 1e-9;

/// Ratio of items produced to items consumed by a block.
#[derive(Debug, Clone, PartialEq)]
pub enum RelativeRate {
    /// Approximate rate; cheap to apply.
    Float(f64),
    /// Exact rational rate; immune to accumulated rounding error.
    Exact(BigRational),
}

impl Default for RelativeRate {
    fn default() -> Self {
        RelativeRate::Float(1.0)
    }
}

impl RelativeRate {
    /// Float rate; must be positive and finite.
    pub fn float(rate: f64) -> Result<Self, RateError> {
        if rate.is_finite() && rate > 0.0 {
            Ok(RelativeRate::Float(rate))
        } else {
            Err(RateError::NotPositive(rate))
        }
    }

    /// Exact rate `interpolation / decimation`.
    pub fn ratio(interpolation: u64, decimation: u64) -> Result<Self, RateError> {
        if interpolation == 0 || decimation == 0 {
            return Err(RateError::ZeroTerm {
                interpolation,
                decimation,
            });
        }
        Ok(RelativeRate::Exact(BigRational::new(
            BigInt::from(interpolation),
            BigInt::from(decimation),
        )))
    }

    /// Check a rate that may have been built directly from a variant.
    pub fn validate(&self) -> Result<(), RateError> {
        match self {
            RelativeRate::Float(r) => RelativeRate::float(*r).map(|_| ()),
            RelativeRate::Exact(r) if r.is_positive() => Ok(()),
            RelativeRate::Exact(_) => Err(RateError::NotPositive(self.as_f64())),
        }
    }

    /// Whether this rate uses the exact rational path.
    pub fn is_exact(&self) -> bool {
        matches!(self, RelativeRate::Exact(_))
    }

    /// Whether the rate is exactly one.
    pub fn is_unity(&self) -> bool {
        match self {
            RelativeRate::Float(r) => *r == 1.0,
            RelativeRate::Exact(r) => r.is_one(),
        }
    }

    /// Float view of the rate.
    pub fn as_f64(&self) -> f64 {
        match self {
            RelativeRate::Float(r) => *r,
            RelativeRate::Exact(r) => r.to_f64().unwrap_or(f64::NAN),
        }
    }

    /// Exact view of the rate. Float rates convert through their binary value.
    pub fn to_exact(&self) -> BigRational {
        match self {
            RelativeRate::Float(r) => BigRational::from_float(*r).unwrap_or_else(BigRational::zero),
            RelativeRate::Exact(r) => r.clone(),
        }
    }

    /// Rescale an absolute item offset: `round(offset * rate)`, ties away from zero.
    pub fn rescale(&self, offset: u64) -> u64 {
        match self {
            // `as` saturates, and offsets are never negative.
            RelativeRate::Float(r) => (offset as f64 * r).round() as u64,
            RelativeRate::Exact(r) => {
                let scaled = BigRational::from_integer(BigInt::from(offset)) * r;
                ratio_to_u64(&scaled.round())
            }
        }
    }

    /// Whole output items obtainable from `ninput` inputs: `floor(ninput * rate)`.
    pub fn outputs_for(&self, ninput: usize) -> usize {
        match self {
            RelativeRate::Float(r) => snap(ninput as f64 * r, f64::floor) as usize,
            RelativeRate::Exact(r) => {
                let scaled = BigRational::from_integer(BigInt::from(ninput)) * r;
                ratio_to_usize(&scaled.floor())
            }
        }
    }

    /// Inputs needed to produce `noutput` items: `ceil(noutput / rate)`.
    pub fn inputs_for(&self, noutput: usize) -> usize {
        match self {
            RelativeRate::Float(r) => snap(noutput as f64 / r, f64::ceil) as usize,
            RelativeRate::Exact(r) => {
                let scaled = BigRational::from_integer(BigInt::from(noutput)) / r;
                ratio_to_usize(&scaled.ceil())
            }
        }
    }

    /// Rate observed from one call, kept in the same form as `self`.
    ///
    /// Both counts must be non-zero.
    pub fn observed(&self, produced: u64, consumed: u64) -> Self {
        match self {
            RelativeRate::Float(_) => RelativeRate::Float(produced as f64 / consumed as f64),
            RelativeRate::Exact(_) => RelativeRate::Exact(BigRational::new(
                BigInt::from(produced),
                BigInt::from(consumed),
            )),
        }
    }
}

fn snap(x: f64, round: fn(f64) -> f64) -> f64 {
    let nearest = x.round();
    if (x - nearest).abs() <= FLOAT_SNAP * nearest.abs().max(1.0) {
        nearest
    } else {
        round(x)
    }
}

fn ratio_to_u64(r: &BigRational) -> u64 {
    let whole = r.to_integer();
    whole
        .to_u64()
        .unwrap_or(if whole.is_negative() { 0 } else { u64::MAX })
}

fn ratio_to_usize(r: &BigRational) -> usize {
    let whole = r.to_integer();
    whole
        .to_usize()
        .unwrap_or(if whole.is_negative() { 0 } else { usize::MAX })
}
