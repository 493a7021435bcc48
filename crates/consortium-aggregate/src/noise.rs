//! Laplace mechanism.
//!
//! Noise with scale `b = sensitivity / epsilon` is drawn by inverse CDF:
//! for `u` uniform on `(-1/2, 1/2)`, `-b * sgn(u) * ln(1 - 2|u|)`.

use crate::error::{AggregateError, Result};
use rand::distributions::Distribution;
use rand::Rng;

/// Zero-centred Laplace distribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Laplace {
    scale: f64,
}

impl Laplace {
    /// Distribution with scale `b`. A zero scale always samples `0.0`.
    pub fn new(scale: f64) -> Result<Self> {
        if !scale.is_finite() || scale < 0.0 {
            return Err(AggregateError::InvalidPolicy(format!(
                "laplace scale must be finite and non-negative, got {}",
                scale
            )));
        }
        Ok(Self { scale })
    }

    /// Scale calibrated for a query of the given sensitivity.
    pub fn calibrated(sensitivity: f64, epsilon: f64) -> Result<Self> {
        if !(epsilon.is_finite() && epsilon > 0.0) {
            return Err(AggregateError::InvalidPolicy(format!(
                "epsilon must be positive, got {}",
                epsilon
            )));
        }
        Self::new(sensitivity / epsilon)
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }
}

impl Distribution<f64> for Laplace {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        if self.scale == 0.0 {
            return 0.0;
        }
        loop {
            let u: f64 = rng.gen_range(-0.5..0.5);
            let tail = 1.0 - 2.0 * u.abs();
            // u = -0.5 would give ln(0)
            if tail > 0.0 {
                return -self.scale * u.signum() * tail.ln();
            }
        }
    }
}
