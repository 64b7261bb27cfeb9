//! Monotone cubic interpolation.
//!
//! Fritsch–Carlson tangent limiting on a cubic Hermite interpolant: the
//! curve passes through every sample and never overshoots between
//! monotone neighbours, which is what spectrum resampling and the pixel
//! window lookup need (an ordinary cubic spline can ring on steeply
//! falling power spectra).

use thiserror::Error;

/// Errors from interpolant construction and evaluation.
#[derive(Error, Debug)]
pub enum InterpError {
    #[error("input vectors must have at least 2 points")]
    InsufficientData,
    #[error("input vectors must have the same length")]
    MismatchedLengths,
    #[error("x values must be strictly ascending")]
    UnsortedData,
    #[error("value {0} is outside interpolation range [{1}, {2}]")]
    OutOfBounds(f64, f64, f64),
}

/// Monotonicity-preserving cubic Hermite interpolant.
#[derive(Debug, Clone)]
pub struct MonotoneCubic {
    x: Vec<f64>,
    y: Vec<f64>,
    /// Limited tangent at each sample.
    tangents: Vec<f64>,
}

impl MonotoneCubic {
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Result<Self, InterpError> {
        if x.len() != y.len() {
            return Err(InterpError::MismatchedLengths);
        }
        if x.len() < 2 {
            return Err(InterpError::InsufficientData);
        }
        if x.windows(2).any(|w| w[1] <= w[0]) {
            return Err(InterpError::UnsortedData);
        }

        let n = x.len();
        let mut secants = Vec::with_capacity(n - 1);
        for i in 0..n - 1 {
            secants.push((y[i + 1] - y[i]) / (x[i + 1] - x[i]));
        }

        // One-sided tangents at the ends, averaged secants inside.
        let mut tangents = Vec::with_capacity(n);
        tangents.push(secants[0]);
        for i in 1..n - 1 {
            if secants[i - 1] * secants[i] <= 0.0 {
                tangents.push(0.0);
            } else {
                tangents.push(0.5 * (secants[i - 1] + secants[i]));
            }
        }
        tangents.push(secants[n - 2]);

        // Fritsch-Carlson limiter.
        for i in 0..n - 1 {
            if secants[i] == 0.0 {
                tangents[i] = 0.0;
                tangents[i + 1] = 0.0;
                continue;
            }
            let alpha = tangents[i] / secants[i];
            let beta = tangents[i + 1] / secants[i];
            let r2 = alpha * alpha + beta * beta;
            if r2 > 9.0 {
                let tau = 3.0 / r2.sqrt();
                tangents[i] = tau * alpha * secants[i];
                tangents[i + 1] = tau * beta * secants[i];
            }
        }

        Ok(Self { x, y, tangents })
    }

    /// Interpolation domain (x_min, x_max).
    pub fn domain(&self) -> (f64, f64) {
        (self.x[0], *self.x.last().unwrap())
    }

    /// Evaluate at `x`; out-of-domain arguments are an error.
    pub fn eval(&self, x: f64) -> Result<f64, InterpError> {
        let (lo, hi) = self.domain();
        if x < lo || x > hi {
            return Err(InterpError::OutOfBounds(x, lo, hi));
        }
        Ok(self.eval_unchecked(x))
    }

    /// Evaluate at `x`, clamping out-of-domain arguments to the boundary.
    pub fn eval_clamped(&self, x: f64) -> f64 {
        let (lo, hi) = self.domain();
        self.eval_unchecked(x.clamp(lo, hi))
    }

    fn eval_unchecked(&self, x: f64) -> f64 {
        let i = match self
            .x
            .binary_search_by(|v| v.partial_cmp(&x).expect("non-finite abscissa"))
        {
            Ok(i) => return self.y[i],
            Err(i) => i.clamp(1, self.x.len() - 1) - 1,
        };
        let h = self.x[i + 1] - self.x[i];
        let t = (x - self.x[i]) / h;
        let t2 = t * t;
        let t3 = t2 * t;
        let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
        let h10 = t3 - 2.0 * t2 + t;
        let h01 = -2.0 * t3 + 3.0 * t2;
        let h11 = t3 - t2;
        h00 * self.y[i] + h10 * h * self.tangents[i] + h01 * self.y[i + 1]
            + h11 * h * self.tangents[i + 1]
    }
}
