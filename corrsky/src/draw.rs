//! Cholesky factorisation and the correlated harmonic-coefficient draw.
//!
//! The draw enumerates j = ℓ(ℓ+1)/2 + m over ℓ ∈ [ℓmin, ℓmax], 0 ≤ m ≤ ℓ,
//! splits the range into one contiguous chunk per worker, and hands chunk
//! k a dedicated generator seeded `seed + (k+1)·OFFSET`. The chunk → seed
//! mapping is static, so a rerun with the same seed and worker count is
//! bit-identical regardless of how rayon schedules the chunks, and the
//! per-worker streams stay disjoint as long as the configuration bounds
//! on seed and worker count hold (checked at startup).
//!
//! Generator state persists across parallel regions within [`RngPool`],
//! so later stages (Poisson sampling, catalogue) continue the same
//! streams instead of reseeding.

use nalgebra::{Cholesky, DMatrix};
use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution as _, Normal};
use rayon::prelude::*;
use thiserror::Error;

use skypix::Alm;

use crate::covariance::CovarianceStack;

/// Seed offset between per-worker generator streams.
pub const RAND_OFFSET: u64 = 10_000_000;

#[derive(Error, Debug)]
pub enum DrawError {
    #[error("Cholesky decomposition failed: cov. matrix for l={0} is not positive-definite")]
    NotPositiveDefinite(usize),
}

/// Deterministic per-worker generators: slot 0 is the serial stream,
/// slots 1..=n the parallel chunk streams.
pub struct RngPool {
    serial: StdRng,
    workers: Vec<StdRng>,
}

impl RngPool {
    pub fn new(seed: u64, n_workers: usize) -> Self {
        Self {
            serial: StdRng::seed_from_u64(seed),
            workers: (0..n_workers)
                .map(|k| StdRng::seed_from_u64(seed + (k as u64 + 1) * RAND_OFFSET))
                .collect(),
        }
    }

    pub fn n_workers(&self) -> usize {
        self.workers.len()
    }

    /// The serial stream (seeded with the bare seed), for one-off draws.
    pub fn serial(&mut self) -> &mut StdRng {
        &mut self.serial
    }

    /// Mutable access to the worker streams for a statically chunked
    /// parallel region; chunk k must always use slot k.
    pub fn workers(&mut self) -> &mut [StdRng] {
        &mut self.workers
    }

    /// Split `total` items into one contiguous range per worker.
    pub fn static_chunks(&self, total: usize) -> Vec<std::ops::Range<usize>> {
        let n = self.workers.len().max(1);
        let chunk = total.div_ceil(n);
        (0..n)
            .map(|k| (k * chunk).min(total)..((k + 1) * chunk).min(total))
            .collect()
    }
}

/// Lower-triangular factors for ℓ ∈ [lmin, lmax].
pub struct CholeskyFactors {
    lmin: usize,
    factors: Vec<DMatrix<f64>>,
}

impl CholeskyFactors {
    pub fn lmin(&self) -> usize {
        self.lmin
    }

    pub fn lmax(&self) -> usize {
        self.lmin + self.factors.len() - 1
    }

    pub fn at(&self, l: usize) -> &DMatrix<f64> {
        &self.factors[l - self.lmin]
    }
}

/// Factor every matrix in [lmin, lmax]; failure names the offending ℓ.
pub fn cholesky_stack(
    stack: &CovarianceStack,
    lmin: usize,
    lmax: usize,
) -> Result<CholeskyFactors, DrawError> {
    let factors = (lmin..=lmax)
        .into_par_iter()
        .map(|l| {
            Cholesky::new(stack.at(l).clone())
                .map(|c| c.l())
                .ok_or(DrawError::NotPositiveDefinite(l))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CholeskyFactors {
        lmin,
        factors,
    })
}

/// Map the flattened index j = ℓ(ℓ+1)/2 + m back to (ℓ, m).
#[inline]
pub fn j_to_lm(j: usize) -> (usize, usize) {
    let mut l = (((8 * j + 1) as f64).sqrt() as usize).saturating_sub(1) / 2;
    while (l + 1) * (l + 2) / 2 <= j {
        l += 1;
    }
    while l * (l + 1) / 2 > j {
        l -= 1;
    }
    (l, j - l * (l + 1) / 2)
}

/// Draw correlated aℓm for every field.
///
/// Per j, each field receives an independent complex standard variable
/// (two 𝒩(0, ½) components; 𝒩(0, 1) on the real part alone when m = 0),
/// and the vector across fields is mixed by L(ℓ).
pub fn draw_alms(
    chol: &CholeskyFactors,
    n_fields: usize,
    pool: &mut RngPool,
) -> Vec<Alm> {
    let (lmin, lmax) = (chol.lmin(), chol.lmax());
    let jmin = lmin * (lmin + 1) / 2;
    let jmax = lmax * (lmax + 3) / 2;
    let chunks = pool.static_chunks(jmax - jmin + 1);

    let normal_unit = Normal::new(0.0, 1.0).expect("unit normal");
    let normal_half = Normal::new(0.0, std::f64::consts::FRAC_1_SQRT_2).expect("half normal");

    let drawn: Vec<Vec<(usize, Vec<Complex64>)>> = chunks
        .par_iter()
        .zip(pool.workers().par_iter_mut())
        .map(|(range, rng)| {
            let mut out = Vec::with_capacity(range.len());
            let mut x = vec![Complex64::new(0.0, 0.0); n_fields];
            for j in range.clone() {
                let (l, m) = j_to_lm(jmin + j);

                // Independent unit-variance complex variables per field.
                if m == 0 {
                    for xi in x.iter_mut() {
                        *xi = Complex64::new(normal_unit.sample(rng), 0.0);
                    }
                } else {
                    for xi in x.iter_mut() {
                        *xi = Complex64::new(normal_half.sample(rng), normal_half.sample(rng));
                    }
                }

                // a = L·x with the lower-triangular factor for this l.
                let lmat = chol.at(l);
                let a: Vec<Complex64> = (0..n_fields)
                    .map(|i| {
                        let mut acc = Complex64::new(0.0, 0.0);
                        for (k, xk) in x.iter().enumerate().take(i + 1) {
                            acc += lmat[(i, k)] * *xk;
                        }
                        acc
                    })
                    .collect();
                out.push((jmin + j, a));
            }
            out
        })
        .collect();

    let mut alms = vec![Alm::new(lmax); n_fields];
    for chunk in drawn {
        for (j, values) in chunk {
            let (l, m) = j_to_lm(j);
            for (i, v) in values.into_iter().enumerate() {
                alms[i].set(l, m, v);
            }
        }
    }
    alms
}
