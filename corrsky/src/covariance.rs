//! Per-ℓ cross-covariance assembly and validation.
//!
//! The pair-indexed spectra and the ℓ-indexed matrix stack are two
//! distinct data products; [`assemble`] is the explicit transpose stage
//! between them. Assembly fills missing pairs by symmetry (or zero, when
//! allowed), validation enforces the diagonal and correlation invariants
//! of §4.5 with the `MINDIAG_FRAC` / `BADCORR_FRAC` escape hatches.

use nalgebra::DMatrix;
use thiserror::Error;

use crate::diag::Diagnostics;
use crate::spectra::PairGrid;

#[derive(Error, Debug)]
pub enum CovarianceError {
    #[error("pair [{0}, {1}] could not be set because [{1}, {0}] was not set either")]
    MissingPair(usize, usize),
}

/// Symmetric N×N covariance matrices for every ℓ ∈ [0, lastl].
#[derive(Debug, Clone)]
pub struct CovarianceStack {
    n_fields: usize,
    matrices: Vec<DMatrix<f64>>,
}

impl CovarianceStack {
    pub fn n_fields(&self) -> usize {
        self.n_fields
    }

    /// Highest multipole stored.
    pub fn lastl(&self) -> usize {
        self.matrices.len() - 1
    }

    pub fn at(&self, l: usize) -> &DMatrix<f64> {
        &self.matrices[l]
    }

    pub fn at_mut(&mut self, l: usize) -> &mut DMatrix<f64> {
        &mut self.matrices[l]
    }

    /// The (i, j) entry across all ℓ, e.g. for regularised spectra output.
    pub fn pair_spectrum(&self, i: usize, j: usize) -> Vec<f64> {
        self.matrices.iter().map(|m| m[(i, j)]).collect()
    }
}

/// Transpose the pair grid into the per-ℓ matrix stack, applying the
/// symmetry / zero fill policy for missing pairs.
pub fn assemble(
    grid: &PairGrid,
    allow_miss_cl: bool,
    diag: &Diagnostics,
) -> Result<CovarianceStack, CovarianceError> {
    let n = grid.n_fields;
    let lastl = grid.lastl;

    // Resolve every pair to a spectrum: direct, transposed, or zero.
    let zero = vec![0.0; lastl + 1];
    let mut resolved: Vec<&[f64]> = Vec::with_capacity(n * n);
    for i in 0..n {
        for j in 0..n {
            if let Some(cl) = grid.get(i, j) {
                resolved.push(cl);
            } else if let Some(cl) = grid.get(j, i) {
                resolved.push(cl);
            } else if allow_miss_cl {
                resolved.push(&zero);
            } else {
                return Err(CovarianceError::MissingPair(i, j));
            }
        }
    }
    let _ = diag;

    let matrices = (0..=lastl)
        .map(|l| DMatrix::from_fn(n, n, |i, j| resolved[i * n + j][l]))
        .collect();
    Ok(CovarianceStack {
        n_fields: n,
        matrices,
    })
}

/// Diagonal and correlation checks over ℓ ∈ [lmin, lmax], in place.
pub fn validate(
    stack: &mut CovarianceStack,
    lmin: usize,
    lmax: usize,
    badcorr_frac: f64,
    mindiag_frac: f64,
    diag: &Diagnostics,
) {
    let n = stack.n_fields();

    // Smallest positive variance over the validated range, used as the
    // replacement scale for zero diagonals.
    let mindiag = if mindiag_frac > 0.0 {
        let mut best = f64::MAX;
        for l in lmin..=lmax {
            for i in 0..n {
                let v = stack.at(l)[(i, i)];
                if v > 0.0 && v < best {
                    best = v;
                }
            }
        }
        (best < f64::MAX).then_some(best)
    } else {
        None
    };

    for l in lmin..=lmax {
        let m = stack.at_mut(l);
        for i in 0..n {
            if m[(i, i)] < 0.0 {
                diag.warn(format_args!(
                    "cov. matrix (l={l}) element [{i}, {i}] is negative"
                ));
            }
            if m[(i, i)] == 0.0 {
                match mindiag {
                    Some(base) => m[(i, i)] = mindiag_frac * base,
                    None => diag.warn(format_args!(
                        "cov. matrix (l={l}) element [{i}, {i}] is zero"
                    )),
                }
            }
            for j in i + 1..n {
                let denom = (m[(i, i)] * m[(j, j)]).sqrt();
                let rho = m[(i, j)] / denom;
                if rho.abs() > 1.0 {
                    tracing::info!(
                        "cov. matrix (l={l}) element [{i}, {j}] gives correlation {rho}, \
                         inflating variances by BADCORR_FRAC"
                    );
                    m[(i, i)] *= 1.0 + badcorr_frac;
                    m[(j, j)] *= 1.0 + badcorr_frac;
                    let rho = m[(i, j)] / (m[(i, i)] * m[(j, j)]).sqrt();
                    if rho.abs() > 1.0 {
                        diag.warn(format_args!(
                            "BADCORR_FRAC could not fix correlation of [{i}, {j}] at l={l}"
                        ));
                    }
                }
            }
        }
    }
}
