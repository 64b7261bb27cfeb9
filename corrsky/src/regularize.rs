//! Iterative positive-definite regularisation of the covariance stack.
//!
//! Each matrix is nudged towards positive-definiteness by flooring its
//! eigenvalues at a small positive fraction of the largest one; the floor
//! grows geometrically per step so the loop always terminates, bounded by
//! `REG_MAXSTEPS`. The maximum-entry change relative to the input's
//! maximum entry is reported per matrix.

use nalgebra::{DMatrix, SymmetricEigen};
use rayon::prelude::*;
use thiserror::Error;

use crate::covariance::CovarianceStack;
use crate::diag::Diagnostics;

#[derive(Error, Debug)]
pub enum RegularizeError {
    #[error("failed to regularise {failures} covariance matrices within {max_steps} steps")]
    Exceeded { failures: usize, max_steps: usize },
}

/// Outcome of regularising one matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegStatus {
    /// Already positive-definite (or identically zero).
    Unchanged,
    /// Made positive-definite after the given number of steps.
    Regularized { steps: usize },
    /// Still not positive-definite after `REG_MAXSTEPS` steps.
    Exceeded,
}

/// ‖A′−A‖_max / ‖A‖_max.
pub fn max_frac_diff(after: &DMatrix<f64>, before: &DMatrix<f64>) -> f64 {
    let scale = before.iter().fold(0.0_f64, |a, v| a.max(v.abs()));
    if scale == 0.0 {
        return 0.0;
    }
    after
        .iter()
        .zip(before.iter())
        .fold(0.0_f64, |a, (x, y)| a.max((x - y).abs()))
        / scale
}

fn is_positive_definite(m: &DMatrix<f64>) -> bool {
    nalgebra::Cholesky::new(m.clone()).is_some()
}

/// Regularise one symmetric matrix in place.
pub fn regularize(m: &mut DMatrix<f64>, max_steps: usize) -> (RegStatus, f64) {
    let scale = m.iter().fold(0.0_f64, |a, v| a.max(v.abs()));
    if scale == 0.0 || is_positive_definite(m) {
        return (RegStatus::Unchanged, 0.0);
    }

    let before = m.clone();
    let mut floor = scale * 1e-12;
    for step in 1..=max_steps {
        let eig = SymmetricEigen::new(m.clone());
        let mut values = eig.eigenvalues.clone();
        for v in values.iter_mut() {
            if *v < floor {
                *v = floor;
            }
        }
        let rebuilt = &eig.eigenvectors
            * DMatrix::from_diagonal(&values)
            * eig.eigenvectors.transpose();
        // Symmetrise away rounding asymmetry from the reconstruction.
        *m = (&rebuilt + rebuilt.transpose()) * 0.5;

        if is_positive_definite(m) {
            return (RegStatus::Regularized { steps: step }, max_frac_diff(m, &before));
        }
        floor *= 10.0;
    }
    (RegStatus::Exceeded, max_frac_diff(m, &before))
}

/// Summary of a stack-wide regularisation pass.
#[derive(Debug, Clone, Copy)]
pub struct RegularizeSummary {
    /// Largest per-matrix fractional change.
    pub max_change: f64,
    /// Multipole where it occurred.
    pub at_l: usize,
}

/// Regularise every matrix for ℓ ∈ [lstart, lend]; any matrix that still
/// fails after `max_steps` is fatal.
pub fn regularize_stack(
    stack: &mut CovarianceStack,
    lstart: usize,
    lend: usize,
    max_steps: usize,
    diag: &Diagnostics,
) -> Result<RegularizeSummary, RegularizeError> {
    let results: Vec<(usize, RegStatus, f64, DMatrix<f64>)> = (lstart..=lend)
        .into_par_iter()
        .map(|l| {
            let mut m = stack.at(l).clone();
            let (status, change) = regularize(&mut m, max_steps);
            (l, status, change, m)
        })
        .collect();

    let mut failures = 0;
    let mut summary = RegularizeSummary {
        max_change: 0.0,
        at_l: lstart,
    };
    for (l, status, change, m) in results {
        *stack.at_mut(l) = m;
        if status == RegStatus::Exceeded {
            diag.warn(format_args!(
                "regularisation for l={l} reached REG_MAXSTEPS with max. change of {change:e}"
            ));
            failures += 1;
        }
        if change > summary.max_change {
            summary.max_change = change;
            summary.at_l = l;
        }
    }
    if failures > 0 {
        return Err(RegularizeError::Exceeded {
            failures,
            max_steps,
        });
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn eigenvalues(m: &DMatrix<f64>) -> Vec<f64> {
        let mut v: Vec<f64> = SymmetricEigen::new(m.clone())
            .eigenvalues
            .iter()
            .copied()
            .collect();
        v.sort_by(|a, b| a.partial_cmp(b).unwrap());
        v
    }

    #[test]
    fn test_positive_definite_is_untouched() {
        let mut m = DMatrix::from_row_slice(2, 2, &[2.0, 0.3, 0.3, 1.0]);
        let before = m.clone();
        let (status, change) = regularize(&mut m, 20);
        assert_eq!(status, RegStatus::Unchanged);
        assert_eq!(change, 0.0);
        assert_eq!(m, before);
    }

    #[test]
    fn test_zero_matrix_is_untouched() {
        let mut m = DMatrix::zeros(3, 3);
        let (status, _) = regularize(&mut m, 20);
        assert_eq!(status, RegStatus::Unchanged);
    }

    #[test]
    fn test_indefinite_matrix_becomes_pd_with_small_change() {
        // Eigenvalues 1.5 and -0.5.
        let mut m = DMatrix::from_row_slice(2, 2, &[0.5, 1.0, 1.0, 0.5]);
        let (status, change) = regularize(&mut m, 50);
        assert!(matches!(status, RegStatus::Regularized { .. }));
        let ev = eigenvalues(&m);
        assert!(ev[0] >= 0.0, "smallest eigenvalue {} negative", ev[0]);
        assert!(nalgebra::Cholesky::new(m.clone()).is_some());
        // The nudge is on the order of the offending eigenvalue.
        assert!(change > 0.0 && change < 1.0);
        // Symmetry is preserved.
        assert_relative_eq!(m[(0, 1)], m[(1, 0)], epsilon = 1e-14);
    }

    #[test]
    fn test_singular_matrix_perfect_correlation() {
        // Perfectly correlated pair: eigenvalues 2 and 0. The regulariser
        // must lift the zero mode just enough for Cholesky to pass while
        // barely changing the entries.
        let mut m = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let (status, change) = regularize(&mut m, 50);
        assert!(matches!(status, RegStatus::Regularized { .. }));
        assert!(nalgebra::Cholesky::new(m.clone()).is_some());
        assert!(change < 1e-6, "change {change} too large for a zero mode");
    }

    #[test]
    fn test_max_frac_diff() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1.0]);
        let b = DMatrix::from_row_slice(2, 2, &[1.1, 0.0, 0.0, 1.0]);
        assert_relative_eq!(max_frac_diff(&b, &a), 0.1, epsilon = 1e-12);
        assert_eq!(max_frac_diff(&a, &DMatrix::zeros(2, 2)), 0.0);
    }

    #[test]
    fn test_stack_pass_and_exceeded() {
        use crate::spectra::PairGrid;

        let mut grid = PairGrid::empty(2, 2);
        grid.set(0, 0, vec![0.0, 1.0, 1.0]);
        grid.set(1, 1, vec![0.0, 1.0, 1.0]);
        grid.set(0, 1, vec![0.0, 0.5, 1.0]); // l=2 is singular
        let diag = Diagnostics::new();
        let mut stack = crate::covariance::assemble(&grid, false, &diag).unwrap();
        let summary = regularize_stack(&mut stack, 1, 2, 50, &diag).unwrap();
        assert_eq!(summary.at_l, 2);
        assert!(nalgebra::Cholesky::new(stack.at(2).clone()).is_some());

        // A max_steps budget of zero can never fix the singular matrix.
        let mut stack = crate::covariance::assemble(&grid, false, &diag).unwrap();
        let err = regularize_stack(&mut stack, 1, 2, 0, &diag);
        assert!(matches!(err, Err(RegularizeError::Exceeded { .. })));
    }
}
