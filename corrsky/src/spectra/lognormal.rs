//! Lognormal → Gaussian auxiliary spectrum transform.
//!
//! For every input pair (i, j) with target mean product
//! M_ij = (μᵢ+sᵢ)(μⱼ+sⱼ), the round trip is
//!
//! Cℓ → ξ(θ) → ξ_G(θ) = log(1 + ξ/M_ij) → Cℓ_G
//!
//! with both Legendre transforms evaluated by the discrete transform at
//! the common band-limit. In the Gaussian model the transform reduces to
//! resampling onto the integer ℓ grid.

use rayon::prelude::*;

use skypix::{DiscreteLegendre, MonotoneCubic};

use crate::diag::Diagnostics;
use crate::fields::FieldRegistry;
use crate::spectra::{PairGrid, SpectrumError, SpectrumSample, SpectrumSet};

/// Replacement for samples whose log argument was non-positive.
pub const BAD_XI_SENTINEL: f64 = -666.0;

/// Resample one spectrum onto integer ℓ ∈ [0, lastl].
///
/// ℓ = 0 is forced to zero (the transform requires it); when the input
/// starts above the dipole, ℓ = 1 is either linearly extrapolated from
/// the two lowest samples or clamped to zero, per `extrap_dipole`. Other
/// multipoles below the first sample are zero.
pub fn resample_to_grid(
    sample: &SpectrumSample,
    lastl: usize,
    extrap_dipole: bool,
) -> Result<Vec<f64>, SpectrumError> {
    let spline = MonotoneCubic::new(sample.ells.clone(), sample.cls.clone())
        .expect("loader guarantees >= 2 monotone samples");
    let first = sample.min_ell();

    let mut out = Vec::with_capacity(lastl + 1);
    for l in 0..=lastl {
        let lf = l as f64;
        let v = if l == 0 {
            0.0
        } else if l == 1 && first > 1.0 {
            if extrap_dipole {
                let (x0, x1) = (sample.ells[0], sample.ells[1]);
                let (y0, y1) = (sample.cls[0], sample.cls[1]);
                y0 + (1.0 - x0) * (y1 - y0) / (x1 - x0)
            } else {
                0.0
            }
        } else if lf < first {
            0.0
        } else {
            spline.eval_clamped(lf)
        };
        out.push(v);
    }
    Ok(out)
}

/// ξ → ξ_G in place; returns the number of non-positive log arguments,
/// each replaced by [`BAD_XI_SENTINEL`].
pub fn gaussianize_xi(xi: &mut [f64], mean_product: f64) -> usize {
    let mut bad = 0;
    for v in xi.iter_mut() {
        let arg = 1.0 + *v / mean_product;
        if arg <= 0.0 {
            *v = BAD_XI_SENTINEL;
            bad += 1;
        } else {
            *v = arg.ln();
        }
    }
    bad
}

/// The inverse map ξ = M_ij·(e^{ξ_G} − 1), used for regularised-spectrum
/// output.
pub fn lognormalize_xi(xi: &mut [f64], mean_product: f64) {
    for v in xi.iter_mut() {
        *v = (v.exp() - 1.0) * mean_product;
    }
}

/// Per-pair intermediate products retained for optional output.
#[derive(Debug, Default)]
pub struct TransformIntermediates {
    /// ξ(θ) per pair, in registry pair order.
    pub xi: Vec<(usize, usize, Vec<f64>)>,
    /// ξ_G(θ) per pair.
    pub gxi: Vec<(usize, usize, Vec<f64>)>,
}

/// Gaussian model: resample every loaded spectrum onto the integer grid.
pub fn build_resampled_grid(
    set: &SpectrumSet,
    lastl: usize,
    extrap_dipole: bool,
) -> Result<PairGrid, SpectrumError> {
    let n = set.n_fields();
    let cells: Vec<Option<Vec<f64>>> = (0..n * n)
        .into_par_iter()
        .map(|k| {
            set.get(k / n, k % n)
                .map(|s| resample_to_grid(s, lastl, extrap_dipole))
                .transpose()
        })
        .collect::<Result<_, _>>()?;
    let mut grid = PairGrid::empty(n, lastl);
    for (k, cell) in cells.into_iter().enumerate() {
        if let Some(cl) = cell {
            grid.set(k / n, k % n, cl);
        }
    }
    Ok(grid)
}

/// Lognormal model: the full Cℓ → ξ → ξ_G → Cℓ_G round trip per pair.
///
/// `keep_xi` / `keep_gxi` retain the correlation functions for output.
/// Any non-positive Gaussianisation argument is warned about per pair and
/// aborts the run once all pairs have been processed.
pub fn build_gaussian_aux_grid(
    set: &SpectrumSet,
    registry: &FieldRegistry,
    dlt: &DiscreteLegendre,
    extrap_dipole: bool,
    keep_xi: bool,
    keep_gxi: bool,
    diag: &Diagnostics,
) -> Result<(PairGrid, TransformIntermediates), SpectrumError> {
    let n = set.n_fields();
    let lastl = dlt.lmax();

    struct PairOut {
        i: usize,
        j: usize,
        gcl: Vec<f64>,
        xi: Option<Vec<f64>>,
        gxi: Option<Vec<f64>>,
        bad: usize,
        negative_variance: bool,
    }

    let results: Vec<Option<PairOut>> = (0..n * n)
        .into_par_iter()
        .map(|k| -> Result<Option<PairOut>, SpectrumError> {
            let (i, j) = (k / n, k % n);
            let Some(sample) = set.get(i, j) else {
                return Ok(None);
            };
            let cl = resample_to_grid(sample, lastl, extrap_dipole)?;
            let mut xi = dlt.synthesize(&cl);
            let kept_xi = keep_xi.then(|| xi.clone());

            let fi = registry.get(i);
            let fj = registry.get(j);
            let mean_product = (fi.mean + fi.shift) * (fj.mean + fj.shift);
            let bad = gaussianize_xi(&mut xi, mean_product);
            // xi[0] is the smallest angle, i.e. the variance estimate.
            let negative_variance = i == j && xi.first().copied().unwrap_or(0.0) < 0.0;
            let kept_gxi = keep_gxi.then(|| xi.clone());

            let gcl = dlt.analyze(&xi);
            Ok(Some(PairOut {
                i,
                j,
                gcl,
                xi: kept_xi,
                gxi: kept_gxi,
                bad,
                negative_variance,
            }))
        })
        .collect::<Result<_, _>>()?;

    let mut grid = PairGrid::empty(n, lastl);
    let mut intermediates = TransformIntermediates::default();
    let mut total_bad = 0;
    for out in results.into_iter().flatten() {
        if out.bad > 0 {
            diag.warn(format_args!(
                "pair [{}, {}]: {} correlation samples lead to a bad log argument, set to {}",
                out.i, out.j, out.bad, BAD_XI_SENTINEL
            ));
            total_bad += out.bad;
        }
        if out.negative_variance {
            diag.warn(format_args!(
                "pair [{}, {}]: auxiliary field variance is negative",
                out.i, out.j
            ));
        }
        if let Some(xi) = out.xi {
            intermediates.xi.push((out.i, out.j, xi));
        }
        if let Some(gxi) = out.gxi {
            intermediates.gxi.push((out.i, out.j, gxi));
        }
        grid.set(out.i, out.j, out.gcl);
    }
    if total_bad > 0 {
        return Err(SpectrumError::BadLogArguments(total_bad));
    }
    Ok((grid, intermediates))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Distribution;
    use crate::fields::{FieldInfo, FieldType};
    use approx::assert_relative_eq;

    fn registry_with_shift(shift: f64) -> FieldRegistry {
        FieldRegistry::from_fields(
            vec![FieldInfo {
                f: 1,
                z: 1,
                mean: 0.0,
                shift,
                kind: FieldType::Density,
                zmin: 0.0,
                zmax: 0.5,
            }],
            Distribution::Lognormal,
        )
        .unwrap()
    }

    #[test]
    fn test_resample_hits_grid_points() {
        let sample = SpectrumSample {
            ells: vec![2.0, 4.0, 8.0],
            cls: vec![0.4, 0.2, 0.1],
        };
        let cl = resample_to_grid(&sample, 8, false).unwrap();
        assert_eq!(cl.len(), 9);
        assert_eq!(cl[0], 0.0);
        assert_eq!(cl[1], 0.0);
        assert_relative_eq!(cl[2], 0.4);
        assert_relative_eq!(cl[4], 0.2);
        assert_relative_eq!(cl[8], 0.1);
        // Interpolated values stay inside the bracketing samples.
        assert!(cl[3] < 0.4 && cl[3] > 0.2);
    }

    #[test]
    fn test_dipole_extrapolation_policy() {
        let sample = SpectrumSample {
            ells: vec![2.0, 4.0],
            cls: vec![0.4, 0.2],
        };
        // Linear continuation to l=1: 0.4 + (1-2)*(0.2-0.4)/2 = 0.5.
        let cl = resample_to_grid(&sample, 4, true).unwrap();
        assert_relative_eq!(cl[1], 0.5, epsilon = 1e-12);
        let cl = resample_to_grid(&sample, 4, false).unwrap();
        assert_eq!(cl[1], 0.0);

        // When the input covers the dipole, the flag is irrelevant.
        let covers = SpectrumSample {
            ells: vec![1.0, 2.0, 4.0],
            cls: vec![0.7, 0.4, 0.2],
        };
        for flag in [true, false] {
            let cl = resample_to_grid(&covers, 4, flag).unwrap();
            assert_relative_eq!(cl[1], 0.7);
        }
    }

    #[test]
    fn test_gaussianize_roundtrip() {
        let mut xi = vec![0.5, 0.1, -0.2, 0.0];
        let orig = xi.clone();
        let bad = gaussianize_xi(&mut xi, 2.0);
        assert_eq!(bad, 0);
        lognormalize_xi(&mut xi, 2.0);
        for (a, b) in xi.iter().zip(&orig) {
            assert_relative_eq!(a, b, epsilon = 1e-14);
        }
    }

    #[test]
    fn test_gaussianize_flags_bad_arguments() {
        let mut xi = vec![0.5, -3.0];
        let bad = gaussianize_xi(&mut xi, 1.0); // 1 + (-3) = -2 <= 0
        assert_eq!(bad, 1);
        assert_eq!(xi[1], BAD_XI_SENTINEL);
    }

    #[test]
    fn test_full_transform_recovers_gaussian_input() {
        // Start from a Gaussian spectrum, map it forward analytically to
        // the lognormal spectrum, and check the pipeline transform gets
        // the Gaussian spectrum back.
        let lastl = 16;
        let dlt = DiscreteLegendre::new(lastl);
        let shift = 1.5;
        let registry = registry_with_shift(shift);

        let gcl: Vec<f64> = (0..=lastl)
            .map(|l| {
                if l >= 2 {
                    0.02 / (l as f64).powi(2)
                } else {
                    0.0
                }
            })
            .collect();
        let mut xi = dlt.synthesize(&gcl);
        // Forward lognormal map: xi_ln = M (e^{xi_G} - 1), M = shift^2.
        lognormalize_xi(&mut xi, shift * shift);
        let lncl = dlt.analyze(&xi);

        let mut set = SpectrumSet::empty(1);
        set.set(
            0,
            0,
            SpectrumSample {
                ells: (0..=lastl).map(|l| l as f64).collect(),
                cls: lncl,
            },
        );
        let diag = Diagnostics::new();
        let (grid, _) =
            build_gaussian_aux_grid(&set, &registry, &dlt, false, false, false, &diag).unwrap();
        let back = grid.get(0, 0).unwrap();
        for l in 2..=lastl {
            assert_relative_eq!(back[l], gcl[l], epsilon = 1e-8, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_bad_log_arguments_abort() {
        // A wildly negative correlation with a tiny shift forces the log
        // argument below zero.
        let lastl = 8;
        let dlt = DiscreteLegendre::new(lastl);
        let registry = registry_with_shift(0.1);
        let mut set = SpectrumSet::empty(1);
        set.set(
            0,
            0,
            SpectrumSample {
                ells: (0..=lastl).map(|l| l as f64).collect(),
                cls: (0..=lastl).map(|l| if l == 2 { 5.0 } else { 0.0 }).collect(),
            },
        );
        let diag = Diagnostics::new();
        let result = build_gaussian_aux_grid(&set, &registry, &dlt, false, false, false, &diag);
        assert!(matches!(result, Err(SpectrumError::BadLogArguments(_))));
        assert!(diag.warnings() > 0);
    }
}
