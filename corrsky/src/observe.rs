//! Selection-function application and count generation.
//!
//! Density maps are converted to per-pixel galaxy counts: either a
//! Poisson draw around the expected count (POISSON = 1) or the expected
//! count itself (POISSON = 0). The expectation per pixel is
//! selection · (1 + δ) · Ω_pix[arcmin²] · Δz. The Poisson stage resets
//! unphysical contrasts δ < −1 to zero and reports the affected fraction.
//!
//! The Poisson draws use the same statically chunked worker streams as
//! the harmonic draw, continuing their state, so a fixed seed and worker
//! count reproduces the whole realisation bit for bit.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::Array2;
use rand_distr::{Distribution as _, Poisson};
use rayon::prelude::*;
use thiserror::Error;

use skypix::Pixelisation;

use crate::draw::RngPool;
use crate::fields::{FieldRegistry, FieldType};

/// Full sky in arcmin².
const FULL_SKY_ARCMIN2: f64 = 4.0 * std::f64::consts::PI
    * (180.0 * 60.0 / std::f64::consts::PI)
    * (180.0 * 60.0 / std::f64::consts::PI);

#[derive(Error, Debug)]
pub enum ObserveError {
    #[error("cannot read selection map {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("selection map {path} has {found} pixels, maps have {expected}")]
    MapLength {
        path: String,
        found: usize,
        expected: usize,
    },
}

/// Separable selection function reduced to a uniform scale times an
/// optional shared angular map.
#[derive(Debug, Clone)]
pub struct SelectionFunction {
    scale: f64,
    angular: Option<Vec<f64>>,
}

impl SelectionFunction {
    pub fn uniform(scale: f64) -> Self {
        Self {
            scale,
            angular: None,
        }
    }

    /// Load the optional angular map (one value per pixel, text; the last
    /// column of each line is used).
    pub fn load(
        scale: f64,
        angular_path: Option<&Path>,
        npix: usize,
    ) -> Result<Self, ObserveError> {
        let angular = match angular_path {
            None => None,
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|source| ObserveError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                let values: Vec<f64> = text
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .filter_map(|l| l.split_whitespace().next_back()?.parse().ok())
                    .collect();
                if values.len() != npix {
                    return Err(ObserveError::MapLength {
                        path: path.display().to_string(),
                        found: values.len(),
                        expected: npix,
                    });
                }
                Some(values)
            }
        };
        Ok(Self { scale, angular })
    }

    #[inline]
    pub fn value(&self, pixel: usize) -> f64 {
        match &self.angular {
            Some(map) => self.scale * map[pixel],
            None => self.scale,
        }
    }
}

/// Convert density-contrast maps to (expected or sampled) galaxy counts
/// in place. Convergence maps pass through untouched.
pub fn apply_selection(
    maps: &mut Array2<f64>,
    registry: &FieldRegistry,
    selection: &SelectionFunction,
    poisson: bool,
    pix: &Pixelisation,
    pool: &mut RngPool,
) {
    let npix = pix.npix();
    let pixel_arcmin2 = FULL_SKY_ARCMIN2 / npix as f64;

    for i in 0..registry.n_fields() {
        let fi = registry.get(i);
        if fi.kind != FieldType::Density {
            continue;
        }
        let dwdz = pixel_arcmin2 * (fi.zmax - fi.zmin);
        let mut row = maps.row_mut(i);
        let values = row.as_slice_mut().expect("maps are row-contiguous");

        if poisson {
            tracing::info!("Poisson sampling {}", fi.label());
            let clamped = AtomicUsize::new(0);
            let chunks = pool.static_chunks(npix);

            // Split the row into the same contiguous chunks as the worker
            // streams, keeping each chunk's pixel offset.
            let mut parts: Vec<(usize, &mut [f64])> = Vec::with_capacity(chunks.len());
            let mut rest = values;
            for range in &chunks {
                let (head, tail) = rest.split_at_mut(range.len());
                parts.push((range.start, head));
                rest = tail;
            }

            parts
                .par_iter_mut()
                .zip(pool.workers().par_iter_mut())
                .for_each(|((start, part), rng)| {
                    for (offset, v) in part.iter_mut().enumerate() {
                        if *v < -1.0 {
                            clamped.fetch_add(1, Ordering::Relaxed);
                            *v = 0.0;
                        }
                        let lambda = selection.value(*start + offset) * (1.0 + *v) * dwdz;
                        *v = if lambda > 0.0 {
                            Poisson::new(lambda).expect("positive mean").sample(rng)
                        } else {
                            0.0
                        };
                    }
                });

            let fraction = clamped.load(Ordering::Relaxed) as f64 / npix as f64;
            tracing::info!(
                "negative density fraction (set to 0): {:.2}%",
                100.0 * fraction
            );
        } else {
            tracing::info!("using expected number density for {}", fi.label());
            values.par_iter_mut().enumerate().for_each(|(p, v)| {
                *v = selection.value(p) * (1.0 + *v) * dwdz;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Distribution;
    use crate::fields::{FieldInfo, FieldRegistry};
    use approx::assert_relative_eq;

    fn registry() -> FieldRegistry {
        FieldRegistry::from_fields(
            vec![
                FieldInfo {
                    f: 1,
                    z: 1,
                    mean: 0.0,
                    shift: 1.0,
                    kind: FieldType::Density,
                    zmin: 0.0,
                    zmax: 0.5,
                },
                FieldInfo {
                    f: 2,
                    z: 1,
                    mean: 0.0,
                    shift: 0.02,
                    kind: FieldType::Convergence,
                    zmin: 1.0,
                    zmax: 1.0,
                },
            ],
            Distribution::Lognormal,
        )
        .unwrap()
    }

    #[test]
    fn test_expected_counts_are_deterministic() {
        let pix = Pixelisation::new(2).unwrap();
        let registry = registry();
        let mut maps = Array2::zeros((2, pix.npix()));
        maps.row_mut(0).fill(1.0); // delta = 1 everywhere
        maps.row_mut(1).fill(0.3); // convergence, must pass through
        let sel = SelectionFunction::uniform(2.0);
        let mut pool = RngPool::new(1, 2);
        apply_selection(&mut maps, &registry, &sel, false, &pix, &mut pool);

        let pixel_arcmin2 = FULL_SKY_ARCMIN2 / pix.npix() as f64;
        let expect = 2.0 * 2.0 * pixel_arcmin2 * 0.5;
        for v in maps.row(0) {
            assert_relative_eq!(*v, expect, epsilon = 1e-9);
        }
        for v in maps.row(1) {
            assert_relative_eq!(*v, 0.3);
        }
    }

    #[test]
    fn test_poisson_counts_have_right_mean() {
        let pix = Pixelisation::new(8).unwrap();
        let registry = registry();
        let mut maps = Array2::zeros((2, pix.npix()));
        // Scale chosen so the expected count per pixel is ~9.
        let pixel_arcmin2 = FULL_SKY_ARCMIN2 / pix.npix() as f64;
        let scale = 9.0 / (pixel_arcmin2 * 0.5);
        let sel = SelectionFunction::uniform(scale);
        let mut pool = RngPool::new(17, 4);
        apply_selection(&mut maps, &registry, &sel, true, &pix, &mut pool);

        let mean = maps.row(0).sum() / pix.npix() as f64;
        assert_relative_eq!(mean, 9.0, max_relative = 0.05);
        // Counts are non-negative integers.
        for v in maps.row(0) {
            assert!(*v >= 0.0 && (v.fract() == 0.0));
        }
    }

    #[test]
    fn test_poisson_is_reproducible_for_fixed_workers() {
        let pix = Pixelisation::new(4).unwrap();
        let registry = registry();
        let sel = SelectionFunction::uniform(1000.0);
        let run = |seed| {
            let mut maps = Array2::zeros((2, pix.npix()));
            let mut pool = RngPool::new(seed, 3);
            apply_selection(&mut maps, &registry, &sel, true, &pix, &mut pool);
            maps
        };
        assert_eq!(run(5), run(5));
        assert_ne!(run(5), run(6));
    }

    #[test]
    fn test_negative_density_clamp() {
        let pix = Pixelisation::new(2).unwrap();
        let registry = registry();
        let mut maps = Array2::zeros((2, pix.npix()));
        maps.row_mut(0).fill(-3.0); // delta < -1 everywhere
        let sel = SelectionFunction::uniform(1.0);
        let mut pool = RngPool::new(1, 2);
        apply_selection(&mut maps, &registry, &sel, true, &pix, &mut pool);
        // Clamped to delta = 0, so the draws are ordinary Poisson counts.
        for v in maps.row(0) {
            assert!(*v >= 0.0);
        }
    }

    #[test]
    fn test_selection_map_length_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("selec.dat");
        std::fs::write(&path, "1.0\n0.5\n").unwrap();
        assert!(matches!(
            SelectionFunction::load(1.0, Some(&path), 48),
            Err(ObserveError::MapLength { found: 2, expected: 48, .. })
        ));
        let sel = SelectionFunction::load(2.0, Some(&path), 2).unwrap();
        assert_relative_eq!(sel.value(1), 1.0);
    }
}
