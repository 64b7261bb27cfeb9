//! Density → convergence line-of-sight integration.
//!
//! Each density slice (f, z) is read as a source shell at its upper
//! redshift edge; the convergence towards it accumulates the lensing
//! kernel times the density contrast of every slice of the same tracer up
//! to and including the source slice. The integrated fields are appended
//! to a new registry (augmentation, never replacement), with tracer names
//! offset by the number of distinct tracers and the redshift range
//! collapsed onto the source edge.

use ndarray::Array2;
use thiserror::Error;

use crate::cosmology::{Cosmology, CosmologyError};
use crate::diag::Diagnostics;
use crate::fields::{FieldError, FieldInfo, FieldRegistry, FieldType};

#[derive(Error, Debug)]
pub enum LosError {
    #[error("no density field found for integrating")]
    NoDensityFields,
    #[error(transparent)]
    Cosmology(#[from] CosmologyError),
    #[error(transparent)]
    Field(#[from] FieldError),
}

/// Augmented registry and map set produced by the integration.
pub struct LosOutcome {
    pub registry: FieldRegistry,
    pub maps: Array2<f64>,
    /// Number of appended convergence fields.
    pub n_new: usize,
}

/// Integrate every density slice into a convergence field.
pub fn integrate_density(
    registry: &FieldRegistry,
    maps: &Array2<f64>,
    cosmo: &Cosmology,
    diag: &Diagnostics,
) -> Result<LosOutcome, LosError> {
    let n = registry.n_fields();
    let npix = maps.ncols();

    // Density tracers must cover redshift contiguously.
    let mut n_density_tracers = 0;
    for &f in registry.f_names() {
        let slices = registry.slices_of_f(f);
        if registry.get(slices[0]).kind != FieldType::Density {
            continue;
        }
        n_density_tracers += 1;
        for pair in slices.windows(2) {
            if registry.get(pair[0]).zmax != registry.get(pair[1]).zmin {
                diag.warn(
                    "expecting sequential and contiguous redshift slices for density tracers",
                );
            }
        }
    }
    tracing::info!("found {n_density_tracers} density tracers for LoS integration");
    if n_density_tracers == 0 {
        return Err(LosError::NoDensityFields);
    }

    // Kernel table: weight of slice m towards the source edge of field i.
    let mut weight = Array2::zeros((n, n));
    for i in 0..n {
        for m in 0..n {
            let fm = registry.get(m);
            let zmid = 0.5 * (fm.zmin + fm.zmax);
            weight[(i, m)] =
                cosmo.kappa_weight_by_z(zmid, registry.get(i).zmax)? * (fm.zmax - fm.zmin);
        }
    }

    // Accumulate per source field over the slices at or below it.
    let mut new_fields = Vec::new();
    let mut new_maps = Vec::new();
    let nf = registry.n_fs() as i32;
    for i in 0..n {
        let fi = registry.get(i);
        if fi.kind != FieldType::Density {
            continue;
        }
        let slices = registry.slices_of_f(fi.f);
        let source_pos = slices
            .iter()
            .position(|&s| s == i)
            .expect("slice lookup is total");

        let mut integrated = vec![0.0; npix];
        for &m in &slices[..=source_pos] {
            let w = weight[(i, m)];
            let row = maps.row(m);
            for (dst, v) in integrated.iter_mut().zip(row.iter()) {
                *dst += w * v;
            }
        }

        new_fields.push(FieldInfo {
            f: nf + fi.f,
            z: fi.z,
            mean: 0.0,
            shift: 0.0,
            kind: FieldType::Convergence,
            // The integrated convergence applies to sources at the far
            // edge of the bin.
            zmin: fi.zmax,
            zmax: fi.zmax,
        });
        new_maps.push(integrated);
    }

    let n_new = new_fields.len();
    let registry = registry.with_appended(new_fields)?;
    let mut out = Array2::zeros((n + n_new, npix));
    for i in 0..n {
        out.row_mut(i).assign(&maps.row(i));
    }
    for (k, m) in new_maps.into_iter().enumerate() {
        out.row_mut(n + k)
            .iter_mut()
            .zip(m)
            .for_each(|(dst, v)| *dst = v);
    }
    Ok(LosOutcome {
        registry,
        maps: out,
        n_new,
    })
}
