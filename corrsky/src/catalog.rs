//! Galaxy catalogue generation.
//!
//! Counts maps are expanded into point sources: each count in a pixel
//! becomes one catalogue row with a position drawn uniformly inside the
//! pixel, a redshift drawn uniformly in the slice, and — when convergence
//! fields share the redshift bin — the pixel's lensing quantities and an
//! observed ellipticity built from the reduced shear.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use num_complex::Complex64;
use rand::rngs::StdRng;
use rand_distr::{Distribution as _, Normal};
use thiserror::Error;

use ndarray::Array2;
use skypix::Pixelisation;

use crate::diag::Diagnostics;
use crate::fields::{FieldRegistry, FieldType};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("cannot write catalogue {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("CATALOG_COLS selects no known columns")]
    NoColumns,
}

/// Catalogue column kinds, in the order requested by `CATALOG_COLS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Theta,
    Phi,
    Z,
    GalType,
    Kappa,
    Gamma1,
    Gamma2,
    Ellip1,
    Ellip2,
    Pixel,
}

impl Column {
    fn parse(word: &str) -> Option<Self> {
        Some(match word {
            "theta" => Self::Theta,
            "phi" => Self::Phi,
            "z" => Self::Z,
            "galtype" => Self::GalType,
            "kappa" => Self::Kappa,
            "gamma1" => Self::Gamma1,
            "gamma2" => Self::Gamma2,
            "ellip1" => Self::Ellip1,
            "ellip2" => Self::Ellip2,
            "pixel" => Self::Pixel,
            _ => return None,
        })
    }

    fn header_name(self, radec: bool) -> &'static str {
        match self {
            Self::Theta => {
                if radec {
                    "dec"
                } else {
                    "theta"
                }
            }
            Self::Phi => {
                if radec {
                    "ra"
                } else {
                    "phi"
                }
            }
            Self::Z => "z",
            Self::GalType => "galtype",
            Self::Kappa => "kappa",
            Self::Gamma1 => "gamma1",
            Self::Gamma2 => "gamma2",
            Self::Ellip1 => "ellip1",
            Self::Ellip2 => "ellip2",
            Self::Pixel => "pixel",
        }
    }
}

/// Parse `CATALOG_COLS`, warning about unknown entries.
pub fn parse_columns(spec: &str, diag: &Diagnostics) -> Result<Vec<Column>, CatalogError> {
    let mut cols = Vec::new();
    for word in spec.split_whitespace() {
        match Column::parse(word) {
            Some(c) => cols.push(c),
            None => diag.warn(format_args!("unknown catalogue column {word}, skipped")),
        }
    }
    if cols.is_empty() {
        return Err(CatalogError::NoColumns);
    }
    Ok(cols)
}

/// Observed ellipticity from intrinsic shape noise and reduced shear
/// (Seitz & Schneider composition).
pub fn gen_ellip(
    rng: &mut StdRng,
    ellip_sigma: f64,
    kappa: f64,
    gamma1: f64,
    gamma2: f64,
) -> (f64, f64) {
    let g = Complex64::new(gamma1, gamma2) / (1.0 - kappa);
    let eint = if ellip_sigma > 0.0 {
        let normal = Normal::new(0.0, ellip_sigma).expect("positive sigma");
        Complex64::new(normal.sample(rng), normal.sample(rng))
    } else {
        Complex64::new(0.0, 0.0)
    };
    let e = if g.norm() <= 1.0 {
        (eint + g) / (Complex64::new(1.0, 0.0) + g.conj() * eint)
    } else {
        (Complex64::new(1.0, 0.0) + g * eint.conj()) / (eint.conj() + g.conj())
    };
    (e.re, e.im)
}

/// Per-field shear maps computed by the shear builder.
pub type ShearMapSet = Vec<Option<(Vec<f64>, Vec<f64>)>>;

pub struct CatalogSummary {
    pub n_sources: usize,
}

/// Expand the counts maps into a text catalogue.
#[allow(clippy::too_many_arguments)]
pub fn write_catalog(
    path: &Path,
    maps: &Array2<f64>,
    registry: &FieldRegistry,
    shear: &ShearMapSet,
    pix: &Pixelisation,
    columns: &[Column],
    angular_coord: i64,
    ellip_sigma: f64,
    rng: &mut StdRng,
    diag: &Diagnostics,
) -> Result<CatalogSummary, CatalogError> {
    let wants_lensing = columns.iter().any(|c| {
        matches!(
            c,
            Column::Kappa | Column::Gamma1 | Column::Gamma2 | Column::Ellip1 | Column::Ellip2
        )
    });
    let n_convergence_tracers = registry
        .f_names()
        .iter()
        .filter(|&&f| {
            let slices = registry.slices_of_f(f);
            registry.get(slices[0]).kind == FieldType::Convergence
        })
        .count();
    if n_convergence_tracers > 1 {
        diag.warn("found multiple convergence tracers, not sure which to use");
    }
    if n_convergence_tracers == 0 && wants_lensing {
        diag.warn("lensing output requested but no convergence field was supplied");
    }

    let radec = angular_coord == 2;
    if angular_coord != 0 && angular_coord != 1 && angular_coord != 2 {
        diag.warn("unknown ANGULAR_COORD option, will keep theta & phi in radians");
    }

    let file = File::create(path).map_err(|source| CatalogError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut out = BufWriter::new(file);
    let io_err = |source| CatalogError::Io {
        path: path.display().to_string(),
        source,
    };

    let header: Vec<&str> = columns.iter().map(|c| c.header_name(radec)).collect();
    writeln!(out, "# {}", header.join(" ")).map_err(io_err)?;

    let mut n_sources = 0;
    let mut row = vec![0.0_f64; columns.len()];
    for &z in registry.z_names() {
        let in_bin = registry.fields_in_z(z);
        for p in 0..pix.npix() {
            // Sources from every density field in this bin.
            let mut cell: Vec<Vec<f64>> = Vec::new();
            for &i in &in_bin {
                let fi = registry.get(i);
                if fi.kind != FieldType::Density {
                    continue;
                }
                let count = maps[(i, p)].max(0.0) as usize;
                for _ in 0..count {
                    let (theta, phi) = pix
                        .random_point_in_pixel(rng, p)
                        .expect("pixel index in range");
                    for (slot, col) in row.iter_mut().zip(columns) {
                        *slot = match col {
                            Column::Theta => convert_theta(theta, angular_coord),
                            Column::Phi => convert_phi(phi, angular_coord),
                            Column::Z => {
                                use rand::Rng as _;
                                rng.gen_range(fi.zmin..=fi.zmax)
                            }
                            Column::GalType => fi.f as f64,
                            Column::Pixel => p as f64,
                            _ => 0.0,
                        };
                    }
                    cell.push(row.clone());
                }
            }

            // Lensing quantities from the convergence fields in this bin.
            for &i in &in_bin {
                if registry.get(i).kind != FieldType::Convergence {
                    continue;
                }
                let kappa = maps[(i, p)];
                let (g1, g2) = shear
                    .get(i)
                    .and_then(|s| s.as_ref())
                    .map(|(g1, g2)| (g1[p], g2[p]))
                    .unwrap_or((0.0, 0.0));
                for source in &mut cell {
                    let ellip = if columns
                        .iter()
                        .any(|c| matches!(c, Column::Ellip1 | Column::Ellip2))
                    {
                        gen_ellip(rng, ellip_sigma, kappa, g1, g2)
                    } else {
                        (0.0, 0.0)
                    };
                    for (slot, col) in source.iter_mut().zip(columns) {
                        match col {
                            Column::Kappa => *slot = kappa,
                            Column::Gamma1 => *slot = g1,
                            Column::Gamma2 => *slot = g2,
                            Column::Ellip1 => *slot = ellip.0,
                            Column::Ellip2 => *slot = ellip.1,
                            _ => {}
                        }
                    }
                }
            }

            for source in &cell {
                let formatted: Vec<String> =
                    source.iter().map(|v| format!("{v:.8e}")).collect();
                writeln!(out, "{}", formatted.join(" ")).map_err(io_err)?;
            }
            n_sources += cell.len();
        }
    }
    out.flush().map_err(io_err)?;
    Ok(CatalogSummary { n_sources })
}

fn convert_theta(theta: f64, angular_coord: i64) -> f64 {
    match angular_coord {
        1 => theta.to_degrees(),
        2 => 90.0 - theta.to_degrees(), // declination
        _ => theta,
    }
}

fn convert_phi(phi: f64, angular_coord: i64) -> f64 {
    match angular_coord {
        1 | 2 => phi.to_degrees(),
        _ => phi,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Distribution;
    use crate::fields::FieldInfo;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    fn registry() -> FieldRegistry {
        FieldRegistry::from_fields(
            vec![
                FieldInfo {
                    f: 1,
                    z: 1,
                    mean: 0.0,
                    shift: 1.0,
                    kind: FieldType::Density,
                    zmin: 0.2,
                    zmax: 0.5,
                },
                FieldInfo {
                    f: 2,
                    z: 1,
                    mean: 0.0,
                    shift: 0.02,
                    kind: FieldType::Convergence,
                    zmin: 0.5,
                    zmax: 0.5,
                },
            ],
            Distribution::Lognormal,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_columns() {
        let diag = Diagnostics::new();
        let cols = parse_columns("theta phi z bogus pixel", &diag).unwrap();
        assert_eq!(
            cols,
            vec![Column::Theta, Column::Phi, Column::Z, Column::Pixel]
        );
        assert_eq!(diag.warnings(), 1);
        assert!(matches!(
            parse_columns("nothing here", &diag),
            Err(CatalogError::NoColumns)
        ));
    }

    #[test]
    fn test_gen_ellip_reduces_to_shear_without_noise() {
        let mut rng = StdRng::seed_from_u64(1);
        let (e1, e2) = gen_ellip(&mut rng, 0.0, 0.1, 0.02, -0.01);
        // With no intrinsic ellipticity, e = g = gamma / (1 - kappa).
        assert_relative_eq!(e1, 0.02 / 0.9, epsilon = 1e-12);
        assert_relative_eq!(e2, -0.01 / 0.9, epsilon = 1e-12);
    }

    #[test]
    fn test_gen_ellip_stays_bounded() {
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..200 {
            let (e1, e2) = gen_ellip(&mut rng, 0.1, 0.05, 0.03, 0.01);
            let norm = (e1 * e1 + e2 * e2).sqrt();
            assert!(norm <= 1.0 + 1e-9, "|e| = {norm} escaped the unit disc");
        }
    }

    #[test]
    fn test_catalog_row_count_matches_counts_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.dat");
        let pix = Pixelisation::new(1).unwrap();
        let registry = registry();

        let mut maps = Array2::zeros((2, pix.npix()));
        maps.row_mut(0).fill(2.0); // two sources per pixel
        maps.row_mut(1).fill(0.1); // kappa
        let shear: ShearMapSet = vec![None, Some((vec![0.01; 12], vec![0.0; 12]))];

        let diag = Diagnostics::new();
        let columns = parse_columns("theta phi z galtype kappa gamma1 pixel", &diag).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let summary = write_catalog(
            &path, &maps, &registry, &shear, &pix, &columns, 0, 0.0, &mut rng, &diag,
        )
        .unwrap();
        assert_eq!(summary.n_sources, 24);

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "# theta phi z galtype kappa gamma1 pixel"
        );
        let rows: Vec<&str> = lines.collect();
        assert_eq!(rows.len(), 24);
        let first: Vec<f64> = rows[0]
            .split_whitespace()
            .map(|v| v.parse().unwrap())
            .collect();
        // z inside the slice, kappa and gamma1 from the maps.
        assert!(first[2] >= 0.2 && first[2] <= 0.5);
        assert_relative_eq!(first[4], 0.1);
        assert_relative_eq!(first[5], 0.01);
        assert_eq!(first[6], 0.0);
    }

    #[test]
    fn test_radec_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.dat");
        let pix = Pixelisation::new(1).unwrap();
        let registry = registry();
        let mut maps = Array2::zeros((2, pix.npix()));
        maps.row_mut(0).fill(1.0);
        let shear: ShearMapSet = vec![None, None];
        let diag = Diagnostics::new();
        let columns = parse_columns("theta phi", &diag).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        write_catalog(
            &path, &maps, &registry, &shear, &pix, &columns, 2, 0.0, &mut rng, &diag,
        )
        .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# dec ra"));
        for line in text.lines().skip(1) {
            let vals: Vec<f64> = line
                .split_whitespace()
                .map(|v| v.parse().unwrap())
                .collect();
            assert!(vals[0] >= -90.0 && vals[0] <= 90.0);
            assert!(vals[1] >= 0.0 && vals[1] < 360.0);
        }
    }
}
