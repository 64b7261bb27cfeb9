//! Stage output writers.
//!
//! Every intermediate data product can be emitted to a path or prefix:
//! per-pair tables named `<prefix>f{af}z{az}f{bf}z{bz}.dat`, per-ℓ matrix
//! files named `<prefix>l{ℓ}.dat` (zero-padded), or single tables whose
//! columns follow the recorded input-Cℓ ordering. All outputs are plain
//! whitespace-delimited text.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use nalgebra::DMatrix;
use ndarray::Array2;
use thiserror::Error;

use skypix::{Alm, Pixelisation};

use crate::covariance::CovarianceStack;
use crate::diag::Diagnostics;
use crate::draw::CholeskyFactors;
use crate::fields::FieldRegistry;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("cannot write {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

fn writer(path: &Path) -> Result<BufWriter<File>, OutputError> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|source| OutputError::Io {
            path: path.display().to_string(),
            source,
        })
}

fn io_at(path: &Path) -> impl Fn(std::io::Error) -> OutputError + '_ {
    move |source| OutputError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// File name for a field pair under a prefix.
pub fn pair_filename(prefix: &str, registry: &FieldRegistry, i: usize, j: usize) -> PathBuf {
    let (af, az) = registry.index_to_name(i);
    let (bf, bz) = registry.index_to_name(j);
    PathBuf::from(format!("{prefix}f{af}z{az}f{bf}z{bz}.dat"))
}

/// Zero-padded multipole tag, wide enough for `lmax`.
pub fn zero_pad(l: usize, lmax: usize) -> String {
    let width = lmax.to_string().len();
    format!("{l:0width$}")
}

/// Two-column (x, y) table.
pub fn write_xy(path: &Path, x: &[f64], y: &[f64]) -> Result<(), OutputError> {
    let mut out = writer(path)?;
    let err = io_at(path);
    for (a, b) in x.iter().zip(y) {
        writeln!(out, "{a:.10e} {b:.10e}").map_err(&err)?;
    }
    out.flush().map_err(&err)
}

/// Per-pair y(x) tables: one file per entry under the prefix.
pub fn write_pair_tables(
    prefix: &str,
    registry: &FieldRegistry,
    x: &[f64],
    entries: &[(usize, usize, Vec<f64>)],
) -> Result<(), OutputError> {
    for (i, j, y) in entries {
        write_xy(&pair_filename(prefix, registry, *i, *j), x, y)?;
    }
    Ok(())
}

/// One Cℓ table with a header row, columns in input-Cℓ order.
///
/// Pairs without a recorded input position are appended after the ordered
/// ones (this happens for symmetry-filled spectra).
pub fn write_cl_table(
    path: &Path,
    registry: &FieldRegistry,
    ells: &[f64],
    entries: &[(usize, usize, Vec<f64>)],
) -> Result<(), OutputError> {
    let mut ordered: Vec<&(usize, usize, Vec<f64>)> = entries.iter().collect();
    // Stable sort: pairs without a recorded position stay in entry order
    // at the end.
    ordered.sort_by_key(|(i, j, _)| registry.input_cl_order(*i, *j).unwrap_or(usize::MAX));

    let mut out = writer(path)?;
    let err = io_at(path);
    let labels: Vec<String> = ordered
        .iter()
        .map(|(i, j, _)| registry.cl_label(*i, *j))
        .collect();
    writeln!(out, "# l {}", labels.join(" ")).map_err(&err)?;
    for (k, ell) in ells.iter().enumerate() {
        write!(out, "{ell:.1}").map_err(&err)?;
        for (_, _, y) in &ordered {
            write!(out, " {:.10e}", y[k]).map_err(&err)?;
        }
        writeln!(out).map_err(&err)?;
    }
    out.flush().map_err(&err)
}

/// Dispatch a Cℓ-like product to per-pair files or a single table,
/// depending on whether the destination ends in `.dat`.
pub fn write_cl_bundle(
    dest: &str,
    registry: &FieldRegistry,
    x: &[f64],
    entries: &[(usize, usize, Vec<f64>)],
) -> Result<(), OutputError> {
    if dest.ends_with(".dat") {
        write_cl_table(Path::new(dest), registry, x, entries)
    } else {
        write_pair_tables(dest, registry, x, entries)
    }
}

/// One matrix as a whitespace table.
pub fn write_matrix(path: &Path, m: &DMatrix<f64>) -> Result<(), OutputError> {
    let mut out = writer(path)?;
    let err = io_at(path);
    for i in 0..m.nrows() {
        let row: Vec<String> = (0..m.ncols()).map(|j| format!("{:.17e}", m[(i, j)])).collect();
        writeln!(out, "{}", row.join(" ")).map_err(&err)?;
    }
    out.flush().map_err(&err)
}

/// The covariance stack over [lstart, lend], one file per ℓ.
pub fn write_matrix_stack(
    prefix: &str,
    stack: &CovarianceStack,
    lstart: usize,
    lend: usize,
) -> Result<(), OutputError> {
    for l in lstart..=lend {
        let path = PathBuf::from(format!("{prefix}l{}.dat", zero_pad(l, lend)));
        write_matrix(&path, stack.at(l))?;
    }
    Ok(())
}

/// The Cholesky factors, one file per ℓ.
pub fn write_cholesky(prefix: &str, chol: &CholeskyFactors) -> Result<(), OutputError> {
    for l in chol.lmin()..=chol.lmax() {
        let path = PathBuf::from(format!("{prefix}l{}.dat", zero_pad(l, chol.lmax())));
        write_matrix(&path, chol.at(l))?;
    }
    Ok(())
}

/// All fields' aℓm in one table: `l m Re(f…) Im(f…) …`.
pub fn write_alm_table(
    path: &Path,
    alms: &[Alm],
    registry: &FieldRegistry,
    lmin: usize,
    lmax: usize,
) -> Result<(), OutputError> {
    let mut out = writer(path)?;
    let err = io_at(path);
    let labels: Vec<String> = (0..alms.len())
        .map(|i| {
            let label = registry.get(i).label();
            format!("Re({label}) Im({label})")
        })
        .collect();
    writeln!(out, "# l m {}", labels.join(" ")).map_err(&err)?;
    for l in lmin..=lmax {
        for m in 0..=l {
            write!(out, "{l} {m}").map_err(&err)?;
            for alm in alms {
                let a = alm.get(l, m);
                write!(out, " {:.10e} {:.10e}", a.re, a.im).map_err(&err)?;
            }
            writeln!(out).map_err(&err)?;
        }
    }
    out.flush().map_err(&err)
}

/// One field's aℓm as a `l m Re Im` table.
pub fn write_single_alm(
    path: &Path,
    alm: &Alm,
    label: &str,
    lmin: usize,
    lmax: usize,
) -> Result<(), OutputError> {
    let mut out = writer(path)?;
    let err = io_at(path);
    writeln!(out, "# l m Re({label}) Im({label})").map_err(&err)?;
    for l in lmin..=lmax {
        for m in 0..=l {
            let a = alm.get(l, m);
            writeln!(out, "{l} {m} {:.10e} {:.10e}", a.re, a.im).map_err(&err)?;
        }
    }
    out.flush().map_err(&err)
}

/// Pixel maps as a table: `theta phi` then one column per field.
pub fn write_map_table(
    path: &Path,
    maps: &Array2<f64>,
    registry: &FieldRegistry,
    pix: &Pixelisation,
) -> Result<(), OutputError> {
    let mut out = writer(path)?;
    let err = io_at(path);
    let labels: Vec<String> = (0..maps.nrows()).map(|i| registry.get(i).label()).collect();
    writeln!(out, "# theta phi {}", labels.join(" ")).map_err(&err)?;
    for p in 0..pix.npix() {
        let (theta, phi) = pix.pix2ang(p).expect("pixel in range");
        write!(out, "{theta:.8e} {phi:.8e}").map_err(&err)?;
        for i in 0..maps.nrows() {
            write!(out, " {:.10e}", maps[(i, p)]).map_err(&err)?;
        }
        writeln!(out).map_err(&err)?;
    }
    out.flush().map_err(&err)
}

/// Shear maps as a table: `theta phi` then (γ₁, γ₂) per convergence field.
pub fn write_shear_table(
    path: &Path,
    entries: &[(usize, &(Vec<f64>, Vec<f64>))],
    registry: &FieldRegistry,
    pix: &Pixelisation,
) -> Result<(), OutputError> {
    let mut out = writer(path)?;
    let err = io_at(path);
    let labels: Vec<String> = entries
        .iter()
        .map(|(i, _)| {
            let label = registry.get(*i).label();
            format!("gamma1({label}) gamma2({label})")
        })
        .collect();
    writeln!(out, "# theta phi {}", labels.join(" ")).map_err(&err)?;
    for p in 0..pix.npix() {
        let (theta, phi) = pix.pix2ang(p).expect("pixel in range");
        write!(out, "{theta:.8e} {phi:.8e}").map_err(&err)?;
        for (_, (g1, g2)) in entries {
            write!(out, " {:.10e} {:.10e}", g1[p], g2[p]).map_err(&err)?;
        }
        writeln!(out).map_err(&err)?;
    }
    out.flush().map_err(&err)
}

/// Cross-spectrum estimate restricted to m ≤ mmax (all m when mmax < 0).
pub fn cross_spectrum_mmax(a: &Alm, b: &Alm, l: usize, mmax: i64) -> f64 {
    if mmax < 0 {
        return a.cross_spectrum(b, l);
    }
    let cap = (mmax as usize).min(l);
    let mut acc = 0.0;
    for m in 0..=cap {
        acc += (a.get(l, m) * b.get(l, m).conj()).re;
    }
    acc / (l as f64 + 1.0)
}

/// Recovered Cℓ table for all pairs i ≤ j over [lmin_out, lmax_out].
pub fn write_recovered_cls(
    path: &Path,
    alms: &[Alm],
    registry: &FieldRegistry,
    lmin_out: usize,
    lmax_out: usize,
    mmax: i64,
    diag: &Diagnostics,
) -> Result<(), OutputError> {
    if mmax >= 0 && (mmax as usize) > lmin_out {
        diag.warn("MMAX_OUT above the output LRANGE lower bound biases the low multipoles");
    }
    let n = alms.len();
    let ells: Vec<f64> = (lmin_out..=lmax_out).map(|l| l as f64).collect();
    let mut entries = Vec::new();
    for i in 0..n {
        for j in i..n {
            let cl: Vec<f64> = (lmin_out..=lmax_out)
                .map(|l| cross_spectrum_mmax(&alms[i], &alms[j], l, mmax))
                .collect();
            entries.push((i, j, cl));
        }
    }
    write_cl_table(path, registry, &ells, &entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Distribution;
    use crate::fields::{FieldInfo, FieldType};
    use num_complex::Complex64;

    fn registry() -> FieldRegistry {
        let mut reg = FieldRegistry::from_fields(
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
                    f: 1,
                    z: 2,
                    mean: 0.0,
                    shift: 1.0,
                    kind: FieldType::Density,
                    zmin: 0.5,
                    zmax: 1.0,
                },
            ],
            Distribution::Lognormal,
        )
        .unwrap();
        reg.record_input_cl_order(&[(1, 1), (0, 0)]);
        reg
    }

    #[test]
    fn test_zero_pad_width() {
        assert_eq!(zero_pad(7, 512), "007");
        assert_eq!(zero_pad(512, 512), "512");
        assert_eq!(zero_pad(3, 9), "3");
    }

    #[test]
    fn test_pair_filename() {
        let reg = registry();
        assert_eq!(
            pair_filename("out/xi-", &reg, 0, 1),
            PathBuf::from("out/xi-f1z1f1z2.dat")
        );
    }

    #[test]
    fn test_cl_table_follows_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cls.dat");
        let reg = registry();
        let entries = vec![
            (0, 0, vec![1.0, 2.0]),
            (1, 1, vec![3.0, 4.0]),
        ];
        write_cl_table(&path, &reg, &[2.0, 3.0], &entries).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        // (1,1) was recorded first in the input, so it leads.
        assert_eq!(lines.next().unwrap(), "# l Cl-f1z2f1z2 Cl-f1z1f1z1");
        let row: Vec<&str> = lines.next().unwrap().split_whitespace().collect();
        assert_eq!(row[0], "2.0");
        assert_eq!(row[1].parse::<f64>().unwrap(), 3.0);
        assert_eq!(row[2].parse::<f64>().unwrap(), 1.0);
    }

    #[test]
    fn test_matrix_roundtrips_through_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.dat");
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 0.25, 0.25, 2.0]);
        write_matrix(&path, &m).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let values: Vec<f64> = text
            .split_whitespace()
            .map(|v| v.parse().unwrap())
            .collect();
        assert_eq!(values, vec![1.0, 0.25, 0.25, 2.0]);
    }

    #[test]
    fn test_alm_table_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alm.dat");
        let reg = registry();
        let mut a = Alm::new(2);
        a.set(2, 1, Complex64::new(0.5, -0.5));
        let alms = vec![a.clone(), a];
        write_alm_table(&path, &alms, &reg, 2, 2).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "# l m Re(f1z1) Im(f1z1) Re(f1z2) Im(f1z2)");
        // Rows for (2,0), (2,1), (2,2).
        assert_eq!(lines.len(), 4);
        assert!(lines[2].starts_with("2 1"));
    }

    #[test]
    fn test_cross_spectrum_mmax_cap() {
        let mut a = Alm::new(3);
        a.set(2, 0, Complex64::new(1.0, 0.0));
        a.set(2, 2, Complex64::new(1.0, 0.0));
        // All m: (1 + 1)/3; m <= 0 only: 1/3.
        assert!((cross_spectrum_mmax(&a, &a, 2, -1) - 2.0 / 3.0).abs() < 1e-14);
        assert!((cross_spectrum_mmax(&a, &a, 2, 0) - 1.0 / 3.0).abs() < 1e-14);
    }
}
