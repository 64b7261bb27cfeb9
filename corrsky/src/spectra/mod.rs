//! Angular power-spectrum ingestion and processing.
//!
//! Input Cℓ(i,j) samples arrive either as one two-column file per ordered
//! field pair (prefix mode) or as a single multi-column table whose header
//! labels encode the pairs. Spectra are filtered in place, transformed to
//! the auxiliary Gaussian spectra (lognormal model), and finally packed
//! into the per-ℓ covariance stack.

pub mod filters;
pub mod lognormal;

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::diag::Diagnostics;
use crate::fields::FieldRegistry;

#[derive(Error, Debug)]
pub enum SpectrumError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("{path}:{line}: expected two numeric columns")]
    Malformed { path: String, line: usize },
    #[error("spectrum file {path} has fewer than 2 samples")]
    TooFewSamples { path: String },
    #[error("spectrum file {path} is not ℓ-monotone at line {line}")]
    NotMonotone { path: String, line: usize },
    #[error("no input spectra found for prefix {0}")]
    NoneFound(String),
    #[error("Cℓ table {path} has {names} column names but {cols} data columns")]
    HeaderMismatch {
        path: String,
        names: usize,
        cols: usize,
    },
    #[error("requested LRANGE maximum {lmax} exceeds the common input band-limit {lastl}")]
    BandLimitTooLow { lmax: usize, lastl: usize },
    #[error("auxiliary Gaussianisation hit {0} non-positive log arguments")]
    BadLogArguments(usize),
}

/// Cℓ samples for one ordered pair; ℓ values need not be integer-spaced.
#[derive(Debug, Clone)]
pub struct SpectrumSample {
    pub ells: Vec<f64>,
    pub cls: Vec<f64>,
}

impl SpectrumSample {
    pub fn max_ell(&self) -> f64 {
        *self.ells.last().expect("spectra hold at least 2 samples")
    }

    pub fn min_ell(&self) -> f64 {
        self.ells[0]
    }
}

/// All loaded spectra, indexed by ordered pair (i, j) row-major.
#[derive(Debug, Clone)]
pub struct SpectrumSet {
    n_fields: usize,
    pairs: Vec<Option<SpectrumSample>>,
}

impl SpectrumSet {
    pub fn empty(n_fields: usize) -> Self {
        Self {
            n_fields,
            pairs: vec![None; n_fields * n_fields],
        }
    }

    pub fn n_fields(&self) -> usize {
        self.n_fields
    }

    pub fn get(&self, i: usize, j: usize) -> Option<&SpectrumSample> {
        self.pairs[i * self.n_fields + j].as_ref()
    }

    pub fn set(&mut self, i: usize, j: usize, sample: SpectrumSample) {
        self.pairs[i * self.n_fields + j] = Some(sample);
    }

    pub fn n_set(&self) -> usize {
        self.pairs.iter().filter(|p| p.is_some()).count()
    }

    /// Parallel-friendly mutable access to all slots.
    pub fn pairs_mut(&mut self) -> &mut [Option<SpectrumSample>] {
        &mut self.pairs
    }

    pub fn iter_set(&self) -> impl Iterator<Item = (usize, usize, &SpectrumSample)> {
        let n = self.n_fields;
        self.pairs
            .iter()
            .enumerate()
            .filter_map(move |(k, p)| p.as_ref().map(|s| (k / n, k % n, s)))
    }

    /// Largest integer ℓ covered by *every* loaded spectrum.
    pub fn common_band_limit(&self) -> usize {
        self.iter_set()
            .map(|(_, _, s)| s.max_ell().floor() as usize)
            .min()
            .unwrap_or(0)
    }
}

/// Spectra resampled onto the integer grid ℓ = 0..=lastl, same pair layout.
#[derive(Debug, Clone)]
pub struct PairGrid {
    pub n_fields: usize,
    pub lastl: usize,
    pairs: Vec<Option<Vec<f64>>>,
}

impl PairGrid {
    pub fn empty(n_fields: usize, lastl: usize) -> Self {
        Self {
            n_fields,
            lastl,
            pairs: vec![None; n_fields * n_fields],
        }
    }

    pub fn get(&self, i: usize, j: usize) -> Option<&[f64]> {
        self.pairs[i * self.n_fields + j].as_deref()
    }

    pub fn set(&mut self, i: usize, j: usize, cl: Vec<f64>) {
        debug_assert_eq!(cl.len(), self.lastl + 1);
        self.pairs[i * self.n_fields + j] = Some(cl);
    }

    pub fn pairs_mut(&mut self) -> &mut [Option<Vec<f64>>] {
        &mut self.pairs
    }

    pub fn is_set(&self, i: usize, j: usize) -> bool {
        self.pairs[i * self.n_fields + j].is_some()
    }

    pub fn iter_set(&self) -> impl Iterator<Item = (usize, usize, &[f64])> {
        let n = self.n_fields;
        self.pairs
            .iter()
            .enumerate()
            .filter_map(move |(k, p)| p.as_deref().map(|s| (k / n, k % n, s)))
    }
}

/// File name for the pair (af, az, bf, bz) under a prefix.
pub fn pair_path(prefix: &str, af: i32, az: i32, bf: i32, bz: i32) -> PathBuf {
    PathBuf::from(format!("{prefix}f{af}z{az}f{bf}z{bz}.dat"))
}

/// Parse a `Cl-f{af}z{az}f{bf}z{bz}` column label.
pub fn parse_pair_label(label: &str) -> Option<(i32, i32, i32, i32)> {
    let rest = label.strip_prefix("Cl-")?;
    let rest = rest.strip_prefix('f')?;
    let (af, rest) = split_int(rest)?;
    let rest = rest.strip_prefix('z')?;
    let (az, rest) = split_int(rest)?;
    let rest = rest.strip_prefix('f')?;
    let (bf, rest) = split_int(rest)?;
    let rest = rest.strip_prefix('z')?;
    let (bz, rest) = split_int(rest)?;
    rest.is_empty().then_some((af, az, bf, bz))
}

fn split_int(s: &str) -> Option<(i32, &str)> {
    let end = s
        .char_indices()
        .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && *c == '-'))
        .count();
    if end == 0 {
        return None;
    }
    let (num, rest) = s.split_at(end);
    num.parse().ok().map(|v| (v, rest))
}

fn read_two_columns(path: &Path) -> Result<SpectrumSample, SpectrumError> {
    let text = fs::read_to_string(path).map_err(|source| SpectrumError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut ells = Vec::new();
    let mut cls = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut it = line.split_whitespace();
        let ell: Option<f64> = it.next().and_then(|v| v.parse().ok());
        let cl: Option<f64> = it.next().and_then(|v| v.parse().ok());
        match (ell, cl) {
            (Some(ell), Some(cl)) => {
                if let Some(&prev) = ells.last() {
                    if ell <= prev {
                        return Err(SpectrumError::NotMonotone {
                            path: path.display().to_string(),
                            line: i + 1,
                        });
                    }
                }
                ells.push(ell);
                cls.push(cl);
            }
            _ => {
                return Err(SpectrumError::Malformed {
                    path: path.display().to_string(),
                    line: i + 1,
                })
            }
        }
    }
    if ells.len() < 2 {
        return Err(SpectrumError::TooFewSamples {
            path: path.display().to_string(),
        });
    }
    Ok(SpectrumSample { ells, cls })
}

/// Load input spectra for every ordered field pair.
///
/// `cl_prefix` is either a file-name prefix probed per pair, or (when it
/// ends in `.dat`) a single multi-column table. Records the input Cℓ
/// ordering in the registry.
pub fn load_spectra(
    cl_prefix: &str,
    registry: &mut FieldRegistry,
    diag: &Diagnostics,
) -> Result<SpectrumSet, SpectrumError> {
    if cl_prefix.ends_with(".dat") {
        load_table(Path::new(cl_prefix), registry, diag)
    } else {
        load_prefix(cl_prefix, registry)
    }
}

fn load_prefix(
    prefix: &str,
    registry: &mut FieldRegistry,
) -> Result<SpectrumSet, SpectrumError> {
    let n = registry.n_fields();
    let mut set = SpectrumSet::empty(n);
    let mut order = Vec::new();
    for k in 0..n * n {
        let (i, j) = (k / n, k % n);
        let (af, az) = registry.index_to_name(i);
        let (bf, bz) = registry.index_to_name(j);
        let path = pair_path(prefix, af, az, bf, bz);
        if !path.exists() {
            continue;
        }
        tracing::info!("{} goes to [{i}, {j}]", path.display());
        set.set(i, j, read_two_columns(&path)?);
        order.push((i, j));
    }
    if order.is_empty() {
        return Err(SpectrumError::NoneFound(prefix.to_string()));
    }
    registry.record_input_cl_order(&order);
    Ok(set)
}

fn load_table(
    path: &Path,
    registry: &mut FieldRegistry,
    diag: &Diagnostics,
) -> Result<SpectrumSet, SpectrumError> {
    let text = fs::read_to_string(path).map_err(|source| SpectrumError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut lines = text.lines().enumerate();

    // Header: first non-empty line; first token is the ℓ column.
    let labels: Vec<String> = loop {
        let Some((_, line)) = lines.next() else {
            return Err(SpectrumError::TooFewSamples {
                path: path.display().to_string(),
            });
        };
        let line = line.trim().trim_start_matches('#').trim();
        if line.is_empty() {
            continue;
        }
        break line.split_whitespace().skip(1).map(str::to_string).collect();
    };

    // Map each column to a field pair; unknown labels are dumped.
    let n = registry.n_fields();
    let mut columns: Vec<Option<(usize, usize)>> = Vec::with_capacity(labels.len());
    let mut order = Vec::new();
    for label in &labels {
        let target = parse_pair_label(label).and_then(|(af, az, bf, bz)| {
            Some((registry.name_to_index(af, az)?, registry.name_to_index(bf, bz)?))
        });
        match target {
            Some((i, j)) => {
                tracing::info!("{label} goes to [{i}, {j}]");
                order.push((i, j));
                columns.push(Some((i, j)));
            }
            None => {
                diag.warn(format_args!(
                    "column {label} in {} does not match any field pair, skipped",
                    path.display()
                ));
                columns.push(None);
            }
        }
    }

    let mut ells = Vec::new();
    let mut data: Vec<Vec<f64>> = vec![Vec::new(); labels.len()];
    for (lineno, line) in lines {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let values: Vec<f64> = line
            .split_whitespace()
            .filter_map(|v| v.parse().ok())
            .collect();
        if values.len() != labels.len() + 1 {
            return Err(SpectrumError::HeaderMismatch {
                path: path.display().to_string(),
                names: labels.len() + 1,
                cols: values.len(),
            });
        }
        if let Some(&prev) = ells.last() {
            if values[0] <= prev {
                return Err(SpectrumError::NotMonotone {
                    path: path.display().to_string(),
                    line: lineno + 1,
                });
            }
        }
        ells.push(values[0]);
        for (col, v) in data.iter_mut().zip(&values[1..]) {
            col.push(*v);
        }
    }
    if ells.len() < 2 {
        return Err(SpectrumError::TooFewSamples {
            path: path.display().to_string(),
        });
    }

    let mut set = SpectrumSet::empty(n);
    for (target, cls) in columns.into_iter().zip(data) {
        if let Some((i, j)) = target {
            set.set(
                i,
                j,
                SpectrumSample {
                    ells: ells.clone(),
                    cls,
                },
            );
        }
    }
    if set.n_set() == 0 {
        return Err(SpectrumError::NoneFound(path.display().to_string()));
    }
    registry.record_input_cl_order(&order);
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Distribution;
    use crate::fields::{FieldInfo, FieldType};
    use std::io::Write;

    fn two_field_registry() -> FieldRegistry {
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
        .unwrap()
    }

    #[test]
    fn test_parse_pair_label() {
        assert_eq!(parse_pair_label("Cl-f1z2f3z4"), Some((1, 2, 3, 4)));
        assert_eq!(parse_pair_label("Cl-f10z20f30z40"), Some((10, 20, 30, 40)));
        assert_eq!(parse_pair_label("Cl-f1z2f3"), None);
        assert_eq!(parse_pair_label("f1z2f3z4"), None);
        assert_eq!(parse_pair_label("Cl-f1z2f3z4x"), None);
    }

    #[test]
    fn test_prefix_mode_loads_and_records_order() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = format!("{}/cl-", dir.path().display());
        std::fs::write(
            pair_path(&prefix, 1, 1, 1, 1),
            "2 0.5\n3 0.4\n4 0.3\n",
        )
        .unwrap();
        std::fs::write(
            pair_path(&prefix, 1, 2, 1, 2),
            "2 0.25\n3 0.2\n4 0.15\n",
        )
        .unwrap();

        let mut reg = two_field_registry();
        let diag = Diagnostics::new();
        let set = load_spectra(&prefix, &mut reg, &diag).unwrap();
        assert_eq!(set.n_set(), 2);
        assert!(set.get(0, 0).is_some());
        assert!(set.get(0, 1).is_none());
        assert_eq!(reg.input_cl_pairs(), &[(0, 0), (1, 1)]);
        assert_eq!(set.common_band_limit(), 4);
    }

    #[test]
    fn test_table_mode_skips_unknown_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cls.dat");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "# l Cl-f1z1f1z1 Cl-f9z9f9z9 Cl-f1z1f1z2").unwrap();
        writeln!(f, "2 1.0 7.0 0.5").unwrap();
        writeln!(f, "4 0.8 7.0 0.4").unwrap();
        writeln!(f, "8 0.6 7.0 0.3").unwrap();
        drop(f);

        let mut reg = two_field_registry();
        let diag = Diagnostics::new();
        let set = load_spectra(&path.display().to_string(), &mut reg, &diag).unwrap();
        assert_eq!(set.n_set(), 2);
        assert_eq!(diag.warnings(), 1);
        assert_eq!(reg.input_cl_pairs(), &[(0, 0), (0, 1)]);
        let s = set.get(0, 1).unwrap();
        assert_eq!(s.ells, vec![2.0, 4.0, 8.0]);
        assert_eq!(s.cls, vec![0.5, 0.4, 0.3]);
    }

    #[test]
    fn test_monotonicity_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = format!("{}/cl-", dir.path().display());
        std::fs::write(pair_path(&prefix, 1, 1, 1, 1), "2 0.5\n2 0.4\n").unwrap();
        let mut reg = two_field_registry();
        let diag = Diagnostics::new();
        assert!(matches!(
            load_spectra(&prefix, &mut reg, &diag),
            Err(SpectrumError::NotMonotone { line: 2, .. })
        ));
    }

    #[test]
    fn test_single_sample_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = format!("{}/cl-", dir.path().display());
        std::fs::write(pair_path(&prefix, 1, 1, 1, 1), "0 0.5\n").unwrap();
        let mut reg = two_field_registry();
        let diag = Diagnostics::new();
        assert!(matches!(
            load_spectra(&prefix, &mut reg, &diag),
            Err(SpectrumError::TooFewSamples { .. })
        ));
    }

    #[test]
    fn test_missing_everything_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = format!("{}/cl-", dir.path().display());
        let mut reg = two_field_registry();
        let diag = Diagnostics::new();
        assert!(matches!(
            load_spectra(&prefix, &mut reg, &diag),
            Err(SpectrumError::NoneFound(_))
        ));
    }
}
