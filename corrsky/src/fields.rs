//! Field registry: the catalogue of logical (f, z) fields.
//!
//! Fields are identified by an integer pair (f, z) — the tracer name and
//! the redshift-bin name — and indexed 0..N−1 in file order. The registry
//! is immutable once the loading stage finishes; later stages share it by
//! reference. The density→convergence integration builds a new, augmented
//! registry instead of mutating this one.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::Distribution;

#[derive(Error, Debug)]
pub enum FieldError {
    #[error("cannot read field list {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("field list {path}:{line}: expected 7 columns (f z mean shift type zmin zmax)")]
    Malformed { path: String, line: usize },
    #[error("field f{f}z{z}: zmin {zmin} > zmax {zmax}")]
    BadRedshiftRange { f: i32, z: i32, zmin: f64, zmax: f64 },
    #[error("field f{f}z{z}: unknown field type {code} (expected 1 or 2)")]
    UnknownType { f: i32, z: i32, code: i64 },
    #[error("field f{f}z{z}: mean+shift = {sum} must be positive for lognormal fields")]
    NonPositiveShiftedMean { f: i32, z: i32, sum: f64 },
    #[error("duplicate field f{f}z{z} in field list")]
    Duplicate { f: i32, z: i32 },
    #[error("field list {path} contains no fields")]
    Empty { path: String },
}

/// Tag of a logical field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Galaxy number-density contrast slice (type code 1).
    Density,
    /// Weak-lensing convergence slice (type code 2).
    Convergence,
}

/// Metadata of one (f, z) field.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub f: i32,
    pub z: i32,
    pub mean: f64,
    pub shift: f64,
    pub kind: FieldType,
    pub zmin: f64,
    pub zmax: f64,
}

impl FieldInfo {
    /// `f{f}z{z}` label used in file names and table headers.
    pub fn label(&self) -> String {
        format!("f{}z{}", self.f, self.z)
    }
}

/// Ordered, indexed field catalogue with (f, z) ↔ index bijections.
#[derive(Debug, Clone, Default)]
pub struct FieldRegistry {
    fields: Vec<FieldInfo>,
    by_name: HashMap<(i32, i32), usize>,
    f_names: Vec<i32>,
    z_names: Vec<i32>,
    /// Pair (i, j) → position in the input Cℓ ordering.
    input_cl_order: HashMap<(usize, usize), usize>,
    input_cl_pairs: Vec<(usize, usize)>,
}

impl FieldRegistry {
    /// Build a registry from parsed records, running the §4.1 checks.
    pub fn from_fields(fields: Vec<FieldInfo>, dist: Distribution) -> Result<Self, FieldError> {
        let mut by_name = HashMap::new();
        let mut f_names = Vec::new();
        let mut z_names = Vec::new();
        for (i, fi) in fields.iter().enumerate() {
            if fi.zmin > fi.zmax {
                return Err(FieldError::BadRedshiftRange {
                    f: fi.f,
                    z: fi.z,
                    zmin: fi.zmin,
                    zmax: fi.zmax,
                });
            }
            if dist == Distribution::Lognormal && fi.mean + fi.shift <= 0.0 {
                return Err(FieldError::NonPositiveShiftedMean {
                    f: fi.f,
                    z: fi.z,
                    sum: fi.mean + fi.shift,
                });
            }
            if by_name.insert((fi.f, fi.z), i).is_some() {
                return Err(FieldError::Duplicate { f: fi.f, z: fi.z });
            }
            if !f_names.contains(&fi.f) {
                f_names.push(fi.f);
            }
            if !z_names.contains(&fi.z) {
                z_names.push(fi.z);
            }
        }
        Ok(Self {
            fields,
            by_name,
            f_names,
            z_names,
            input_cl_order: HashMap::new(),
            input_cl_pairs: Vec::new(),
        })
    }

    /// Load a whitespace-delimited FIELDS_INFO file: one
    /// `f z mean shift type zmin zmax` record per line.
    pub fn load(path: &Path, dist: Distribution) -> Result<Self, FieldError> {
        let text = fs::read_to_string(path).map_err(|source| FieldError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut fields = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let cols: Vec<f64> = line
                .split_whitespace()
                .filter_map(|c| c.parse().ok())
                .collect();
            if cols.len() != 7 {
                return Err(FieldError::Malformed {
                    path: path.display().to_string(),
                    line: lineno + 1,
                });
            }
            let (f, z) = (cols[0] as i32, cols[1] as i32);
            let kind = match cols[4] as i64 {
                1 => FieldType::Density,
                2 => FieldType::Convergence,
                code => return Err(FieldError::UnknownType { f, z, code }),
            };
            fields.push(FieldInfo {
                f,
                z,
                mean: cols[2],
                shift: cols[3],
                kind,
                zmin: cols[5],
                zmax: cols[6],
            });
        }
        if fields.is_empty() {
            return Err(FieldError::Empty {
                path: path.display().to_string(),
            });
        }
        Self::from_fields(fields, dist)
    }

    pub fn n_fields(&self) -> usize {
        self.fields.len()
    }

    /// Number of distinct tracer names f.
    pub fn n_fs(&self) -> usize {
        self.f_names.len()
    }

    /// Number of distinct redshift-bin names z.
    pub fn n_zs(&self) -> usize {
        self.z_names.len()
    }

    pub fn get(&self, i: usize) -> &FieldInfo {
        &self.fields[i]
    }

    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    /// Index → (f, z) name pair.
    pub fn index_to_name(&self, i: usize) -> (i32, i32) {
        (self.fields[i].f, self.fields[i].z)
    }

    /// (f, z) name pair → index; `None` for unknown fields.
    pub fn name_to_index(&self, f: i32, z: i32) -> Option<usize> {
        self.by_name.get(&(f, z)).copied()
    }

    /// Redshift-bin names in first-appearance order.
    pub fn z_names(&self) -> &[i32] {
        &self.z_names
    }

    /// Indices of all fields in redshift bin `z`, in registry order.
    pub fn fields_in_z(&self, z: i32) -> Vec<usize> {
        (0..self.n_fields())
            .filter(|&i| self.fields[i].z == z)
            .collect()
    }

    /// Indices of the slices of tracer `f`, ordered by ascending zmin.
    pub fn slices_of_f(&self, f: i32) -> Vec<usize> {
        let mut idx: Vec<usize> = (0..self.n_fields())
            .filter(|&i| self.fields[i].f == f)
            .collect();
        idx.sort_by(|&a, &b| {
            self.fields[a]
                .zmin
                .partial_cmp(&self.fields[b].zmin)
                .expect("non-finite zmin")
        });
        idx
    }

    /// Distinct tracer names in first-appearance order.
    pub fn f_names(&self) -> &[i32] {
        &self.f_names
    }

    /// `Cl-f{af}z{az}f{bf}z{bz}` column label for the pair (i, j).
    pub fn cl_label(&self, i: usize, j: usize) -> String {
        let (af, az) = self.index_to_name(i);
        let (bf, bz) = self.index_to_name(j);
        let mut s = String::new();
        let _ = write!(s, "Cl-f{af}z{az}f{bf}z{bz}");
        s
    }

    /// Record the order in which (i, j) pairs appeared in the input.
    pub fn record_input_cl_order(&mut self, pairs: &[(usize, usize)]) {
        self.input_cl_pairs = pairs.to_vec();
        self.input_cl_order = pairs
            .iter()
            .enumerate()
            .map(|(k, &p)| (p, k))
            .collect();
    }

    /// Position of (i, j) in the recorded input ordering.
    pub fn input_cl_order(&self, i: usize, j: usize) -> Option<usize> {
        self.input_cl_order.get(&(i, j)).copied()
    }

    /// The recorded input ordering itself.
    pub fn input_cl_pairs(&self) -> &[(usize, usize)] {
        &self.input_cl_pairs
    }

    /// New registry with extra fields appended (density→convergence
    /// integration); the input-Cℓ ordering of the base registry is kept.
    pub fn with_appended(&self, extra: Vec<FieldInfo>) -> Result<Self, FieldError> {
        let mut fields = self.fields.clone();
        fields.extend(extra);
        // Augmented fields never re-enter the lognormal checks.
        let mut out = Self::from_fields(fields, Distribution::Gaussian)?;
        out.input_cl_pairs = self.input_cl_pairs.clone();
        out.input_cl_order = self.input_cl_order.clone();
        Ok(out)
    }
}
