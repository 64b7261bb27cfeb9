//! Key-value configuration with command-line overrides.
//!
//! The configuration is a text file of `KEY: value` lines (comments start
//! with `#`), optionally overridden by trailing command-line arguments of
//! the same form (or `KEY=value`). Unknown keys in the file are warned
//! about and ignored; ill-formed values are a `ConfigError`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::diag::Diagnostics;
use crate::draw::RAND_OFFSET;

/// Hard ceiling on worker threads; beyond this the per-thread seed
/// offsets would collide with a 31-bit seed space.
pub const MAX_THREADS: usize = 210;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("missing required key {0}")]
    MissingKey(&'static str),
    #[error("key {key}: cannot parse {value:?} as {expected}")]
    BadValue {
        key: String,
        value: String,
        expected: &'static str,
    },
    #[error("unknown DIST: {0}")]
    UnknownDist(String),
    #[error("LRANGE set in the wrong order: {0} > {1}")]
    BadLRange(usize, usize),
    #[error("LRANGE lower bound must be at least 1, got {0}")]
    LMinTooSmall(usize),
    #[error("unknown POISSON option: {0}")]
    BadPoisson(i64),
    #[error("RNDSEED {0} exceeds the per-thread offset bound {1}")]
    SeedTooLarge(u64, u64),
    #[error("thread count {0} exceeds the supported maximum {1}")]
    TooManyThreads(usize, usize),
    #[error("APPLY_PIXWIN is set but PIXWIN_FILE is not")]
    MissingPixwinFile,
    #[error("malformed command-line override {0:?} (expected KEY: value)")]
    BadOverride(String),
}

/// Statistical model of the realisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    Lognormal,
    Gaussian,
    Homogeneous,
}

impl std::str::FromStr for Distribution {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOGNORMAL" => Ok(Self::Lognormal),
            "GAUSSIAN" => Ok(Self::Gaussian),
            "HOMOGENEOUS" => Ok(Self::Homogeneous),
            other => Err(ConfigError::UnknownDist(other.to_string())),
        }
    }
}

/// Output keys recognised by `EXIT_AT`, in pipeline order.
pub const STAGE_KEYS: &[&str] = &[
    "SMOOTH_CL_PREFIX",
    "XIOUT_PREFIX",
    "GXIOUT_PREFIX",
    "GCLOUT_PREFIX",
    "COVL_PREFIX",
    "REG_COVL_PREFIX",
    "REG_CL_PREFIX",
    "CHOLESKY_PREFIX",
    "AUXALM_OUT",
    "AUXMAP_OUT",
    "DENS2KAPPA_STAT",
    "MAP_OUT",
    "RECOVALM_OUT",
    "RECOVCLS_OUT",
    "SHEAR_ALM_PREFIX",
    "SHEAR_MAP_OUT",
    "MAPWER_OUT",
    "CATALOG_OUT",
];

/// Optional per-stage output destinations; `None` means disabled
/// (the `0` sentinel in the config file).
#[derive(Debug, Clone, Default)]
pub struct Outputs {
    pub smooth_cl_prefix: Option<String>,
    pub xiout_prefix: Option<String>,
    pub gxiout_prefix: Option<String>,
    pub gclout_prefix: Option<String>,
    pub covl_prefix: Option<String>,
    pub reg_covl_prefix: Option<String>,
    pub reg_cl_prefix: Option<String>,
    pub cholesky_prefix: Option<String>,
    pub auxalm_out: Option<String>,
    pub auxmap_out: Option<String>,
    pub dens2kappa_stat: Option<String>,
    pub map_out: Option<String>,
    pub recovalm_out: Option<String>,
    pub recovcls_out: Option<String>,
    pub shear_alm_prefix: Option<String>,
    pub shear_map_out: Option<String>,
    pub mapwer_out: Option<String>,
    pub catalog_out: Option<String>,
}

/// Fully parsed and validated run configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub dist: Distribution,
    pub fields_info: PathBuf,
    pub cl_prefix: String,
    pub lmin: usize,
    pub lmax: usize,
    pub nside: usize,

    pub scale_cls: f64,
    /// Gaussian beam width in arc-minutes; ≤ 0 disables the filter.
    pub winfunc_sigma: f64,
    pub apply_pixwin: bool,
    pub pixwin_file: Option<PathBuf>,
    pub suppress_l: f64,
    pub sup_index: f64,

    pub allow_miss_cl: bool,
    pub crop_cl: bool,
    pub extrap_dipole: bool,

    pub badcorr_frac: f64,
    pub mindiag_frac: f64,
    pub reg_maxsteps: usize,

    pub rndseed: u64,
    pub dens2kappa: i64,
    pub poisson: i64,
    pub exit_at: String,

    pub omega_m: f64,
    pub omega_l: f64,
    pub w_de: f64,

    pub selec_scale: f64,
    pub selec_map: Option<PathBuf>,
    pub ellip_sigma: f64,
    pub catalog_cols: String,
    pub angular_coord: i64,
    pub ring_weight_file: Option<PathBuf>,
    pub lrange_out: Option<(usize, usize)>,
    pub mmax_out: i64,

    pub outputs: Outputs,
}

/// Raw key-value view of the file plus overrides.
struct RawConfig(HashMap<String, String>);

impl RawConfig {
    fn take(&mut self, key: &'static str) -> Option<String> {
        self.0.remove(key)
    }

    fn required(&mut self, key: &'static str) -> Result<String, ConfigError> {
        self.take(key).ok_or(ConfigError::MissingKey(key))
    }

    fn parse<T: std::str::FromStr>(
        &mut self,
        key: &'static str,
        default: T,
        expected: &'static str,
    ) -> Result<T, ConfigError> {
        match self.take(key) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|_| ConfigError::BadValue {
                key: key.to_string(),
                value: v,
                expected,
            }),
        }
    }

    /// The `0` sentinel means "disabled" for paths and prefixes.
    fn optional_path(&mut self, key: &'static str) -> Option<String> {
        self.take(key).filter(|v| v != "0")
    }
}

/// Parse `KEY: value` lines into an ordered key-value map.
fn parse_lines(text: &str, map: &mut HashMap<String, String>) {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
}

/// Fold command-line override tokens into the map.
///
/// Accepts `KEY: value` split across tokens, `KEY:value`, and `KEY=value`.
fn parse_overrides(
    tokens: &[String],
    map: &mut HashMap<String, String>,
) -> Result<(), ConfigError> {
    let mut it = tokens.iter();
    while let Some(tok) = it.next() {
        if let Some((key, value)) = tok.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        } else if let Some((key, value)) = tok.split_once(':') {
            let value = value.trim();
            let value = if value.is_empty() {
                it.next()
                    .ok_or_else(|| ConfigError::BadOverride(tok.clone()))?
                    .trim()
            } else {
                value
            };
            map.insert(key.trim().to_string(), value.to_string());
        } else {
            return Err(ConfigError::BadOverride(tok.clone()));
        }
    }
    Ok(())
}

impl Config {
    /// Load the config file, apply overrides, and type-check everything.
    pub fn load(
        path: &Path,
        overrides: &[String],
        diag: &Diagnostics,
    ) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut map = HashMap::new();
        parse_lines(&text, &mut map);
        parse_overrides(overrides, &mut map)?;
        Self::from_map(map, diag)
    }

    fn from_map(map: HashMap<String, String>, diag: &Diagnostics) -> Result<Self, ConfigError> {
        let mut raw = RawConfig(map);

        let dist: Distribution = raw.required("DIST")?.parse()?;
        let fields_info = PathBuf::from(raw.required("FIELDS_INFO")?);
        let cl_prefix = raw.required("CL_PREFIX")?;
        let nside: usize = {
            let v = raw.required("NSIDE")?;
            v.parse().map_err(|_| ConfigError::BadValue {
                key: "NSIDE".into(),
                value: v,
                expected: "positive integer",
            })?
        };

        let (lmin, lmax) = {
            let v = raw.required("LRANGE")?;
            let parts: Vec<usize> = v.split_whitespace().filter_map(|t| t.parse().ok()).collect();
            if parts.len() != 2 {
                return Err(ConfigError::BadValue {
                    key: "LRANGE".into(),
                    value: v,
                    expected: "two integers",
                });
            }
            (parts[0], parts[1])
        };
        if lmin > lmax {
            return Err(ConfigError::BadLRange(lmin, lmax));
        }
        if lmin < 1 {
            return Err(ConfigError::LMinTooSmall(lmin));
        }

        let lrange_out = match raw.take("LRANGE_OUT") {
            None => None,
            Some(v) => {
                let parts: Vec<usize> =
                    v.split_whitespace().filter_map(|t| t.parse().ok()).collect();
                if parts.len() != 2 {
                    return Err(ConfigError::BadValue {
                        key: "LRANGE_OUT".into(),
                        value: v,
                        expected: "two integers",
                    });
                }
                Some((parts[0], parts[1]))
            }
        };

        let crop_cl = match raw.parse::<i64>("CROP_CL", 0, "0 or 1")? {
            0 => false,
            1 => true,
            other => {
                diag.warn(format_args!(
                    "unknown CROP_CL option {other}, will assume CROP_CL=0"
                ));
                false
            }
        };

        let poisson = raw.parse::<i64>("POISSON", 1, "0 or 1")?;
        if poisson != 0 && poisson != 1 {
            return Err(ConfigError::BadPoisson(poisson));
        }

        let exit_at = raw.take("EXIT_AT").unwrap_or_else(|| "0".to_string());
        if exit_at != "0" && !STAGE_KEYS.contains(&exit_at.as_str()) {
            diag.warn(format_args!("EXIT_AT names unknown output stage {exit_at}"));
        }

        let outputs = Outputs {
            smooth_cl_prefix: raw.optional_path("SMOOTH_CL_PREFIX"),
            xiout_prefix: raw.optional_path("XIOUT_PREFIX"),
            gxiout_prefix: raw.optional_path("GXIOUT_PREFIX"),
            gclout_prefix: raw.optional_path("GCLOUT_PREFIX"),
            covl_prefix: raw.optional_path("COVL_PREFIX"),
            reg_covl_prefix: raw.optional_path("REG_COVL_PREFIX"),
            reg_cl_prefix: raw.optional_path("REG_CL_PREFIX"),
            cholesky_prefix: raw.optional_path("CHOLESKY_PREFIX"),
            auxalm_out: raw.optional_path("AUXALM_OUT"),
            auxmap_out: raw.optional_path("AUXMAP_OUT"),
            dens2kappa_stat: raw.optional_path("DENS2KAPPA_STAT"),
            map_out: raw.optional_path("MAP_OUT"),
            recovalm_out: raw.optional_path("RECOVALM_OUT"),
            recovcls_out: raw.optional_path("RECOVCLS_OUT"),
            shear_alm_prefix: raw.optional_path("SHEAR_ALM_PREFIX"),
            shear_map_out: raw.optional_path("SHEAR_MAP_OUT"),
            mapwer_out: raw.optional_path("MAPWER_OUT"),
            catalog_out: raw.optional_path("CATALOG_OUT"),
        };

        let cfg = Self {
            dist,
            fields_info,
            cl_prefix,
            lmin,
            lmax,
            nside,
            scale_cls: raw.parse("SCALE_CLS", 1.0, "number")?,
            winfunc_sigma: raw.parse("WINFUNC_SIGMA", -1.0, "number")?,
            apply_pixwin: raw.parse::<i64>("APPLY_PIXWIN", 0, "0 or 1")? == 1,
            pixwin_file: raw.optional_path("PIXWIN_FILE").map(PathBuf::from),
            suppress_l: raw.parse("SUPPRESS_L", -1.0, "number")?,
            sup_index: raw.parse("SUP_INDEX", -1.0, "number")?,
            allow_miss_cl: raw.parse::<i64>("ALLOW_MISS_CL", 0, "0 or 1")? == 1,
            crop_cl,
            extrap_dipole: raw.parse::<i64>("EXTRAP_DIPOLE", 1, "0 or 1")? == 1,
            badcorr_frac: raw.parse("BADCORR_FRAC", 0.0, "number")?,
            mindiag_frac: raw.parse("MINDIAG_FRAC", 0.0, "number")?,
            reg_maxsteps: raw.parse("REG_MAXSTEPS", 1000, "positive integer")?,
            rndseed: raw.parse("RNDSEED", 1, "non-negative integer")?,
            dens2kappa: raw.parse("DENS2KAPPA", 0, "0 or 1")?,
            poisson,
            exit_at,
            omega_m: raw.parse("OMEGA_m", 0.3, "number")?,
            omega_l: raw.parse("OMEGA_L", 0.7, "number")?,
            w_de: raw.parse("W_de", -1.0, "number")?,
            selec_scale: raw.parse("SELEC_SCALE", 1.0, "number")?,
            selec_map: raw.optional_path("SELEC_MAP").map(PathBuf::from),
            ellip_sigma: raw.parse("ELLIP_SIGMA", 0.0, "number")?,
            catalog_cols: raw
                .take("CATALOG_COLS")
                .unwrap_or_else(|| "theta phi z galtype kappa gamma1 gamma2 ellip1 ellip2 pixel".to_string()),
            angular_coord: raw.parse("ANGULAR_COORD", 0, "0, 1 or 2")?,
            ring_weight_file: raw.optional_path("RING_WEIGHT_FILE").map(PathBuf::from),
            lrange_out,
            mmax_out: raw.parse("MMAX_OUT", -1, "integer")?,
            outputs,
        };

        for key in raw.0.keys() {
            diag.warn(format_args!("unknown config key {key} ignored"));
        }

        if cfg.apply_pixwin && cfg.pixwin_file.is_none() {
            return Err(ConfigError::MissingPixwinFile);
        }
        Ok(cfg)
    }

    /// Preconditions that involve the runtime thread count: the
    /// per-thread seed streams stay disjoint only while
    /// `seed + n_threads·OFFSET` fits the seed space.
    pub fn validate_parallel(&self, n_threads: usize) -> Result<(), ConfigError> {
        if self.rndseed >= RAND_OFFSET - 1 {
            return Err(ConfigError::SeedTooLarge(self.rndseed, RAND_OFFSET - 1));
        }
        if n_threads >= MAX_THREADS {
            return Err(ConfigError::TooManyThreads(n_threads, MAX_THREADS));
        }
        Ok(())
    }

    /// Whether the pipeline should stop right after the named stage.
    pub fn exit_after(&self, stage: &str) -> bool {
        self.exit_at == stage
    }

    /// Whether any requested output needs shear maps.
    pub fn shear_requested(&self) -> bool {
        if self.outputs.shear_alm_prefix.is_some() || self.outputs.shear_map_out.is_some() {
            return true;
        }
        if self.outputs.catalog_out.is_some() {
            return ["gamma1", "gamma2", "ellip1", "ellip2"]
                .iter()
                .any(|c| self.catalog_cols.split_whitespace().any(|w| w == *c));
        }
        false
    }

    /// Output ℓ-range for recovered spectra, clamped into [lmin, lmax].
    pub fn lrange_out_clamped(&self, diag: &Diagnostics) -> (usize, usize) {
        match self.lrange_out {
            None => (self.lmin, self.lmax),
            Some((mut lo, mut hi)) => {
                if hi > self.lmax {
                    diag.warn("LRANGE_OUT beyond LRANGE upper bound, will use the latter instead");
                    hi = self.lmax;
                }
                if lo < self.lmin {
                    diag.warn("LRANGE_OUT beyond LRANGE lower bound, will use the latter instead");
                    lo = self.lmin;
                }
                (lo, hi)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> String {
        "DIST: GAUSSIAN\n\
         FIELDS_INFO: fields.dat\n\
         CL_PREFIX: cls-\n\
         LRANGE: 2 64\n\
         NSIDE: 32\n"
            .to_string()
    }

    fn load_str(text: &str, overrides: &[&str], diag: &Diagnostics) -> Result<Config, ConfigError> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.config");
        std::fs::write(&path, text).unwrap();
        let overrides: Vec<String> = overrides.iter().map(|s| s.to_string()).collect();
        Config::load(&path, &overrides, diag)
    }

    #[test]
    fn test_minimal_config_and_defaults() {
        let diag = Diagnostics::new();
        let cfg = load_str(&base_config(), &[], &diag).unwrap();
        assert_eq!(cfg.dist, Distribution::Gaussian);
        assert_eq!((cfg.lmin, cfg.lmax), (2, 64));
        assert_eq!(cfg.nside, 32);
        assert_eq!(cfg.scale_cls, 1.0);
        assert!(!cfg.allow_miss_cl);
        assert!(cfg.extrap_dipole);
        assert_eq!(cfg.poisson, 1);
        assert!(cfg.outputs.map_out.is_none());
        assert_eq!(diag.warnings(), 0);
    }

    #[test]
    fn test_overrides_win() {
        let diag = Diagnostics::new();
        let cfg = load_str(
            &base_config(),
            &["RNDSEED:", "42", "SCALE_CLS=2.5", "MAP_OUT: maps.dat"],
            &diag,
        )
        .unwrap();
        assert_eq!(cfg.rndseed, 42);
        assert_eq!(cfg.scale_cls, 2.5);
        assert_eq!(cfg.outputs.map_out.as_deref(), Some("maps.dat"));
    }

    #[test]
    fn test_lrange_order_is_fatal() {
        let diag = Diagnostics::new();
        let text = base_config().replace("LRANGE: 2 64", "LRANGE: 64 2");
        assert!(matches!(
            load_str(&text, &[], &diag),
            Err(ConfigError::BadLRange(64, 2))
        ));
    }

    #[test]
    fn test_crop_cl_contract() {
        let diag = Diagnostics::new();
        let cfg = load_str(&base_config(), &["CROP_CL: 7"], &diag).unwrap();
        assert!(!cfg.crop_cl);
        assert_eq!(diag.warnings(), 1);
    }

    #[test]
    fn test_unknown_key_warns() {
        let diag = Diagnostics::new();
        let cfg = load_str(&base_config(), &["NO_SUCH_KEY: 1"], &diag).unwrap();
        assert_eq!(diag.warnings(), 1);
        let _ = cfg;
    }

    #[test]
    fn test_unknown_exit_stage_warns() {
        let diag = Diagnostics::new();
        load_str(&base_config(), &["EXIT_AT: NOT_A_STAGE"], &diag).unwrap();
        assert_eq!(diag.warnings(), 1);
    }

    #[test]
    fn test_bad_poisson_is_fatal() {
        let diag = Diagnostics::new();
        assert!(matches!(
            load_str(&base_config(), &["POISSON: 3"], &diag),
            Err(ConfigError::BadPoisson(3))
        ));
    }

    #[test]
    fn test_parallel_preconditions() {
        let diag = Diagnostics::new();
        let cfg = load_str(&base_config(), &["RNDSEED: 42"], &diag).unwrap();
        assert!(cfg.validate_parallel(8).is_ok());
        assert!(matches!(
            cfg.validate_parallel(500),
            Err(ConfigError::TooManyThreads(500, MAX_THREADS))
        ));

        let cfg = load_str(&base_config(), &["RNDSEED: 99999999"], &diag).unwrap();
        assert!(matches!(
            cfg.validate_parallel(2),
            Err(ConfigError::SeedTooLarge(99999999, _))
        ));
    }

    #[test]
    fn test_pixwin_requires_file() {
        let diag = Diagnostics::new();
        assert!(matches!(
            load_str(&base_config(), &["APPLY_PIXWIN: 1"], &diag),
            Err(ConfigError::MissingPixwinFile)
        ));
        let cfg = load_str(
            &base_config(),
            &["APPLY_PIXWIN: 1", "PIXWIN_FILE: pixwin.dat"],
            &diag,
        )
        .unwrap();
        assert!(cfg.apply_pixwin);
    }

    #[test]
    fn test_shear_requested_via_catalog_columns() {
        let diag = Diagnostics::new();
        let cfg = load_str(&base_config(), &["CATALOG_OUT: cat.dat"], &diag).unwrap();
        assert!(cfg.shear_requested()); // default columns include gamma1
        let cfg = load_str(
            &base_config(),
            &["CATALOG_OUT: cat.dat", "CATALOG_COLS: theta phi z"],
            &diag,
        )
        .unwrap();
        assert!(!cfg.shear_requested());
        let cfg = load_str(&base_config(), &["SHEAR_MAP_OUT: shear.dat"], &diag).unwrap();
        assert!(cfg.shear_requested());
    }
}
