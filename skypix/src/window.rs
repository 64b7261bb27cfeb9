//! Pixel-window and ring-weight table loaders.
//!
//! Both tables are whitespace-delimited text. The pixel window is a
//! two-column (ℓ, W) table expected to cover [0, 4·Nside]; ring weights
//! are one correction per line for the 2·Nside northern rings, stored as
//! the deviation w with the applied weight being 1 + w.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::interp::{InterpError, MonotoneCubic};

#[derive(Error, Debug)]
pub enum WindowError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("{path}:{line}: malformed entry: {text}")]
    Malformed {
        path: String,
        line: usize,
        text: String,
    },
    #[error("{path}: expected {expected} ring weights, found {found}")]
    WeightCount {
        path: String,
        expected: usize,
        found: usize,
    },
    #[error("pixel window table is unusable: {0}")]
    BadTable(#[from] InterpError),
}

/// Pixel window function W(ℓ) sampled on a grid, evaluated by monotone
/// interpolation.
#[derive(Debug, Clone)]
pub struct PixelWindow {
    ell_max: f64,
    spline: MonotoneCubic,
}

impl PixelWindow {
    /// W(ℓ)², the factor applied to a power spectrum; arguments past the
    /// table are clamped to the boundary value.
    pub fn squared_at(&self, ell: f64) -> f64 {
        let w = self.spline.eval_clamped(ell);
        w * w
    }

    /// Whether ℓ lies inside the tabulated range.
    pub fn covers(&self, ell: f64) -> bool {
        ell <= self.ell_max
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>, WindowError> {
    let text = fs::read_to_string(path).map_err(|source| WindowError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(text
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect())
}

/// Load a two-column (ℓ, W) pixel window table.
///
/// The table should cover [0, 4·Nside]; a shorter table still loads (the
/// caller decides whether to warn) and is clamped beyond its last entry.
pub fn load_pixel_window(path: &Path, _nside: usize) -> Result<PixelWindow, WindowError> {
    let mut ells = Vec::new();
    let mut ws = Vec::new();
    for (i, line) in read_lines(path)?.iter().enumerate() {
        let mut it = line.split_whitespace();
        let (a, b) = (it.next(), it.next());
        match (
            a.and_then(|v| v.parse::<f64>().ok()),
            b.and_then(|v| v.parse::<f64>().ok()),
        ) {
            (Some(ell), Some(w)) => {
                ells.push(ell);
                ws.push(w);
            }
            _ => {
                return Err(WindowError::Malformed {
                    path: path.display().to_string(),
                    line: i + 1,
                    text: line.clone(),
                })
            }
        }
    }
    let ell_max = ells.last().copied().unwrap_or(0.0);
    Ok(PixelWindow {
        ell_max,
        spline: MonotoneCubic::new(ells, ws)?,
    })
}

/// Load 2·Nside ring-weight corrections; the applied weight is 1 + w.
pub fn load_ring_weights(path: &Path, nside: usize) -> Result<Vec<f64>, WindowError> {
    let lines = read_lines(path)?;
    let mut weights = Vec::with_capacity(2 * nside);
    for (i, line) in lines.iter().enumerate() {
        let w: f64 = line
            .split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| WindowError::Malformed {
                path: path.display().to_string(),
                line: i + 1,
                text: line.clone(),
            })?;
        weights.push(1.0 + w);
    }
    if weights.len() != 2 * nside {
        return Err(WindowError::WeightCount {
            path: path.display().to_string(),
            expected: 2 * nside,
            found: weights.len(),
        });
    }
    Ok(weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;

    fn write_temp(content: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir();
        let path = dir.join(format!(
            "skypix-window-{}-{}.dat",
            std::process::id(),
            content.len()
        ));
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_pixel_window_interpolates_and_clamps() {
        let path = write_temp("# ell W\n0 1.0\n1 0.9\n2 0.8\n3 0.7\n4 0.6\n");
        let win = load_pixel_window(&path, 1).unwrap();
        assert_relative_eq!(win.squared_at(1.0), 0.81, epsilon = 1e-12);
        assert_relative_eq!(win.squared_at(4.0), 0.36, epsilon = 1e-12);
        // Clamped beyond the table.
        assert_relative_eq!(win.squared_at(10.0), 0.36, epsilon = 1e-12);
        assert!(win.covers(4.0));
        assert!(!win.covers(4.5));
        fs::remove_file(path).ok();
    }

    #[test]
    fn test_pixel_window_rejects_garbage() {
        let path = write_temp("0 1.0\nnot a number\n");
        assert!(matches!(
            load_pixel_window(&path, 1),
            Err(WindowError::Malformed { line: 2, .. })
        ));
        fs::remove_file(path).ok();
    }

    #[test]
    fn test_ring_weights_count_and_offset() {
        let path = write_temp("0.01\n-0.02\n0.0\n0.5\n");
        let w = load_ring_weights(&path, 2).unwrap();
        assert_eq!(w.len(), 4);
        assert_relative_eq!(w[0], 1.01);
        assert_relative_eq!(w[1], 0.98);
        assert_relative_eq!(w[3], 1.5);

        assert!(matches!(
            load_ring_weights(&path, 3),
            Err(WindowError::WeightCount { expected: 6, found: 4, .. })
        ));
        fs::remove_file(path).ok();
    }

    #[test]
    fn test_missing_file() {
        let missing = Path::new("/nonexistent/skypix-window.dat");
        assert!(matches!(
            load_pixel_window(missing, 4),
            Err(WindowError::Io { .. })
        ));
    }
}
