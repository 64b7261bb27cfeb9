//! Naive scalar and spin-2 spherical-harmonic transforms on the RING grid.
//!
//! Synthesis and analysis are direct sums over rings and multipoles: for
//! each ring the m-modes are accumulated from the associated Legendre
//! tables, then swept over the ring's pixels with an incremental
//! cos/sin(mφ) recurrence. Parallel work is split per ring (synthesis,
//! phase sums) and per order m (analysis accumulation), with all
//! floating-point reductions running in a fixed order so repeated runs are
//! bit-identical.
//!
//! Analysis uses the pixel solid angle as quadrature weight, optionally
//! corrected by per-ring weights; it is accurate for band-limits
//! comfortably below the grid's Nyquist scale, degrading smoothly as
//! ℓ → 2·Nside.

use num_complex::Complex64;
use rayon::prelude::*;
use thiserror::Error;

use crate::legendre::normalized_assoc_table;
use crate::pixelisation::Pixelisation;

/// Errors from the harmonic transforms.
#[derive(Error, Debug)]
pub enum ShtError {
    #[error("map has {0} pixels, pixelisation expects {1}")]
    MapSizeMismatch(usize, usize),
    #[error("ring weight table has {0} entries, expected {1}")]
    WeightLength(usize, usize),
}

/// Triangular aℓm storage, 0 ≤ m ≤ ℓ ≤ lmax; the m = 0 column is real.
#[derive(Debug, Clone, PartialEq)]
pub struct Alm {
    lmax: usize,
    data: Vec<Complex64>,
}

impl Alm {
    pub fn new(lmax: usize) -> Self {
        let n = (lmax + 1) * (lmax + 2) / 2;
        Self {
            lmax,
            data: vec![Complex64::new(0.0, 0.0); n],
        }
    }

    #[inline]
    fn idx(l: usize, m: usize) -> usize {
        l * (l + 1) / 2 + m
    }

    pub fn lmax(&self) -> usize {
        self.lmax
    }

    pub fn n_coeffs(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn get(&self, l: usize, m: usize) -> Complex64 {
        debug_assert!(m <= l && l <= self.lmax);
        self.data[Self::idx(l, m)]
    }

    #[inline]
    pub fn set(&mut self, l: usize, m: usize, value: Complex64) {
        debug_assert!(m <= l && l <= self.lmax);
        self.data[Self::idx(l, m)] = value;
    }

    /// Iterate (ℓ, m, aℓm) in ℓ-major order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, Complex64)> + '_ {
        (0..=self.lmax).flat_map(move |l| (0..=l).map(move |m| (l, m, self.get(l, m))))
    }

    /// Cross-spectrum estimate Ĉℓ = Σ_m aℓm·b*ℓm / (ℓ+1).
    pub fn cross_spectrum(&self, other: &Alm, l: usize) -> f64 {
        debug_assert!(l <= self.lmax && l <= other.lmax);
        let mut acc = 0.0;
        for m in 0..=l {
            acc += (self.get(l, m) * other.get(l, m).conj()).re;
        }
        acc / (l as f64 + 1.0)
    }
}

/// Per-pixel sweep of Σ_m terms with an incremental angle recurrence.
#[inline]
fn ring_sweep<F: FnMut(usize, f64, f64)>(phi: f64, lmax: usize, mut visit: F) {
    let (sin_phi, cos_phi) = phi.sin_cos();
    let (mut s, mut c) = (0.0_f64, 1.0_f64);
    for m in 0..=lmax {
        visit(m, c, s);
        let c_next = c * cos_phi - s * sin_phi;
        s = s * cos_phi + c * sin_phi;
        c = c_next;
    }
}

/// Inverse scalar transform: pixel map from aℓm.
pub fn synthesize(alm: &Alm, pix: &Pixelisation) -> Vec<f64> {
    let lmax = alm.lmax();
    let ring_maps: Vec<Vec<f64>> = pix
        .rings()
        .par_iter()
        .map(|ring| {
            // m-modes of this ring: F_m(θ) = Σ_ℓ λ_ℓm(θ) aℓm.
            let mut fm = vec![Complex64::new(0.0, 0.0); lmax + 1];
            for (m, slot) in fm.iter_mut().enumerate() {
                let lam = normalized_assoc_table(lmax, m, ring.theta);
                let mut acc = Complex64::new(0.0, 0.0);
                for l in m..=lmax {
                    acc += lam[l - m] * alm.get(l, m);
                }
                *slot = acc;
            }

            let dphi = 2.0 * std::f64::consts::PI / ring.count as f64;
            (0..ring.count)
                .map(|k| {
                    let phi = ring.phi0 + k as f64 * dphi;
                    let mut v = 0.0;
                    ring_sweep(phi, lmax, |m, c, s| {
                        let w = if m == 0 { 1.0 } else { 2.0 };
                        v += w * (fm[m].re * c - fm[m].im * s);
                    });
                    v
                })
                .collect()
        })
        .collect();
    ring_maps.concat()
}

/// Forward scalar transform: aℓm from a pixel map.
///
/// `ring_weights`, when given, must hold 2·Nside entries applied
/// symmetrically from both poles.
pub fn analyze(
    map: &[f64],
    pix: &Pixelisation,
    lmax: usize,
    ring_weights: Option<&[f64]>,
) -> Result<Alm, ShtError> {
    if map.len() != pix.npix() {
        return Err(ShtError::MapSizeMismatch(map.len(), pix.npix()));
    }
    if let Some(w) = ring_weights {
        if w.len() != 2 * pix.nside() {
            return Err(ShtError::WeightLength(w.len(), 2 * pix.nside()));
        }
    }

    let n_rings = pix.n_rings();
    let omega = pix.pixel_solid_angle();

    // Phase sums per ring: G_m = Σ_p f(p)·e^{−imφ_p}.
    let phases: Vec<Vec<Complex64>> = pix
        .rings()
        .par_iter()
        .map(|ring| {
            let dphi = 2.0 * std::f64::consts::PI / ring.count as f64;
            let mut gm = vec![Complex64::new(0.0, 0.0); lmax + 1];
            for k in 0..ring.count {
                let f = map[ring.first + k];
                let phi = ring.phi0 + k as f64 * dphi;
                ring_sweep(phi, lmax, |m, c, s| {
                    gm[m] += Complex64::new(f * c, -f * s);
                });
            }
            gm
        })
        .collect();

    // Accumulate aℓm = Σ_rings w_r·λ_ℓm(θ_r)·G_m(r), one column per m.
    let columns: Vec<Vec<Complex64>> = (0..=lmax)
        .into_par_iter()
        .map(|m| {
            let mut col = vec![Complex64::new(0.0, 0.0); lmax - m + 1];
            for (r, ring) in pix.rings().iter().enumerate() {
                let rw = ring_weights
                    .map(|w| w[r.min(n_rings - 1 - r)])
                    .unwrap_or(1.0);
                let weight = omega * rw;
                let lam = normalized_assoc_table(lmax, m, ring.theta);
                let g = phases[r][m] * weight;
                for l in m..=lmax {
                    col[l - m] += lam[l - m] * g;
                }
            }
            col
        })
        .collect();

    let mut alm = Alm::new(lmax);
    for (m, col) in columns.iter().enumerate() {
        for l in m..=lmax {
            alm.set(l, m, col[l - m]);
        }
    }
    Ok(alm)
}

/// F₁/F₂(θ) tables for spin-2 synthesis, ℓ-indexed 0..=lmax.
///
/// Built from λ_ℓm and λ_{ℓ−1,m}; zero below ℓ = max(2, m). F₁ is even in
/// m, F₂ odd, and for m = 0, F₁ℓ0 reduces to the real spin-2 harmonic.
fn spin2_f_tables(lmax: usize, m: usize, theta: f64) -> (Vec<f64>, Vec<f64>) {
    let mut f1 = vec![0.0; lmax + 1];
    let mut f2 = vec![0.0; lmax + 1];
    if lmax < 2 || m > lmax {
        return (f1, f2);
    }
    let x = theta.cos();
    let s2 = theta.sin() * theta.sin();
    let mf = m as f64;
    let lam = normalized_assoc_table(lmax, m, theta);

    for l in m.max(2)..=lmax {
        let lf = l as f64;
        let norm = 2.0 / ((lf - 1.0) * lf * (lf + 1.0) * (lf + 2.0)).sqrt();
        let d = ((2.0 * lf + 1.0) / (2.0 * lf - 1.0) * (lf * lf - mf * mf)).sqrt();
        let lam_l = lam[l - m];
        let lam_lm1 = if l > m { lam[l - 1 - m] } else { 0.0 };
        f1[l] = norm
            * (-((lf - mf * mf) / s2 + lf * (lf - 1.0) / 2.0) * lam_l
                + d * x / s2 * lam_lm1);
        f2[l] = norm * mf / s2 * (-(lf - 1.0) * x * lam_l + d * lam_lm1);
    }
    (f1, f2)
}

/// Spin-2 synthesis of (γ₁, γ₂) maps from E-mode coefficients (B ≡ 0).
pub fn synthesize_spin2(e: &Alm, pix: &Pixelisation) -> (Vec<f64>, Vec<f64>) {
    let lmax = e.lmax();
    let ring_maps: Vec<(Vec<f64>, Vec<f64>)> = pix
        .rings()
        .par_iter()
        .map(|ring| {
            let mut w1 = vec![Complex64::new(0.0, 0.0); lmax + 1];
            let mut w2 = vec![Complex64::new(0.0, 0.0); lmax + 1];
            for m in 0..=lmax {
                let (f1, f2) = spin2_f_tables(lmax, m, ring.theta);
                let mut acc1 = Complex64::new(0.0, 0.0);
                let mut acc2 = Complex64::new(0.0, 0.0);
                for l in m.max(2)..=lmax {
                    let a = e.get(l, m);
                    acc1 += f1[l] * a;
                    acc2 += f2[l] * a;
                }
                w1[m] = acc1;
                w2[m] = acc2;
            }

            let dphi = 2.0 * std::f64::consts::PI / ring.count as f64;
            let mut g1 = Vec::with_capacity(ring.count);
            let mut g2 = Vec::with_capacity(ring.count);
            for k in 0..ring.count {
                let phi = ring.phi0 + k as f64 * dphi;
                let mut v1 = 0.0;
                let mut v2 = 0.0;
                ring_sweep(phi, lmax, |m, c, s| {
                    let w = if m == 0 { 1.0 } else { 2.0 };
                    v1 += w * (w1[m].re * c - w1[m].im * s);
                    // The odd-parity combination: Im(w₂·e^{imφ}).
                    v2 += w * (w2[m].re * s + w2[m].im * c);
                });
                g1.push(-v1);
                g2.push(-v2);
            }
            (g1, g2)
        })
        .collect();

    let mut gamma1 = Vec::with_capacity(pix.npix());
    let mut gamma2 = Vec::with_capacity(pix.npix());
    for (g1, g2) in ring_maps {
        gamma1.extend(g1);
        gamma2.extend(g2);
    }
    (gamma1, gamma2)
}
