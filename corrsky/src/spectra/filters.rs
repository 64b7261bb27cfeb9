//! Stateless in-place filters on the loaded spectra.
//!
//! Applied in the declared order: constant rescale, Gaussian beam, pixel
//! window, exponential high-ℓ suppression. The ℓ grid of each spectrum is
//! never changed.

use std::f64::consts::PI;

use rayon::prelude::*;

use skypix::PixelWindow;

use crate::config::Config;
use crate::diag::Diagnostics;
use crate::error::PipelineError;
use crate::spectra::SpectrumSet;

/// Multiply every spectrum by a constant.
pub fn rescale(set: &mut SpectrumSet, factor: f64) {
    set.pairs_mut().par_iter_mut().for_each(|slot| {
        if let Some(s) = slot {
            for c in &mut s.cls {
                *c *= factor;
            }
        }
    });
}

/// Gaussian beam: Cℓ ← Cℓ·exp(−ℓ(ℓ+1)σ²), σ given in arc-minutes.
pub fn gaussian_beam(set: &mut SpectrumSet, sigma_arcmin: f64) {
    let sigma_rad = sigma_arcmin / 60.0 * PI / 180.0;
    let sigma2 = sigma_rad * sigma_rad;
    set.pairs_mut().par_iter_mut().for_each(|slot| {
        if let Some(s) = slot {
            for (ell, c) in s.ells.iter().zip(&mut s.cls) {
                *c *= (-ell * (ell + 1.0) * sigma2).exp();
            }
        }
    });
}

/// Pixel window: Cℓ ← Cℓ·W(ℓ)². Warns when the input reaches past the
/// tabulated range [0, 4·Nside].
pub fn pixel_window(set: &mut SpectrumSet, window: &PixelWindow, diag: &Diagnostics) {
    let overshoot = set
        .iter_set()
        .any(|(_, _, s)| !window.covers(s.max_ell()));
    if overshoot {
        diag.warn("input C(l) overshoots the pixel window function table");
    }
    set.pairs_mut().par_iter_mut().for_each(|slot| {
        if let Some(s) = slot {
            for (ell, c) in s.ells.iter().zip(&mut s.cls) {
                *c *= window.squared_at(*ell);
            }
        }
    });
}

/// Exponential suppression: Cℓ ← Cℓ·exp(−(ℓ/ℓsup)ⁿ).
pub fn exponential_suppression(set: &mut SpectrumSet, lsup: f64, index: f64) {
    set.pairs_mut().par_iter_mut().for_each(|slot| {
        if let Some(s) = slot {
            for (ell, c) in s.ells.iter().zip(&mut s.cls) {
                *c *= (-(ell / lsup).powf(index)).exp();
            }
        }
    });
}

/// Run the configured filters in their declared order.
pub fn apply_all(
    set: &mut SpectrumSet,
    cfg: &Config,
    diag: &Diagnostics,
) -> Result<(), PipelineError> {
    if cfg.scale_cls != 1.0 {
        tracing::info!("re-scaling all C(l)s by SCALE_CLS = {}", cfg.scale_cls);
        rescale(set, cfg.scale_cls);
    }
    if cfg.winfunc_sigma > 0.0 {
        tracing::info!(
            "applying Gaussian window function, sigma = {} arcmin",
            cfg.winfunc_sigma
        );
        gaussian_beam(set, cfg.winfunc_sigma);
    }
    if cfg.apply_pixwin {
        let path = cfg
            .pixwin_file
            .as_ref()
            .expect("validated at config load");
        let window = skypix::load_pixel_window(path, cfg.nside)?;
        tracing::info!("applying pixel window function from {}", path.display());
        pixel_window(set, &window, diag);
    }
    if cfg.suppress_l >= 0.0 && cfg.sup_index >= 0.0 {
        tracing::info!(
            "applying exponential suppression, l_sup = {}, index = {}",
            cfg.suppress_l,
            cfg.sup_index
        );
        exponential_suppression(set, cfg.suppress_l, cfg.sup_index);
    }
    Ok(())
}
