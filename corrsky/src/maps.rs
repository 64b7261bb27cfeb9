//! Pixel-map synthesis and the pixel-space distribution transforms.
//!
//! The auxiliary Gaussian maps come from the inverse scalar transform;
//! lognormal fields are then exponentiated with a per-field scale that
//! restores the target mean and shift, Gaussian fields just get their
//! mean added, and homogeneous runs skip harmonic space entirely.

use ndarray::Array2;
use rayon::prelude::*;

use skypix::{synthesize, Alm, Pixelisation};

use crate::config::Distribution;
use crate::fields::FieldRegistry;

/// Inverse-transform every field's aℓm into a (field × pixel) array.
pub fn synthesize_maps(alms: &[Alm], pix: &Pixelisation) -> Array2<f64> {
    let mut maps = Array2::zeros((alms.len(), pix.npix()));
    for (i, alm) in alms.iter().enumerate() {
        let row = synthesize(alm, pix);
        maps.row_mut(i)
            .iter_mut()
            .zip(row)
            .for_each(|(dst, v)| *dst = v);
    }
    maps
}

/// First three sample moments of a map.
#[derive(Debug, Clone, Copy)]
pub struct MapMoments {
    pub mean: f64,
    /// Unbiased sample variance.
    pub variance: f64,
    pub skewness: f64,
}

pub fn map_moments(values: &[f64]) -> MapMoments {
    let n = values.len() as f64;
    let mean = values.par_iter().sum::<f64>() / n;
    let variance = values
        .par_iter()
        .map(|v| (v - mean) * (v - mean))
        .sum::<f64>()
        / (n - 1.0);
    let skewness = values
        .par_iter()
        .map(|v| (v - mean).powi(3))
        .sum::<f64>()
        / n
        / variance.powf(1.5);
    MapMoments {
        mean,
        variance,
        skewness,
    }
}

/// Replace the Gaussian pixels g by α·exp(g) − s with
/// α = (μ+s)·exp(−v̂/2), restoring the target mean and shift.
pub fn exponentiate_lognormal(values: &mut [f64], mean: f64, shift: f64) {
    let moments = map_moments(values);
    let alpha = (mean + shift) * (-moments.variance / 2.0).exp();
    values.par_iter_mut().for_each(|v| {
        *v = alpha * v.exp() - shift;
    });
}

/// Gaussian model: just add the target mean.
pub fn add_mean(values: &mut [f64], mean: f64) {
    if mean != 0.0 {
        values.par_iter_mut().for_each(|v| *v += mean);
    }
}

/// Lognormal parameters implied by the first three moments, as printed in
/// the map statistics table: (μ_G, σ_G, shift).
pub fn lognormal_implied_params(mean: f64, variance: f64, skewness: f64) -> (f64, f64, f64) {
    let shift = moments_to_shift(mean, variance, skewness);
    let ratio = 1.0 + variance / ((mean + shift) * (mean + shift));
    let gmu = ((mean + shift) / ratio.sqrt()).ln();
    let gsigma = ratio.ln().sqrt();
    (gmu, gsigma, shift)
}

/// Solve skew = (w+2)·√(w−1), w = exp(σ_G²), then s = √(var/(w−1)) − μ.
/// Returns NaN for non-positive skewness (no lognormal matches).
pub fn moments_to_shift(mean: f64, variance: f64, skewness: f64) -> f64 {
    if skewness <= 0.0 || variance <= 0.0 {
        return f64::NAN;
    }
    let target = skewness * skewness;
    let mut w = 1.0 + skewness.powf(2.0 / 3.0); // decent starting point
    for _ in 0..100 {
        let g = (w + 2.0) * (w + 2.0) * (w - 1.0) - target;
        let dg = (w + 2.0) * (3.0 * w);
        let step = g / dg;
        w -= step;
        if w <= 1.0 {
            w = 1.0 + 1e-12;
        }
        if step.abs() < 1e-14 * w {
            break;
        }
    }
    (variance / (w - 1.0)).sqrt() - mean
}

/// Human-readable per-field statistics table (mean, std. dev., skewness,
/// plus the implied lognormal parameters when applicable).
pub fn stats_table(maps: &Array2<f64>, registry: &FieldRegistry, dist: Distribution) -> String {
    let mut out = String::new();
    out.push_str("# FieldID        Mean     Std.Dev.     Skewness");
    if dist == Distribution::Lognormal {
        out.push_str("          gMU       gSIGMA        Shift");
    }
    out.push('\n');
    for i in 0..registry.n_fields() {
        let row = maps.row(i);
        let m = map_moments(row.as_slice().expect("maps are row-contiguous"));
        out.push_str(&format!(
            "{:<10}{:>13.6e}{:>13.6e}{:>13.6e}",
            registry.get(i).label(),
            m.mean,
            m.variance.sqrt(),
            m.skewness
        ));
        if dist == Distribution::Lognormal {
            let (gmu, gsigma, shift) = lognormal_implied_params(m.mean, m.variance, m.skewness);
            out.push_str(&format!("{gmu:>13.6e}{gsigma:>13.6e}{shift:>13.6e}"));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution as _, Normal};

    #[test]
    fn test_map_moments_on_known_data() {
        let values = vec![1.0, 2.0, 3.0, 4.0];
        let m = map_moments(&values);
        assert_relative_eq!(m.mean, 2.5);
        assert_relative_eq!(m.variance, 5.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(m.skewness, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_exponentiation_restores_mean_and_floor() {
        let mut rng = StdRng::seed_from_u64(11);
        let sigma = 0.4;
        let normal = Normal::new(0.0, sigma).unwrap();
        let mut values: Vec<f64> = (0..200_000).map(|_| normal.sample(&mut rng)).collect();
        let (mean, shift) = (1.0, 1.0);
        exponentiate_lognormal(&mut values, mean, shift);

        // All pixels above -shift, sample mean near the target.
        assert!(values.iter().all(|v| *v > -shift));
        let m = map_moments(&values);
        assert_relative_eq!(m.mean, mean, epsilon = 0.01);
        // Positive skewness, as befits a lognormal.
        assert!(m.skewness > 0.0);
    }

    #[test]
    fn test_exponentiation_variance_matches_design() {
        // For X = alpha exp(G) - s with G ~ N(0, sigma^2):
        // var(X) = (mean+s)^2 (e^{sigma^2} - 1).
        let mut rng = StdRng::seed_from_u64(5);
        let sigma = 0.3;
        let normal = Normal::new(0.0, sigma).unwrap();
        let mut values: Vec<f64> = (0..400_000).map(|_| normal.sample(&mut rng)).collect();
        let (mean, shift) = (0.0, 2.0);
        exponentiate_lognormal(&mut values, mean, shift);
        let expect_var = (mean + shift).powi(2) * ((sigma * sigma).exp() - 1.0);
        let m = map_moments(&values);
        assert_relative_eq!(m.variance, expect_var, max_relative = 0.05);
    }

    #[test]
    fn test_add_mean() {
        let mut values = vec![0.0, 1.0, -1.0];
        add_mean(&mut values, 2.0);
        assert_eq!(values, vec![2.0, 3.0, 1.0]);
    }

    #[test]
    fn test_moments_to_shift_recovers_lognormal() {
        // Analytic moments of a shifted lognormal with known parameters.
        let (sigma2, shift, mean) = (0.25_f64, 1.5_f64, 0.3_f64);
        let w = sigma2.exp();
        let variance = (mean + shift) * (mean + shift) * (w - 1.0);
        let skewness = (w + 2.0) * (w - 1.0_f64).sqrt();
        let recovered = moments_to_shift(mean, variance, skewness);
        assert_relative_eq!(recovered, shift, epsilon = 1e-6);

        let (gmu, gsigma, _) = lognormal_implied_params(mean, variance, skewness);
        assert_relative_eq!(gsigma * gsigma, sigma2, epsilon = 1e-6);
        // E[X] = exp(gmu + sigma^2/2) - shift must give back the mean.
        assert_relative_eq!((gmu + sigma2 / 2.0).exp() - shift, mean, epsilon = 1e-5);
    }

    #[test]
    fn test_moments_to_shift_rejects_negative_skew() {
        assert!(moments_to_shift(0.0, 1.0, -0.5).is_nan());
    }

    #[test]
    fn test_stats_table_shape() {
        use crate::config::Distribution;
        use crate::fields::{FieldInfo, FieldRegistry, FieldType};

        let registry = FieldRegistry::from_fields(
            vec![FieldInfo {
                f: 1,
                z: 1,
                mean: 0.0,
                shift: 1.0,
                kind: FieldType::Density,
                zmin: 0.0,
                zmax: 0.5,
            }],
            Distribution::Gaussian,
        )
        .unwrap();
        let maps = Array2::from_shape_fn((1, 16), |(_, j)| j as f64);
        let table = stats_table(&maps, &registry, Distribution::Gaussian);
        assert!(table.starts_with("# FieldID"));
        assert!(table.contains("f1z1"));
        assert_eq!(table.lines().count(), 2);
    }
}
