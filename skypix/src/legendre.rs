//! Legendre polynomials, fully-normalised associated Legendre functions,
//! and Gauss–Legendre quadrature rules.
//!
//! The associated functions λ_ℓm(θ) are normalised so that the spherical
//! harmonics are Y_ℓm(θ, φ) = λ_ℓm(θ)·e^{imφ}, Condon–Shortley phase
//! included. Recurrences run upwards in ℓ at fixed m, which is stable for
//! the band-limits used here.

use std::f64::consts::PI;

/// Evaluate P_0(x) … P_lmax(x) with the three-term recurrence.
pub fn legendre_table(lmax: usize, x: f64) -> Vec<f64> {
    let mut p = Vec::with_capacity(lmax + 1);
    p.push(1.0);
    if lmax == 0 {
        return p;
    }
    p.push(x);
    for l in 1..lmax {
        let lf = l as f64;
        let next = ((2.0 * lf + 1.0) * x * p[l] - lf * p[l - 1]) / (lf + 1.0);
        p.push(next);
    }
    p
}

/// Evaluate λ_mm(θ) … λ_lmax,m(θ) for a fixed order m.
///
/// Returns a vector of length `lmax - m + 1`; entry k holds λ_{m+k, m}.
/// Values underflow to zero near the poles for large m, which is harmless
/// for synthesis and analysis sums.
pub fn normalized_assoc_table(lmax: usize, m: usize, theta: f64) -> Vec<f64> {
    assert!(m <= lmax, "order m={m} exceeds lmax={lmax}");
    let x = theta.cos();
    let s = theta.sin();

    // Seed λ_mm by the sectoral recurrence, Condon-Shortley phase folded in.
    let mut lam_mm = (1.0 / (4.0 * PI)).sqrt();
    for k in 1..=m {
        let kf = k as f64;
        lam_mm *= -((2.0 * kf + 1.0) / (2.0 * kf)).sqrt() * s;
    }

    let mut out = Vec::with_capacity(lmax - m + 1);
    out.push(lam_mm);
    if lmax == m {
        return out;
    }
    let mf = m as f64;
    out.push((2.0 * mf + 3.0).sqrt() * x * lam_mm);
    for l in (m + 2)..=lmax {
        let lf = l as f64;
        let a = ((4.0 * lf * lf - 1.0) / (lf * lf - mf * mf)).sqrt();
        let b = (((lf - 1.0) * (lf - 1.0) - mf * mf) / (4.0 * (lf - 1.0) * (lf - 1.0) - 1.0))
            .sqrt();
        let next = a * (x * out[l - m - 1] - b * out[l - m - 2]);
        out.push(next);
    }
    out
}

/// Gauss–Legendre quadrature rule on [−1, 1].
///
/// Nodes are the roots of P_n, found by Newton iteration from the usual
/// Chebyshev-like initial guesses; weights are 2/((1−x²)·P_n'(x)²).
#[derive(Debug, Clone)]
pub struct GaussLegendre {
    pub nodes: Vec<f64>,
    pub weights: Vec<f64>,
}

impl GaussLegendre {
    pub fn new(n: usize) -> Self {
        assert!(n >= 1, "quadrature rule needs at least one node");
        let mut nodes = vec![0.0; n];
        let mut weights = vec![0.0; n];
        let nf = n as f64;

        // Roots come in ± pairs; solve for the non-negative half.
        for k in 0..n.div_ceil(2) {
            let mut x = (PI * (k as f64 + 0.75) / (nf + 0.5)).cos();
            let mut dp = 0.0;
            for _ in 0..100 {
                // P_n(x) and P_n'(x) by recurrence.
                let (mut p0, mut p1) = (1.0, x);
                for l in 1..n {
                    let lf = l as f64;
                    let p2 = ((2.0 * lf + 1.0) * x * p1 - lf * p0) / (lf + 1.0);
                    p0 = p1;
                    p1 = p2;
                }
                dp = nf * (x * p1 - p0) / (x * x - 1.0);
                let dx = p1 / dp;
                x -= dx;
                if dx.abs() < 1e-15 {
                    break;
                }
            }
            let w = 2.0 / ((1.0 - x * x) * dp * dp);
            nodes[k] = x;
            weights[k] = w;
            nodes[n - 1 - k] = -x;
            weights[n - 1 - k] = w;
        }
        // Ascending node order.
        nodes.reverse();
        weights.reverse();
        Self { nodes, weights }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
