//! Shear construction from convergence.
//!
//! E-mode coefficients follow the flat-sky-exact spin coupling
//! γE_ℓm = √((ℓ+2)(ℓ−1)/(ℓ(ℓ+1)))·κ_ℓm for ℓ ≥ 2 (zero below, B ≡ 0),
//! and the spin-2 inverse transform produces the (γ₁, γ₂) maps.

use skypix::{synthesize_spin2, Alm, Pixelisation};

/// κℓm → shear E-mode coefficients; monopole and dipole vanish.
pub fn kappa_to_shear_emode(klm: &Alm) -> Alm {
    let lmax = klm.lmax();
    let mut elm = Alm::new(lmax);
    for l in 2..=lmax {
        let lf = l as f64;
        let coeff = ((lf + 2.0) * (lf - 1.0) / (lf * (lf + 1.0))).sqrt();
        for m in 0..=l {
            elm.set(l, m, coeff * klm.get(l, m));
        }
    }
    elm
}

/// Inverse spin-2 transform of the E-mode coefficients.
pub fn shear_maps(elm: &Alm, pix: &Pixelisation) -> (Vec<f64>, Vec<f64>) {
    synthesize_spin2(elm, pix)
}
