//! FLRW background for the line-of-sight lensing kernel.
//!
//! Distances assume a (possibly curved) wCDM background with constant
//! dark-energy equation of state and no radiation term, valid at the low
//! redshifts the slices live at. The comoving distance is integrated once
//! onto a fixed grid and interpolated afterwards.

use thiserror::Error;

/// Speed of light in km/s.
const C_KMS: f64 = 299_792.458;
/// Hubble constant scale, 100 km/s/Mpc; distances come out in h⁻¹ Mpc.
const H100: f64 = 100.0;
/// Tabulation range and resolution for the comoving-distance grid.
const Z_GRID_MAX: f64 = 8.0;
const Z_GRID_STEPS: usize = 2000;

#[derive(Error, Debug)]
pub enum CosmologyError {
    #[error("redshift {0} outside the tabulated range [0, {Z_GRID_MAX}]")]
    RedshiftOutOfRange(f64),
}

#[derive(Debug, Clone)]
pub struct Cosmology {
    pub omega_m: f64,
    pub omega_de: f64,
    pub omega_k: f64,
    pub w_de: f64,
    /// χ(z) on the uniform z grid, in h⁻¹ Mpc.
    dist_grid: Vec<f64>,
}

impl Cosmology {
    pub fn new(omega_m: f64, omega_de: f64, w_de: f64) -> Self {
        let omega_k = 1.0 - omega_m - omega_de;
        let mut cosmo = Self {
            omega_m,
            omega_de,
            omega_k,
            w_de,
            dist_grid: Vec::new(),
        };
        // Cumulative trapezoid of dχ/dz over the grid.
        let dz = Z_GRID_MAX / Z_GRID_STEPS as f64;
        let mut grid = Vec::with_capacity(Z_GRID_STEPS + 1);
        let mut acc = 0.0;
        let mut prev = cosmo.dchi_dz(0.0);
        grid.push(0.0);
        for i in 1..=Z_GRID_STEPS {
            let z = i as f64 * dz;
            let cur = cosmo.dchi_dz(z);
            acc += 0.5 * (prev + cur) * dz;
            grid.push(acc);
            prev = cur;
        }
        cosmo.dist_grid = grid;
        cosmo
    }

    /// Dimensionless expansion rate E(z) = H(z)/H₀.
    pub fn eh(&self, z: f64) -> f64 {
        let zp = 1.0 + z;
        (self.omega_m * zp.powi(3)
            + self.omega_k * zp.powi(2)
            + self.omega_de * zp.powf(3.0 * (1.0 + self.w_de)))
        .sqrt()
    }

    /// dχ/dz in h⁻¹ Mpc.
    pub fn dchi_dz(&self, z: f64) -> f64 {
        C_KMS / H100 / self.eh(z)
    }

    /// Radial comoving distance χ(z) in h⁻¹ Mpc.
    pub fn com_dist(&self, z: f64) -> Result<f64, CosmologyError> {
        if !(0.0..=Z_GRID_MAX).contains(&z) {
            return Err(CosmologyError::RedshiftOutOfRange(z));
        }
        let t = z / Z_GRID_MAX * Z_GRID_STEPS as f64;
        let i = (t.floor() as usize).min(Z_GRID_STEPS - 1);
        let frac = t - i as f64;
        Ok(self.dist_grid[i] + frac * (self.dist_grid[i + 1] - self.dist_grid[i]))
    }

    /// Transverse comoving distance for a radial distance χ.
    pub fn transverse_dist(&self, chi: f64) -> f64 {
        if self.omega_k == 0.0 {
            return chi;
        }
        let curv = C_KMS / H100 / self.omega_k.abs().sqrt();
        if self.omega_k > 0.0 {
            curv * (chi / curv).sinh()
        } else {
            curv * (chi / curv).sin()
        }
    }

    /// Lensing kernel W(z|z_source) for line-of-sight integration of the
    /// density contrast.
    pub fn kappa_weight_by_z(&self, z: f64, zsource: f64) -> Result<f64, CosmologyError> {
        let chi = self.com_dist(z)?;
        let chi_s = self.com_dist(zsource)?;
        Ok(1.5 * H100 * H100 / (C_KMS * C_KMS) * self.omega_m * (1.0 + z)
            * self.transverse_dist(chi)
            * self.transverse_dist(chi_s - chi)
            / self.transverse_dist(chi_s)
            * self.dchi_dz(z))
    }
}
