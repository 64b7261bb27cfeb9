//! RING-scheme equal-area pixelisation of the sphere.
//!
//! Pixels live on iso-latitude rings: Nside−1 rings of 4i pixels in each
//! polar cap and 2·Nside+1 equatorial rings of 4·Nside pixels, for a total
//! of 12·Nside² equal-area pixels. Pixel indices increase from the north
//! pole southwards, west to east within each ring.

use std::f64::consts::PI;

use thiserror::Error;

/// Errors from pixelisation construction and queries.
#[derive(Error, Debug)]
pub enum PixelisationError {
    #[error("Nside must be at least 1")]
    BadNside,
    #[error("pixel index {0} out of range for {1} pixels")]
    BadPixel(usize, usize),
}

/// One iso-latitude ring of the grid.
#[derive(Debug, Clone)]
pub struct Ring {
    /// Index of the first pixel of the ring.
    pub first: usize,
    /// Number of pixels in the ring.
    pub count: usize,
    /// cos θ of the ring centre.
    pub z: f64,
    /// Colatitude of the ring centre in radians.
    pub theta: f64,
    /// sin θ of the ring centre.
    pub sin_theta: f64,
    /// Azimuth of the centre of the first pixel.
    pub phi0: f64,
}

/// RING-scheme pixelisation at a given resolution parameter.
#[derive(Debug, Clone)]
pub struct Pixelisation {
    nside: usize,
    npix: usize,
    ncap: usize,
    rings: Vec<Ring>,
}

impl Pixelisation {
    /// Build the ring table for resolution `nside` (any value ≥ 1).
    pub fn new(nside: usize) -> Result<Self, PixelisationError> {
        if nside == 0 {
            return Err(PixelisationError::BadNside);
        }
        let npix = 12 * nside * nside;
        let ncap = 2 * nside * (nside - 1);
        let n = nside as f64;

        let mut rings = Vec::with_capacity(4 * nside - 1);
        // North polar cap.
        for i in 1..nside {
            let z = 1.0 - (i * i) as f64 / (3.0 * n * n);
            rings.push(Ring {
                first: 2 * i * (i - 1),
                count: 4 * i,
                z,
                theta: z.acos(),
                sin_theta: (1.0 - z * z).sqrt(),
                phi0: PI / (4 * i) as f64,
            });
        }
        // Equatorial belt, rings nside..=3*nside counted from the pole.
        for i in nside..=3 * nside {
            let z = (2 * nside) as f64 * 2.0 / (3.0 * n) - (i as f64) * 2.0 / (3.0 * n);
            let fodd = if (i + nside) % 2 == 1 { 1.0 } else { 0.5 };
            rings.push(Ring {
                first: ncap + (i - nside) * 4 * nside,
                count: 4 * nside,
                z,
                theta: z.acos(),
                sin_theta: (1.0 - z * z).sqrt(),
                phi0: (1.0 - fodd) * PI / (2.0 * n),
            });
        }
        // South polar cap, mirrored.
        for i in (1..nside).rev() {
            let z = -1.0 + (i * i) as f64 / (3.0 * n * n);
            rings.push(Ring {
                first: npix - 2 * i * (i + 1),
                count: 4 * i,
                z,
                theta: z.acos(),
                sin_theta: (1.0 - z * z).sqrt(),
                phi0: PI / (4 * i) as f64,
            });
        }
        debug_assert_eq!(rings.len(), 4 * nside - 1);

        Ok(Self {
            nside,
            npix,
            ncap,
            rings,
        })
    }

    pub fn nside(&self) -> usize {
        self.nside
    }

    /// Total number of pixels, 12·Nside².
    pub fn npix(&self) -> usize {
        self.npix
    }

    /// Solid angle of one pixel in steradians.
    pub fn pixel_solid_angle(&self) -> f64 {
        4.0 * PI / self.npix as f64
    }

    /// The ring table, north to south.
    pub fn rings(&self) -> &[Ring] {
        &self.rings
    }

    pub fn n_rings(&self) -> usize {
        self.rings.len()
    }

    /// Index of the ring containing pixel `p`.
    pub fn ring_of(&self, p: usize) -> usize {
        debug_assert!(p < self.npix);
        match self.rings.binary_search_by(|r| r.first.cmp(&p)) {
            Ok(i) => i,
            Err(i) => i - 1,
        }
    }

    /// Colatitude and azimuth of the centre of pixel `p`.
    pub fn pix2ang(&self, p: usize) -> Result<(f64, f64), PixelisationError> {
        if p >= self.npix {
            return Err(PixelisationError::BadPixel(p, self.npix));
        }
        let r = &self.rings[self.ring_of(p)];
        let k = p - r.first;
        let phi = r.phi0 + k as f64 * 2.0 * PI / r.count as f64;
        Ok((r.theta, phi))
    }

    /// Pixel containing the direction (θ, φ).
    pub fn ang2pix(&self, theta: f64, phi: f64) -> usize {
        let n = self.nside as f64;
        let z = theta.cos();
        let za = z.abs();
        let mut tt = phi.rem_euclid(2.0 * PI) / (PI / 2.0); // in [0, 4)

        if za <= 2.0 / 3.0 {
            // Equatorial belt.
            let temp1 = n * (0.5 + tt);
            let temp2 = n * z * 0.75;
            let jp = (temp1 - temp2).floor() as i64;
            let jm = (temp1 + temp2).floor() as i64;
            let ir = self.nside as i64 + 1 + jp - jm; // in 1..=2n+1
            let kshift = 1 - (ir & 1);
            let nl4 = 4 * self.nside as i64;
            let mut ip = (jp + jm - self.nside as i64 + kshift + 1) / 2;
            ip = ip.rem_euclid(nl4);
            (self.ncap as i64 + (ir - 1) * nl4 + ip) as usize
        } else {
            // Polar caps.
            if tt >= 4.0 {
                tt = 0.0;
            }
            let tp = tt - tt.floor();
            let tmp = n * (3.0 * (1.0 - za)).sqrt();
            let jp = (tp * tmp).floor() as i64;
            let jm = ((1.0 - tp) * tmp).floor() as i64;
            let ir = (jp + jm + 1).min(self.nside as i64); // ring counted from the pole
            let mut ip = (tt * ir as f64).floor() as i64;
            ip = ip.rem_euclid(4 * ir);
            if z > 0.0 {
                (2 * ir * (ir - 1) + ip) as usize
            } else {
                (self.npix as i64 - 2 * ir * (ir + 1) + ip) as usize
            }
        }
    }

    /// Draw a point uniformly distributed inside pixel `p`.
    ///
    /// Rejection-samples a bounding box in (z, φ) around the pixel until
    /// `ang2pix` agrees; the box spans the centres of the adjacent rings so
    /// it always contains the full pixel.
    pub fn random_point_in_pixel<R: rand::Rng>(
        &self,
        rng: &mut R,
        p: usize,
    ) -> Result<(f64, f64), PixelisationError> {
        if p >= self.npix {
            return Err(PixelisationError::BadPixel(p, self.npix));
        }
        let ri = self.ring_of(p);
        let r = &self.rings[ri];
        let z_hi = if ri == 0 { 1.0 } else { self.rings[ri - 1].z };
        let z_lo = if ri + 1 == self.rings.len() {
            -1.0
        } else {
            self.rings[ri + 1].z
        };
        let k = p - r.first;
        let phi_c = r.phi0 + k as f64 * 2.0 * PI / r.count as f64;
        let half_width = 2.0 * PI / r.count as f64;

        for _ in 0..10_000 {
            let z = rng.gen_range(z_lo..=z_hi);
            let phi = (phi_c + rng.gen_range(-half_width..=half_width)).rem_euclid(2.0 * PI);
            let theta = z.acos();
            if self.ang2pix(theta, phi) == p {
                return Ok((theta, phi));
            }
        }
        // Pathological rounding near a pixel boundary: fall back to the centre.
        self.pix2ang(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_pixel_counts() {
        for nside in [1usize, 2, 4, 8, 16] {
            let pix = Pixelisation::new(nside).unwrap();
            assert_eq!(pix.npix(), 12 * nside * nside);
            assert_eq!(pix.n_rings(), 4 * nside - 1);
            let total: usize = pix.rings().iter().map(|r| r.count).sum();
            assert_eq!(total, pix.npix());
            // Ring first-pixel indices are cumulative.
            let mut expect = 0;
            for r in pix.rings() {
                assert_eq!(r.first, expect);
                expect += r.count;
            }
        }
    }

    #[test]
    fn test_rings_descend_in_z() {
        let pix = Pixelisation::new(8).unwrap();
        for w in pix.rings().windows(2) {
            assert!(w[0].z > w[1].z);
        }
        // North/south symmetry.
        let rings = pix.rings();
        let n = rings.len();
        for i in 0..n / 2 {
            assert_relative_eq!(rings[i].z, -rings[n - 1 - i].z, epsilon = 1e-12);
            assert_eq!(rings[i].count, rings[n - 1 - i].count);
        }
    }

    #[test]
    fn test_pix2ang_ang2pix_roundtrip() {
        for nside in [1usize, 2, 3, 8] {
            let pix = Pixelisation::new(nside).unwrap();
            for p in 0..pix.npix() {
                let (theta, phi) = pix.pix2ang(p).unwrap();
                assert_eq!(pix.ang2pix(theta, phi), p, "nside={nside} pixel {p}");
            }
        }
    }

    #[test]
    fn test_ring_of() {
        let pix = Pixelisation::new(4).unwrap();
        for (i, r) in pix.rings().iter().enumerate() {
            assert_eq!(pix.ring_of(r.first), i);
            assert_eq!(pix.ring_of(r.first + r.count - 1), i);
        }
    }

    #[test]
    fn test_random_point_lands_in_pixel() {
        let pix = Pixelisation::new(4).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for p in [0usize, 5, 95, 100, 191] {
            for _ in 0..20 {
                let (theta, phi) = pix.random_point_in_pixel(&mut rng, p).unwrap();
                assert_eq!(pix.ang2pix(theta, phi), p);
            }
        }
    }

    #[test]
    fn test_bad_inputs() {
        assert!(Pixelisation::new(0).is_err());
        let pix = Pixelisation::new(2).unwrap();
        assert!(pix.pix2ang(pix.npix()).is_err());
    }
}
