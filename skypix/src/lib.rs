//! Sphere pixelisation and naive spherical-harmonic transforms.
//!
//! This crate provides the geometric and harmonic machinery used by the
//! `corrsky` field simulator:
//!
//! - **RING-scheme equal-area pixelisation**: iso-latitude rings with
//!   12·Nside² pixels, pixel ↔ angle conversions, and uniform sampling of
//!   points inside a pixel.
//! - **Legendre machinery**: ordinary and fully-normalised associated
//!   Legendre recurrences plus Gauss–Legendre quadrature rules.
//! - **Discrete Legendre transform**: the Cℓ ↔ ξ(θ) round trip on
//!   Gauss–Legendre nodes, exact at the configured band-limit.
//! - **Spherical-harmonic transforms**: scalar synthesis and analysis
//!   (with optional ring weights) and spin-2 synthesis for shear maps.
//! - **Interpolation and table loaders**: monotone cubic interpolation,
//!   pixel-window and ring-weight tables.
//!
//! The transforms are deliberately naive — direct sums over rings and
//! multipoles, parallelised with rayon — which keeps them exact to
//! rounding at moderate band-limits without any FFT bookkeeping.

pub mod dlt;
pub mod interp;
pub mod legendre;
pub mod pixelisation;
pub mod sht;
pub mod window;

pub use dlt::DiscreteLegendre;
pub use interp::MonotoneCubic;
pub use legendre::GaussLegendre;
pub use pixelisation::Pixelisation;
pub use sht::{analyze, synthesize, synthesize_spin2, Alm};
pub use window::{load_pixel_window, load_ring_weights, PixelWindow};
