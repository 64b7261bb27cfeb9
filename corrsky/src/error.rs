//! Top-level error aggregation.
//!
//! Stage modules return their own typed errors; this enum is what the
//! orchestrator and the binary see. Every variant maps onto one of the
//! design's error kinds: configuration, input, domain, numerical, or
//! resource failures.

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::config::ConfigError;
use crate::cosmology::CosmologyError;
use crate::covariance::CovarianceError;
use crate::draw::DrawError;
use crate::fields::FieldError;
use crate::los::LosError;
use crate::observe::ObserveError;
use crate::output::OutputError;
use crate::regularize::RegularizeError;
use crate::spectra::SpectrumError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Field(#[from] FieldError),
    #[error(transparent)]
    Spectrum(#[from] SpectrumError),
    #[error(transparent)]
    Window(#[from] skypix::window::WindowError),
    #[error(transparent)]
    Covariance(#[from] CovarianceError),
    #[error(transparent)]
    Regularize(#[from] RegularizeError),
    #[error(transparent)]
    Draw(#[from] DrawError),
    #[error(transparent)]
    Sht(#[from] skypix::sht::ShtError),
    #[error(transparent)]
    Pixelisation(#[from] skypix::pixelisation::PixelisationError),
    #[error(transparent)]
    Cosmology(#[from] CosmologyError),
    #[error(transparent)]
    Los(#[from] LosError),
    #[error(transparent)]
    Observe(#[from] ObserveError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Output(#[from] OutputError),
}
