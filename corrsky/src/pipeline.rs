//! End-to-end pipeline orchestration.
//!
//! Mirrors the stage sequence of the design: load fields and spectra,
//! filter, transform to auxiliary Gaussian spectra, assemble / validate /
//! regularise the covariance stack, Cholesky-factor it, draw correlated
//! aℓm, synthesise and transform maps, then the optional products (LOS
//! convergence, recovered spectra, shear, observed counts, catalogue).
//! After each optional output the `EXIT_AT` key may stop the run; that is
//! a success, reported through [`RunOutcome::early_exit`].

use std::path::Path;

use ndarray::Array2;

use skypix::{analyze, Alm, DiscreteLegendre, Pixelisation};

use crate::catalog::{self, ShearMapSet};
use crate::config::{Config, Distribution};
use crate::covariance;
use crate::diag::Diagnostics;
use crate::draw::{self, RngPool};
use crate::error::PipelineError;
use crate::fields::{FieldRegistry, FieldType};
use crate::los;
use crate::maps as maps_mod;
use crate::observe::{self, SelectionFunction};
use crate::output;
use crate::regularize;
use crate::shear as shear_mod;
use crate::spectra::{self, filters, lognormal, SpectrumError};

/// How a successful run ended.
#[derive(Debug)]
pub struct RunOutcome {
    pub warnings: usize,
    /// `Some(stage)` when `EXIT_AT` stopped the pipeline early.
    pub early_exit: Option<String>,
}

/// Run the full pipeline for one realisation.
pub fn run(cfg: &Config, diag: &Diagnostics) -> Result<RunOutcome, PipelineError> {
    let n_workers = rayon::current_num_threads();
    cfg.validate_parallel(n_workers)?;
    tracing::info!("running with {n_workers} worker threads");

    let pix = Pixelisation::new(cfg.nside)?;
    let mut registry = FieldRegistry::load(&cfg.fields_info, cfg.dist)?;
    tracing::info!(
        "field registry: {} fields, Nf = {}, Nz = {}",
        registry.n_fields(),
        registry.n_fs(),
        registry.n_zs()
    );
    let mut pool = RngPool::new(cfg.rndseed, n_workers);

    macro_rules! exit_if {
        ($stage:literal) => {
            if cfg.exit_after($stage) {
                tracing::info!(concat!("EXIT_AT ", $stage, " reached, stopping"));
                return Ok(RunOutcome {
                    warnings: diag.warnings(),
                    early_exit: Some($stage.to_string()),
                });
            }
        };
    }

    let mut aux_alms: Option<Vec<Alm>> = None;
    let mut maps: Array2<f64>;

    if cfg.dist == Distribution::Homogeneous {
        tracing::info!("HOMOGENEOUS realisations: filling maps with mean values");
        maps = Array2::from_shape_fn((registry.n_fields(), pix.npix()), |(i, _)| {
            registry.get(i).mean
        });
    } else {
        // Spectra: load, filter, transform.
        let mut set = spectra::load_spectra(&cfg.cl_prefix, &mut registry, diag)?;
        filters::apply_all(&mut set, cfg, diag)?;
        if let Some(dest) = &cfg.outputs.smooth_cl_prefix {
            write_native_spectra(dest, &set, &registry, diag)?;
            tracing::info!("filtered C(l)s written to {dest}");
        }
        exit_if!("SMOOTH_CL_PREFIX");

        let mut lastl = set.common_band_limit();
        tracing::info!("maximum l described by all input C(l)s: {lastl}");
        if cfg.lmax > lastl {
            return Err(SpectrumError::BandLimitTooLow {
                lmax: cfg.lmax,
                lastl,
            }
            .into());
        }
        if cfg.crop_cl {
            lastl = cfg.lmax;
        }
        tracing::info!("maximum l used in the transformation: {lastl}");

        let mut dlt = None;
        let grid = if cfg.dist == Distribution::Lognormal {
            tracing::info!("LOGNORMAL realisations: computing auxiliary Gaussian C(l)s");
            let transform = DiscreteLegendre::new(lastl);
            let (grid, intermediates) = lognormal::build_gaussian_aux_grid(
                &set,
                &registry,
                &transform,
                cfg.extrap_dipole,
                cfg.outputs.xiout_prefix.is_some(),
                cfg.outputs.gxiout_prefix.is_some(),
                diag,
            )?;
            let thetas_deg: Vec<f64> =
                transform.thetas().iter().map(|t| t.to_degrees()).collect();
            if let Some(prefix) = &cfg.outputs.xiout_prefix {
                output::write_pair_tables(prefix, &registry, &thetas_deg, &intermediates.xi)?;
                tracing::info!("correlation functions written to prefix {prefix}");
            }
            if let Some(prefix) = &cfg.outputs.gxiout_prefix {
                output::write_pair_tables(prefix, &registry, &thetas_deg, &intermediates.gxi)?;
                tracing::info!("Gaussian correlation functions written to prefix {prefix}");
            }
            dlt = Some(transform);
            grid
        } else {
            lognormal::build_resampled_grid(&set, lastl, cfg.extrap_dipole)?
        };
        drop(set);
        exit_if!("XIOUT_PREFIX");
        exit_if!("GXIOUT_PREFIX");

        if let Some(dest) = &cfg.outputs.gclout_prefix {
            let ells: Vec<f64> = (0..=lastl).map(|l| l as f64).collect();
            let entries: Vec<(usize, usize, Vec<f64>)> = grid
                .iter_set()
                .map(|(i, j, cl)| (i, j, cl.to_vec()))
                .collect();
            output::write_cl_bundle(dest, &registry, &ells, &entries)?;
            tracing::info!("auxiliary Gaussian C(l)s written to {dest}");
        }
        exit_if!("GCLOUT_PREFIX");

        // Covariance stack: assemble, validate, regularise.
        let mut stack = covariance::assemble(&grid, cfg.allow_miss_cl, diag)?;
        if let Some(prefix) = &cfg.outputs.covl_prefix {
            output::write_matrix_stack(prefix, &stack, 0, lastl)?;
            tracing::info!("cov. matrices written to prefix {prefix}");
        }
        exit_if!("COVL_PREFIX");

        covariance::validate(
            &mut stack,
            cfg.lmin,
            cfg.lmax,
            cfg.badcorr_frac,
            cfg.mindiag_frac,
            diag,
        );

        // Regularised output spectra need the whole band regularised.
        let (lstart, lend) =
            if cfg.dist == Distribution::Lognormal && cfg.outputs.reg_cl_prefix.is_some() {
                (1, lastl)
            } else {
                (cfg.lmin, cfg.lmax)
            };
        let summary =
            regularize::regularize_stack(&mut stack, lstart, lend, cfg.reg_maxsteps, diag)?;
        tracing::info!(
            "max. fractional change from regularisation: {:e} at l={}",
            summary.max_change,
            summary.at_l
        );
        if let Some(prefix) = &cfg.outputs.reg_covl_prefix {
            output::write_matrix_stack(prefix, &stack, lstart, lend)?;
            tracing::info!("regularised cov. matrices written to prefix {prefix}");
        }
        exit_if!("REG_COVL_PREFIX");

        if let Some(dest) = &cfg.outputs.reg_cl_prefix {
            write_regularized_cls(dest, &stack, &registry, dlt.as_ref(), cfg)?;
            tracing::info!("regularised C(l)s written to {dest}");
        }
        exit_if!("REG_CL_PREFIX");

        // Cholesky and the harmonic draw.
        let chol = draw::cholesky_stack(&stack, cfg.lmin, cfg.lmax)?;
        drop(stack);
        if let Some(prefix) = &cfg.outputs.cholesky_prefix {
            output::write_cholesky(prefix, &chol)?;
            tracing::info!("mixing matrices written to prefix {prefix}");
        }
        exit_if!("CHOLESKY_PREFIX");

        tracing::info!("generating auxiliary Gaussian alm's");
        let alms = draw::draw_alms(&chol, registry.n_fields(), &mut pool);
        drop(chol);
        if let Some(path) = &cfg.outputs.auxalm_out {
            output::write_alm_table(Path::new(path), &alms, &registry, cfg.lmin, cfg.lmax)?;
            tracing::info!("auxiliary alm's written to {path}");
        }
        exit_if!("AUXALM_OUT");

        tracing::info!("generating maps from alm's");
        maps = maps_mod::synthesize_maps(&alms, &pix);
        aux_alms = Some(alms);
        if let Some(path) = &cfg.outputs.auxmap_out {
            output::write_map_table(Path::new(path), &maps, &registry, &pix)?;
            tracing::info!("auxiliary maps written to {path}");
        }
        exit_if!("AUXMAP_OUT");

        // Pixel-space distribution transform.
        match cfg.dist {
            Distribution::Lognormal => {
                tracing::info!("LOGNORMAL realisations: exponentiating pixels");
                for i in 0..registry.n_fields() {
                    let fi = registry.get(i).clone();
                    let mut row = maps.row_mut(i);
                    let values = row.as_slice_mut().expect("maps are row-contiguous");
                    maps_mod::exponentiate_lognormal(values, fi.mean, fi.shift);
                }
            }
            Distribution::Gaussian => {
                tracing::info!("GAUSSIAN realisations: adding mean values to pixels");
                for i in 0..registry.n_fields() {
                    let mean = registry.get(i).mean;
                    let mut row = maps.row_mut(i);
                    maps_mod::add_mean(
                        row.as_slice_mut().expect("maps are row-contiguous"),
                        mean,
                    );
                }
            }
            Distribution::Homogeneous => unreachable!("handled above"),
        }
    }

    // Optional density -> convergence integration (registry augmentation).
    if cfg.dens2kappa == 1 {
        tracing::info!("integrating densities along the line of sight");
        let cosmo = crate::cosmology::Cosmology::new(cfg.omega_m, cfg.omega_l, cfg.w_de);
        let outcome = los::integrate_density(&registry, &maps, &cosmo, diag)?;
        registry = outcome.registry;
        maps = outcome.maps;
        tracing::info!("appended {} integrated convergence fields", outcome.n_new);
        if let Some(dest) = &cfg.outputs.dens2kappa_stat {
            let table = maps_mod::stats_table(&maps, &registry, cfg.dist);
            if dest == "1" {
                tracing::info!("integrated density statistics:\n{table}");
            } else {
                std::fs::write(dest, table).map_err(|source| {
                    crate::output::OutputError::Io {
                        path: dest.clone(),
                        source,
                    }
                })?;
                tracing::info!("integrated density statistics written to {dest}");
            }
        }
    } else if cfg.dens2kappa != 0 {
        diag.warn("unknown DENS2KAPPA option: skipping density LoS integration");
    }
    exit_if!("DENS2KAPPA_STAT");

    if let Some(path) = &cfg.outputs.map_out {
        output::write_map_table(Path::new(path), &maps, &registry, &pix)?;
        tracing::info!("maps written to {path}");
    }
    exit_if!("MAP_OUT");

    // Recovered alm / Cl from the final maps.
    if cfg.outputs.recovalm_out.is_some() || cfg.outputs.recovcls_out.is_some() {
        let (lo, hi) = cfg.lrange_out_clamped(diag);
        let weights = ring_weights(cfg, diag);
        tracing::info!("recovering alm's from maps");
        let mut recovered = Vec::with_capacity(registry.n_fields());
        for i in 0..registry.n_fields() {
            let row = maps.row(i);
            let alm = analyze(
                row.as_slice().expect("maps are row-contiguous"),
                &pix,
                hi,
                weights.as_deref(),
            )?;
            recovered.push(alm);
        }
        if let Some(path) = &cfg.outputs.recovalm_out {
            output::write_alm_table(Path::new(path), &recovered, &registry, lo, hi)?;
            tracing::info!("recovered alm's written to {path}");
        }
        if let Some(path) = &cfg.outputs.recovcls_out {
            output::write_recovered_cls(
                Path::new(path),
                &recovered,
                &registry,
                lo,
                hi,
                cfg.mmax_out,
                diag,
            )?;
            tracing::info!("recovered C(l)s written to {path}");
        }
    }
    exit_if!("RECOVALM_OUT");
    exit_if!("RECOVCLS_OUT");

    // Shear from the convergence fields.
    let mut shear: ShearMapSet = vec![None; registry.n_fields()];
    if cfg.shear_requested() {
        let weights = ring_weights(cfg, diag);
        let mut noise_warned = false;
        for i in 0..registry.n_fields() {
            if registry.get(i).kind != FieldType::Convergence {
                continue;
            }
            tracing::info!("computing shear for {}", registry.get(i).label());

            let elm = if cfg.dist == Distribution::Homogeneous {
                Alm::new(cfg.lmax)
            } else if cfg.dist == Distribution::Gaussian
                && aux_alms.as_ref().is_some_and(|a| i < a.len())
            {
                // Gaussian convergence maps are linear in the draw, so
                // the auxiliary alm's can be reused directly.
                shear_mod::kappa_to_shear_emode(&aux_alms.as_ref().expect("checked above")[i])
            } else {
                if cfg.lmax > cfg.nside && !noise_warned {
                    diag.warn("LMAX > NSIDE introduces noise in the transformation");
                    noise_warned = true;
                }
                let row = maps.row(i);
                let klm = analyze(
                    row.as_slice().expect("maps are row-contiguous"),
                    &pix,
                    cfg.lmax,
                    weights.as_deref(),
                )?;
                shear_mod::kappa_to_shear_emode(&klm)
            };

            if let Some(prefix) = &cfg.outputs.shear_alm_prefix {
                let path = std::path::PathBuf::from(format!(
                    "{prefix}{}.dat",
                    registry.get(i).label()
                ));
                output::write_single_alm(&path, &elm, &registry.get(i).label(), 0, cfg.lmax)?;
            }
            shear[i] = Some(shear_mod::shear_maps(&elm, &pix));
        }
        if cfg.outputs.shear_alm_prefix.is_some() {
            tracing::info!(
                "shear E-mode alm's written to prefix {}",
                cfg.outputs.shear_alm_prefix.as_deref().unwrap_or("")
            );
        }
        exit_if!("SHEAR_ALM_PREFIX");

        if let Some(path) = &cfg.outputs.shear_map_out {
            let entries: Vec<(usize, &(Vec<f64>, Vec<f64>))> = shear
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
                .collect();
            output::write_shear_table(Path::new(path), &entries, &registry, &pix)?;
            tracing::info!("shear maps written to {path}");
        }
        exit_if!("SHEAR_MAP_OUT");
    }

    // Observables: selection function and count generation.
    let selection =
        SelectionFunction::load(cfg.selec_scale, cfg.selec_map.as_deref(), pix.npix())?;
    observe::apply_selection(
        &mut maps,
        &registry,
        &selection,
        cfg.poisson == 1,
        &pix,
        &mut pool,
    );
    if let Some(path) = &cfg.outputs.mapwer_out {
        output::write_map_table(Path::new(path), &maps, &registry, &pix)?;
        tracing::info!("observed maps written to {path}");
    }
    exit_if!("MAPWER_OUT");

    // Catalogue.
    if let Some(path) = &cfg.outputs.catalog_out {
        let columns = catalog::parse_columns(&cfg.catalog_cols, diag)?;
        let summary = catalog::write_catalog(
            Path::new(path),
            &maps,
            &registry,
            &shear,
            &pix,
            &columns,
            cfg.angular_coord,
            cfg.ellip_sigma,
            pool.serial(),
            diag,
        )?;
        tracing::info!("catalogue with {} sources written to {path}", summary.n_sources);
    }

    Ok(RunOutcome {
        warnings: diag.warnings(),
        early_exit: None,
    })
}

/// Load ring weights, falling back to uniform with a warning.
fn ring_weights(cfg: &Config, diag: &Diagnostics) -> Option<Vec<f64>> {
    let path = cfg.ring_weight_file.as_ref()?;
    match skypix::load_ring_weights(path, cfg.nside) {
        Ok(w) => Some(w),
        Err(e) => {
            diag.warn(format_args!("could not load ring weights ({e}), using 1.0 instead"));
            None
        }
    }
}

/// Write the filtered spectra on their native ℓ grids.
///
/// A `.dat` destination needs a shared grid across pairs (table layout);
/// when the grids differ the output falls back to per-pair files.
fn write_native_spectra(
    dest: &str,
    set: &spectra::SpectrumSet,
    registry: &FieldRegistry,
    diag: &Diagnostics,
) -> Result<(), PipelineError> {
    let entries: Vec<(usize, usize, Vec<f64>)> = set
        .iter_set()
        .map(|(i, j, s)| (i, j, s.cls.clone()))
        .collect();
    if dest.ends_with(".dat") {
        let mut grids = set.iter_set().map(|(_, _, s)| &s.ells);
        let first = grids.next().expect("at least one spectrum is loaded");
        if grids.all(|g| g == first) {
            output::write_cl_table(Path::new(dest), registry, first, &entries)?;
            return Ok(());
        }
        diag.warn("SMOOTH_CL_PREFIX table output needs a shared l grid, writing per-pair files");
    }
    for (i, j, cls) in &entries {
        let sample = set.get(*i, *j).expect("entry came from iter_set");
        output::write_xy(
            &output::pair_filename(dest, registry, *i, *j),
            &sample.ells,
            cls,
        )?;
    }
    Ok(())
}

/// Regularised spectra: map the regularised Gaussian Cℓ back through the
/// lognormal transform (identity in the Gaussian model) and write them.
fn write_regularized_cls(
    dest: &str,
    stack: &covariance::CovarianceStack,
    registry: &FieldRegistry,
    dlt: Option<&DiscreteLegendre>,
    cfg: &Config,
) -> Result<(), PipelineError> {
    let lastl = stack.lastl();
    let ells: Vec<f64> = (0..=lastl).map(|l| l as f64).collect();
    let n = registry.n_fields();
    let mut entries = Vec::with_capacity(n * (n + 1) / 2);
    for i in 0..n {
        for j in i..n {
            let mut cl = stack.pair_spectrum(i, j);
            if cfg.dist == Distribution::Lognormal {
                let dlt = dlt.expect("lognormal runs carry the transform");
                let mut xi = dlt.synthesize(&cl);
                let fi = registry.get(i);
                let fj = registry.get(j);
                lognormal::lognormalize_xi(
                    &mut xi,
                    (fi.mean + fi.shift) * (fj.mean + fj.shift),
                );
                cl = dlt.analyze(&xi);
            }
            entries.push((i, j, cl));
        }
    }
    output::write_cl_bundle(dest, registry, &ells, &entries)?;
    Ok(())
}
