//! The iterative-smoother update step.
//!
//! One outer iteration refines the ensemble `A` against the innovation
//! `D = d + E - Y` through the coefficient recursion
//!
//! ```text
//!   Omega  = I + W (I - 11'/N) / sqrt(N-1)
//!   S      = Y0 Omega^-1                  (average sensitivity)
//!   H      = D + S W                      (innovation)
//!   W      = (1-gamma) W + gamma S' (S S' + R)^-1 H
//!   A      = A0 (I + W / sqrt(N-1))
//! ```
//!
//! with the middle inverse formed by one of four schemes ([`Inversion`]).
//! All observation-space quantities are first brought to canonical scale by
//! dividing each row by the corresponding observation standard deviation.

use std::fs::{File, OpenOptions};
use std::io::Write;

use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::ies::IesError;
use crate::ies::config::{IesConfig, Inversion};
use crate::ies::data::IesData;
use crate::ies::linalg::{CholeskySolve, LuSolve, SymEig, ThinSvd};

/// Singular values this far below the largest one are discarded regardless of
/// the energy quota.
const SINGULAR_FLOOR: f64 = 1e-12;

/// Draws observation perturbations `E` for a diagonal error covariance given
/// the per-observation standard deviations. Columns are independent samples
/// of `N(0, R)`.
pub fn sample_perturbations<R: Rng + ?Sized>(
    rng: &mut R,
    obs_std: &Array1<f64>,
    ens_size: usize,
) -> Array2<f64> {
    Array2::from_shape_fn((obs_std.len(), ens_size), |(i, _)| {
        let z: f64 = StandardNormal.sample(rng);
        obs_std[i] * z
    })
}

/// Subtracts from every row its mean: `M <- M (I - 11'/N)`.
fn subtract_row_mean(m: &mut Array2<f64>) {
    if let Some(means) = m.mean_axis(Axis(1)) {
        for (mut row, &mean) in m.axis_iter_mut(Axis(0)).zip(means.iter()) {
            row.mapv_inplace(|x| x - mean);
        }
    }
}

/// Divides each row of `m` by the matching observation standard deviation.
fn scale_rows(m: &mut Array2<f64>, inv_std: &Array1<f64>) {
    Zip::from(m.axis_iter_mut(Axis(0)))
        .and(inv_std)
        .par_for_each(|mut row, &scale| row.mapv_inplace(|x| x * scale));
}

fn shape_err(what: &str, got: (usize, usize), want: (usize, usize)) -> IesError {
    IesError::ShapeMismatch(format!("{what}: got {got:?}, expected {want:?}"))
}

/// Truncated SVD of the sensitivity matrix: returns the retained left
/// singular vectors and the inverted retained singular values, or `None`
/// when the spectrum collapses entirely.
fn truncated_svd_inverse(
    s: &Array2<f64>,
    truncation: f64,
    rank_cap: Option<usize>,
) -> Result<Option<(Array2<f64>, Array1<f64>)>, IesError> {
    let (u, sig, _) = s.thin_svd()?;
    let sig_max = sig.iter().cloned().fold(0.0_f64, f64::max);
    if sig_max <= 0.0 {
        return Ok(None);
    }

    let total_energy: f64 = sig.iter().map(|x| x * x).sum();
    let mut rank = 0;
    let mut energy = 0.0;
    for &value in sig.iter() {
        if value < SINGULAR_FLOOR * sig_max {
            break;
        }
        rank += 1;
        energy += value * value;
        if energy / total_energy >= truncation {
            break;
        }
    }
    if let Some(cap) = rank_cap {
        rank = rank.min(cap);
    }
    if rank == 0 {
        return Ok(None);
    }

    let u0 = u.slice(ndarray::s![.., ..rank]).to_owned();
    let sig_inv = Array1::from_iter(sig.iter().take(rank).map(|&x| 1.0 / x));
    Ok(Some((u0, sig_inv)))
}

/// Low-rank factorization of `(S S' + C)^-1 ~= X1 diag(eig) X1'` for an
/// explicitly given (scaled) error covariance `C`.
fn lowrank_cov_inverse(
    s: &Array2<f64>,
    cov: &Array2<f64>,
    truncation: f64,
    rank_cap: Option<usize>,
) -> Result<Option<(Array2<f64>, Array1<f64>)>, IesError> {
    let Some((u0, sig_inv)) = truncated_svd_inverse(s, truncation, rank_cap)? else {
        return Ok(None);
    };
    let rank = sig_inv.len();

    // B = Sig^-1 U0' C U0 Sig^-1, the covariance rotated into the retained
    // subspace and whitened by the singular values.
    let rotated = u0.t().dot(cov).dot(&u0);
    let mut b = Array2::zeros((rank, rank));
    for i in 0..rank {
        for j in 0..rank {
            b[(i, j)] = sig_inv[i] * rotated[(i, j)] * sig_inv[j];
        }
    }

    let (lambda, z) = b.sym_eig()?;
    let eig = lambda.mapv(|l| 1.0 / (1.0 + l.max(0.0)));

    // X1 = U0 Sig^-1 Z
    let mut u0_scaled = u0;
    for (j, &inv) in sig_inv.iter().enumerate() {
        u0_scaled.column_mut(j).mapv_inplace(|x| x * inv);
    }
    Ok(Some((u0_scaled.dot(&z), eig)))
}

/// Reduced-form factorization using a second SVD of the scaled perturbations
/// rotated into the retained subspace; avoids forming any covariance product.
fn lowrank_perturbation_inverse(
    s: &Array2<f64>,
    e_scaled: &Array2<f64>,
    truncation: f64,
    rank_cap: Option<usize>,
) -> Result<Option<(Array2<f64>, Array1<f64>)>, IesError> {
    let Some((u0, sig_inv)) = truncated_svd_inverse(s, truncation, rank_cap)? else {
        return Ok(None);
    };

    // X0 = Sig^-1 U0' E
    let mut x0 = u0.t().dot(e_scaled);
    for (i, &inv) in sig_inv.iter().enumerate() {
        x0.row_mut(i).mapv_inplace(|x| x * inv);
    }
    let (u1, sig1, _) = x0.thin_svd()?;
    let eig = sig1.mapv(|s1| 1.0 / (1.0 + s1 * s1));

    let mut u0_scaled = u0;
    for (j, &inv) in sig_inv.iter().enumerate() {
        u0_scaled.column_mut(j).mapv_inplace(|x| x * inv);
    }
    Ok(Some((u0_scaled.dot(&u1), eig)))
}

/// `X3 = X1 diag(eig) X1' H`
fn apply_lowrank_inverse(x1: &Array2<f64>, eig: &Array1<f64>, h: &Array2<f64>) -> Array2<f64> {
    let mut inner = x1.t().dot(h);
    for (i, &factor) in eig.iter().enumerate() {
        inner.row_mut(i).mapv_inplace(|x| x * factor);
    }
    x1.dot(&inner)
}

/// Builds the ensemble transition matrix `X` for one smoother step and
/// advances the coefficient matrix `w0` in place.
///
/// `s`, `e`, `d` are the active `obs x ens` matrices, `r` the active error
/// covariance, `a` the current state ensemble (consulted only for the
/// optional anomaly projection). Returns `Ok(None)` when the retained
/// singular spectrum is empty, in which case `w0` is left untouched and the
/// caller should keep the ensemble unchanged.
#[allow(clippy::too_many_arguments)]
pub fn make_transition(
    a: ArrayView2<'_, f64>,
    s: &Array2<f64>,
    r: &Array2<f64>,
    e: &Array2<f64>,
    d: &Array2<f64>,
    inversion: Inversion,
    truncation: f64,
    rank_cap: Option<usize>,
    projection: bool,
    w0: &mut Array2<f64>,
    steplength: f64,
) -> Result<Option<Array2<f64>>, IesError> {
    let (nrobs, ens_size) = s.dim();
    if ens_size < 2 {
        return Err(IesError::ShapeMismatch(format!(
            "ensemble update needs at least two members, got {ens_size}"
        )));
    }
    if nrobs == 0 {
        return Ok(None);
    }
    if e.dim() != (nrobs, ens_size) {
        return Err(shape_err("perturbations E", e.dim(), (nrobs, ens_size)));
    }
    if d.dim() != (nrobs, ens_size) {
        return Err(shape_err("innovations D", d.dim(), (nrobs, ens_size)));
    }
    if r.dim() != (nrobs, nrobs) {
        return Err(shape_err("error covariance R", r.dim(), (nrobs, nrobs)));
    }
    if w0.dim() != (ens_size, ens_size) {
        return Err(shape_err("coefficients W", w0.dim(), (ens_size, ens_size)));
    }
    if a.ncols() != ens_size {
        return Err(shape_err("ensemble A", a.dim(), (a.nrows(), ens_size)));
    }

    let nsc = 1.0 / ((ens_size - 1) as f64).sqrt();

    // Canonical scaling: divide observation-space rows by the observation
    // standard deviations and turn R into the matching correlation matrix.
    let mut inv_std = Array1::zeros(nrobs);
    for i in 0..nrobs {
        let variance = r[(i, i)];
        if variance <= 0.0 {
            return Err(IesError::InvalidObservationVariance {
                index: i,
                variance,
            });
        }
        inv_std[i] = 1.0 / variance.sqrt();
    }
    let mut y0 = s.clone();
    let mut e_sc = e.clone();
    let mut d_sc = d.clone();
    scale_rows(&mut y0, &inv_std);
    scale_rows(&mut e_sc, &inv_std);
    scale_rows(&mut d_sc, &inv_std);
    let r_sc = Array2::from_shape_fn((nrobs, nrobs), |(i, j)| r[(i, j)] * inv_std[i] * inv_std[j]);

    // Predicted anomalies.
    subtract_row_mean(&mut y0);
    y0 *= nsc;

    // Optional projection of the innovation onto the span of the state
    // anomalies; meaningful only when the ensemble is under-determined in
    // state space, and skipped for the reduced subspace scheme which handles
    // the deficiency internally.
    if projection && a.nrows() < ens_size && inversion != Inversion::SubspaceRe {
        let mut anomalies = a.to_owned();
        subtract_row_mean(&mut anomalies);
        let (_, sig, vt) = anomalies.thin_svd()?;
        let sig_max = sig.iter().cloned().fold(0.0_f64, f64::max);
        if sig_max > 0.0 {
            let rank = sig
                .iter()
                .take_while(|&&x| x >= SINGULAR_FLOOR * sig_max)
                .count();
            let vt_active = vt.slice(ndarray::s![..rank, ..]);
            let projector = vt_active.t().dot(&vt_active);
            y0 = y0.dot(&projector);
            d_sc = d_sc.dot(&projector);
        }
    }

    // Omega = I + W (I - 11'/N) / sqrt(N-1), then solve Omega' S' = Y0' for
    // the average sensitivity S.
    let mut w_centered = w0.clone();
    subtract_row_mean(&mut w_centered);
    let mut omega = Array2::eye(ens_size);
    omega.scaled_add(nsc, &w_centered);
    let sens = omega.t().lu_solve(&y0.t()).t().to_owned();

    // Innovation seen from the current coefficients.
    let h = &d_sc + &sens.dot(w0);

    let gamma = steplength;
    let w_new = match inversion {
        Inversion::Exact => {
            // Covariance of the corrected sensitivity, the same operand the
            // subspace schemes factor; equals Y0 Y0' + R~ at the first
            // iteration where Omega = I.
            let c = sens.dot(&sens.t()) + &r_sc;
            let x3 = c.cholesky_solve(&h)?;
            w0.mapv(|x| x * (1.0 - gamma)) + sens.t().dot(&x3).mapv(|x| x * gamma)
        }
        Inversion::SubspaceExactR
        | Inversion::SubspaceEeR
        | Inversion::SubspaceRe => {
            let factor = match inversion {
                Inversion::SubspaceExactR => {
                    lowrank_cov_inverse(&sens, &r_sc, truncation, rank_cap)?
                }
                Inversion::SubspaceEeR => {
                    let cov = e_sc.dot(&e_sc.t()).mapv(|x| x * nsc * nsc);
                    lowrank_cov_inverse(&sens, &cov, truncation, rank_cap)?
                }
                Inversion::SubspaceRe => {
                    let e_scaled = e_sc.mapv(|x| x * nsc);
                    lowrank_perturbation_inverse(&sens, &e_scaled, truncation, rank_cap)?
                }
                Inversion::Exact => unreachable!(),
            };
            let Some((x1, eig)) = factor else {
                return Ok(None);
            };
            let x3 = apply_lowrank_inverse(&x1, &eig, &h);
            w0.mapv(|x| x * (1.0 - gamma)) + sens.t().dot(&x3).mapv(|x| x * gamma)
        }
    };

    let mut x = Array2::eye(ens_size);
    x.scaled_add(nsc, &w_new);
    *w0 = w_new;
    Ok(Some(x))
}

/// The classical (non-iterative) transform: the transition matrix for zero
/// initial coefficients and a unit step length, i.e. the stochastic-EnKF
/// update `A <- A X`. Equivalent to one call of [`make_transition`] with a
/// fresh coefficient matrix.
pub fn initial_transition(
    s: &Array2<f64>,
    r: &Array2<f64>,
    e: &Array2<f64>,
    d: &Array2<f64>,
    inversion: Inversion,
    truncation: f64,
    rank_cap: Option<usize>,
) -> Result<Option<Array2<f64>>, IesError> {
    let ens_size = s.ncols();
    let mut w0 = Array2::zeros((ens_size, ens_size));
    // The ensemble itself is only consulted by the projection branch, which
    // the classical update never takes.
    let a = Array2::zeros((0, ens_size));
    make_transition(
        a.view(),
        s,
        r,
        e,
        d,
        inversion,
        truncation,
        rank_cap,
        false,
        &mut w0,
        1.0,
    )
}

/// One full smoother step: reconciled bookkeeping, coefficient recursion and
/// the final ensemble transform `A <- A0 X`.
///
/// Preconditions: [`IesData::init_update`] has been called with the masks of
/// this iteration, `a` is `state x active_ens`, `s`/`e`/`d` are
/// `active_obs x active_ens` and `r` is `active_obs x active_obs`. On the
/// first call the prior ensemble and the observation perturbations are
/// captured; later calls reuse the stored values so the perturbations stay
/// fixed over the whole assimilation.
pub fn update_ensemble(
    config: &IesConfig,
    data: &mut IesData,
    a: &mut Array2<f64>,
    s: &Array2<f64>,
    r: &Array2<f64>,
    e: &Array2<f64>,
    d: &Array2<f64>,
) -> Result<(), IesError> {
    config.validate()?;
    if data.ens_mask().is_none() || data.obs_mask().is_none() {
        return Err(IesError::NotInitialized(
            "init_update must run before update_ensemble",
        ));
    }

    let ens_size = a.ncols();
    let nrobs = s.nrows();
    if ens_size != data.active_ens_count() {
        return Err(IesError::ShapeMismatch(format!(
            "ensemble has {ens_size} columns but the mask activates {}",
            data.active_ens_count()
        )));
    }
    if nrobs != data.active_obs_count() {
        return Err(IesError::ShapeMismatch(format!(
            "predictions have {nrobs} rows but the mask activates {}",
            data.active_obs_count()
        )));
    }

    let iteration_nr = data.advance_iteration();
    let steplength = config.steplength(iteration_nr);

    if ens_size <= 1 {
        log::debug!("single active realization; smoother step {iteration_nr} is a no-op");
        return Ok(());
    }
    if nrobs == 0 {
        log::debug!("no active observations; smoother step {iteration_nr} leaves A unchanged");
        return Ok(());
    }

    data.update_state_size(a.nrows());
    data.store_initial_prior(a);
    data.store_initial_perturbations(e);
    data.augment_initial_perturbations(e);
    data.allocate_coefficients();

    // The perturbations must stay identical across iterations: swap the
    // freshly sampled ones inside D for the stored initial ones.
    let e_stored = data
        .active_perturbations()
        .ok_or(IesError::NotInitialized("stored perturbations missing"))?;
    let d_used = d + &(&e_stored - e);

    let mut w_active = data
        .active_coefficients()
        .ok_or(IesError::NotInitialized("coefficient matrix missing"))?;

    let transition = make_transition(
        a.view(),
        s,
        r,
        &e_stored,
        &d_used,
        config.inversion,
        config.truncation,
        config.rank_cap,
        config.projection,
        &mut w_active,
        steplength,
    )?;

    match transition {
        Some(x) => {
            data.store_active_coefficients(&w_active);
            let a0 = data
                .stored_prior()
                .ok_or(IesError::NotInitialized("stored prior missing"))?;
            *a = a0.dot(&x);
            log::info!(
                "smoother step {iteration_nr}: steplength {steplength:.4}, {nrobs} observations, \
                 {ens_size} realizations"
            );
        }
        None => {
            log::warn!(
                "smoother step {iteration_nr}: retained singular spectrum is empty, \
                 ensemble left unchanged"
            );
        }
    }

    write_iteration_log(config, data, steplength, nrobs, ens_size)?;
    Ok(())
}

fn write_iteration_log(
    config: &IesConfig,
    data: &IesData,
    steplength: f64,
    nrobs: usize,
    ens_size: usize,
) -> Result<(), IesError> {
    let Some(path) = &config.log_path else {
        return Ok(());
    };
    let mut file = if data.iteration_nr() <= 1 {
        File::create(path)?
    } else {
        OpenOptions::new().append(true).create(true).open(path)?
    };
    writeln!(
        file,
        "iteration {:>3}  steplength {:.6}  active_obs {:>5}  active_ens {:>4}",
        data.iteration_nr(),
        steplength,
        nrobs,
        ens_size
    )?;
    Ok(())
}
