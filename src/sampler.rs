//! The Del Moral (2012) adaptive SMC loop.
//!
//! The driver owns the particle matrix and its distance rows. Each epoch it
//! adapts the tolerance by golden-section search against an effective sample
//! size target, reweights, resamples when the particle cloud degenerates,
//! and rejuvenates particles with a Metropolis-Hastings step over batches of
//! Gaussian proposals evaluated on the worker pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use faer::{Col, Mat};
use log::{debug, info, warn};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use thiserror::Error;

use crate::config::ModelConfig;
use crate::kernel::{calc_weights, ess, solve_epsilon, KernelError};
use crate::pool::{PoolError, WorkerPool};
use crate::prior::Prior;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SamplerError {
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("disparate simulation batch size ({batch_size}) and particle count ({n_sample}) are not supported")]
    DisparateBatchSize { n_sample: usize, batch_size: usize },
    #[error("parameter matrix has {got} columns but the model has {expected} parameters")]
    ParamDimension { got: usize, expected: usize },
}

/// Internal state handed back by the SMC loop.
pub(crate) struct SmcState {
    pub params: Mat<f64>,
    pub distances: Mat<f64>,
    pub weights: Col<f64>,
    pub eps_history: Vec<f64>,
    pub current_eps: f64,
    pub completed_epochs: usize,
}

/// True when a distance row clears the tolerance: its smallest replicate
/// distance is below `eps` and nonnegative. Sentinel rows from rejected
/// parameter vectors are negative and therefore fail every tolerance.
pub(crate) fn row_passes(distances: &Mat<f64>, row: usize, eps: f64) -> bool {
    let mut min = f64::INFINITY;
    for j in 0..distances.ncols() {
        min = min.min(distances[(row, j)]);
    }
    min >= 0.0 && min < eps
}

/// Number of replicates in a row inside `[0, eps)`.
fn tolerance_count(distances: &Mat<f64>, row: usize, eps: f64) -> u64 {
    let mut count = 0;
    for j in 0..distances.ncols() {
        let d = distances[(row, j)];
        if d >= 0.0 && d < eps {
            count += 1;
        }
    }
    count
}

/// Columnwise standard deviation with an n - 1 denominator, used as the
/// per-dimension proposal scale.
fn column_sd(params: &Mat<f64>) -> Vec<f64> {
    let n = params.nrows() as f64;
    (0..params.ncols())
        .map(|j| {
            let mut sum = 0.0;
            for i in 0..params.nrows() {
                sum += params[(i, j)];
            }
            let mean = sum / n;
            let mut ss = 0.0;
            for i in 0..params.nrows() {
                let centered = params[(i, j)] - mean;
                ss += centered * centered;
            }
            (ss / (n - 1.0)).sqrt()
        })
        .collect()
}

fn matrix_min_max(values: &Mat<f64>) -> (f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for j in 0..values.ncols() {
        for i in 0..values.nrows() {
            min = min.min(values[(i, j)]);
            max = max.max(values[(i, j)]);
        }
    }
    (min, max)
}

fn copy_row(dst: &mut Mat<f64>, dst_row: usize, src: &Mat<f64>, src_row: usize) {
    for j in 0..src.ncols() {
        dst[(dst_row, j)] = src[(src_row, j)];
    }
}

fn extract_row(params: &Mat<f64>, row: usize) -> Vec<f64> {
    (0..params.ncols()).map(|j| params[(row, j)]).collect()
}

/// Inverse-CDF multinomial resampling: draw n row indices against the
/// cumulative weights and copy the selected particle and distance rows.
fn resample<R: Rng + ?Sized>(
    params: &Mat<f64>,
    distances: &Mat<f64>,
    weights: &Col<f64>,
    rng: &mut R,
) -> (Mat<f64>, Mat<f64>) {
    let n = params.nrows();
    let mut cumulative = vec![0.0; n];
    let mut running = 0.0;
    for i in 0..n {
        running += weights[i];
        cumulative[i] = running;
    }
    let mut new_params = Mat::zeros(n, params.ncols());
    let mut new_distances = Mat::zeros(n, distances.ncols());
    for i in 0..n {
        let draw: f64 = rng.random();
        let mut pick = n - 1;
        for (j, bound) in cumulative.iter().enumerate() {
            if draw <= *bound {
                pick = j;
                break;
            }
        }
        copy_row(&mut new_params, i, params, pick);
        copy_row(&mut new_distances, i, distances, pick);
    }
    (new_params, new_distances)
}

/// Add Gaussian perturbation noise to every entry of `base`, with standard
/// deviation `2 * tau_j` per column. The proposal kernel is symmetric, so
/// the Metropolis ratio needs no proposal-density correction.
fn perturb<R: Rng + ?Sized>(base: &Mat<f64>, tau: &[f64], rng: &mut R) -> Mat<f64> {
    let mut proposal = base.clone();
    for (j, tau_j) in tau.iter().enumerate() {
        let noise = Normal::new(0.0, 2.0 * tau_j).expect("proposal scale is nonnegative");
        for i in 0..base.nrows() {
            proposal[(i, j)] += noise.sample(rng);
        }
    }
    proposal
}

/// Run the adaptive SMC sampler and return the final particle system.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_smc<R: Rng + ?Sized>(
    config: &Arc<ModelConfig>,
    prior: &Prior,
    pool: &mut WorkerPool,
    rng: &mut R,
    interrupt: &AtomicBool,
    n_sample: usize,
    verbose: u8,
) -> Result<SmcState, SamplerError> {
    let n = n_sample;
    if n != config.control.batch_size {
        return Err(SamplerError::DisparateBatchSize {
            n_sample: n,
            batch_size: config.control.batch_size,
        });
    }

    if verbose > 1 {
        info!("starting sampler: {} epochs requested", config.control.epochs);
    }
    debug!("generating starting parameters from prior");
    let mut params = prior.sample_matrix(n, rng);
    let (mut distances, _) = pool.run_matrix(&params, false)?;

    let mut weights = Col::from_fn(n, |_| 1.0 / n as f64);
    let mut e0 = f64::INFINITY;
    let mut e1 = f64::INFINITY;
    let mut eps_history = Vec::with_capacity(config.control.epochs);
    let mut completed_epochs = 0;

    for iteration in 0..config.control.epochs {
        if interrupt.load(Ordering::Relaxed) {
            info!("interrupt requested, returning after {completed_epochs} epochs");
            break;
        }
        if verbose > 0 {
            info!("iteration {iteration}, e0: {e0}");
        }

        let tau = column_sd(&params);

        let (d_min, d_max) = matrix_min_max(&distances);
        e1 = solve_epsilon(
            d_min + 1.0,
            d_max,
            e0,
            config.control.shrinkage,
            &distances,
            &weights,
        )?;
        weights = calc_weights(e1, e0, &distances, &weights)?;
        if verbose > 2 {
            debug!("   e1 = {e1}, ESS = {}", ess(&weights));
        }

        if ess(&weights) < n as f64 {
            let (resampled_params, resampled_distances) =
                resample(&params, &distances, &weights, rng);
            params = resampled_params;
            distances = resampled_distances;
            for i in 0..n {
                weights[i] = 1.0 / n as f64;
            }
        } else {
            info!("not resampling, ESS sufficient");
        }

        // MCMC rejuvenation: all proposal batches perturb the post-resample
        // particle set, and acceptances fill candidate slots in order.
        let base = params.clone();
        let mut candidate_params = params.clone();
        let mut candidate_distances = distances.clone();
        let mut last_proposal = params.clone();
        let mut last_results = distances.clone();
        let mut filled = 0;
        let mut batches = 0;
        while filled < n && batches < config.control.max_batches {
            let proposal = perturb(&base, &tau, rng);
            let (results, _) = pool.run_matrix(&proposal, false)?;
            for i in 0..n {
                if filled == n {
                    break;
                }
                if row_passes(&results, i, e1) {
                    copy_row(&mut candidate_params, filled, &proposal, i);
                    copy_row(&mut candidate_distances, filled, &results, i);
                    filled += 1;
                }
            }
            if filled < n && verbose > 1 {
                info!("  batch {batches}, {filled}/{n} accepted");
            }
            last_proposal = proposal;
            last_results = results;
            batches += 1;
        }
        if filled < n {
            // Out of batches: the remaining slots take rows from the last
            // proposal batch even though they missed the tolerance.
            warn!(
                "  {filled}/{n} acceptances in {batches} batches, \
                 filling remaining slots from the last proposal batch"
            );
            for i in filled..n {
                copy_row(&mut candidate_params, i, &last_proposal, i);
                copy_row(&mut candidate_distances, i, &last_results, i);
            }
        }

        let mut accepted = 0_usize;
        let mut nan_ratios = 0_usize;
        for i in 0..n {
            let prior_new = prior.eval(&extract_row(&candidate_params, i));
            let prior_cur = prior.eval(&extract_row(&params, i));
            let numerator = tolerance_count(&candidate_distances, i, e1) as f64 * prior_new;
            let denominator = tolerance_count(&distances, i, e1) as f64 * prior_cur;
            let ratio = numerator / denominator;
            let draw: f64 = rng.random();
            if ratio.is_nan() {
                nan_ratios += 1;
            } else if draw <= ratio {
                accepted += 1;
                copy_row(&mut params, i, &candidate_params, i);
                copy_row(&mut distances, i, &candidate_distances, i);
            }
        }
        if accepted == 0 {
            warn!("sampler collapsed: no particles accepted in the MCMC step");
        }
        if verbose > 2 {
            debug!("    MCMC step complete, {accepted} accepted, {nan_ratios} NaN ratios");
        }

        e0 = e1;
        eps_history.push(e1);
        completed_epochs = iteration + 1;
    }

    Ok(SmcState {
        params,
        distances,
        weights,
        eps_history,
        current_eps: e1,
        completed_epochs,
    })
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::simulate::INVALID_PARAMS_DISTANCE;

    #[test]
    fn sentinel_rows_fail_every_tolerance() {
        let distances = Mat::from_fn(2, 4, |i, _| {
            if i == 0 {
                INVALID_PARAMS_DISTANCE
            } else {
                0.5
            }
        });
        assert!(!row_passes(&distances, 0, 1.0));
        assert!(!row_passes(&distances, 0, f64::MAX));
        assert!(row_passes(&distances, 1, 1.0));
        assert!(!row_passes(&distances, 1, 0.5));
        assert_eq!(tolerance_count(&distances, 0, f64::MAX), 0);
        assert_eq!(tolerance_count(&distances, 1, 1.0), 4);
    }

    #[test]
    fn degenerate_weights_resample_to_a_single_particle() {
        let params = Mat::from_fn(5, 2, |i, j| (i * 2 + j) as f64);
        let distances = Mat::from_fn(5, 3, |i, _| i as f64);
        let weights = Col::from_fn(5, |i| if i == 1 { 1.0 } else { 0.0 });
        let mut rng = StdRng::seed_from_u64(10);
        let (new_params, new_distances) = resample(&params, &distances, &weights, &mut rng);
        for i in 0..5 {
            for j in 0..2 {
                assert_eq!(new_params[(i, j)], params[(1, j)]);
            }
            for j in 0..3 {
                assert_eq!(new_distances[(i, j)], distances[(1, j)]);
            }
        }
    }

    #[test]
    fn resampling_frequencies_follow_the_weights() {
        // Chi-squared goodness of fit against the weight vector at
        // significance 0.01 (df = 3).
        let params = Mat::from_fn(4, 1, |i, _| i as f64);
        let distances = Mat::zeros(4, 1);
        let weights = Col::from_fn(4, |i| [0.1, 0.2, 0.3, 0.4][i]);
        let mut rng = StdRng::seed_from_u64(2024);
        let mut counts = [0.0_f64; 4];
        let rounds = 2000;
        for _ in 0..rounds {
            let (resampled, _) = resample(&params, &distances, &weights, &mut rng);
            for i in 0..4 {
                counts[resampled[(i, 0)] as usize] += 1.0;
            }
        }
        let total = (rounds * 4) as f64;
        let statistic: f64 = (0..4)
            .map(|i| {
                let expected = weights[i] * total;
                (counts[i] - expected).powi(2) / expected
            })
            .sum();
        // 0.99 quantile of chi-squared with 3 degrees of freedom.
        assert!(statistic < 11.345, "chi-squared statistic {statistic}");
    }

    #[test]
    fn perturbation_leaves_zero_variance_columns_alone() {
        let base = Mat::from_fn(6, 2, |i, _| i as f64);
        let tau = [0.0, 1.0];
        let mut rng = StdRng::seed_from_u64(5);
        let proposal = perturb(&base, &tau, &mut rng);
        for i in 0..6 {
            assert_eq!(proposal[(i, 0)], base[(i, 0)]);
        }
    }

    #[test]
    fn column_sd_matches_hand_computation() {
        let params = Mat::from_fn(4, 1, |i, _| [2.0, 4.0, 4.0, 6.0][i]);
        let sd = column_sd(&params);
        assert!((sd[0] - (8.0 / 3.0_f64).sqrt()).abs() < 1e-12);
    }
}
