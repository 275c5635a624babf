//! Importance-weight, effective-sample-size, and tolerance-solver
//! primitives for the adaptive SMC sampler.

use faer::{Col, Mat};
use log::error;
use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum KernelError {
    /// The weight normalizer came out non-finite. A diagnostic pass logging
    /// per-particle numerators, denominators, and partial sums has already
    /// run by the time this is returned.
    #[error("non-finite weights encountered while updating at eps {current} vs {previous}")]
    NonFiniteWeights { current: f64, previous: f64 },
}

/// Effective sample size of a probability vector: `1 / sum(w_i^2)`.
///
/// Lies in `[1, n]` whenever `w` is a valid probability vector.
pub fn ess(weights: &Col<f64>) -> f64 {
    let mut sum_sq = 0.0;
    for i in 0..weights.nrows() {
        sum_sq += weights[i] * weights[i];
    }
    sum_sq.recip()
}

fn indicator_counts(distances: &Mat<f64>, row: usize, eps_cur: f64, eps_prev: f64) -> (u64, u64) {
    let mut num = 0;
    let mut den = 0;
    for j in 0..distances.ncols() {
        if distances[(row, j)] < eps_cur {
            num += 1;
        }
        if distances[(row, j)] < eps_prev {
            den += 1;
        }
    }
    (num, den)
}

/// Importance-weight update for a tolerance shrink from `eps_prev` to
/// `eps_cur`.
///
/// Each particle's previous weight is rescaled by the ratio of replicate
/// counts inside the new and old tolerance; the result is normalized to sum
/// to one. A `0/0` ratio contributes zero. If the normalizer is non-finite
/// (a positive count over a zero count, or propagated NaN), the computation
/// is rerun with per-particle logging and fails.
pub fn calc_weights(
    eps_cur: f64,
    eps_prev: f64,
    distances: &Mat<f64>,
    prev_weights: &Col<f64>,
) -> Result<Col<f64>, KernelError> {
    let n = distances.nrows();
    let mut weights = Col::zeros(n);
    let mut total = 0.0;
    for i in 0..n {
        let (num, den) = indicator_counts(distances, i, eps_cur, eps_prev);
        let value = if num == 0 && den == 0 {
            0.0
        } else {
            num as f64 / den as f64 * prev_weights[i]
        };
        weights[i] = value;
        total += value;
    }
    if !total.is_finite() {
        error!("non-finite weights encountered, rerunning calculation with debug info");
        error!("calculating weights at {eps_cur} vs. {eps_prev}");
        let mut partial = 0.0;
        for i in 0..n {
            let (num, den) = indicator_counts(distances, i, eps_cur, eps_prev);
            partial += weights[i];
            error!(
                "i = {i}: (n/d) = ({num}/{den}), w_prev = {}, raw = {}, partial sum = {partial}",
                prev_weights[i],
                weights[i]
            );
        }
        return Err(KernelError::NonFiniteWeights {
            current: eps_cur,
            previous: eps_prev,
        });
    }
    for i in 0..n {
        weights[i] /= total;
    }
    Ok(weights)
}

/// Find the tolerance in `[lb, ub]` whose reweighted effective sample size
/// is closest to `alpha * ESS(prev_weights)`, by golden-section search.
///
/// The objective is piecewise constant between threshold crossings, so a
/// derivative-free bracket search is used: the two interior points are
/// lazily repositioned as the bracket shifts, and the search stops once the
/// bracket is narrower than 0.5 or after 10 000 iterations. Returns the
/// bracket midpoint.
pub fn solve_epsilon(
    lb: f64,
    ub: f64,
    eps_prev: f64,
    alpha: f64,
    distances: &Mat<f64>,
    prev_weights: &Col<f64>,
) -> Result<f64, KernelError> {
    let phi = (1.0 + 5.0_f64.sqrt()) / 2.0;
    let rhs = alpha * ess(prev_weights);
    let objective = |eps: f64| -> Result<f64, KernelError> {
        let weights = calc_weights(eps, eps_prev, distances, prev_weights)?;
        Ok((rhs - ess(&weights)).powi(2))
    };

    let mut a = lb;
    let mut b = ub;
    let mut c = lb;
    let mut d = ub;
    let mut move_lower = true;
    let mut move_upper = true;
    let mut iterations = 0;
    while iterations < 10_000 && b - a > 0.5 {
        if move_lower {
            c = b + (a - b) / phi;
            move_lower = false;
        }
        if move_upper {
            d = a + (b - a) / phi;
            move_upper = false;
        }
        let fc = objective(c)?;
        let fd = objective(d)?;
        if fc < fd {
            b = d;
            d = c;
            move_lower = true;
        } else {
            a = c;
            c = d;
            move_upper = true;
        }
        iterations += 1;
    }
    Ok((a + b) / 2.0)
}
