use std::sync::Arc;

use faer::{Col, Mat};
use log::warn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Binomial, Distribution, Normal};

use crate::config::{DataCompartment, ModelConfig, ReinfectionModel};

/// Sentinel distance reported for a parameter vector of the wrong length.
/// The sampler treats rows carrying it as failing every tolerance.
pub const INVALID_PARAMS_DISTANCE: f64 = -2.0;

/// Full compartment history of one forward simulation.
///
/// Matrices are T x L; `p_ei` and `p_ir` are per time step (the transition
/// mode is exponential, so they do not vary by location). Counts are stored
/// as `f64` but are exact integers.
#[derive(Debug, Clone)]
pub struct Trajectory {
    pub s: Mat<f64>,
    pub e: Mat<f64>,
    pub i: Mat<f64>,
    pub r: Mat<f64>,
    pub s_star: Mat<f64>,
    pub e_star: Mat<f64>,
    pub i_star: Mat<f64>,
    pub r_star: Mat<f64>,
    pub p_se: Mat<f64>,
    pub p_ei: Col<f64>,
    pub p_ir: Col<f64>,
    pub beta: Col<f64>,
    pub rho: Option<Col<f64>>,
    pub x: Mat<f64>,
    /// Scalar summary: the mean distance over the job's replicates.
    pub result: f64,
}

/// Result of one simulation job, tagged with the submission index so the
/// driver can reassemble a row-aligned distance matrix.
#[derive(Debug)]
pub struct SimOutput {
    pub index: usize,
    /// One distance per replicate.
    pub distances: Vec<f64>,
    pub trajectory: Option<Box<Trajectory>>,
}

/// A simulator node: a pure function of (parameters, generator state) over a
/// shared read-only configuration.
///
/// Each worker thread owns exactly one of these. Replicates for a job run
/// sequentially, so replicate k always draws from a deterministic position
/// in the generator stream given the worker seed and the preceding jobs.
pub struct SimWorker {
    config: Arc<ModelConfig>,
    rng: StdRng,
}

impl SimWorker {
    pub fn new(config: Arc<ModelConfig>, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Run one job: m replicates of the stochastic SEIR process at `theta`.
    pub fn run(&mut self, index: usize, theta: &[f64], want_trajectory: bool) -> SimOutput {
        let m = self.config.control.replicates;
        let layout = self.config.param_layout();
        if layout.decode(theta).is_none() {
            warn!(
                "invalid parameter vector of length {} (expected {}), ignoring job {}",
                theta.len(),
                layout.total(),
                index
            );
            return SimOutput {
                index,
                distances: vec![INVALID_PARAMS_DISTANCE; m],
                trajectory: None,
            };
        }

        let plan = ReplicatePlan::prepare(&self.config, theta);
        let mut distances = Vec::with_capacity(m);
        let mut trajectory = None;
        for replicate in 0..m {
            let record = want_trajectory && replicate == 0;
            let (distance, traj) = plan.run_replicate(&self.config, &mut self.rng, record);
            distances.push(distance);
            if let Some(traj) = traj {
                trajectory = Some(Box::new(traj));
            }
        }
        if let Some(traj) = trajectory.as_mut() {
            traj.result = distances.iter().sum::<f64>() / m as f64;
        }
        SimOutput {
            index,
            distances,
            trajectory,
        }
    }
}

/// Parameter-dependent quantities shared by every replicate of one job.
struct ReplicatePlan {
    beta: Vec<f64>,
    rho: Vec<f64>,
    /// exp(X beta), reshaped T x L.
    intensity: Mat<f64>,
    /// Exponential transition probabilities per time step.
    p_ei: Col<f64>,
    p_ir: Col<f64>,
    /// Reinfection probability per time step, empty when disabled.
    p_rs: Col<f64>,
}

impl ReplicatePlan {
    fn prepare(config: &ModelConfig, theta: &[f64]) -> Self {
        let layout = config.param_layout();
        let view = layout.decode(theta).expect("length checked by caller");
        let n_tpt = config.data.n_tpt();
        let n_loc = config.data.n_loc();

        let beta = Col::from_fn(layout.n_beta, |j| view.beta[j]);
        let eta = &config.exposure.x * &beta;
        // Column-major reshape: row l * T + t of the design matrix holds
        // time t at location l.
        let intensity = Mat::from_fn(n_tpt, n_loc, |t, l| eta[l * n_tpt + t].exp());

        let offset = &config.exposure.offset;
        let p_ei = Col::from_fn(n_tpt, |t| 1.0 - (-view.gamma_ei * offset[t]).exp());
        let p_ir = Col::from_fn(n_tpt, |t| 1.0 - (-view.gamma_ir * offset[t]).exp());

        let p_rs = match &config.reinfection {
            ReinfectionModel::None => Col::zeros(0),
            ReinfectionModel::Enabled { x_rs, .. } => {
                let beta_rs = Col::from_fn(layout.n_beta_rs, |j| view.beta_rs[j]);
                let eta_rs = x_rs * &beta_rs;
                Col::from_fn(n_tpt, |t| 1.0 - (-eta_rs[t].exp() * offset[t]).exp())
            }
        };

        Self {
            beta: view.beta.to_vec(),
            rho: view.rho.to_vec(),
            intensity,
            p_ei,
            p_ir,
            p_rs,
        }
    }

    /// One stochastic replicate. Returns the distance to the observed data
    /// and, when `record` is set, the full compartment history.
    fn run_replicate<R: Rng + ?Sized>(
        &self,
        config: &ModelConfig,
        rng: &mut R,
        record: bool,
    ) -> (f64, Option<Trajectory>) {
        let n_tpt = config.data.n_tpt();
        let n_loc = config.data.n_loc();
        let population = config.initial.population();
        let reinfection = self.p_rs.nrows() > 0;

        let mut s = config.initial.s0.clone();
        let mut e = config.initial.e0.clone();
        let mut i = config.initial.i0.clone();
        let mut r = config.initial.r0.clone();

        let mut stream = Mat::zeros(n_tpt, n_loc);
        let mut history = record.then(|| RecordedHistory::new(n_tpt, n_loc));

        let mut pressure = vec![0.0; n_loc];
        let mut base = vec![0.0; n_loc];
        for t in 0..n_tpt {
            let dt = config.exposure.offset[t];
            for l in 0..n_loc {
                base[l] = if population[l] == 0 {
                    0.0
                } else {
                    self.intensity[(t, l)] * i[l] as f64 / population[l] as f64
                };
                pressure[l] = base[l];
            }
            for (k, dm) in config.spatial.matrices.iter().enumerate() {
                for l in 0..n_loc {
                    let mut coupled = 0.0;
                    for j in 0..n_loc {
                        coupled += dm[(l, j)] * base[j];
                    }
                    pressure[l] += self.rho[k] * coupled;
                }
            }

            for l in 0..n_loc {
                let p_se = 1.0 - (-pressure[l] * dt).exp();
                let e_star = draw_binomial(rng, s[l], p_se);
                let i_star = draw_binomial(rng, e[l], self.p_ei[t]);
                let r_star = draw_binomial(rng, i[l], self.p_ir[t]);
                let s_star = if reinfection {
                    draw_binomial(rng, r[l], self.p_rs[t])
                } else {
                    0
                };

                if let Some(h) = history.as_mut() {
                    h.s[(t, l)] = s[l] as f64;
                    h.e[(t, l)] = e[l] as f64;
                    h.i[(t, l)] = i[l] as f64;
                    h.r[(t, l)] = r[l] as f64;
                    h.s_star[(t, l)] = s_star as f64;
                    h.e_star[(t, l)] = e_star as f64;
                    h.i_star[(t, l)] = i_star as f64;
                    h.r_star[(t, l)] = r_star as f64;
                    h.p_se[(t, l)] = p_se;
                }

                s[l] = s[l] - e_star + s_star;
                e[l] = e[l] + e_star - i_star;
                i[l] = i[l] + i_star - r_star;
                r[l] = r[l] + r_star - s_star;

                stream[(t, l)] = match config.data.compartment {
                    DataCompartment::IStar => i_star as f64,
                    DataCompartment::RStar => r_star as f64,
                };
            }
        }

        let distance = self.score(config, rng, &mut stream);
        let trajectory = history.map(|h| h.into_trajectory(self, config));
        (distance, trajectory)
    }

    /// Distance between the replicate's incidence stream and the observed
    /// data, applying the cumulative transform and overdispersion noise
    /// configured on the data model.
    fn score<R: Rng + ?Sized>(
        &self,
        config: &ModelConfig,
        rng: &mut R,
        stream: &mut Mat<f64>,
    ) -> f64 {
        if config.data.cumulative {
            for l in 0..stream.ncols() {
                for t in 1..stream.nrows() {
                    stream[(t, l)] += stream[(t - 1, l)];
                }
            }
        }
        if config.data.phi > 0.0 {
            let noise = Normal::new(0.0, config.data.phi).expect("phi validated nonnegative");
            for l in 0..stream.ncols() {
                for t in 0..stream.nrows() {
                    stream[(t, l)] += noise.sample(rng);
                }
            }
        }
        config.data.metric.evaluate(stream, &config.data.y)
    }
}

struct RecordedHistory {
    s: Mat<f64>,
    e: Mat<f64>,
    i: Mat<f64>,
    r: Mat<f64>,
    s_star: Mat<f64>,
    e_star: Mat<f64>,
    i_star: Mat<f64>,
    r_star: Mat<f64>,
    p_se: Mat<f64>,
}

impl RecordedHistory {
    fn new(n_tpt: usize, n_loc: usize) -> Self {
        Self {
            s: Mat::zeros(n_tpt, n_loc),
            e: Mat::zeros(n_tpt, n_loc),
            i: Mat::zeros(n_tpt, n_loc),
            r: Mat::zeros(n_tpt, n_loc),
            s_star: Mat::zeros(n_tpt, n_loc),
            e_star: Mat::zeros(n_tpt, n_loc),
            i_star: Mat::zeros(n_tpt, n_loc),
            r_star: Mat::zeros(n_tpt, n_loc),
            p_se: Mat::zeros(n_tpt, n_loc),
        }
    }

    fn into_trajectory(self, plan: &ReplicatePlan, config: &ModelConfig) -> Trajectory {
        Trajectory {
            s: self.s,
            e: self.e,
            i: self.i,
            r: self.r,
            s_star: self.s_star,
            e_star: self.e_star,
            i_star: self.i_star,
            r_star: self.r_star,
            p_se: self.p_se,
            p_ei: plan.p_ei.clone(),
            p_ir: plan.p_ir.clone(),
            beta: Col::from_fn(plan.beta.len(), |j| plan.beta[j]),
            rho: config
                .has_spatial()
                .then(|| Col::from_fn(plan.rho.len(), |k| plan.rho[k])),
            x: config.exposure.x.clone(),
            result: 0.0,
        }
    }
}

/// Binomial draw guarded against degenerate and non-finite probabilities.
/// A NaN probability yields zero transitions rather than a panic.
fn draw_binomial<R: Rng + ?Sized>(rng: &mut R, n: u64, p: f64) -> u64 {
    if n == 0 || !(p > 0.0) {
        return 0;
    }
    if p >= 1.0 {
        return n;
    }
    Binomial::new(n, p)
        .expect("probability lies in (0, 1)")
        .sample(rng)
}
