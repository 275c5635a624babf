use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use faer::{Col, Mat};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{
    ConfigError, DataModel, ExposureModel, InitialValues, ModelConfig, ReinfectionModel,
    SamplingControl, SpatialStructure, TransitionPriors,
};
use crate::pool::WorkerPool;
use crate::prior::Prior;
use crate::sampler::{run_smc, SamplerError};
use crate::simulate::Trajectory;

/// What `sample` should return alongside the final particles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// The final N x m distance matrix.
    Distances,
    /// Full compartment histories simulated from the final particles.
    Trajectories,
}

/// Simulation output of a sampling run.
#[derive(Debug)]
pub enum SampleOutput {
    Distances(Mat<f64>),
    Trajectories(Vec<Trajectory>),
}

/// Result bundle of a sampling run.
#[derive(Debug)]
pub struct SampleResult {
    /// Final particle matrix, one row per posterior sample.
    pub params: Mat<f64>,
    pub output: SampleOutput,
    /// Final normalized importance weights.
    pub weights: Col<f64>,
    /// Number of SMC iterations actually completed (smaller than the
    /// requested epoch count after an interrupt).
    pub completed_epochs: usize,
    /// The tolerance in force when the run ended.
    pub current_eps: f64,
    /// Realized tolerance schedule, one entry per completed epoch.
    pub eps_history: Vec<f64>,
}

/// An ABC inference problem for a spatial stochastic SEIR model.
///
/// Construction validates the seven model components against each other and
/// fixes the parameter layout. The configuration is then immutable and
/// shared read-only with the simulation workers; all sampler state lives in
/// the entry points.
///
/// A single base seed governs every run: the driver generator is seeded
/// with it directly, and each worker derives its own stream from the base
/// seed, its worker index, and a per-call counter. Re-running a freshly
/// constructed model with the same configuration reproduces identical
/// output.
#[derive(Debug)]
pub struct SpatialSeirModel {
    config: Arc<ModelConfig>,
    prior: Prior,
    rng: StdRng,
    interrupt: Arc<AtomicBool>,
    calls: u64,
}

impl SpatialSeirModel {
    /// Build a model from its seven components, in fixed order.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data: DataModel,
        exposure: ExposureModel,
        reinfection: ReinfectionModel,
        spatial: SpatialStructure,
        transitions: TransitionPriors,
        initial: InitialValues,
        control: SamplingControl,
    ) -> Result<Self, ConfigError> {
        Self::from_config(ModelConfig::new(
            data,
            exposure,
            reinfection,
            spatial,
            transitions,
            initial,
            control,
        )?)
    }

    pub fn from_config(config: ModelConfig) -> Result<Self, ConfigError> {
        let prior = Prior::new(&config)?;
        let rng = StdRng::seed_from_u64(config.control.seed);
        Ok(Self {
            config: Arc::new(config),
            prior,
            rng,
            interrupt: Arc::new(AtomicBool::new(false)),
            calls: 0,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn prior(&self) -> &Prior {
        &self.prior
    }

    /// Flag polled between SMC iterations. Setting it from another thread
    /// makes `sample` return early with the epochs completed so far.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Run the forward simulator once per parameter row and return the full
    /// trajectory of each row. No SMC is involved.
    pub fn simulate(&mut self, params: &Mat<f64>) -> Result<Vec<Trajectory>, SamplerError> {
        let expected = self.config.n_params();
        if params.ncols() != expected {
            return Err(SamplerError::ParamDimension {
                got: params.ncols(),
                expected,
            });
        }
        let mut pool = self.spawn_pool();
        let (_, trajectories) = pool.run_matrix(params, true)?;
        Ok(trajectories.into_iter().flatten().map(|t| *t).collect())
    }

    /// Run the forward simulator once per parameter row and return a scalar
    /// summary per row: the mean of its replicate distances. Rows with the
    /// wrong parameter dimension come back as the −2.0 sentinel.
    pub fn marginal_posterior_estimates(
        &mut self,
        params: &Mat<f64>,
    ) -> Result<Col<f64>, SamplerError> {
        let mut pool = self.spawn_pool();
        let (distances, _) = pool.run_matrix(params, false)?;
        let m = distances.ncols() as f64;
        Ok(Col::from_fn(distances.nrows(), |i| {
            (0..distances.ncols()).map(|j| distances[(i, j)]).sum::<f64>() / m
        }))
    }

    /// Run the Del Moral adaptive SMC sampler for `n_sample` particles.
    ///
    /// `verbose` scales progress output (0 silent, higher values add
    /// per-iteration and per-batch detail). `mode` selects whether the
    /// result carries the final distance matrix or trajectories simulated
    /// from the final particles.
    pub fn sample(
        &mut self,
        n_sample: usize,
        verbose: u8,
        mode: OutputMode,
    ) -> Result<SampleResult, SamplerError> {
        let mut pool = self.spawn_pool();
        let state = run_smc(
            &self.config,
            &self.prior,
            &mut pool,
            &mut self.rng,
            &self.interrupt,
            n_sample,
            verbose,
        )?;
        let output = match mode {
            OutputMode::Distances => SampleOutput::Distances(state.distances),
            OutputMode::Trajectories => {
                let (_, trajectories) = pool.run_matrix(&state.params, true)?;
                SampleOutput::Trajectories(
                    trajectories.into_iter().flatten().map(|t| *t).collect(),
                )
            }
        };
        Ok(SampleResult {
            params: state.params,
            output,
            weights: state.weights,
            completed_epochs: state.completed_epochs,
            current_eps: state.current_eps,
            eps_history: state.eps_history,
        })
    }

    fn spawn_pool(&mut self) -> WorkerPool {
        self.calls += 1;
        WorkerPool::spawn(Arc::clone(&self.config), self.calls)
    }
}
