use faer::{Col, Mat};
use thiserror::Error;

use crate::params::ParamLayout;

/// Errors raised while assembling a [`ModelConfig`] from its components.
///
/// Every variant names the dimensions that disagree, so the caller can see
/// which pair of components was inconsistent without re-deriving shapes.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Exposure model and data model imply different numbers of locations: {data}, {exposure}")]
    LocationMismatch { data: usize, exposure: usize },
    #[error("Exposure model and data model imply different numbers of time points: {data}, {exposure}")]
    TimeMismatch { data: usize, exposure: usize },
    #[error("Data model and distance model imply different numbers of locations: {data}, {distance}")]
    DistanceLocationMismatch { data: usize, distance: usize },
    #[error("Data model and initial value container have different dimensions: {data}, {init}")]
    InitialValueMismatch { data: usize, init: usize },
    #[error("Reinfection and data model time points differ: {reinfection}, {data}")]
    ReinfectionTimeMismatch { reinfection: usize, data: usize },
    #[error("Design matrix has {rows} rows, expected T * L = {expected}")]
    DesignRowMismatch { rows: usize, expected: usize },
    #[error("Offset has length {len}, expected {expected} time points")]
    OffsetLengthMismatch { len: usize, expected: usize },
    #[error("Spatial weight matrix {index} is {rows}x{cols}, expected {expected}x{expected}")]
    SpatialShapeMismatch {
        index: usize,
        rows: usize,
        cols: usize,
        expected: usize,
    },
    #[error("Exposure prior mean has length {mean} but precision has length {precision}")]
    PriorLengthMismatch { mean: usize, precision: usize },
    #[error("{name} must be strictly positive, got {value}")]
    NonPositive { name: &'static str, value: f64 },
    #[error("Shrinkage factor must lie in (0, 1), got {0}")]
    BadShrinkage(f64),
    #[error("{name} must be at least 1")]
    ZeroCount { name: &'static str },
}

/// Which transition count the observed incidence describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataCompartment {
    /// New infections per step (E to I transitions).
    IStar,
    /// New removals per step (I to R transitions).
    RStar,
}

/// Discrepancy between an observed and a simulated incidence matrix.
///
/// Both forms are normalized by the number of cells, so the distance scale
/// does not grow with the study dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    /// Mean absolute difference.
    L1,
    /// Root mean squared difference.
    L2,
}

impl DistanceMetric {
    /// Distance between two equally shaped matrices. Nonnegative and
    /// deterministic for finite inputs.
    pub fn evaluate(&self, simulated: &Mat<f64>, observed: &Mat<f64>) -> f64 {
        let cells = (observed.nrows() * observed.ncols()) as f64;
        let mut acc = 0.0;
        for j in 0..observed.ncols() {
            for i in 0..observed.nrows() {
                let diff = simulated[(i, j)] - observed[(i, j)];
                acc += match self {
                    DistanceMetric::L1 => diff.abs(),
                    DistanceMetric::L2 => diff * diff,
                };
            }
        }
        match self {
            DistanceMetric::L1 => acc / cells,
            DistanceMetric::L2 => (acc / cells).sqrt(),
        }
    }
}

/// Observed incidence and the rules for comparing simulations against it.
#[derive(Debug, Clone)]
pub struct DataModel {
    /// T x L matrix of observed counts.
    pub y: Mat<f64>,
    /// Which transition stream the observations describe.
    pub compartment: DataCompartment,
    /// Compare cumulative rather than per-step incidence.
    pub cumulative: bool,
    /// Overdispersion scale. When positive, Gaussian noise with this
    /// standard deviation is added to the simulated stream before the
    /// distance is computed. Zero disables the noise entirely.
    pub phi: f64,
    /// Distance form used to score replicates.
    pub metric: DistanceMetric,
}

impl DataModel {
    pub fn new(y: Mat<f64>, compartment: DataCompartment, metric: DistanceMetric) -> Self {
        Self {
            y,
            compartment,
            cumulative: false,
            phi: 0.0,
            metric,
        }
    }

    pub fn n_tpt(&self) -> usize {
        self.y.nrows()
    }

    pub fn n_loc(&self) -> usize {
        self.y.ncols()
    }
}

/// Linear predictor structure for the exposure (infection intensity) process.
///
/// The design matrix `x` has `T * L` rows ordered in location-major blocks:
/// row `l * T + t` carries the covariates for time `t` at location `l`, which
/// matches the column-major reshape of the fitted linear predictor into a
/// T x L intensity surface.
#[derive(Debug, Clone)]
pub struct ExposureModel {
    pub x: Mat<f64>,
    pub n_tpt: usize,
    pub n_loc: usize,
    /// Time step durations, strictly positive, length T.
    pub offset: Col<f64>,
    pub beta_prior_mean: Col<f64>,
    pub beta_prior_precision: Col<f64>,
}

impl ExposureModel {
    pub fn new(
        x: Mat<f64>,
        n_tpt: usize,
        n_loc: usize,
        offset: Col<f64>,
        beta_prior_mean: Col<f64>,
        beta_prior_precision: Col<f64>,
    ) -> Result<Self, ConfigError> {
        if x.nrows() != n_tpt * n_loc {
            return Err(ConfigError::DesignRowMismatch {
                rows: x.nrows(),
                expected: n_tpt * n_loc,
            });
        }
        if offset.nrows() != n_tpt {
            return Err(ConfigError::OffsetLengthMismatch {
                len: offset.nrows(),
                expected: n_tpt,
            });
        }
        if beta_prior_mean.nrows() != beta_prior_precision.nrows()
            || beta_prior_mean.nrows() != x.ncols()
        {
            return Err(ConfigError::PriorLengthMismatch {
                mean: beta_prior_mean.nrows(),
                precision: beta_prior_precision.nrows(),
            });
        }
        for t in 0..offset.nrows() {
            if !(offset[t] > 0.0) {
                return Err(ConfigError::NonPositive {
                    name: "offset",
                    value: offset[t],
                });
            }
        }
        Ok(Self {
            x,
            n_tpt,
            n_loc,
            offset,
            beta_prior_mean,
            beta_prior_precision,
        })
    }

    pub fn n_beta(&self) -> usize {
        self.x.ncols()
    }
}

/// Reinfection (R to S) process. The original implementation encodes the
/// disabled state with a mode flag and a zero-precision sentinel; here the
/// two states are explicit.
#[derive(Debug, Clone)]
pub enum ReinfectionModel {
    None,
    Enabled {
        /// T x p_rs design matrix for the reinfection linear predictor.
        x_rs: Mat<f64>,
        prior_mean: Col<f64>,
        prior_precision: Col<f64>,
    },
}

impl ReinfectionModel {
    pub fn enabled(
        x_rs: Mat<f64>,
        prior_mean: Col<f64>,
        prior_precision: Col<f64>,
    ) -> Result<Self, ConfigError> {
        if prior_mean.nrows() != prior_precision.nrows() || prior_mean.nrows() != x_rs.ncols() {
            return Err(ConfigError::PriorLengthMismatch {
                mean: prior_mean.nrows(),
                precision: prior_precision.nrows(),
            });
        }
        Ok(ReinfectionModel::Enabled {
            x_rs,
            prior_mean,
            prior_precision,
        })
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, ReinfectionModel::Enabled { .. })
    }

    pub fn n_beta_rs(&self) -> usize {
        match self {
            ReinfectionModel::None => 0,
            ReinfectionModel::Enabled { x_rs, .. } => x_rs.ncols(),
        }
    }
}

/// Spatial coupling structure: a list of L x L weight matrices, each paired
/// with one autocorrelation parameter rho_k. An empty list means the model
/// has a single location or no spatial mixing.
#[derive(Debug, Clone)]
pub struct SpatialStructure {
    pub matrices: Vec<Mat<f64>>,
    /// Beta(a, b) prior shape parameters shared by every rho_k.
    pub rho_prior: (f64, f64),
}

impl SpatialStructure {
    pub fn new(matrices: Vec<Mat<f64>>, rho_prior: (f64, f64)) -> Result<Self, ConfigError> {
        if !(rho_prior.0 > 0.0) {
            return Err(ConfigError::NonPositive {
                name: "rho prior shape a",
                value: rho_prior.0,
            });
        }
        if !(rho_prior.1 > 0.0) {
            return Err(ConfigError::NonPositive {
                name: "rho prior shape b",
                value: rho_prior.1,
            });
        }
        Ok(Self {
            matrices,
            rho_prior,
        })
    }

    pub fn none() -> Self {
        Self {
            matrices: Vec::new(),
            rho_prior: (1.0, 1.0),
        }
    }

    pub fn n_rho(&self) -> usize {
        self.matrices.len()
    }
}

/// Gamma priors for the two transition rates, parameterized by shape and
/// rate. Transitions are exponential: the probability of leaving a
/// compartment over a step of length dt is `1 - exp(-gamma * dt)`.
#[derive(Debug, Clone, Copy)]
pub struct TransitionPriors {
    pub ei_shape: f64,
    pub ei_rate: f64,
    pub ir_shape: f64,
    pub ir_rate: f64,
}

impl TransitionPriors {
    pub fn new(ei_shape: f64, ei_rate: f64, ir_shape: f64, ir_rate: f64) -> Result<Self, ConfigError> {
        for (name, value) in [
            ("gamma_EI prior shape", ei_shape),
            ("gamma_EI prior rate", ei_rate),
            ("gamma_IR prior shape", ir_shape),
            ("gamma_IR prior rate", ir_rate),
        ] {
            if !(value > 0.0) {
                return Err(ConfigError::NonPositive { name, value });
            }
        }
        Ok(Self {
            ei_shape,
            ei_rate,
            ir_shape,
            ir_rate,
        })
    }
}

/// Initial compartment counts per location.
#[derive(Debug, Clone)]
pub struct InitialValues {
    pub s0: Vec<u64>,
    pub e0: Vec<u64>,
    pub i0: Vec<u64>,
    pub r0: Vec<u64>,
}

impl InitialValues {
    pub fn new(s0: Vec<u64>, e0: Vec<u64>, i0: Vec<u64>, r0: Vec<u64>) -> Self {
        Self { s0, e0, i0, r0 }
    }

    pub fn n_loc(&self) -> usize {
        self.s0.len()
    }

    /// Total population N_l per location.
    pub fn population(&self) -> Vec<u64> {
        (0..self.s0.len())
            .map(|l| self.s0[l] + self.e0[l] + self.i0[l] + self.r0[l])
            .collect()
    }
}

/// Knobs controlling a sampling run.
#[derive(Debug, Clone, Copy)]
pub struct SamplingControl {
    /// Number of replicate simulations per parameter vector.
    pub replicates: usize,
    /// Base seed for the whole run. Worker generators are derived from it.
    pub seed: u64,
    /// Number of simulator worker threads.
    pub cores: usize,
    /// Number of SMC iterations.
    pub epochs: usize,
    /// Bound on proposal batches per rejuvenation phase.
    pub max_batches: usize,
    /// Simulation batch size. Must equal the particle count in this sampler.
    pub batch_size: usize,
    /// Tolerance shrinkage factor alpha in (0, 1).
    pub shrinkage: f64,
}

impl SamplingControl {
    pub fn new(replicates: usize, seed: u64, batch_size: usize) -> Result<Self, ConfigError> {
        let control = Self {
            replicates,
            seed,
            cores: 1,
            epochs: 10,
            max_batches: 20,
            batch_size,
            shrinkage: 0.9,
        };
        control.validate()?;
        Ok(control)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("replicates", self.replicates),
            ("cores", self.cores),
            ("epochs", self.epochs),
            ("max_batches", self.max_batches),
            ("batch_size", self.batch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroCount { name });
            }
        }
        if !(self.shrinkage > 0.0 && self.shrinkage < 1.0) {
            return Err(ConfigError::BadShrinkage(self.shrinkage));
        }
        Ok(())
    }

    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_max_batches(mut self, max_batches: usize) -> Self {
        self.max_batches = max_batches;
        self
    }

    pub fn with_shrinkage(mut self, shrinkage: f64) -> Self {
        self.shrinkage = shrinkage;
        self
    }
}

/// The combined, validated model configuration.
///
/// Immutable for the lifetime of a sampling run and shared read-only with
/// every simulator worker. Construction checks all cross-component dimension
/// constraints; the individual component constructors check the local ones.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub data: DataModel,
    pub exposure: ExposureModel,
    pub reinfection: ReinfectionModel,
    pub spatial: SpatialStructure,
    pub transitions: TransitionPriors,
    pub initial: InitialValues,
    pub control: SamplingControl,
}

impl ModelConfig {
    pub fn new(
        data: DataModel,
        exposure: ExposureModel,
        reinfection: ReinfectionModel,
        spatial: SpatialStructure,
        transitions: TransitionPriors,
        initial: InitialValues,
        control: SamplingControl,
    ) -> Result<Self, ConfigError> {
        if data.n_loc() != exposure.n_loc {
            return Err(ConfigError::LocationMismatch {
                data: data.n_loc(),
                exposure: exposure.n_loc,
            });
        }
        if data.n_tpt() != exposure.n_tpt {
            return Err(ConfigError::TimeMismatch {
                data: data.n_tpt(),
                exposure: exposure.n_tpt,
            });
        }
        for (index, dm) in spatial.matrices.iter().enumerate() {
            if dm.nrows() != data.n_loc() || dm.ncols() != data.n_loc() {
                return Err(ConfigError::SpatialShapeMismatch {
                    index,
                    rows: dm.nrows(),
                    cols: dm.ncols(),
                    expected: data.n_loc(),
                });
            }
        }
        if data.n_loc() != initial.n_loc() {
            return Err(ConfigError::InitialValueMismatch {
                data: data.n_loc(),
                init: initial.n_loc(),
            });
        }
        if let ReinfectionModel::Enabled { x_rs, .. } = &reinfection {
            if x_rs.nrows() != data.n_tpt() {
                return Err(ConfigError::ReinfectionTimeMismatch {
                    reinfection: x_rs.nrows(),
                    data: data.n_tpt(),
                });
            }
        }
        control.validate()?;
        Ok(Self {
            data,
            exposure,
            reinfection,
            spatial,
            transitions,
            initial,
            control,
        })
    }

    pub fn has_spatial(&self) -> bool {
        self.spatial.n_rho() > 0
    }

    pub fn has_reinfection(&self) -> bool {
        self.reinfection.is_enabled()
    }

    /// Fixed column decomposition of a parameter vector.
    pub fn param_layout(&self) -> ParamLayout {
        ParamLayout::new(
            self.exposure.n_beta(),
            self.reinfection.n_beta_rs(),
            self.spatial.n_rho(),
        )
    }

    /// Total parameter dimension P.
    pub fn n_params(&self) -> usize {
        self.param_layout().total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exposure(n_tpt: usize, n_loc: usize) -> ExposureModel {
        let p = 2;
        ExposureModel::new(
            Mat::from_fn(n_tpt * n_loc, p, |i, j| if j == 0 { 1.0 } else { i as f64 }),
            n_tpt,
            n_loc,
            Col::from_fn(n_tpt, |_| 1.0),
            Col::zeros(p),
            Col::from_fn(p, |_| 0.1),
        )
        .unwrap()
    }

    fn data(n_tpt: usize, n_loc: usize) -> DataModel {
        DataModel::new(
            Mat::zeros(n_tpt, n_loc),
            DataCompartment::IStar,
            DistanceMetric::L1,
        )
    }

    #[test]
    fn location_mismatch_names_both_counts() {
        let err = ModelConfig::new(
            data(10, 3),
            exposure(10, 4),
            ReinfectionModel::None,
            SpatialStructure::none(),
            TransitionPriors::new(1.0, 1.0, 1.0, 1.0).unwrap(),
            InitialValues::new(vec![100; 3], vec![0; 3], vec![1; 3], vec![0; 3]),
            SamplingControl::new(10, 42, 50).unwrap(),
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains('3') && message.contains('4'), "{message}");
    }

    #[test]
    fn param_dimension_counts_all_blocks() {
        let spatial = SpatialStructure::new(
            vec![Mat::zeros(3, 3), Mat::zeros(3, 3)],
            (1.0, 1.0),
        )
        .unwrap();
        let reinfection = ReinfectionModel::enabled(
            Mat::zeros(10, 1),
            Col::zeros(1),
            Col::from_fn(1, |_| 0.5),
        )
        .unwrap();
        let config = ModelConfig::new(
            data(10, 3),
            exposure(10, 3),
            reinfection,
            spatial,
            TransitionPriors::new(1.0, 1.0, 1.0, 1.0).unwrap(),
            InitialValues::new(vec![100; 3], vec![0; 3], vec![1; 3], vec![0; 3]),
            SamplingControl::new(10, 42, 50).unwrap(),
        )
        .unwrap();
        // beta (2) + beta_rs (1) + rho (2) + gamma_EI, gamma_IR
        assert_eq!(config.n_params(), 7);
    }

    #[test]
    fn offset_must_be_positive() {
        let err = ExposureModel::new(
            Mat::zeros(4, 1),
            4,
            1,
            Col::from_fn(4, |t| if t == 2 { 0.0 } else { 1.0 }),
            Col::zeros(1),
            Col::from_fn(1, |_| 1.0),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::NonPositive { .. }));
    }

    #[test]
    fn shrinkage_outside_unit_interval_is_rejected() {
        let control = SamplingControl::new(10, 0, 10).unwrap().with_shrinkage(1.0);
        assert!(matches!(control.validate(), Err(ConfigError::BadShrinkage(_))));
    }
}
