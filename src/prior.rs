use faer::Mat;
use rand::Rng;
use rand_distr::Distribution;
use statrs::distribution::{Beta, Continuous, Gamma, Normal};

use crate::config::{ConfigError, ModelConfig, ReinfectionModel};
use crate::params::ParamLayout;

#[derive(Debug, Clone, Copy)]
struct GaussianPrior {
    mean: f64,
    sd: f64,
    density: Normal,
}

impl GaussianPrior {
    fn from_precision(mean: f64, precision: f64) -> Result<Self, ConfigError> {
        if !(precision > 0.0) {
            return Err(ConfigError::NonPositive {
                name: "prior precision",
                value: precision,
            });
        }
        let sd = precision.sqrt().recip();
        let density = Normal::new(mean, sd).map_err(|_| ConfigError::NonPositive {
            name: "prior precision",
            value: precision,
        })?;
        Ok(Self { mean, sd, density })
    }
}

/// Joint prior over a parameter vector.
///
/// The density factorizes into independent components: Gaussian priors on the
/// exposure and reinfection coefficients (specified by mean and precision),
/// a Beta prior on each spatial autocorrelation rho_k, and Gamma priors on
/// the two transition rates. Evaluation is deterministic and never draws
/// from a generator.
#[derive(Debug, Clone)]
pub struct Prior {
    layout: ParamLayout,
    beta: Vec<GaussianPrior>,
    beta_rs: Vec<GaussianPrior>,
    rho_shape: (f64, f64),
    rho_density: Option<Beta>,
    ei_shape_rate: (f64, f64),
    ir_shape_rate: (f64, f64),
    gamma_ei: Gamma,
    gamma_ir: Gamma,
}

fn gaussian_components(
    mean: &faer::Col<f64>,
    precision: &faer::Col<f64>,
) -> Result<Vec<GaussianPrior>, ConfigError> {
    (0..mean.nrows())
        .map(|j| GaussianPrior::from_precision(mean[j], precision[j]))
        .collect()
}

fn gamma_density(shape: f64, rate: f64, name: &'static str) -> Result<Gamma, ConfigError> {
    Gamma::new(shape, rate).map_err(|_| ConfigError::NonPositive {
        name,
        value: shape.min(rate),
    })
}

impl Prior {
    pub fn new(config: &ModelConfig) -> Result<Self, ConfigError> {
        let layout = config.param_layout();
        let beta = gaussian_components(
            &config.exposure.beta_prior_mean,
            &config.exposure.beta_prior_precision,
        )?;
        let beta_rs = match &config.reinfection {
            ReinfectionModel::None => Vec::new(),
            ReinfectionModel::Enabled {
                prior_mean,
                prior_precision,
                ..
            } => gaussian_components(prior_mean, prior_precision)?,
        };
        let rho_shape = config.spatial.rho_prior;
        let rho_density = if config.has_spatial() {
            Some(
                Beta::new(rho_shape.0, rho_shape.1).map_err(|_| ConfigError::NonPositive {
                    name: "rho prior shape",
                    value: rho_shape.0.min(rho_shape.1),
                })?,
            )
        } else {
            None
        };
        let t = &config.transitions;
        Ok(Self {
            layout,
            beta,
            beta_rs,
            rho_shape,
            rho_density,
            ei_shape_rate: (t.ei_shape, t.ei_rate),
            ir_shape_rate: (t.ir_shape, t.ir_rate),
            gamma_ei: gamma_density(t.ei_shape, t.ei_rate, "gamma_EI prior")?,
            gamma_ir: gamma_density(t.ir_shape, t.ir_rate, "gamma_IR prior")?,
        })
    }

    /// Prior density at `theta`, as a plain (non-log) value.
    ///
    /// Returns 0.0 for a wrong-length vector or whenever any component falls
    /// outside its admissible domain (rho outside (0, 1), a nonpositive
    /// transition rate).
    pub fn eval(&self, theta: &[f64]) -> f64 {
        let Some(view) = self.layout.decode(theta) else {
            return 0.0;
        };
        if view.gamma_ei <= 0.0 || view.gamma_ir <= 0.0 {
            return 0.0;
        }
        let mut density = 1.0;
        for (prior, value) in self.beta.iter().zip(view.beta) {
            density *= prior.density.pdf(*value);
        }
        for (prior, value) in self.beta_rs.iter().zip(view.beta_rs) {
            density *= prior.density.pdf(*value);
        }
        if let Some(rho_density) = &self.rho_density {
            for value in view.rho {
                if !(*value > 0.0 && *value < 1.0) {
                    return 0.0;
                }
                density *= rho_density.pdf(*value);
            }
        }
        density * self.gamma_ei.pdf(view.gamma_ei) * self.gamma_ir.pdf(view.gamma_ir)
    }

    /// Draw `n` particles from the prior into an n x P matrix, in the fixed
    /// column order beta, beta_rs, rho, gamma_EI, gamma_IR.
    pub fn sample_matrix<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Mat<f64> {
        let p = self.layout.total();
        let rho_sampler = self.rho_density.as_ref().map(|_| {
            rand_distr::Beta::new(self.rho_shape.0, self.rho_shape.1)
                .expect("validated at construction")
        });
        // rand_distr parameterizes Gamma by shape and scale, statrs by
        // shape and rate.
        let ei_sampler = rand_distr::Gamma::new(self.ei_shape_rate.0, self.ei_shape_rate.1.recip())
            .expect("validated at construction");
        let ir_sampler = rand_distr::Gamma::new(self.ir_shape_rate.0, self.ir_shape_rate.1.recip())
            .expect("validated at construction");
        let mut params = Mat::zeros(n, p);
        for i in 0..n {
            let mut j = 0;
            for prior in self.beta.iter().chain(self.beta_rs.iter()) {
                let dist = rand_distr::Normal::new(prior.mean, prior.sd)
                    .expect("validated at construction");
                params[(i, j)] = dist.sample(rng);
                j += 1;
            }
            if let Some(sampler) = &rho_sampler {
                for _ in 0..self.layout.n_rho {
                    params[(i, j)] = sampler.sample(rng);
                    j += 1;
                }
            }
            params[(i, j)] = ei_sampler.sample(rng);
            params[(i, j + 1)] = ir_sampler.sample(rng);
        }
        params
    }

    pub fn layout(&self) -> ParamLayout {
        self.layout
    }
}

#[cfg(test)]
mod tests {
    use faer::{Col, Mat};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::config::{
        DataCompartment, DataModel, DistanceMetric, ExposureModel, InitialValues, ModelConfig,
        SamplingControl, SpatialStructure, TransitionPriors,
    };

    fn config() -> ModelConfig {
        let n_tpt = 5;
        let exposure = ExposureModel::new(
            Mat::from_fn(n_tpt, 2, |i, j| if j == 0 { 1.0 } else { i as f64 / 5.0 }),
            n_tpt,
            1,
            Col::from_fn(n_tpt, |_| 1.0),
            Col::zeros(2),
            Col::from_fn(2, |_| 0.5),
        )
        .unwrap();
        ModelConfig::new(
            DataModel::new(
                Mat::zeros(n_tpt, 1),
                DataCompartment::IStar,
                DistanceMetric::L1,
            ),
            exposure,
            ReinfectionModel::None,
            SpatialStructure::none(),
            TransitionPriors::new(2.0, 4.0, 2.0, 4.0).unwrap(),
            InitialValues::new(vec![100], vec![0], vec![1], vec![0]),
            SamplingControl::new(4, 17, 20).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn eval_is_positive_inside_domain() {
        let prior = Prior::new(&config()).unwrap();
        let density = prior.eval(&[0.1, -0.2, 0.4, 0.3]);
        assert!(density > 0.0);
    }

    #[test]
    fn eval_is_zero_outside_domain() {
        let prior = Prior::new(&config()).unwrap();
        assert_eq!(prior.eval(&[0.1, -0.2, -0.4, 0.3]), 0.0);
        assert_eq!(prior.eval(&[0.1, -0.2, 0.4, 0.0]), 0.0);
    }

    #[test]
    fn eval_is_zero_for_wrong_length() {
        let prior = Prior::new(&config()).unwrap();
        assert_eq!(prior.eval(&[0.1, -0.2, 0.4]), 0.0);
    }

    #[test]
    fn eval_is_deterministic() {
        let prior = Prior::new(&config()).unwrap();
        let theta = [0.3, 0.1, 0.5, 0.25];
        assert_eq!(prior.eval(&theta), prior.eval(&theta));
    }

    #[test]
    fn sampled_particles_stay_in_prior_support() {
        let prior = Prior::new(&config()).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let draws = prior.sample_matrix(100, &mut rng);
        assert_eq!(draws.nrows(), 100);
        assert_eq!(draws.ncols(), 4);
        for i in 0..draws.nrows() {
            assert!(draws[(i, 2)] > 0.0);
            assert!(draws[(i, 3)] > 0.0);
            let row: Vec<f64> = (0..4).map(|j| draws[(i, j)]).collect();
            assert!(prior.eval(&row) > 0.0);
        }
    }
}
