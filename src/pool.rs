use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use faer::Mat;
use thiserror::Error;

use crate::config::ModelConfig;
use crate::simulate::{SimOutput, SimWorker, Trajectory};

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PoolError {
    /// A worker thread exited before all in-flight jobs produced results.
    /// This aborts the current sampling call.
    #[error("a simulation worker died before draining its jobs")]
    WorkerDied,
}

struct Job {
    index: usize,
    theta: Vec<f64>,
    want_trajectory: bool,
}

/// A fixed pool of simulator workers fed over per-worker job channels.
///
/// Jobs are dispatched round-robin, so job i always lands on worker
/// `i mod cores` and reproducibility follows from the per-worker generator
/// seeds. Results come back tagged with the submission index on a shared
/// channel; callers reassemble them into row order.
///
/// Dropping the pool closes the job channels; workers finish whatever is
/// in flight and exit.
pub struct WorkerPool {
    senders: Vec<Sender<Job>>,
    results: Receiver<SimOutput>,
    handles: Vec<JoinHandle<()>>,
    replicates: usize,
    next: usize,
}

impl WorkerPool {
    /// Spawn `config.control.cores` workers. Worker k is seeded
    /// `base_seed + 1000 * k + call`, where `call` counts entry-point
    /// invocations on the owning model, so repeated calls do not replay
    /// the same streams.
    pub fn spawn(config: Arc<ModelConfig>, call: u64) -> Self {
        let cores = config.control.cores;
        let replicates = config.control.replicates;
        let base_seed = config.control.seed;
        let (result_tx, results) = unbounded();
        let mut senders = Vec::with_capacity(cores);
        let mut handles = Vec::with_capacity(cores);
        for k in 0..cores {
            let (job_tx, job_rx) = unbounded::<Job>();
            let seed = base_seed + 1000 * k as u64 + call;
            let worker_config = Arc::clone(&config);
            let out = result_tx.clone();
            handles.push(thread::spawn(move || {
                let mut worker = SimWorker::new(worker_config, seed);
                for job in job_rx.iter() {
                    let output = worker.run(job.index, &job.theta, job.want_trajectory);
                    if out.send(output).is_err() {
                        return;
                    }
                }
            }));
            senders.push(job_tx);
        }
        Self {
            senders,
            results,
            handles,
            replicates,
            next: 0,
        }
    }

    /// Round-robin dispatch of one parameter vector.
    pub fn submit(
        &mut self,
        index: usize,
        theta: Vec<f64>,
        want_trajectory: bool,
    ) -> Result<(), PoolError> {
        let worker = self.next % self.senders.len();
        self.next += 1;
        self.senders[worker]
            .send(Job {
                index,
                theta,
                want_trajectory,
            })
            .map_err(|_| PoolError::WorkerDied)
    }

    /// Block until `n` results have arrived.
    pub fn drain(&mut self, n: usize) -> Result<Vec<SimOutput>, PoolError> {
        (0..n)
            .map(|_| self.results.recv().map_err(|_| PoolError::WorkerDied))
            .collect()
    }

    /// Stop all workers after draining in-flight jobs. Equivalent to
    /// dropping the pool.
    pub fn shutdown(self) {}

    /// Simulate every row of a parameter matrix and reassemble the distance
    /// matrix (and trajectories, when requested) in row order.
    pub fn run_matrix(
        &mut self,
        params: &Mat<f64>,
        want_trajectories: bool,
    ) -> Result<(Mat<f64>, Vec<Option<Box<Trajectory>>>), PoolError> {
        let n = params.nrows();
        for i in 0..n {
            let theta: Vec<f64> = (0..params.ncols()).map(|j| params[(i, j)]).collect();
            self.submit(i, theta, want_trajectories)?;
        }
        let mut distances = Mat::zeros(n, self.replicates);
        let mut trajectories: Vec<Option<Box<Trajectory>>> = (0..n).map(|_| None).collect();
        for output in self.drain(n)? {
            for (j, d) in output.distances.iter().enumerate() {
                distances[(output.index, j)] = *d;
            }
            trajectories[output.index] = output.trajectory;
        }
        Ok((distances, trajectories))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.senders.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use faer::Col;

    use super::*;
    use crate::config::{
        DataCompartment, DataModel, DistanceMetric, ExposureModel, InitialValues, ModelConfig,
        ReinfectionModel, SamplingControl, SpatialStructure, TransitionPriors,
    };

    fn config(cores: usize) -> Arc<ModelConfig> {
        let n_tpt = 6;
        let exposure = ExposureModel::new(
            Mat::from_fn(n_tpt, 1, |_, _| 1.0),
            n_tpt,
            1,
            Col::from_fn(n_tpt, |_| 1.0),
            Col::zeros(1),
            Col::from_fn(1, |_| 0.1),
        )
        .unwrap();
        Arc::new(
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
                InitialValues::new(vec![200], vec![0], vec![5], vec![0]),
                SamplingControl::new(3, 11, 8).unwrap().with_cores(cores),
            )
            .unwrap(),
        )
    }

    #[test]
    fn results_reassemble_in_submission_order() {
        let config = config(3);
        let mut pool = WorkerPool::spawn(Arc::clone(&config), 1);
        let params = Mat::from_fn(8, 3, |i, j| match j {
            0 => 0.1 * i as f64,
            1 => 0.3,
            _ => 0.2,
        });
        let (distances, trajectories) = pool.run_matrix(&params, false).unwrap();
        assert_eq!(distances.nrows(), 8);
        assert_eq!(distances.ncols(), config.control.replicates);
        assert!(trajectories.iter().all(|t| t.is_none()));
        for i in 0..distances.nrows() {
            for j in 0..distances.ncols() {
                assert!(distances[(i, j)] >= 0.0);
            }
        }
    }

    #[test]
    fn pool_runs_are_reproducible() {
        let config = config(2);
        let params = Mat::from_fn(4, 3, |i, _| 0.1 + 0.05 * i as f64);
        let mut first_pool = WorkerPool::spawn(Arc::clone(&config), 1);
        let (first, _) = first_pool.run_matrix(&params, false).unwrap();
        let mut second_pool = WorkerPool::spawn(Arc::clone(&config), 1);
        let (second, _) = second_pool.run_matrix(&params, false).unwrap();
        for i in 0..first.nrows() {
            for j in 0..first.ncols() {
                assert_eq!(first[(i, j)], second[(i, j)]);
            }
        }
    }

    #[test]
    fn trajectories_come_back_for_every_row() {
        let config = config(2);
        let mut pool = WorkerPool::spawn(config, 1);
        let params = Mat::from_fn(3, 3, |_, _| 0.2);
        let (_, trajectories) = pool.run_matrix(&params, true).unwrap();
        assert!(trajectories.iter().all(|t| t.is_some()));
    }
}
