//! Wrapper around a constructed optimizer handle and its optional trainer
//! capability.

use ndarray::ArrayView2;

use crate::{
    Result,
    backend::{NnData, OptimizerBackend},
    config::{self, SolverConfig},
};

/// Owns the optimizer handle resolved from a config file.
///
/// Recreated wholesale on reset; never partially mutated.
pub struct NnSolver {
    optimizer: Box<dyn OptimizerBackend>,
    has_trainer: bool,
}

impl NnSolver {
    /// Resolves a config file and constructs the named optimizer in
    /// synchronous stepping mode.
    pub fn build(config_file: &str) -> Result<Self> {
        Self::build_mode(config_file, false)
    }

    /// As [`Self::build`], in async stepping mode: steps apply accumulated
    /// updates only, and gradient production is the caller's responsibility.
    pub fn build_async(config_file: &str) -> Result<Self> {
        Self::build_mode(config_file, true)
    }

    fn build_mode(config_file: &str, async_mode: bool) -> Result<Self> {
        let config = SolverConfig::load(config_file)?;
        let mut optimizer = config::build_optimizer(&config, async_mode)?;
        let has_trainer = optimizer.as_trainer().is_some();

        Ok(Self {
            optimizer,
            has_trainer,
        })
    }

    pub fn has_trainer(&self) -> bool {
        self.has_trainer
    }

    pub fn apply_steps(&mut self, steps: usize) {
        self.optimizer.step(steps);
    }

    pub fn forward_backward(&mut self) -> NnData {
        self.optimizer.forward_backward()
    }

    pub fn reset(&mut self) {
        self.optimizer.reset();
    }

    pub fn zero_grad(&mut self) {
        self.optimizer.zero_grad();
    }

    pub fn update(&mut self) {
        self.optimizer.apply_update();
    }

    pub fn iter(&self) -> usize {
        self.optimizer.iter()
    }

    pub fn net_params(&self, out: &mut Vec<NnData>) {
        self.optimizer.net_params(out);
    }

    pub fn set_net_params(&mut self, params: &[NnData]) -> Result<()> {
        self.optimizer.set_net_params(params)
    }

    /// Stages a matrix pair into the trainer capability, if the optimizer
    /// exposes one. Returns whether the data was ingested.
    pub fn ingest_data(&mut self, x: ArrayView2<NnData>, y: ArrayView2<NnData>) -> bool {
        match self.optimizer.as_trainer() {
            Some(trainer) => {
                trainer.ingest_data(x, y);
                true
            }
            None => false,
        }
    }
}
