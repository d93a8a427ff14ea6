//! Backend-agnostic training/inference facade for a policy/value network:
//! a pluggable model and optimizer behind one object, with affine
//! input/output normalization, parameter blending and checkpointing.

pub mod backend;
pub mod config;
pub mod error;
pub mod minibatch;
pub mod net;
pub mod normalize;
pub mod solver;

pub use backend::{ModelBackend, NnData, OptimizerBackend, TrainerBackend};
pub use error::{Error, Result};
pub use net::{NeuralNet, Problem};
