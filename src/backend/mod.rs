pub mod dense;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::Result;

/// The scalar type flowing through every backend.
pub type NnData = f64;

/// The contract a concrete network execution engine must satisfy.
///
/// The handle behind this trait is exclusively owned by the facade; backends
/// never leak internal buffers across this boundary. The flat parameter
/// ordering used by `get_params`/`set_params`/`blend_params`/`compare_params`
/// must be identical and stable across calls.
pub trait ModelBackend {
    /// Loads the network architecture from a topology file.
    fn load_net(&mut self, net_file: &str) -> Result<()>;

    /// Loads learnable parameters from a checkpoint file.
    fn load_model(&mut self, model_file: &str) -> Result<()>;

    /// Serializes the learnable parameters to a checkpoint file.
    fn save_model(&self, out_file: &str) -> Result<()>;

    /// One forward pass over a single input vector.
    fn eval(&mut self, x: ArrayView1<NnData>) -> Result<Array1<NnData>>;

    /// One forward pass per row of `x`.
    fn eval_batch(&mut self, x: ArrayView2<NnData>) -> Result<Array2<NnData>>;

    /// Backward pass given an output gradient, returning the input gradient.
    fn backward(&mut self, y_diff: ArrayView1<NnData>) -> Result<Array1<NnData>>;

    fn input_size(&self) -> usize;
    fn output_size(&self) -> usize;
    fn batch_size(&self) -> usize;
    fn num_params(&self) -> usize;

    /// Copies the flat parameter vector into `out`.
    fn get_params(&self, out: &mut Vec<NnData>);

    /// Overwrites the parameters from a flat vector in the same ordering.
    fn set_params(&mut self, params: &[NnData]) -> Result<()>;

    /// Per-parameter affine combination
    /// `new = self_weight * self + other_weight * params`.
    fn blend_params(
        &mut self,
        params: &[NnData],
        self_weight: NnData,
        other_weight: NnData,
    ) -> Result<()>;

    /// Exact, zero-tolerance equality against a flat parameter vector.
    fn compare_params(&self, params: &[NnData]) -> bool;

    fn has_layer(&self, layer_name: &str) -> bool;

    /// Adds Gaussian noise into the named layer's current activation buffer,
    /// then resumes the forward pass immediately after that layer.
    fn forward_inject_noise_prefilled(
        &mut self,
        mean: NnData,
        stdev: NnData,
        layer_name: &str,
    ) -> Result<Array1<NnData>>;

    /// Raw read of a named layer's activation buffer.
    fn layer_state(&self, layer_name: &str) -> Result<Array1<NnData>>;

    /// Raw write of a named layer's activation buffer.
    fn set_layer_state(&mut self, state: ArrayView1<NnData>, layer_name: &str) -> Result<()>;
}

/// The contract a concrete optimizer must satisfy.
///
/// In synchronous mode `step(n)` performs `n` full update cycles, computing
/// gradients internally. In async mode `step(n)` performs exactly `n`
/// apply-accumulated-update operations and advances the iteration counter by
/// `n` without computing any gradients; the caller drives `forward_backward`
/// to populate them.
pub trait OptimizerBackend {
    fn step(&mut self, steps: usize);

    /// Clears accumulated optimizer state and the iteration counter.
    fn reset(&mut self);

    /// Zeroes the gradient buffers.
    fn zero_grad(&mut self);

    /// Applies the currently accumulated update once.
    fn apply_update(&mut self);

    /// One forward+backward pass over the ingested data, returning the loss.
    fn forward_backward(&mut self) -> NnData;

    fn iter(&self) -> usize;

    /// Copies the optimizer net's flat parameter vector into `out`, in the
    /// same ordering as the model side.
    fn net_params(&self, out: &mut Vec<NnData>);

    /// Overwrites the optimizer net's parameters from a flat vector.
    fn set_net_params(&mut self, params: &[NnData]) -> Result<()>;

    /// Capability probe: the trainer interface, if this optimizer exposes it.
    fn as_trainer(&mut self) -> Option<&mut dyn TrainerBackend> {
        None
    }
}

/// Optional capability to ingest a matrix pair as one minibatch and train on
/// it directly.
pub trait TrainerBackend {
    fn train_step(&mut self, iters: usize) -> NnData;

    fn forward_backward(&mut self) -> NnData;

    /// Stages one `(X, Y)` matrix pair as the current minibatch.
    fn ingest_data(&mut self, x: ArrayView2<NnData>, y: ArrayView2<NnData>);
}
