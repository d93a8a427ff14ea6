//! The top-level facade: owns the model and optimizer handles, composes
//! normalization with every backend call and drives training.

use std::mem;

use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use parking_lot::Mutex;

use crate::{
    Error, Result,
    backend::{ModelBackend, NnData, dense::DenseNet},
    minibatch,
    normalize::{self, OffsetScale},
    solver::NnSolver,
};

/// Serializes checkpoint output process-wide so the parameter file and its
/// normalization sidecar are always written as one unit.
static OUTPUT_LOCK: Mutex<()> = Mutex::new(());

const DEFAULT_PASSES_PER_STEP: usize = 100;

/// A training problem: an input matrix, a target matrix with matching row
/// count, and the pass-count multiplier applied per minibatch.
#[derive(Debug, Clone)]
pub struct Problem {
    pub x: Array2<NnData>,
    pub y: Array2<NnData>,
    pub passes_per_step: usize,
}

impl Default for Problem {
    fn default() -> Self {
        Self {
            x: Array2::zeros((0, 0)),
            y: Array2::zeros((0, 0)),
            passes_per_step: DEFAULT_PASSES_PER_STEP,
        }
    }
}

impl Problem {
    pub fn new(x: Array2<NnData>, y: Array2<NnData>) -> Self {
        Self {
            x,
            y,
            ..Self::default()
        }
    }

    pub fn has_data(&self) -> bool {
        !self.x.is_empty()
    }
}

/// A learnable function approximator behind pluggable model and optimizer
/// backends.
///
/// The model handle and solver handle are independent: an instance can be
/// inference-only (valid model, no solver) or hold a solver whose first step
/// has not yet produced a valid model. All values are routed through the
/// normalization state before and after delegating to the backends.
pub struct NeuralNet {
    model: Option<Box<dyn ModelBackend>>,
    solver: Option<NnSolver>,
    offset_scale: OffsetScale,
    valid_model: bool,
    solver_file: String,
    async_mode: bool,
    param_buf: Vec<NnData>,
    grad_buf: Vec<NnData>,
}

impl Default for NeuralNet {
    fn default() -> Self {
        Self::new()
    }
}

impl NeuralNet {
    pub fn new() -> Self {
        Self {
            model: None,
            solver: None,
            offset_scale: OffsetScale::default(),
            valid_model: false,
            solver_file: String::new(),
            async_mode: false,
            param_buf: Vec::new(),
            grad_buf: Vec::new(),
        }
    }

    /// Drops both handles and empties the normalization state.
    pub fn clear(&mut self) {
        self.model = None;
        self.solver = None;
        self.valid_model = false;
        self.offset_scale.clear();
        self.grad_buf.clear();
    }

    fn ensure_model(&mut self) -> &mut Box<dyn ModelBackend> {
        self.model
            .get_or_insert_with(|| Box::new(DenseNet::new()))
    }

    /// Loads the network architecture, lazily constructing the model handle.
    /// Initializes identity normalization if none is present. An empty path
    /// is a no-op.
    pub fn load_net(&mut self, net_file: &str) -> Result<()> {
        if net_file.is_empty() {
            return Ok(());
        }

        self.ensure_model().load_net(net_file)?;
        info!("loaded net topology from {net_file}");

        if !self.offset_scale.valid() {
            let (input, output) = (self.input_size(), self.output_size());
            self.offset_scale.init_identity(input, output);
        }

        Ok(())
    }

    /// Loads parameter weights from a checkpoint, then leniently loads the
    /// companion normalization sidecar (a missing sidecar is not an error),
    /// and marks the model valid for inference. An empty path is a no-op.
    pub fn load_model(&mut self, model_file: &str) -> Result<()> {
        if model_file.is_empty() {
            return Ok(());
        }

        self.ensure_model().load_model(model_file)?;
        info!("loaded model weights from {model_file}");

        let scale_file = normalize::scale_file(model_file);
        let (input, output) = (self.input_size(), self.output_size());
        self.offset_scale.load_sidecar(&scale_file, input, output);

        self.sync_solver_params();
        self.valid_model = true;
        Ok(())
    }

    /// Resolves the config file and attaches the named optimizer, binding
    /// the trainer capability when the implementation exposes one. An empty
    /// path is a no-op.
    ///
    /// With `async_mode` set, solver steps apply accumulated updates only;
    /// the caller is responsible for producing gradients between steps.
    pub fn load_solver(&mut self, config_file: &str, async_mode: bool) -> Result<()> {
        if config_file.is_empty() {
            return Ok(());
        }

        self.solver_file = config_file.to_string();
        self.async_mode = async_mode;

        let solver = if async_mode {
            NnSolver::build_async(config_file)?
        } else {
            NnSolver::build(config_file)?
        };
        info!(
            "attached solver from {config_file} (async={async_mode}, trainer={})",
            solver.has_trainer()
        );
        self.solver = Some(solver);

        self.ensure_model();
        if !self.offset_scale.valid() {
            let (input, output) = (self.input_size(), self.output_size());
            self.offset_scale.init_identity(input, output);
        }

        self.sync_solver_params();
        Ok(())
    }

    /// Stages the problem into the trainer capability and requests
    /// `passes_per_step * ceil(rows / batch_size)` optimizer steps. Does
    /// nothing without a solver.
    pub fn train(&mut self, problem: &Problem) {
        if self.solver.is_none() {
            return;
        }

        self.load_train_data(problem);

        let batch_size = self.batch_size().max(1);
        let num_batches = problem.x.nrows().div_ceil(batch_size);
        self.step_solver(problem.passes_per_step * num_batches);
    }

    /// Ingests the problem and runs one forward+backward pass, returning the
    /// loss without taking an optimizer step. Returns 0 without a solver.
    pub fn forward_backward(&mut self, problem: &Problem) -> NnData {
        if self.solver.is_none() {
            return 0.0;
        }

        self.load_train_data(problem);
        match &mut self.solver {
            Some(solver) => solver.forward_backward(),
            None => 0.0,
        }
    }

    /// Requests `iters` optimizer steps, then synchronizes this facade's
    /// model parameters with the optimizer's and marks the model valid.
    pub fn step_solver(&mut self, iters: usize) {
        let Some(solver) = &mut self.solver else {
            return;
        };

        solver.apply_steps(iters);
        self.sync_net_params();
        self.valid_model = true;
    }

    /// Drops the solver handle and rebuilds it wholesale from the remembered
    /// config file and stepping mode.
    pub fn reset_solver(&mut self) -> Result<()> {
        self.solver = None;

        let solver_file = mem::take(&mut self.solver_file);
        if solver_file.is_empty() {
            return Ok(());
        }

        self.load_solver(&solver_file, self.async_mode)
    }

    /// Forward pass: normalize input, backend forward, unnormalize output.
    /// Succeeds with no solver attached.
    pub fn eval(&mut self, x: ArrayView1<NnData>) -> Result<Array1<NnData>> {
        let model = self.model.as_mut().ok_or(Error::NoModel)?;

        let mut nx = x.to_owned();
        self.offset_scale.normalize_input(nx.view_mut());

        let mut y = model.eval(nx.view())?;
        self.offset_scale.unnormalize_output(y.view_mut());
        Ok(y)
    }

    /// Batched [`Self::eval`] over the rows of `x`.
    pub fn eval_batch(&mut self, x: ArrayView2<NnData>) -> Result<Array2<NnData>> {
        let nx = self.normalize_input_matrix(x);
        let model = self.model.as_mut().ok_or(Error::NoModel)?;

        let mut y = model.eval_batch(nx.view())?;
        for row in y.rows_mut() {
            self.offset_scale.unnormalize_output(row);
        }

        Ok(y)
    }

    /// Backward pass: the precise dual of [`Self::eval`]'s value transforms.
    /// Unnormalizes the output gradient, runs the backend backward pass and
    /// normalizes the resulting input gradient.
    pub fn backward(&mut self, y_diff: ArrayView1<NnData>) -> Result<Array1<NnData>> {
        let model = self.model.as_mut().ok_or(Error::NoModel)?;

        let mut ny_diff = y_diff.to_owned();
        self.offset_scale.unnormalize_output_diff(ny_diff.view_mut());

        let mut x_diff = model.backward(ny_diff.view())?;
        self.offset_scale.normalize_input_diff(x_diff.view_mut());
        Ok(x_diff)
    }

    /// Bulk-copies all learnable parameters and all four normalization
    /// vectors from another instance and marks the model valid.
    pub fn copy_model(&mut self, other: &NeuralNet) -> Result<()> {
        let mut params = mem::take(&mut self.param_buf);
        other.model.as_ref().ok_or(Error::NoModel)?.get_params(&mut params);

        let model = self.model.as_mut().ok_or(Error::NoModel)?;
        model.set_params(&params)?;
        self.param_buf = params;

        self.offset_scale = other.offset_scale.clone();
        self.sync_solver_params();
        self.valid_model = true;
        Ok(())
    }

    /// Pushes another instance's parameter vector through this model's
    /// parameter write path, reusing a scratch buffer.
    pub fn copy_grad(&mut self, other: &NeuralNet) -> Result<()> {
        let mut grad = mem::take(&mut self.grad_buf);
        other.model.as_ref().ok_or(Error::NoModel)?.get_params(&mut grad);

        let model = self.model.as_mut().ok_or(Error::NoModel)?;
        let result = model.set_params(&grad);
        self.grad_buf = grad;
        result
    }

    /// Per-parameter affine combination
    /// `new = self_weight * self + other_weight * other`. Normalization
    /// vectors are not blended.
    pub fn blend_model(
        &mut self,
        other: &NeuralNet,
        self_weight: NnData,
        other_weight: NnData,
    ) -> Result<()> {
        let mut params = mem::take(&mut self.param_buf);
        other.model.as_ref().ok_or(Error::NoModel)?.get_params(&mut params);

        let model = self.model.as_mut().ok_or(Error::NoModel)?;
        model.blend_params(&params, self_weight, other_weight)?;
        self.param_buf = params;

        self.sync_solver_params();
        self.valid_model = true;
        Ok(())
    }

    /// [`Self::blend_model`] with weights `1 - lerp` and `lerp`.
    pub fn lerp_model(&mut self, other: &NeuralNet, lerp: NnData) -> Result<()> {
        self.blend_model(other, 1.0 - lerp, lerp)
    }

    /// Exact, zero-tolerance equality over every learnable parameter and all
    /// four normalization vectors. Intended for checkpoint round-trip
    /// verification, not convergence testing.
    pub fn compare_model(&self, other: &NeuralNet) -> bool {
        let (Some(model), Some(other_model)) = (&self.model, &other.model) else {
            return false;
        };

        let mut params = Vec::new();
        other_model.get_params(&mut params);

        model.compare_params(&params) && self.offset_scale == other.offset_scale
    }

    /// Adds Gaussian noise into the named layer's current activation buffer,
    /// resumes the forward pass after that layer and unnormalizes the result.
    pub fn forward_inject_noise_prefilled(
        &mut self,
        mean: NnData,
        stdev: NnData,
        layer_name: &str,
    ) -> Result<Array1<NnData>> {
        let model = self.model.as_mut().ok_or(Error::NoModel)?;

        let mut y = model.forward_inject_noise_prefilled(mean, stdev, layer_name)?;
        self.offset_scale.unnormalize_output(y.view_mut());
        Ok(y)
    }

    /// Raw read of a named layer's activation buffer.
    pub fn layer_state(&self, layer_name: &str) -> Result<Array1<NnData>> {
        self.model
            .as_ref()
            .ok_or(Error::NoModel)?
            .layer_state(layer_name)
    }

    /// Raw write of a named layer's activation buffer.
    pub fn set_layer_state(&mut self, state: ArrayView1<NnData>, layer_name: &str) -> Result<()> {
        self.model
            .as_mut()
            .ok_or(Error::NoModel)?
            .set_layer_state(state, layer_name)
    }

    /// Saves the checkpoint and its normalization sidecar under the
    /// process-wide output lock, so no reader ever observes a checkpoint
    /// with a mismatched or half-written sidecar. Does nothing without a
    /// model handle.
    pub fn output_model(&self, out_file: &str) -> Result<()> {
        let Some(model) = &self.model else {
            return Ok(());
        };

        let _output_lock = OUTPUT_LOCK.lock();
        model.save_model(out_file)?;
        self.offset_scale
            .write_sidecar(&normalize::scale_file(out_file))
    }

    pub fn has_net(&self) -> bool {
        self.model.is_some()
    }

    pub fn has_solver(&self) -> bool {
        self.solver.is_some()
    }

    pub fn has_layer(&self, layer_name: &str) -> bool {
        match &self.model {
            Some(model) => model.has_layer(layer_name),
            None => false,
        }
    }

    pub fn has_valid_model(&self) -> bool {
        self.valid_model
    }

    pub fn input_size(&self) -> usize {
        self.model.as_ref().map_or(0, |m| m.input_size())
    }

    pub fn output_size(&self) -> usize {
        self.model.as_ref().map_or(0, |m| m.output_size())
    }

    pub fn batch_size(&self) -> usize {
        self.model.as_ref().map_or(0, |m| m.batch_size())
    }

    pub fn num_params(&self) -> usize {
        self.model.as_ref().map_or(0, |m| m.num_params())
    }

    pub fn offset_scale(&self) -> &OffsetScale {
        &self.offset_scale
    }

    pub fn set_input_offset_scale(&mut self, offset: Array1<NnData>, scale: Array1<NnData>) {
        self.offset_scale.input_offset = offset;
        self.offset_scale.input_scale = scale;
    }

    pub fn set_output_offset_scale(&mut self, offset: Array1<NnData>, scale: Array1<NnData>) {
        self.offset_scale.output_offset = offset;
        self.offset_scale.output_scale = scale;
    }

    /// Per-column statistics over a sample matrix: offset is the negated
    /// mean, scale the inverse standard deviation (zero for a zero-variance
    /// column).
    pub fn calc_offset_scale(
        &self,
        x: ArrayView2<NnData>,
    ) -> (Array1<NnData>, Array1<NnData>) {
        normalize::calc_offset_scale(x)
    }

    /// Stages the (optionally normalized) matrices into the trainer
    /// capability. Silently does nothing when no solver or no trainer
    /// capability is attached.
    fn load_train_data(&mut self, problem: &Problem) {
        assert_eq!(
            problem.x.nrows(),
            problem.y.nrows(),
            "input and target row counts must match"
        );

        let Some(solver) = &mut self.solver else {
            return;
        };
        if !solver.has_trainer() {
            debug!("optimizer has no trainer capability, skipping data ingest");
            return;
        }

        let nx = if self.offset_scale.valid() {
            let rows = problem.x.nrows();
            let cols = problem.x.ncols();
            let staged = minibatch::stage_normalized(
                problem.x.view(),
                rows,
                cols,
                self.offset_scale.input_offset.view(),
                self.offset_scale.input_scale.view(),
            );
            Array2::from_shape_vec((rows, cols), staged).unwrap()
        } else {
            problem.x.clone()
        };

        let ny = if self.offset_scale.valid() {
            let rows = problem.y.nrows();
            let cols = problem.y.ncols();
            let staged = minibatch::stage_normalized(
                problem.y.view(),
                rows,
                cols,
                self.offset_scale.output_offset.view(),
                self.offset_scale.output_scale.view(),
            );
            Array2::from_shape_vec((rows, cols), staged).unwrap()
        } else {
            problem.y.clone()
        };

        solver.ingest_data(nx.view(), ny.view());
    }

    fn normalize_input_matrix(&self, x: ArrayView2<NnData>) -> Array2<NnData> {
        if !self.offset_scale.valid() {
            return x.to_owned();
        }

        let rows = x.nrows();
        let cols = x.ncols();
        let staged = minibatch::stage_normalized(
            x,
            rows,
            cols,
            self.offset_scale.input_offset.view(),
            self.offset_scale.input_scale.view(),
        );
        Array2::from_shape_vec((rows, cols), staged).unwrap()
    }

    /// Copies this facade's parameters into the optimizer's net. Skipped
    /// with a log entry when either side is absent or the sizes disagree.
    fn sync_solver_params(&mut self) {
        let (Some(model), Some(solver)) = (&self.model, &mut self.solver) else {
            return;
        };
        if model.num_params() == 0 {
            return;
        }

        let mut params = mem::take(&mut self.param_buf);
        model.get_params(&mut params);
        if let Err(e) = solver.set_net_params(&params) {
            warn!("skipping model -> solver param sync: {e}");
        }
        self.param_buf = params;
    }

    /// Copies the optimizer's current parameters into this facade's model.
    fn sync_net_params(&mut self) {
        let (Some(model), Some(solver)) = (&mut self.model, &self.solver) else {
            return;
        };

        let mut params = mem::take(&mut self.param_buf);
        solver.net_params(&mut params);
        if let Err(e) = model.set_params(&params) {
            warn!("skipping solver -> model param sync: {e}");
        }
        self.param_buf = params;
    }
}
