//! The six optimizer update rules for the dense backend, resolved once at
//! construction time behind a single tagged variant.

use std::fs;

use ndarray::{Array2, ArrayView2};
use serde::Deserialize;

use super::DenseNet;
use crate::{
    Result,
    backend::{ModelBackend, NnData, OptimizerBackend, TrainerBackend},
    config::OptimizerKind,
    minibatch,
};

#[derive(Deserialize)]
struct SolverDescriptor {
    net: String,
    #[serde(default = "default_learning_rate")]
    learning_rate: NnData,
    #[serde(default = "default_momentum")]
    momentum: NnData,
    #[serde(default = "default_decay")]
    decay: NnData,
    #[serde(default = "default_epsilon")]
    epsilon: NnData,
    #[serde(default = "default_beta1")]
    beta1: NnData,
    #[serde(default = "default_beta2")]
    beta2: NnData,
}

fn default_learning_rate() -> NnData {
    0.01
}

fn default_momentum() -> NnData {
    0.9
}

fn default_decay() -> NnData {
    0.95
}

fn default_epsilon() -> NnData {
    1e-8
}

fn default_beta1() -> NnData {
    0.9
}

fn default_beta2() -> NnData {
    0.999
}

enum UpdateRule {
    Sgd {
        learning_rate: NnData,
    },
    Nesterov {
        learning_rate: NnData,
        momentum: NnData,
        velocity: Box<[NnData]>,
    },
    Adagrad {
        learning_rate: NnData,
        epsilon: NnData,
        g2: Box<[NnData]>,
    },
    Rmsprop {
        learning_rate: NnData,
        decay: NnData,
        epsilon: NnData,
        g2: Box<[NnData]>,
    },
    Adadelta {
        learning_rate: NnData,
        decay: NnData,
        epsilon: NnData,
        g2: Box<[NnData]>,
        dx2: Box<[NnData]>,
    },
    Adam {
        learning_rate: NnData,
        beta1: NnData,
        beta2: NnData,
        beta1_t: NnData,
        beta2_t: NnData,
        epsilon: NnData,
        v: Box<[NnData]>,
        s: Box<[NnData]>,
    },
}

impl UpdateRule {
    fn new(kind: OptimizerKind, desc: &SolverDescriptor, len: usize) -> Self {
        let zeros = || vec![0.0; len].into_boxed_slice();

        match kind {
            OptimizerKind::Sgd => UpdateRule::Sgd {
                learning_rate: desc.learning_rate,
            },
            OptimizerKind::Nesterov => UpdateRule::Nesterov {
                learning_rate: desc.learning_rate,
                momentum: desc.momentum,
                velocity: zeros(),
            },
            OptimizerKind::Adagrad => UpdateRule::Adagrad {
                learning_rate: desc.learning_rate,
                epsilon: desc.epsilon,
                g2: zeros(),
            },
            OptimizerKind::Rmsprop => UpdateRule::Rmsprop {
                learning_rate: desc.learning_rate,
                decay: desc.decay,
                epsilon: desc.epsilon,
                g2: zeros(),
            },
            OptimizerKind::Adadelta => UpdateRule::Adadelta {
                learning_rate: desc.learning_rate,
                decay: desc.decay,
                epsilon: desc.epsilon,
                g2: zeros(),
                dx2: zeros(),
            },
            OptimizerKind::Adam => UpdateRule::Adam {
                learning_rate: desc.learning_rate,
                beta1: desc.beta1,
                beta2: desc.beta2,
                beta1_t: 1.0,
                beta2_t: 1.0,
                epsilon: desc.epsilon,
                v: zeros(),
                s: zeros(),
            },
        }
    }

    fn update(&mut self, grad: &[NnData], weights: &mut [NnData]) {
        match self {
            UpdateRule::Sgd { learning_rate } => {
                let lr = *learning_rate;
                for (w, g) in weights.iter_mut().zip(grad) {
                    *w -= lr * g;
                }
            }
            UpdateRule::Nesterov {
                learning_rate,
                momentum,
                velocity,
            } => {
                let lr = *learning_rate;
                let mu = *momentum;
                weights
                    .iter_mut()
                    .zip(grad)
                    .zip(velocity.iter_mut())
                    .for_each(|((w, g), v)| {
                        let v_prev = *v;
                        *v = mu * v_prev - lr * g;
                        *w += -mu * v_prev + (1.0 + mu) * *v;
                    });
            }
            UpdateRule::Adagrad {
                learning_rate,
                epsilon,
                g2,
            } => {
                let lr = *learning_rate;
                let eps = *epsilon;
                weights
                    .iter_mut()
                    .zip(grad)
                    .zip(g2.iter_mut())
                    .for_each(|((w, g), acc)| {
                        *acc += g.powi(2);
                        *w -= lr * g / (acc.sqrt() + eps);
                    });
            }
            UpdateRule::Rmsprop {
                learning_rate,
                decay,
                epsilon,
                g2,
            } => {
                let lr = *learning_rate;
                let rho = *decay;
                let eps = *epsilon;
                weights
                    .iter_mut()
                    .zip(grad)
                    .zip(g2.iter_mut())
                    .for_each(|((w, g), acc)| {
                        *acc = rho * *acc + (1.0 - rho) * g.powi(2);
                        *w -= lr * g / (acc.sqrt() + eps);
                    });
            }
            UpdateRule::Adadelta {
                learning_rate,
                decay,
                epsilon,
                g2,
                dx2,
            } => {
                let lr = *learning_rate;
                let rho = *decay;
                let eps = *epsilon;
                weights
                    .iter_mut()
                    .zip(grad)
                    .zip(g2.iter_mut())
                    .zip(dx2.iter_mut())
                    .for_each(|(((w, g), acc), dacc)| {
                        *acc = rho * *acc + (1.0 - rho) * g.powi(2);
                        let dx = ((*dacc + eps).sqrt() / (*acc + eps).sqrt()) * g;
                        *dacc = rho * *dacc + (1.0 - rho) * dx.powi(2);
                        *w -= lr * dx;
                    });
            }
            UpdateRule::Adam {
                learning_rate,
                beta1,
                beta2,
                beta1_t,
                beta2_t,
                epsilon,
                v,
                s,
            } => {
                let lr = *learning_rate;
                let b1 = *beta1;
                let b2 = *beta2;
                let eps = *epsilon;

                *beta1_t *= b1;
                *beta2_t *= b2;
                let bc1 = 1.0 - *beta1_t;
                let bc2 = 1.0 - *beta2_t;
                let step_size = lr * (bc2.sqrt() / bc1);

                weights
                    .iter_mut()
                    .zip(grad)
                    .zip(v.iter_mut())
                    .zip(s.iter_mut())
                    .for_each(|(((w, g), v), s)| {
                        *v = b1 * *v + (1.0 - b1) * g;
                        *s = b2 * *s + (1.0 - b2) * g.powi(2);
                        *w -= step_size * *v / (s.sqrt() + eps);
                    });
            }
        }
    }

    fn reset(&mut self) {
        match self {
            UpdateRule::Sgd { .. } => {}
            UpdateRule::Nesterov { velocity, .. } => velocity.fill(0.0),
            UpdateRule::Adagrad { g2, .. } => g2.fill(0.0),
            UpdateRule::Rmsprop { g2, .. } => g2.fill(0.0),
            UpdateRule::Adadelta { g2, dx2, .. } => {
                g2.fill(0.0);
                dx2.fill(0.0);
            }
            UpdateRule::Adam {
                beta1_t,
                beta2_t,
                v,
                s,
                ..
            } => {
                *beta1_t = 1.0;
                *beta2_t = 1.0;
                v.fill(0.0);
                s.fill(0.0);
            }
        }
    }
}

/// The dense backend's optimizer: owns its own net plus the update rule and
/// the currently ingested minibatch.
pub struct DenseOptimizer {
    net: DenseNet,
    rule: UpdateRule,
    iter: usize,
    async_mode: bool,
    batch_x: Array2<NnData>,
    batch_y: Array2<NnData>,
    grad_buf: Vec<NnData>,
    param_buf: Vec<NnData>,
}

impl DenseOptimizer {
    /// Builds the optimizer from a backend-specific solver descriptor.
    ///
    /// The descriptor names the topology file and the hyperparameters; the
    /// optimizer kind was resolved by the config layer. A descriptor the
    /// backend cannot parse is a fatal construction error.
    pub fn from_descriptor(
        solver_file: &str,
        kind: OptimizerKind,
        async_mode: bool,
    ) -> Result<Self> {
        let text = fs::read_to_string(solver_file)?;
        let desc: SolverDescriptor = serde_json::from_str(&text)?;

        let mut net = DenseNet::new();
        net.load_net(&desc.net)?;
        let rule = UpdateRule::new(kind, &desc, net.num_params());

        Ok(Self {
            net,
            rule,
            iter: 0,
            async_mode,
            batch_x: Array2::zeros((0, 0)),
            batch_y: Array2::zeros((0, 0)),
            grad_buf: Vec::new(),
            param_buf: Vec::new(),
        })
    }

    fn has_data(&self) -> bool {
        self.batch_x.nrows() > 0
    }

    /// One averaged forward+backward pass over the ingested minibatch.
    fn batch_pass(&mut self) -> NnData {
        if !self.has_data() {
            return 0.0;
        }

        self.net.zero_grad();

        let rows = self.batch_x.nrows();
        let mut loss = 0.0;
        for i in 0..rows {
            let y_pred = self.net.forward(self.batch_x.row(i));
            let diff = &y_pred - &self.batch_y.row(i);
            loss += 0.5 * diff.mapv(|d| d * d).sum();
            self.net.backprop(diff.view());
        }

        let norm = 1.0 / rows as NnData;
        self.net.scale_grad(norm);
        loss * norm
    }
}

impl OptimizerBackend for DenseOptimizer {
    fn step(&mut self, steps: usize) {
        if self.async_mode {
            // Apply-only: gradients were produced by the caller's
            // forward-backward passes, never computed here.
            for _ in 0..steps {
                self.apply_update();
                self.iter += 1;
            }
            return;
        }

        for _ in 0..steps {
            self.batch_pass();
            self.apply_update();
            self.iter += 1;
        }
    }

    fn reset(&mut self) {
        self.rule.reset();
        self.iter = 0;
    }

    fn zero_grad(&mut self) {
        self.net.zero_grad();
    }

    fn apply_update(&mut self) {
        let Self {
            net,
            rule,
            grad_buf,
            param_buf,
            ..
        } = self;

        net.grad(grad_buf);
        net.get_params(param_buf);
        rule.update(grad_buf, param_buf);

        // Lengths are the net's own, set_params cannot fail here.
        let _ = net.set_params(param_buf);
    }

    fn forward_backward(&mut self) -> NnData {
        self.batch_pass()
    }

    fn iter(&self) -> usize {
        self.iter
    }

    fn net_params(&self, out: &mut Vec<NnData>) {
        self.net.get_params(out);
    }

    fn set_net_params(&mut self, params: &[NnData]) -> Result<()> {
        self.net.set_params(params)
    }

    fn as_trainer(&mut self) -> Option<&mut dyn TrainerBackend> {
        Some(self)
    }
}

impl TrainerBackend for DenseOptimizer {
    fn train_step(&mut self, iters: usize) -> NnData {
        self.step(iters);
        0.0
    }

    fn forward_backward(&mut self) -> NnData {
        self.batch_pass()
    }

    fn ingest_data(&mut self, x: ArrayView2<NnData>, y: ArrayView2<NnData>) {
        assert_eq!(x.nrows(), y.nrows());
        assert_eq!(x.ncols(), self.net.input_size());
        assert_eq!(y.ncols(), self.net.output_size());

        let rows = x.nrows();
        let staged_x = minibatch::stage(x, rows, x.ncols());
        let staged_y = minibatch::stage(y, rows, y.ncols());

        self.batch_x = Array2::from_shape_vec((rows, x.ncols()), staged_x).unwrap();
        self.batch_y = Array2::from_shape_vec((rows, y.ncols()), staged_y).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    const TOPOLOGY: &str = r#"{
        "input_size": 2,
        "layers": [
            { "name": "h1", "units": 4, "activation": "tanh" },
            { "name": "out", "units": 1, "activation": "linear" }
        ]
    }"#;

    fn write_solver(tag: &str, extra: &str) -> String {
        let dir = std::env::temp_dir();
        let topo_path = dir.join(format!("policy_net_opt_topo_{}_{tag}.json", std::process::id()));
        fs::write(&topo_path, TOPOLOGY).unwrap();

        let solver = format!(
            r#"{{ "net": "{}", "learning_rate": 0.1{extra} }}"#,
            topo_path.to_string_lossy()
        );
        let solver_path = dir.join(format!(
            "policy_net_opt_solver_{}_{tag}.json",
            std::process::id()
        ));
        fs::write(&solver_path, solver).unwrap();
        solver_path.to_string_lossy().into_owned()
    }

    fn toy_batch() -> (Array2<NnData>, Array2<NnData>) {
        (
            array![[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]],
            array![[0.0], [1.0], [1.0], [0.0]],
        )
    }

    fn build(kind: OptimizerKind, tag: &str, async_mode: bool) -> DenseOptimizer {
        let solver = write_solver(tag, "");
        let opt = DenseOptimizer::from_descriptor(&solver, kind, async_mode).unwrap();
        fs::remove_file(&solver).ok();
        opt
    }

    #[test]
    fn sync_stepping_reduces_loss() {
        let mut opt = build(OptimizerKind::Adam, "sync", false);
        let (x, y) = toy_batch();
        opt.ingest_data(x.view(), y.view());

        let before = OptimizerBackend::forward_backward(&mut opt);
        opt.step(200);
        let after = OptimizerBackend::forward_backward(&mut opt);

        assert!(after < before, "loss went {before} -> {after}");
        assert_eq!(opt.iter(), 200);
    }

    #[test]
    fn async_step_applies_without_computing_gradients() {
        let mut opt = build(OptimizerKind::Sgd, "async", true);
        let (x, y) = toy_batch();
        opt.ingest_data(x.view(), y.view());

        let mut before = Vec::new();
        opt.net_params(&mut before);

        // No gradients have been produced: apply-only steps are identity
        // for plain SGD, but the counter still advances.
        opt.zero_grad();
        opt.step(3);
        assert_eq!(opt.iter(), 3);

        let mut after = Vec::new();
        opt.net_params(&mut after);
        assert_eq!(before, after);

        // Once the caller runs forward-backward, the next step applies it.
        OptimizerBackend::forward_backward(&mut opt);
        opt.step(1);
        opt.net_params(&mut after);
        assert_ne!(before, after);
    }

    #[test]
    fn every_kind_constructs_and_steps() {
        const KINDS: [OptimizerKind; 6] = [
            OptimizerKind::Sgd,
            OptimizerKind::Nesterov,
            OptimizerKind::Adagrad,
            OptimizerKind::Rmsprop,
            OptimizerKind::Adadelta,
            OptimizerKind::Adam,
        ];

        let (x, y) = toy_batch();
        for (i, kind) in KINDS.into_iter().enumerate() {
            let mut opt = build(kind, &format!("all{i}"), false);
            opt.ingest_data(x.view(), y.view());

            let mut before = Vec::new();
            opt.net_params(&mut before);
            opt.step(5);

            let mut after = Vec::new();
            opt.net_params(&mut after);
            assert_ne!(before, after, "{kind:?} did not move the parameters");
        }
    }

    #[test]
    fn reset_clears_iteration_and_state() {
        let mut opt = build(OptimizerKind::Adam, "reset", false);
        let (x, y) = toy_batch();
        opt.ingest_data(x.view(), y.view());

        opt.step(10);
        assert_eq!(opt.iter(), 10);

        opt.reset();
        assert_eq!(opt.iter(), 0);
    }

    #[test]
    fn exposes_trainer_capability() {
        let mut opt = build(OptimizerKind::Sgd, "cap", false);
        assert!(opt.as_trainer().is_some());
    }

    #[test]
    fn forward_backward_without_data_is_zero() {
        let mut opt = build(OptimizerKind::Sgd, "nodata", false);
        assert_eq!(OptimizerBackend::forward_backward(&mut opt), 0.0);
    }
}
