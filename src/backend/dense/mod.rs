//! The `dense` reference backend: a small fully-connected network with named
//! layers, retained activation buffers and a flat, stable parameter ordering.

mod optimizer;

pub use optimizer::DenseOptimizer;

use std::{fs, str::FromStr};

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use super::{ModelBackend, NnData};
use crate::{Error, Result};

const INIT_STDDEV: NnData = 0.1;
const INIT_SEED: u64 = 0x5eed;

/// Activation functions available to topology documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Linear,
    Tanh,
    Sigmoid,
    Relu,
}

impl Activation {
    fn apply(self, z: NnData) -> NnData {
        match self {
            Activation::Linear => z,
            Activation::Tanh => z.tanh(),
            Activation::Sigmoid => 1.0 / (1.0 + (-z).exp()),
            Activation::Relu => z.max(0.0),
        }
    }

    fn derivative(self, z: NnData) -> NnData {
        match self {
            Activation::Linear => 1.0,
            Activation::Tanh => 1.0 - z.tanh().powi(2),
            Activation::Sigmoid => {
                let s = 1.0 / (1.0 + (-z).exp());
                s * (1.0 - s)
            }
            Activation::Relu => {
                if z > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

impl FromStr for Activation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(Activation::Linear),
            "tanh" => Ok(Activation::Tanh),
            "sigmoid" => Ok(Activation::Sigmoid),
            "relu" => Ok(Activation::Relu),
            _ => Err(Error::UnknownActivation(s.to_string())),
        }
    }
}

#[derive(Deserialize)]
struct TopologyDoc {
    input_size: usize,
    #[serde(default = "default_batch_size")]
    batch_size: usize,
    layers: Vec<LayerDoc>,
}

#[derive(Deserialize)]
struct LayerDoc {
    name: String,
    units: usize,
    activation: String,
}

#[derive(Serialize, Deserialize)]
struct CheckpointDoc {
    params: Vec<NnData>,
}

fn default_batch_size() -> usize {
    1
}

struct DenseLayer {
    name: String,
    weights: Array2<NnData>,
    bias: Array1<NnData>,
    activation: Activation,
    weighted_sums: Array1<NnData>,
    activations: Array1<NnData>,
    grad_w: Array2<NnData>,
    grad_b: Array1<NnData>,
}

impl DenseLayer {
    fn new<R: Rng>(name: String, inputs: usize, units: usize, act: Activation, rng: &mut R) -> Self {
        let mut weights = Array2::zeros((units, inputs));
        for w in weights.iter_mut() {
            let n: NnData = rng.sample(StandardNormal);
            *w = INIT_STDDEV * n;
        }

        Self {
            name,
            weights,
            bias: Array1::zeros(units),
            activation: act,
            weighted_sums: Array1::zeros(units),
            activations: Array1::zeros(units),
            grad_w: Array2::zeros((units, inputs)),
            grad_b: Array1::zeros(units),
        }
    }
}

fn outer(d: ArrayView1<NnData>, a: ArrayView1<NnData>) -> Array2<NnData> {
    let d2 = d.insert_axis(Axis(1));
    let a2 = a.insert_axis(Axis(0));
    d2.dot(&a2)
}

/// A fully-connected network. Each named layer retains the weighted sums and
/// activations of the most recent forward pass so layer state can be read,
/// overwritten and resumed from.
pub struct DenseNet {
    input_size: usize,
    batch_size: usize,
    layers: Vec<DenseLayer>,
    input: Array1<NnData>,
}

impl Default for DenseNet {
    fn default() -> Self {
        Self::new()
    }
}

impl DenseNet {
    pub fn new() -> Self {
        Self {
            input_size: 0,
            batch_size: 1,
            layers: Vec::new(),
            input: Array1::zeros(0),
        }
    }

    fn layer_index(&self, layer_name: &str) -> Option<usize> {
        self.layers.iter().position(|l| l.name == layer_name)
    }

    /// Forward pass assuming `x` already matches the input size.
    fn forward(&mut self, x: ArrayView1<NnData>) -> Array1<NnData> {
        self.input = x.to_owned();

        let mut a = self.input.clone();
        for layer in &mut self.layers {
            let act = layer.activation;
            let z = layer.weights.dot(&a) + &layer.bias;
            a = z.mapv(|v| act.apply(v));
            layer.weighted_sums = z;
            layer.activations = a.clone();
        }

        a
    }

    /// Resumes the forward pass starting at the layer after `from`, reusing
    /// whatever is currently in `from`'s activation buffer.
    fn forward_from(&mut self, from: usize) -> Array1<NnData> {
        let mut a = self.layers[from].activations.clone();
        for layer in &mut self.layers[from + 1..] {
            let act = layer.activation;
            let z = layer.weights.dot(&a) + &layer.bias;
            a = z.mapv(|v| act.apply(v));
            layer.weighted_sums = z;
            layer.activations = a.clone();
        }

        a
    }

    /// Backward pass from an output gradient, accumulating parameter
    /// gradients and returning the input gradient. Requires the buffers of a
    /// prior forward pass.
    fn backprop(&mut self, y_diff: ArrayView1<NnData>) -> Array1<NnData> {
        let mut delta = y_diff.to_owned();

        for l in (0..self.layers.len()).rev() {
            let act = self.layers[l].activation;
            let dz = self.layers[l].weighted_sums.mapv(|v| act.derivative(v));
            delta = &delta * &dz;

            let a_prev = if l == 0 {
                self.input.clone()
            } else {
                self.layers[l - 1].activations.clone()
            };

            self.layers[l].grad_w += &outer(delta.view(), a_prev.view());
            self.layers[l].grad_b += &delta;

            delta = self.layers[l].weights.t().dot(&delta);
        }

        delta
    }

    fn zero_grad(&mut self) {
        for layer in &mut self.layers {
            layer.grad_w.fill(0.0);
            layer.grad_b.fill(0.0);
        }
    }

    fn scale_grad(&mut self, factor: NnData) {
        for layer in &mut self.layers {
            layer.grad_w *= factor;
            layer.grad_b *= factor;
        }
    }

    /// Flat gradient vector in the same ordering as the parameters.
    fn grad(&self, out: &mut Vec<NnData>) {
        out.clear();
        for layer in &self.layers {
            out.extend(layer.grad_w.iter());
            out.extend(layer.grad_b.iter());
        }
    }
}

impl ModelBackend for DenseNet {
    fn load_net(&mut self, net_file: &str) -> Result<()> {
        let text = fs::read_to_string(net_file)?;
        let doc: TopologyDoc = serde_json::from_str(&text)?;

        // Deterministic initialization: a freshly loaded net is reproducible
        // across instances until a checkpoint or a training step touches it.
        let mut rng = <rand::rngs::StdRng as rand::SeedableRng>::seed_from_u64(INIT_SEED);

        let mut layers = Vec::with_capacity(doc.layers.len());
        let mut inputs = doc.input_size;
        for layer in doc.layers {
            let act: Activation = layer.activation.parse()?;
            layers.push(DenseLayer::new(layer.name, inputs, layer.units, act, &mut rng));
            inputs = layer.units;
        }

        self.input_size = doc.input_size;
        self.batch_size = doc.batch_size;
        self.input = Array1::zeros(doc.input_size);
        self.layers = layers;
        Ok(())
    }

    fn load_model(&mut self, model_file: &str) -> Result<()> {
        let text = fs::read_to_string(model_file)?;
        let doc: CheckpointDoc = serde_json::from_str(&text)?;
        self.set_params(&doc.params)
    }

    fn save_model(&self, out_file: &str) -> Result<()> {
        let mut params = Vec::with_capacity(self.num_params());
        self.get_params(&mut params);

        let text = serde_json::to_string(&CheckpointDoc { params })?;
        fs::write(out_file, text)?;
        Ok(())
    }

    fn eval(&mut self, x: ArrayView1<NnData>) -> Result<Array1<NnData>> {
        if self.layers.is_empty() {
            return Err(Error::NoModel);
        }
        if x.len() != self.input_size {
            return Err(Error::SizeMismatch {
                what: "eval input",
                got: x.len(),
                expected: self.input_size,
            });
        }

        Ok(self.forward(x))
    }

    fn eval_batch(&mut self, x: ArrayView2<NnData>) -> Result<Array2<NnData>> {
        let mut out = Array2::zeros((x.nrows(), self.output_size()));
        for (i, row) in x.rows().into_iter().enumerate() {
            let y = self.eval(row)?;
            out.row_mut(i).assign(&y);
        }

        Ok(out)
    }

    fn backward(&mut self, y_diff: ArrayView1<NnData>) -> Result<Array1<NnData>> {
        if self.layers.is_empty() {
            return Err(Error::NoModel);
        }
        if y_diff.len() != self.output_size() {
            return Err(Error::SizeMismatch {
                what: "backward output diff",
                got: y_diff.len(),
                expected: self.output_size(),
            });
        }

        Ok(self.backprop(y_diff))
    }

    fn input_size(&self) -> usize {
        self.input_size
    }

    fn output_size(&self) -> usize {
        match self.layers.last() {
            Some(layer) => layer.bias.len(),
            None => 0,
        }
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn num_params(&self) -> usize {
        self.layers
            .iter()
            .map(|l| l.weights.len() + l.bias.len())
            .sum()
    }

    fn get_params(&self, out: &mut Vec<NnData>) {
        out.clear();
        for layer in &self.layers {
            out.extend(layer.weights.iter());
            out.extend(layer.bias.iter());
        }
    }

    fn set_params(&mut self, params: &[NnData]) -> Result<()> {
        if params.len() != self.num_params() {
            return Err(Error::SizeMismatch {
                what: "params",
                got: params.len(),
                expected: self.num_params(),
            });
        }

        let mut offset = 0;
        for layer in &mut self.layers {
            for w in layer.weights.iter_mut() {
                *w = params[offset];
                offset += 1;
            }
            for b in layer.bias.iter_mut() {
                *b = params[offset];
                offset += 1;
            }
        }

        Ok(())
    }

    fn blend_params(
        &mut self,
        params: &[NnData],
        self_weight: NnData,
        other_weight: NnData,
    ) -> Result<()> {
        if params.len() != self.num_params() {
            return Err(Error::SizeMismatch {
                what: "blend params",
                got: params.len(),
                expected: self.num_params(),
            });
        }

        let mut offset = 0;
        for layer in &mut self.layers {
            for w in layer.weights.iter_mut() {
                *w = self_weight * *w + other_weight * params[offset];
                offset += 1;
            }
            for b in layer.bias.iter_mut() {
                *b = self_weight * *b + other_weight * params[offset];
                offset += 1;
            }
        }

        Ok(())
    }

    fn compare_params(&self, params: &[NnData]) -> bool {
        if params.len() != self.num_params() {
            return false;
        }

        let mut offset = 0;
        for layer in &self.layers {
            for w in layer.weights.iter() {
                if *w != params[offset] {
                    return false;
                }
                offset += 1;
            }
            for b in layer.bias.iter() {
                if *b != params[offset] {
                    return false;
                }
                offset += 1;
            }
        }

        true
    }

    fn has_layer(&self, layer_name: &str) -> bool {
        self.layer_index(layer_name).is_some()
    }

    fn forward_inject_noise_prefilled(
        &mut self,
        mean: NnData,
        stdev: NnData,
        layer_name: &str,
    ) -> Result<Array1<NnData>> {
        let idx = self
            .layer_index(layer_name)
            .ok_or_else(|| Error::MissingLayer(layer_name.to_string()))?;

        let mut rng = rand::rng();
        for v in self.layers[idx].activations.iter_mut() {
            let n: NnData = rng.sample(StandardNormal);
            *v += mean + stdev * n;
        }

        if idx + 1 == self.layers.len() {
            return Ok(self.layers[idx].activations.clone());
        }

        Ok(self.forward_from(idx))
    }

    fn layer_state(&self, layer_name: &str) -> Result<Array1<NnData>> {
        let idx = self
            .layer_index(layer_name)
            .ok_or_else(|| Error::MissingLayer(layer_name.to_string()))?;

        Ok(self.layers[idx].activations.clone())
    }

    fn set_layer_state(&mut self, state: ArrayView1<NnData>, layer_name: &str) -> Result<()> {
        let idx = self
            .layer_index(layer_name)
            .ok_or_else(|| Error::MissingLayer(layer_name.to_string()))?;

        let layer = &mut self.layers[idx];
        if state.len() != layer.activations.len() {
            return Err(Error::SizeMismatch {
                what: "layer state",
                got: state.len(),
                expected: layer.activations.len(),
            });
        }

        layer.activations.assign(&state);
        Ok(())
    }
}
