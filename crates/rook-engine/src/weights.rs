//! Network topology and the flat set of named weight tensors it is built from.
//!
//! Tensor names follow one scheme:
//!
//! | prefix                      | shape                        |
//! |-----------------------------|------------------------------|
//! | `input`                     | `[F][112][3][3]`             |
//! | `residual.{i}.conv{1,2}`    | `[F][F][3][3]`               |
//! | `residual.{i}.se.{w1,b1,w2,b2}` | `[K][F]`, `[K]`, `[2F][K]`, `[2F]` |
//! | `policy1`, `policy`         | `[F][F][3][3]`, `[80][F][3][3]` (convolution head) |
//! | `policy`, `ip_pol`          | `[P][F][1][1]`, `[1858][P·64]` (classical head) |
//! | `value`, `ip1_val`, `ip2_val` | `[V][F][1][1]`, `[H][V·64]`, `[1 or 3][H]` |
//! | `moves_left`, `ip1_mov`, `ip2_mov` | `[M][F][1][1]`, `[H][M·64]`, `[1][H]` |
//!
//! Every prefix has `.weights` and `.biases`; convolutions may also carry
//! `.bn_means` and `.bn_stddivs`.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rook_core::{Result, RookError, BOARD_SQUARES};
use rook_nn::{BatchNorm, ConvWeights, FcWeights, SeParams, CONV_POLICY_PLANES, NUM_POLICY_OUTPUTS};
use serde::{Deserialize, Serialize};

/// Input planes per position.
pub const INPUT_PLANES: usize = 112;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyHead {
    /// Two 3×3 convolutions to 80 planes, gathered into move space.
    Convolution,
    /// 1×1 convolution then a fully-connected layer to 1858 logits.
    Classical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueHead {
    /// One tanh output.
    Scalar,
    /// Win/draw/loss logits, softmaxed on the host.
    Wdl,
}

impl ValueHead {
    pub fn outputs(self) -> usize {
        match self {
            ValueHead::Scalar => 1,
            ValueHead::Wdl => 3,
        }
    }
}

/// Shape of the residual tower and which heads it has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTopology {
    pub blocks: usize,
    pub filters: usize,
    /// SE bottleneck is `filters / se_ratio`; `None` without SE.
    pub se_ratio: Option<usize>,
    pub policy: PolicyHead,
    pub value: ValueHead,
    pub moves_left: bool,
}

impl NetworkTopology {
    /// SE bottleneck width. Zero for a zero ratio, which `validate` rejects.
    pub fn se_k(&self) -> Option<usize> {
        self.se_ratio.map(|r| self.filters.checked_div(r).unwrap_or(0))
    }

    pub fn validate(&self) -> Result<()> {
        if self.blocks == 0 || self.filters == 0 {
            return Err(RookError::UnsupportedTopology(format!(
                "{} blocks of {} filters",
                self.blocks, self.filters
            )));
        }
        if self.se_k() == Some(0) {
            return Err(RookError::UnsupportedTopology(format!(
                "SE ratio {:?} leaves no bottleneck for {} filters",
                self.se_ratio, self.filters
            )));
        }
        Ok(())
    }
}

/// Head widths used when generating random weights. Loaded networks infer
/// them from tensor shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadDims {
    pub policy_channels: usize,
    pub value_channels: usize,
    pub value_hidden: usize,
    pub moves_left_channels: usize,
    pub moves_left_hidden: usize,
}

impl Default for HeadDims {
    fn default() -> Self {
        Self {
            policy_channels: 32,
            value_channels: 32,
            value_hidden: 128,
            moves_left_channels: 8,
            moves_left_hidden: 128,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedTensor {
    pub name: String,
    pub dims: Vec<usize>,
    pub data: Vec<f32>,
}

impl NamedTensor {
    pub fn new(name: impl Into<String>, dims: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let name = name.into();
        let expected: usize = dims.iter().product();
        if expected != data.len() {
            return Err(RookError::shape(name, &dims, &[data.len()]));
        }
        Ok(Self { name, dims, data })
    }

    /// Tensor from little-endian `f32` bytes.
    pub fn from_le_bytes(name: impl Into<String>, dims: Vec<usize>, bytes: &[u8]) -> Result<Self> {
        let name = name.into();
        if bytes.len() % 4 != 0 {
            return Err(RookError::InvalidConfig(format!(
                "{}: {} bytes is not a whole number of f32",
                name,
                bytes.len()
            )));
        }
        let mut data = vec![0.0f32; bytes.len() / 4];
        bytemuck::cast_slice_mut::<f32, u8>(&mut data).copy_from_slice(bytes);
        if cfg!(target_endian = "big") {
            for v in &mut data {
                *v = f32::from_bits(u32::from_le(v.to_bits()));
            }
        }
        Self::new(name, dims, data)
    }
}

/// Flat, ordered set of named `f32` tensors.
#[derive(Debug, Clone, Default)]
pub struct WeightSet {
    tensors: Vec<NamedTensor>,
    index: HashMap<String, usize>,
}

impl WeightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tensor. A tensor with the same name is replaced.
    pub fn insert(&mut self, tensor: NamedTensor) {
        match self.index.get(&tensor.name) {
            Some(&i) => self.tensors[i] = tensor,
            None => {
                self.index.insert(tensor.name.clone(), self.tensors.len());
                self.tensors.push(tensor);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedTensor> {
        self.tensors.iter()
    }

    pub fn get(&self, name: &str) -> Option<&NamedTensor> {
        self.index.get(name).map(|&i| &self.tensors[i])
    }

    pub fn require(&self, name: &str) -> Result<&NamedTensor> {
        self.get(name).ok_or_else(|| RookError::MissingTensor(name.to_string()))
    }

    fn optional(&self, name: &str) -> Option<&[f32]> {
        self.get(name).map(|t| t.data.as_slice())
    }

    /// Leading dimension of `{prefix}.weights`: output channels of a
    /// convolution, outputs of a fully-connected layer.
    pub fn outputs_of(&self, prefix: &str) -> Result<usize> {
        let t = self.require(&format!("{}.weights", prefix))?;
        t.dims
            .first()
            .copied()
            .ok_or_else(|| RookError::shape(format!("{}.weights", prefix), &[1], &[]))
    }

    pub fn conv(&self, prefix: &str) -> Result<ConvWeights<'_>> {
        let filter = self.require(&format!("{}.weights", prefix))?;
        let bn = match (
            self.optional(&format!("{}.bn_means", prefix)),
            self.optional(&format!("{}.bn_stddivs", prefix)),
        ) {
            (Some(means), Some(stddivs)) => Some(BatchNorm { means, stddivs }),
            (None, None) => None,
            (Some(_), None) => return Err(RookError::MissingTensor(format!("{}.bn_stddivs", prefix))),
            (None, Some(_)) => return Err(RookError::MissingTensor(format!("{}.bn_means", prefix))),
        };
        Ok(ConvWeights {
            filter: &filter.data,
            bias: self.optional(&format!("{}.biases", prefix)),
            bn,
            dims: Some(&filter.dims),
        })
    }

    pub fn fc(&self, prefix: &str) -> Result<FcWeights<'_>> {
        let weights = self.require(&format!("{}.weights", prefix))?;
        Ok(FcWeights {
            weights: &weights.data,
            bias: self.optional(&format!("{}.biases", prefix)),
            dims: Some(&weights.dims),
        })
    }

    /// SE weights of residual block `block`. The declared shapes of `w1`
    /// and `w2` must agree with `[b1][c]` and `[b2][b1]`.
    pub fn se(&self, block: usize) -> Result<SeParams<'_>> {
        let prefix = format!("residual.{}.se", block);
        let w1 = self.require(&format!("{}.w1", prefix))?;
        let w2 = self.require(&format!("{}.w2", prefix))?;
        let b1 = self.data(&format!("{}.b1", prefix))?;
        let b2 = self.data(&format!("{}.b2", prefix))?;
        let (k, c2) = (b1.len(), b2.len());
        let c = c2 / 2;
        if w1.dims != [k, c] {
            return Err(RookError::shape(&w1.name, &[k, c], &w1.dims));
        }
        if w2.dims != [c2, k] {
            return Err(RookError::shape(&w2.name, &[c2, k], &w2.dims));
        }
        Ok(SeParams {
            w1: &w1.data,
            b1,
            w2: &w2.data,
            b2,
        })
    }

    fn data(&self, name: &str) -> Result<&[f32]> {
        Ok(&self.require(name)?.data)
    }

    /// Seeded random network. Weights are uniform in `±1/sqrt(fan_in)`;
    /// the stem carries batch-norm parameters so both normalization paths
    /// are exercised.
    pub fn random(topology: &NetworkTopology, dims: &HeadDims, seed: u64) -> Result<Self> {
        topology.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut set = WeightSet::new();
        let f = topology.filters;

        let layer = |set: &mut WeightSet, rng: &mut StdRng, prefix: &str, dims: Vec<usize>| -> Result<()> {
            let outputs = dims[0];
            let fan_in: usize = dims[1..].iter().product();
            let len: usize = dims.iter().product();
            let weights = uniform(rng, len, 1.0 / (fan_in.max(1) as f32).sqrt());
            let biases = uniform(rng, outputs, 0.1);
            set.insert(NamedTensor::new(format!("{}.weights", prefix), dims, weights)?);
            set.insert(NamedTensor::new(format!("{}.biases", prefix), vec![outputs], biases)?);
            Ok(())
        };

        layer(&mut set, &mut rng, "input", vec![f, INPUT_PLANES, 3, 3])?;
        let means = uniform(&mut rng, f, 0.1);
        let stddivs = (0..f).map(|_| rng.gen_range(0.8..1.2)).collect();
        set.insert(NamedTensor::new("input.bn_means", vec![f], means)?);
        set.insert(NamedTensor::new("input.bn_stddivs", vec![f], stddivs)?);

        for i in 0..topology.blocks {
            layer(&mut set, &mut rng, &format!("residual.{}.conv1", i), vec![f, f, 3, 3])?;
            layer(&mut set, &mut rng, &format!("residual.{}.conv2", i), vec![f, f, 3, 3])?;
            if let Some(k) = topology.se_k() {
                let prefix = format!("residual.{}.se", i);
                let (s1, s2) = (1.0 / (f as f32).sqrt(), 1.0 / (k as f32).sqrt());
                set.insert(NamedTensor::new(format!("{}.w1", prefix), vec![k, f], uniform(&mut rng, k * f, s1))?);
                set.insert(NamedTensor::new(format!("{}.b1", prefix), vec![k], uniform(&mut rng, k, 0.1))?);
                set.insert(NamedTensor::new(format!("{}.w2", prefix), vec![2 * f, k], uniform(&mut rng, 2 * f * k, s2))?);
                set.insert(NamedTensor::new(format!("{}.b2", prefix), vec![2 * f], uniform(&mut rng, 2 * f, 0.1))?);
            }
        }

        match topology.policy {
            PolicyHead::Convolution => {
                layer(&mut set, &mut rng, "policy1", vec![f, f, 3, 3])?;
                layer(&mut set, &mut rng, "policy", vec![CONV_POLICY_PLANES, f, 3, 3])?;
            }
            PolicyHead::Classical => {
                let p = dims.policy_channels;
                layer(&mut set, &mut rng, "policy", vec![p, f, 1, 1])?;
                layer(&mut set, &mut rng, "ip_pol", vec![NUM_POLICY_OUTPUTS, p * BOARD_SQUARES])?;
            }
        }

        let (v, vh) = (dims.value_channels, dims.value_hidden);
        layer(&mut set, &mut rng, "value", vec![v, f, 1, 1])?;
        layer(&mut set, &mut rng, "ip1_val", vec![vh, v * BOARD_SQUARES])?;
        layer(&mut set, &mut rng, "ip2_val", vec![topology.value.outputs(), vh])?;

        if topology.moves_left {
            let (m, mh) = (dims.moves_left_channels, dims.moves_left_hidden);
            layer(&mut set, &mut rng, "moves_left", vec![m, f, 1, 1])?;
            layer(&mut set, &mut rng, "ip1_mov", vec![mh, m * BOARD_SQUARES])?;
            layer(&mut set, &mut rng, "ip2_mov", vec![1, mh])?;
        }
        Ok(set)
    }
}

fn uniform(rng: &mut StdRng, len: usize, scale: f32) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-scale..scale)).collect()
}
