//! The search-facing engine: a loaded network, its contexts and staging.

use half::f16;
use rook_core::{DType, DeviceCaps, Element, Result, RookError, Stream};
use rook_nn::WeightLoader;
use serde::{Deserialize, Serialize};

use crate::computation::Computation;
use crate::config::{EngineConfig, ExecutionMode, LeasePolicy};
use crate::context::{ComputeContext, ContextPool, ACTIVATION_BUFFERS};
use crate::network::{Network, NetworkOptions};
use crate::staging::{PositionPlanes, StagingBuffer, StagingPool};
use crate::weights::{NetworkTopology, ValueHead, WeightSet};

/// Value head output of one position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Expected score in [-1, 1].
    Scalar(f32),
    /// Win, draw and loss probabilities.
    Wdl([f32; 3]),
}

impl Value {
    /// Expected score from the side to move.
    pub fn q(&self) -> f32 {
        match *self {
            Value::Scalar(q) => q,
            Value::Wdl([w, _, l]) => w - l,
        }
    }

    /// Draw probability; zero for scalar heads.
    pub fn d(&self) -> f32 {
        match *self {
            Value::Scalar(_) => 0.0,
            Value::Wdl([_, d, _]) => d,
        }
    }
}

/// Evaluation of one position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    /// Raw policy logits in move-index order.
    pub policy: Vec<f32>,
    pub value: Value,
    pub moves_left: Option<f32>,
}

impl EvalResult {
    fn from_staging(io: &StagingBuffer, i: usize) -> Self {
        let raw = io.value(i);
        let value = match raw {
            [w, d, l] => {
                let p = softmax(&[*w, *d, *l]);
                Value::Wdl([p[0], p[1], p[2]])
            }
            _ => Value::Scalar(raw.first().copied().unwrap_or(0.0)),
        };
        Self {
            policy: io.policy(i).to_vec(),
            value,
            moves_left: io.moves_left(i),
        }
    }
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

struct Inner<T: Element> {
    network: Network<T>,
    contexts: ContextPool<T>,
}

impl<T: Element> Inner<T> {
    fn build(config: &EngineConfig, topology: &NetworkTopology, weights: &WeightSet, caps: DeviceCaps) -> Result<Self> {
        let stream = Stream::new(&config.device)?;
        let loader = WeightLoader::new(&stream, caps);
        let opts = NetworkOptions {
            layout: config.layout,
            mode: config.mode,
            max_batch: config.max_batch_size,
        };
        let network = Network::build(topology, weights, opts, &loader)?;
        let contexts = (0..config.concurrency)
            .map(|_| ComputeContext::new(&config.device, network.workspace_len(), network.activation_len()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            network,
            contexts: ContextPool::new(contexts),
        })
    }

    fn run(&self, policy: LeasePolicy, io: &mut StagingBuffer, n: usize) -> Result<()> {
        let mut ctx = self.contexts.lease_with(policy)?;
        self.network.forward(&mut ctx, io, n)
    }

    fn context_bytes(&self) -> usize {
        let elements = self.network.workspace_len() + ACTIVATION_BUFFERS * self.network.activation_len();
        T::DTYPE.storage_bytes(elements) * self.contexts.size()
    }
}

enum Backend {
    F32(Inner<f32>),
    F16(Inner<f16>),
}

/// A network resident on one device, ready to evaluate batches.
///
/// `evaluate` may be called from several threads at once; each call leases
/// one computation context for its whole batch.
pub struct Engine {
    config: EngineConfig,
    caps: DeviceCaps,
    topology: NetworkTopology,
    backend: Backend,
    staging: StagingPool,
}

impl Engine {
    pub fn new(config: EngineConfig, topology: &NetworkTopology, weights: &WeightSet) -> Result<Self> {
        let caps = config.effective_caps()?;
        config.validate(&caps)?;
        if config.mode == ExecutionMode::Decomposed && !caps.vendor_convolution {
            tracing::warn!(device = %config.device, "no vendor convolution; decomposed mode runs Winograd convolutions");
        }

        let backend = match config.precision {
            DType::F32 => Backend::F32(Inner::build(&config, topology, weights, caps)?),
            DType::F16 => Backend::F16(Inner::build(&config, topology, weights, caps)?),
        };
        let staging = StagingPool::new(
            config.device,
            config.max_batch_size,
            topology.value == ValueHead::Wdl,
            topology.moves_left,
        );
        let engine = Self {
            config,
            caps,
            topology: *topology,
            backend,
            staging,
        };
        tracing::info!(
            device = %engine.config.device,
            precision = ?engine.config.precision,
            layout = %engine.config.layout,
            mode = ?engine.config.mode,
            blocks = topology.blocks,
            filters = topology.filters,
            fused_blocks = engine.fused_blocks(),
            contexts = engine.config.concurrency,
            max_batch = engine.config.max_batch_size,
            context_mib = engine.context_bytes() / (1 << 20),
            "engine ready"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    pub fn topology(&self) -> &NetworkTopology {
        &self.topology
    }

    pub fn max_batch_size(&self) -> usize {
        self.config.max_batch_size
    }

    /// Whether residual blocks run as fused Winograd chains.
    pub fn fused_blocks(&self) -> bool {
        match &self.backend {
            Backend::F32(inner) => inner.network.fused_blocks(),
            Backend::F16(inner) => inner.network.fused_blocks(),
        }
    }

    /// Layer kinds in execution order.
    pub fn layer_names(&self) -> Vec<&'static str> {
        match &self.backend {
            Backend::F32(inner) => inner.network.layer_names(),
            Backend::F16(inner) => inner.network.layer_names(),
        }
    }

    /// Device bytes held by all computation contexts.
    pub fn context_bytes(&self) -> usize {
        match &self.backend {
            Backend::F32(inner) => inner.context_bytes(),
            Backend::F16(inner) => inner.context_bytes(),
        }
    }

    /// Evaluate up to `max_batch_size` positions, one result per input in
    /// input order. Blocks until a context is free unless the lease policy
    /// is `NoWait`.
    pub fn evaluate(&self, positions: &[PositionPlanes]) -> Result<Vec<EvalResult>> {
        let n = positions.len();
        if n == 0 {
            return Ok(Vec::new());
        }
        if n > self.config.max_batch_size {
            return Err(RookError::BatchTooLarge {
                requested: n,
                capacity: self.config.max_batch_size,
            });
        }

        let mut io = self.staging.acquire()?;
        for (i, planes) in positions.iter().enumerate() {
            io.set_position(i, planes)?;
        }
        let policy = self.config.lease_policy;
        match &self.backend {
            Backend::F32(inner) => inner.run(policy, &mut io, n)?,
            Backend::F16(inner) => inner.run(policy, &mut io, n)?,
        }
        Ok((0..n).map(|i| EvalResult::from_staging(&io, i)).collect())
    }

    /// Start a batch that is filled one position at a time.
    pub fn new_computation(&self) -> Computation<'_> {
        Computation::new(self)
    }
}
