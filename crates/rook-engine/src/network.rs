//! Network graph executor.
//!
//! The tower is flattened at build time into a list of steps over three
//! rotating activation slots: slot 0 receives the expanded input planes,
//! the trunk hops between slots block by block, and each head works in the
//! two slots the trunk output is not in before emitting into the staging
//! buffer.

use rook_core::{
    Activation, DevSlice, DevSliceMut, DeviceBuffer, DeviceCaps, Element, Layout, Result, RookError, TensorShape,
    BOARD_SQUARES,
};
use rook_kernels::ops;
use rook_nn::{
    Conv1Layer, ConvLayer, ConvOptions, FcLayer, FusedWinogradConvSeLayer, Handles, Layer, LayerOps,
    LayerWeights, PolicyMapLayer, ResidualBlock, SeLayer, WeightLoader, NUM_POLICY_OUTPUTS,
};

use crate::config::ExecutionMode;
use crate::context::{ComputeContext, ACTIVATION_BUFFERS};
use crate::staging::{HeadOutput, StagingBuffer};
use crate::weights::{NetworkTopology, PolicyHead, ValueHead, WeightSet, INPUT_PLANES};

/// Build-time choices that are not part of the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkOptions {
    pub layout: Layout,
    pub mode: ExecutionMode,
    pub max_batch: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    /// Layers exist but hold no weights.
    Uninitialized,
    Ready,
}

/// Which tensors a step loads.
enum WeightRef {
    Conv(String),
    Fc(String),
    PolicyMap,
    Se { block: usize },
    FusedWinograd { conv: String, se_block: Option<usize> },
    Residual { block: usize, se: bool },
}

impl WeightRef {
    fn resolve<'w>(&self, w: &'w WeightSet) -> Result<LayerWeights<'w>> {
        Ok(match self {
            WeightRef::Conv(prefix) => LayerWeights::Conv(w.conv(prefix)?),
            WeightRef::Fc(prefix) => LayerWeights::Fc(w.fc(prefix)?),
            WeightRef::PolicyMap => LayerWeights::PolicyMap,
            WeightRef::Se { block } => LayerWeights::Se {
                se: w.se(*block)?,
                prev_bias: None,
            },
            WeightRef::FusedWinograd { conv, se_block } => LayerWeights::FusedWinograd {
                conv: w.conv(conv)?,
                se: se_block.map(|b| w.se(b)).transpose()?,
            },
            WeightRef::Residual { block, se } => LayerWeights::Residual {
                conv1: w.conv(&format!("residual.{}.conv1", block))?,
                conv2: w.conv(&format!("residual.{}.conv2", block))?,
                se: if *se { Some(w.se(*block)?) } else { None },
            },
        })
    }
}

struct Step<T: Element> {
    layer: Layer<T>,
    weights: WeightRef,
    input: usize,
    output: usize,
    skip: Option<usize>,
}

enum Op<T: Element> {
    Run(Step<T>),
    /// Copy `len` values per sample from `slot` into a staging output.
    Emit { head: HeadOutput, slot: usize, len: usize },
}

struct Builder<T: Element> {
    ops: Vec<Op<T>>,
    shapes: [Option<TensorShape>; ACTIVATION_BUFFERS],
    layout: Layout,
    fused: bool,
}

impl<T: Element> Builder<T> {
    fn shape(&self, slot: usize) -> Result<TensorShape> {
        self.shapes[slot].ok_or_else(|| RookError::InvalidConfig(format!("activation slot {} read before written", slot)))
    }

    fn push(&mut self, layer: Layer<T>, weights: WeightRef, input: usize, output: usize, skip: Option<usize>) -> Result<()> {
        if input == output || skip == Some(output) {
            return Err(RookError::InvalidConfig(format!("{} reads the slot it writes", layer.name())));
        }
        let have = self.shape(input)?;
        let want = layer.input_shape();
        if have != want {
            return Err(RookError::shape(format!("{} input", layer.name()), &want.dims(), &have.dims()));
        }
        if let Some(s) = skip {
            let skip_shape = self.shape(s)?;
            if skip_shape != layer.output_shape() {
                return Err(RookError::shape(
                    format!("{} skip", layer.name()),
                    &layer.output_shape().dims(),
                    &skip_shape.dims(),
                ));
            }
        }
        self.shapes[output] = Some(layer.output_shape());
        self.ops.push(Op::Run(Step { layer, weights, input, output, skip }));
        Ok(())
    }

    fn emit(&mut self, head: HeadOutput, slot: usize, len: usize) -> Result<()> {
        let have = self.shape(slot)?;
        if have.sample_len() != len {
            return Err(RookError::shape(format!("{:?} output", head), &[len], &[have.sample_len()]));
        }
        self.ops.push(Op::Emit { head, slot, len });
        Ok(())
    }

    /// 3×3 convolution with bias in the configured mode.
    fn conv3(&mut self, prefix: &str, c_in: usize, c_out: usize, relu: bool, io: (usize, usize), skip: Option<usize>) -> Result<()> {
        let skip_add = skip.is_some();
        let (layer, weights) = if self.fused {
            (
                Layer::FusedWinograd(FusedWinogradConvSeLayer::new(c_in, c_out, self.layout, relu, true, skip_add)),
                WeightRef::FusedWinograd { conv: prefix.to_string(), se_block: None },
            )
        } else {
            let opts = ConvOptions { filter_size: 3, relu, use_bias: true, skip_add };
            (
                Layer::Conv(ConvLayer::new(c_in, c_out, self.layout, opts)),
                WeightRef::Conv(prefix.to_string()),
            )
        };
        self.push(layer, weights, io.0, io.1, skip)
    }

    /// 1×1 convolution head stem, then two fully-connected layers.
    fn dense_head(
        &mut self,
        w: &WeightSet,
        names: [&str; 3],
        trunk: usize,
        channels_in: usize,
        acts: (Activation, Activation),
    ) -> Result<usize> {
        let (t1, t2) = others(trunk);
        let channels = w.outputs_of(names[0])?;
        self.push(
            Layer::Conv1(Conv1Layer::new(channels_in, channels, self.layout, true)),
            WeightRef::Conv(names[0].to_string()),
            trunk,
            t1,
            None,
        )?;
        let hidden = w.outputs_of(names[1])?;
        let fc1 = FcLayer::new(self.shape(t1)?, hidden, acts.0);
        self.push(Layer::Fc(fc1), WeightRef::Fc(names[1].to_string()), t1, t2, None)?;
        let outputs = w.outputs_of(names[2])?;
        let fc2 = FcLayer::new(self.shape(t2)?, outputs, acts.1);
        self.push(Layer::Fc(fc2), WeightRef::Fc(names[2].to_string()), t2, t1, None)?;
        Ok(t1)
    }
}

fn others(slot: usize) -> (usize, usize) {
    ((slot + 1) % ACTIVATION_BUFFERS, (slot + 2) % ACTIVATION_BUFFERS)
}

/// The residual tower with its heads, resident on one device.
pub struct Network<T: Element> {
    topology: NetworkTopology,
    opts: NetworkOptions,
    caps: DeviceCaps,
    ops: Vec<Op<T>>,
    fused_blocks: bool,
    state: NetworkState,
    workspace_len: usize,
    activation_len: usize,
}

impl<T: Element> Network<T> {
    /// Lay out the layers for `topology`. Head widths are read from the
    /// shapes in `weights`; nothing is uploaded yet.
    pub fn new(topology: &NetworkTopology, weights: &WeightSet, opts: NetworkOptions, caps: DeviceCaps) -> Result<Self> {
        topology.validate()?;
        if opts.max_batch == 0 {
            return Err(RookError::InvalidConfig("max_batch must be at least 1".into()));
        }
        let f = topology.filters;
        let se_k = topology.se_k();
        let fused = opts.mode == ExecutionMode::Fused;
        let fused_blocks = fused && caps.can_fuse_residual(f, se_k.unwrap_or(0), T::DTYPE);
        let mut b = Builder::<T> {
            ops: Vec::new(),
            shapes: [Some(TensorShape::board(1, INPUT_PLANES)), None, None],
            layout: opts.layout,
            fused,
        };

        b.conv3("input", INPUT_PLANES, f, true, (0, 1), None)?;
        let mut cur = 1;

        for i in 0..topology.blocks {
            let (t1, t2) = others(cur);
            if fused_blocks {
                let mut block = ResidualBlock::new(f, opts.layout, i == 0, i + 1 == topology.blocks);
                if let Some(k) = se_k {
                    block = block.with_se(k);
                }
                let weights = WeightRef::Residual { block: i, se: se_k.is_some() };
                b.push(Layer::Residual(block), weights, cur, t1, None)?;
                cur = t1;
                continue;
            }

            let conv1 = format!("residual.{}.conv1", i);
            let conv2 = format!("residual.{}.conv2", i);
            b.conv3(&conv1, f, f, true, (cur, t1), None)?;
            match se_k {
                None => {
                    b.conv3(&conv2, f, f, true, (t1, t2), Some(cur))?;
                    cur = t2;
                }
                Some(k) if fused && caps.can_fuse_se(f, k) => {
                    let layer = FusedWinogradConvSeLayer::new(f, f, opts.layout, true, true, true).with_se(k);
                    let weights = WeightRef::FusedWinograd { conv: conv2, se_block: Some(i) };
                    b.push(Layer::FusedWinograd(layer), weights, t1, t2, Some(cur))?;
                    cur = t2;
                }
                Some(k) => {
                    b.conv3(&conv2, f, f, false, (t1, t2), None)?;
                    let mut se = SeLayer::new(f, k, opts.layout, true, false);
                    if !fused {
                        se = se.decomposed();
                    }
                    b.push(Layer::Se(se), WeightRef::Se { block: i }, t2, t1, Some(cur))?;
                    cur = t1;
                }
            }
        }

        let trunk = cur;
        let (t1, t2) = others(trunk);
        match topology.policy {
            PolicyHead::Convolution => {
                b.conv3("policy1", f, f, true, (trunk, t1), None)?;
                let planes = weights.outputs_of("policy")?;
                b.conv3("policy", f, planes, false, (t1, t2), None)?;
                b.push(Layer::PolicyMap(PolicyMapLayer::new(opts.layout)), WeightRef::PolicyMap, t2, t1, None)?;
                b.emit(HeadOutput::Policy, t1, NUM_POLICY_OUTPUTS)?;
            }
            PolicyHead::Classical => {
                let channels = weights.outputs_of("policy")?;
                b.push(
                    Layer::Conv1(Conv1Layer::new(f, channels, opts.layout, true)),
                    WeightRef::Conv("policy".into()),
                    trunk,
                    t1,
                    None,
                )?;
                let fc = FcLayer::new(b.shape(t1)?, NUM_POLICY_OUTPUTS, Activation::None);
                b.push(Layer::Fc(fc), WeightRef::Fc("ip_pol".into()), t1, t2, None)?;
                b.emit(HeadOutput::Policy, t2, NUM_POLICY_OUTPUTS)?;
            }
        }

        let value_act = match topology.value {
            ValueHead::Scalar => Activation::Tanh,
            ValueHead::Wdl => Activation::None,
        };
        let slot = b.dense_head(weights, ["value", "ip1_val", "ip2_val"], trunk, f, (Activation::Relu, value_act))?;
        b.emit(HeadOutput::Value, slot, topology.value.outputs())?;

        if topology.moves_left {
            let slot = b.dense_head(
                weights,
                ["moves_left", "ip1_mov", "ip2_mov"],
                trunk,
                f,
                (Activation::Relu, Activation::Relu),
            )?;
            b.emit(HeadOutput::MovesLeft, slot, 1)?;
        }

        let mut workspace_len = 0;
        let mut per_sample = INPUT_PLANES * BOARD_SQUARES;
        for op in &b.ops {
            if let Op::Run(step) = op {
                workspace_len = workspace_len.max(step.layer.workspace_size(opts.max_batch));
                per_sample = per_sample
                    .max(step.layer.input_shape().sample_len())
                    .max(step.layer.output_shape().sample_len());
            }
        }

        tracing::debug!(
            blocks = topology.blocks,
            filters = f,
            se_k = ?se_k,
            mode = ?opts.mode,
            fused_blocks,
            steps = b.ops.len(),
            "network laid out"
        );
        Ok(Self {
            topology: *topology,
            opts,
            caps,
            ops: b.ops,
            fused_blocks,
            state: NetworkState::Uninitialized,
            workspace_len,
            activation_len: opts.max_batch * per_sample,
        })
    }

    /// Upload every layer's weights, tower first, then the heads in
    /// policy, value, moves-left order.
    pub fn load(&mut self, loader: &WeightLoader<'_>, weights: &WeightSet) -> Result<()> {
        for op in &mut self.ops {
            if let Op::Run(step) = op {
                let w = step.weights.resolve(weights)?;
                step.layer.load(loader, &w)?;
            }
        }
        self.state = NetworkState::Ready;
        tracing::debug!(workspace = self.workspace_len, activations = self.activation_len, "network weights loaded");
        Ok(())
    }

    /// [`Network::new`] followed by [`Network::load`].
    pub fn build(
        topology: &NetworkTopology,
        weights: &WeightSet,
        opts: NetworkOptions,
        loader: &WeightLoader<'_>,
    ) -> Result<Self> {
        let mut net = Self::new(topology, weights, opts, *loader.caps())?;
        net.load(loader, weights)?;
        Ok(net)
    }

    pub fn state(&self) -> NetworkState {
        self.state
    }

    pub fn topology(&self) -> &NetworkTopology {
        &self.topology
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    pub fn max_batch(&self) -> usize {
        self.opts.max_batch
    }

    /// Whether residual blocks run as fused Winograd chains.
    pub fn fused_blocks(&self) -> bool {
        self.fused_blocks
    }

    /// Workspace elements a context needs.
    pub fn workspace_len(&self) -> usize {
        self.workspace_len
    }

    /// Elements of each activation buffer.
    pub fn activation_len(&self) -> usize {
        self.activation_len
    }

    /// Layer kinds in execution order.
    pub fn layer_names(&self) -> Vec<&'static str> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Run(step) => Some(step.layer.name()),
                Op::Emit { .. } => None,
            })
            .collect()
    }

    /// Evaluate the first `n` positions staged in `io` on `ctx`. Outputs
    /// are in `io` when this returns.
    pub fn forward(&self, ctx: &mut ComputeContext<T>, io: &mut StagingBuffer, n: usize) -> Result<()> {
        if self.state != NetworkState::Ready {
            return Err(RookError::NotReady);
        }
        let capacity = self.opts.max_batch.min(io.capacity());
        if n > capacity {
            return Err(RookError::BatchTooLarge { requested: n, capacity });
        }
        if n == 0 {
            return Ok(());
        }
        let ComputeContext {
            stream,
            blas,
            dnn,
            workspace,
            activations,
        } = ctx;
        let stream = &*stream;
        let h = Handles {
            stream,
            blas: &*blas,
            dnn: &*dnn,
            caps: &self.caps,
        };
        tracing::trace!(n, steps = self.ops.len(), "forward");

        io.upload_inputs(stream, n)?;
        {
            let (masks, values) = io.device_inputs();
            let mut input = activations[0].view_mut();
            ops::expand_planes(stream, &mut input, masks, values, n, INPUT_PLANES, self.opts.layout)?;
        }

        for op in &self.ops {
            match op {
                Op::Run(step) => {
                    let (mut out, views) = slot_views(activations, step.output)?;
                    let input = views[step.input].ok_or_else(|| aliasing(step))?;
                    let skip = match step.skip {
                        Some(s) => Some(views[s].ok_or_else(|| aliasing(step))?),
                        None => None,
                    };
                    step.layer
                        .evaluate(n, &mut out, input, skip, workspace.view_mut(), &h)?;
                }
                Op::Emit { head, slot, len } => {
                    let src = activations[*slot].view();
                    let mut dst = io.device_output(*head)?;
                    ops::copy_converted::<T, f32>(stream, &mut dst, src, n * len)?;
                }
            }
        }
        io.download_outputs(stream, n)
    }
}

fn aliasing<T: Element>(step: &Step<T>) -> RookError {
    RookError::InvalidConfig(format!("{} reads the activation slot it writes", step.layer.name()))
}

/// The output slot mutably and every other slot shared.
fn slot_views<T: Element>(
    activations: &mut [DeviceBuffer<T>],
    output: usize,
) -> Result<(DevSliceMut<'_, T>, Vec<Option<DevSlice<'_, T>>>)> {
    let mut out = None;
    let mut views = Vec::with_capacity(activations.len());
    for (i, buf) in activations.iter_mut().enumerate() {
        if i == output {
            out = Some(buf.view_mut());
            views.push(None);
        } else {
            views.push(Some(buf.view()));
        }
    }
    let out = out.ok_or_else(|| RookError::InvalidConfig(format!("no activation slot {}", output)))?;
    Ok((out, views))
}
