//! Squeeze-and-excitation.

use rook_core::{
    arena_footprint, Activation, DevSlice, DevSliceMut, DeviceBuffer, Element, Layout, Result, RookError,
    TensorShape, WorkspaceArena,
};
use rook_kernels::{ops, GemmShape, SeWeights};

use crate::layer::{Handles, LayerOps};
use crate::loader::WeightLoader;
use crate::weights::SeParams;

/// SE weights resident on the device.
pub struct DeviceSe<T: Element> {
    w1: DeviceBuffer<T>,
    b1: DeviceBuffer<T>,
    w2: DeviceBuffer<T>,
    b2: DeviceBuffer<T>,
    k: usize,
}

impl<T: Element> DeviceSe<T> {
    pub fn load(loader: &WeightLoader<'_>, what: &str, params: &SeParams<'_>, c: usize, k: usize) -> Result<Self> {
        params.check(what, c, k)?;
        Ok(Self {
            w1: loader.upload(params.w1)?,
            b1: loader.upload(params.b1)?,
            w2: loader.upload(params.w2)?,
            b2: loader.upload(params.b2)?,
            k,
        })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn view(&self) -> SeWeights<'_, T> {
        SeWeights {
            w1: self.w1.view(),
            b1: self.b1.view(),
            w2: self.w2.view(),
            b2: self.b2.view(),
            k: self.k,
        }
    }
}

/// Workspace of the decomposed sequence for `n` samples.
pub(crate) fn decomposed_workspace(n: usize, c: usize, k: usize) -> usize {
    arena_footprint(&[n * c, n * k, n * 2 * c])
}

/// pool → FC1 (ReLU) → FC2 → scale (+ skip, ReLU), scratch from `arena`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn se_decomposed<T: Element>(
    h: &Handles<'_>,
    arena: &mut WorkspaceArena<'_, T>,
    output: &mut DevSliceMut<'_, T>,
    input: DevSlice<'_, T>,
    skip: Option<DevSlice<'_, T>>,
    se: &DeviceSe<T>,
    prev_bias: Option<DevSlice<'_, T>>,
    shape: TensorShape,
    layout: Layout,
    relu: bool,
) -> Result<()> {
    let (n, c, k) = (shape.n, shape.c, se.k);
    let mut pooled = arena.take(n * c)?;
    let mut hidden = arena.take(n * k)?;
    let mut scale = arena.take(n * 2 * c)?;

    ops::global_avg_pool(h.stream, &mut pooled, input, prev_bias, shape, layout)?;

    h.blas.gemm_strided_batched(
        h.stream,
        &GemmShape::single(n, k, c, false, true),
        pooled.view(),
        se.w1.view(),
        &mut hidden,
    )?;
    ops::bias_activation(h.stream, &mut hidden, se.b1.view(), TensorShape::flat(n, k), Layout::Nchw, Activation::Relu)?;

    h.blas.gemm_strided_batched(
        h.stream,
        &GemmShape::single(n, 2 * c, k, false, true),
        hidden.view(),
        se.w2.view(),
        &mut scale,
    )?;
    ops::bias_activation(
        h.stream,
        &mut scale,
        se.b2.view(),
        TensorShape::flat(n, 2 * c),
        Layout::Nchw,
        Activation::None,
    )?;

    ops::global_scale(h.stream, output, input, scale.view(), prev_bias, skip, shape, layout, relu)
}

struct Loaded<T: Element> {
    se: DeviceSe<T>,
    prev_bias: Option<DeviceBuffer<T>>,
}

/// Standalone SE block: `out = relu?(SE(x + prev_bias) + skip)`.
///
/// Runs the single fused kernel when the device allows it, the decomposed
/// sequence otherwise.
pub struct SeLayer<T: Element> {
    shape: TensorShape,
    k: usize,
    layout: Layout,
    relu: bool,
    prev_bias: bool,
    force_decomposed: bool,
    weights: Option<Loaded<T>>,
}

impl<T: Element> SeLayer<T> {
    pub fn new(channels: usize, k: usize, layout: Layout, relu: bool, prev_bias: bool) -> Self {
        Self {
            shape: TensorShape::board(1, channels),
            k,
            layout,
            relu,
            prev_bias,
            force_decomposed: false,
            weights: None,
        }
    }

    /// Never use the fused kernel.
    pub fn decomposed(mut self) -> Self {
        self.force_decomposed = true;
        self
    }

    pub fn load_weights(
        &mut self,
        loader: &WeightLoader<'_>,
        params: &SeParams<'_>,
        prev_bias: Option<&[f32]>,
    ) -> Result<()> {
        let c = self.shape.c;
        let se = DeviceSe::load(loader, "se", params, c, self.k)?;
        let prev_bias = match (self.prev_bias, prev_bias) {
            (true, Some(b)) => {
                if b.len() != c {
                    return Err(RookError::shape("se previous bias", &[c], &[b.len()]));
                }
                Some(loader.upload(b)?)
            }
            (true, None) => return Err(RookError::MissingTensor("se previous-layer bias".into())),
            (false, _) => None,
        };
        self.weights = Some(Loaded { se, prev_bias });
        Ok(())
    }
}

impl<T: Element> LayerOps<T> for SeLayer<T> {
    fn name(&self) -> &'static str {
        "se"
    }

    fn input_shape(&self) -> TensorShape {
        self.shape
    }

    fn output_shape(&self) -> TensorShape {
        self.shape
    }

    fn workspace_size(&self, max_batch: usize) -> usize {
        decomposed_workspace(max_batch, self.shape.c, self.k)
    }

    fn is_loaded(&self) -> bool {
        self.weights.is_some()
    }

    fn evaluate(
        &self,
        n: usize,
        output: &mut DevSliceMut<'_, T>,
        input: DevSlice<'_, T>,
        skip: Option<DevSlice<'_, T>>,
        workspace: DevSliceMut<'_, T>,
        h: &Handles<'_>,
    ) -> Result<()> {
        let w = self.weights.as_ref().ok_or(RookError::LayerNotLoaded("se"))?;
        let shape = self.shape.with_batch(n);
        let prev_bias = w.prev_bias.as_ref().map(|b| b.view());
        if !self.force_decomposed
            && ops::se_fused(
                h.stream,
                h.caps,
                output,
                input,
                skip,
                &w.se.view(),
                prev_bias,
                shape,
                self.layout,
                self.relu,
            )?
        {
            return Ok(());
        }
        tracing::trace!(channels = shape.c, k = self.k, "se: decomposed");
        let mut arena = WorkspaceArena::new(workspace);
        se_decomposed(h, &mut arena, output, input, skip, &w.se, prev_bias, shape, self.layout, self.relu)
    }
}
