//! Residual block as a chain of fused Winograd stages.
//!
//! A block is `relu(SE(conv2(relu(conv1(x) + b1)) + b2) + x)`. The output
//! transform of each convolution also produces the input transform of the
//! next one, so consecutive blocks hand their transformed activation over
//! through the first half of the shared workspace. Only the first block of
//! a run transforms its input, only the last skips the hand-over.

use rook_core::{
    arena_footprint, DevSlice, DevSliceMut, Element, Layout, Result, RookError, TensorShape, WorkspaceArena,
};
use rook_kernels::{ops, winograd_transformed_len, WinogradEpilogue};

use crate::layer::{Handles, LayerOps};
use crate::loader::WeightLoader;
use crate::se::DeviceSe;
use crate::weights::{ConvWeights, SeParams};
use crate::winograd::WinogradFilter;

struct Loaded<T: Element> {
    conv1: WinogradFilter<T>,
    conv2: WinogradFilter<T>,
    se: Option<DeviceSe<T>>,
}

pub struct ResidualBlock<T: Element> {
    c: usize,
    se_k: Option<usize>,
    first: bool,
    last: bool,
    layout: Layout,
    weights: Option<Loaded<T>>,
}

impl<T: Element> ResidualBlock<T> {
    pub fn new(channels: usize, layout: Layout, first: bool, last: bool) -> Self {
        Self {
            c: channels,
            se_k: None,
            first,
            last,
            layout,
            weights: None,
        }
    }

    pub fn with_se(mut self, k: usize) -> Self {
        self.se_k = Some(k);
        self
    }

    pub fn load_weights(
        &mut self,
        loader: &WeightLoader<'_>,
        conv1: &ConvWeights<'_>,
        conv2: &ConvWeights<'_>,
        se: Option<&SeParams<'_>>,
    ) -> Result<()> {
        let c = self.c;
        let se = match (self.se_k, se) {
            (Some(k), Some(p)) => Some(DeviceSe::load(loader, "residual", p, c, k)?),
            (Some(_), None) => return Err(RookError::MissingTensor("residual se weights".into())),
            (None, _) => None,
        };
        self.weights = Some(Loaded {
            conv1: WinogradFilter::load(loader, "residual conv1", conv1, c, c)?,
            conv2: WinogradFilter::load(loader, "residual conv2", conv2, c, c)?,
            se,
        });
        Ok(())
    }
}

impl<T: Element> LayerOps<T> for ResidualBlock<T> {
    fn name(&self) -> &'static str {
        "residual"
    }

    fn input_shape(&self) -> TensorShape {
        TensorShape::board(1, self.c)
    }

    fn output_shape(&self) -> TensorShape {
        TensorShape::board(1, self.c)
    }

    fn workspace_size(&self, max_batch: usize) -> usize {
        let len = winograd_transformed_len(max_batch, self.c);
        arena_footprint(&[len, len])
    }

    fn is_loaded(&self) -> bool {
        self.weights.is_some()
    }

    fn evaluate(
        &self,
        n: usize,
        output: &mut DevSliceMut<'_, T>,
        input: DevSlice<'_, T>,
        _skip: Option<DevSlice<'_, T>>,
        workspace: DevSliceMut<'_, T>,
        h: &Handles<'_>,
    ) -> Result<()> {
        let w = self.weights.as_ref().ok_or(RookError::LayerNotLoaded("residual"))?;
        if let Some(k) = self.se_k {
            if !h.caps.can_fuse_residual(self.c, k, T::DTYPE) {
                return Err(RookError::UnsupportedTopology(format!(
                    "residual block of {} channels with SE width {} cannot be fused on this device",
                    self.c, k
                )));
            }
        }
        let c = self.c;
        let len = winograd_transformed_len(n, c);
        let mut arena = WorkspaceArena::new(workspace);
        // Offset 0 in every block, so the previous block's hand-over is here.
        let mut carry = arena.take(len)?;
        let mut m = arena.take(len)?;

        if self.first {
            ops::winograd_input_transform(h.stream, &mut carry, input, n, c, self.layout)?;
        }

        w.conv1.multiply(h, n, carry.view(), &mut m)?;
        let epilogue = WinogradEpilogue {
            bias: Some(w.conv1.bias.view()),
            relu: true,
            ..WinogradEpilogue::none()
        };
        // `output` holds the intermediate activation until conv2 overwrites it.
        ops::winograd_output_input_transform(h.stream, output, &mut carry, m.view(), &epilogue, n, c, self.layout)?;

        w.conv2.multiply(h, n, carry.view(), &mut m)?;
        let epilogue = WinogradEpilogue {
            bias: Some(w.conv2.bias.view()),
            se: w.se.as_ref().map(DeviceSe::view),
            skip: Some(input),
            relu: true,
        };
        if self.last {
            ops::winograd_output_transform(h.stream, output, m.view(), &epilogue, n, c, self.layout)
        } else {
            ops::winograd_output_input_transform(h.stream, output, &mut carry, m.view(), &epilogue, n, c, self.layout)
        }
    }
}
