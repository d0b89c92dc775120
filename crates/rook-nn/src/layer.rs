//! Uniform layer contract and the closed set of layer kinds.

use rook_core::{DevSlice, DevSliceMut, DeviceCaps, Element, Result, RookError, Stream, TensorShape};
use rook_kernels::{BlasHandle, DnnHandle};

use crate::conv::ConvLayer;
use crate::conv1::Conv1Layer;
use crate::fc::FcLayer;
use crate::loader::WeightLoader;
use crate::policy_map::PolicyMapLayer;
use crate::residual::ResidualBlock;
use crate::se::SeLayer;
use crate::weights::LayerWeights;
use crate::winograd::FusedWinogradConvSeLayer;

/// Per-context handles a layer issues work through.
pub struct Handles<'a> {
    pub stream: &'a Stream,
    pub blas: &'a BlasHandle,
    pub dnn: &'a DnnHandle,
    pub caps: &'a DeviceCaps,
}

/// What every layer provides.
///
/// Shapes are per sample (`n == 1`). `workspace_size` is in elements of
/// `T` and covers a batch of `max_batch`.
pub trait LayerOps<T: Element> {
    fn name(&self) -> &'static str;

    fn input_shape(&self) -> TensorShape;

    fn output_shape(&self) -> TensorShape;

    fn workspace_size(&self, max_batch: usize) -> usize;

    fn is_loaded(&self) -> bool;

    /// Run the layer on the first `n` samples of `input`, writing `output`.
    /// `skip` is the residual input for layers that add one.
    fn evaluate(
        &self,
        n: usize,
        output: &mut DevSliceMut<'_, T>,
        input: DevSlice<'_, T>,
        skip: Option<DevSlice<'_, T>>,
        workspace: DevSliceMut<'_, T>,
        handles: &Handles<'_>,
    ) -> Result<()>;
}

pub enum Layer<T: Element> {
    Conv(ConvLayer<T>),
    Conv1(Conv1Layer<T>),
    Fc(FcLayer<T>),
    PolicyMap(PolicyMapLayer<T>),
    Se(SeLayer<T>),
    FusedWinograd(FusedWinogradConvSeLayer<T>),
    Residual(ResidualBlock<T>),
}

macro_rules! each_layer {
    ($self:expr, $l:ident => $body:expr) => {
        match $self {
            Layer::Conv($l) => $body,
            Layer::Conv1($l) => $body,
            Layer::Fc($l) => $body,
            Layer::PolicyMap($l) => $body,
            Layer::Se($l) => $body,
            Layer::FusedWinograd($l) => $body,
            Layer::Residual($l) => $body,
        }
    };
}

impl<T: Element> Layer<T> {
    /// Load this layer's weights. The weight kind must match the layer kind.
    pub fn load(&mut self, loader: &WeightLoader<'_>, weights: &LayerWeights<'_>) -> Result<()> {
        match (self, weights) {
            (Layer::Conv(l), LayerWeights::Conv(w)) => l.load_weights(loader, w),
            (Layer::Conv1(l), LayerWeights::Conv(w)) => l.load_weights(loader, w),
            (Layer::Fc(l), LayerWeights::Fc(w)) => l.load_weights(loader, w),
            (Layer::PolicyMap(l), LayerWeights::PolicyMap) => l.load_weights(loader),
            (Layer::Se(l), LayerWeights::Se { se, prev_bias }) => l.load_weights(loader, se, *prev_bias),
            (Layer::FusedWinograd(l), LayerWeights::FusedWinograd { conv, se }) => {
                l.load_weights(loader, conv, se.as_ref())
            }
            (Layer::Residual(l), LayerWeights::Residual { conv1, conv2, se }) => {
                l.load_weights(loader, conv1, conv2, se.as_ref())
            }
            (layer, weights) => Err(RookError::InvalidConfig(format!(
                "{} layer cannot load {} weights",
                layer.name(),
                weights.kind()
            ))),
        }
    }
}

impl<T: Element> LayerOps<T> for Layer<T> {
    fn name(&self) -> &'static str {
        each_layer!(self, l => l.name())
    }

    fn input_shape(&self) -> TensorShape {
        each_layer!(self, l => l.input_shape())
    }

    fn output_shape(&self) -> TensorShape {
        each_layer!(self, l => l.output_shape())
    }

    fn workspace_size(&self, max_batch: usize) -> usize {
        each_layer!(self, l => l.workspace_size(max_batch))
    }

    fn is_loaded(&self) -> bool {
        each_layer!(self, l => l.is_loaded())
    }

    fn evaluate(
        &self,
        n: usize,
        output: &mut DevSliceMut<'_, T>,
        input: DevSlice<'_, T>,
        skip: Option<DevSlice<'_, T>>,
        workspace: DevSliceMut<'_, T>,
        handles: &Handles<'_>,
    ) -> Result<()> {
        each_layer!(self, l => l.evaluate(n, output, input, skip, workspace, handles))
    }
}
