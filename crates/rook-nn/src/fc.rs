//! Fully-connected layer.

use rook_core::{Activation, DevSlice, DevSliceMut, DeviceBuffer, Element, Layout, Result, RookError, TensorShape};
use rook_kernels::{ops, GemmShape};

use crate::layer::{Handles, LayerOps};
use crate::loader::WeightLoader;
use crate::weights::FcWeights;

struct Loaded<T: Element> {
    weights: DeviceBuffer<T>,
    bias: DeviceBuffer<T>,
}

/// `y = act(x · Wᵀ + b)` over the flattened input.
pub struct FcLayer<T: Element> {
    input: TensorShape,
    outputs: usize,
    activation: Activation,
    weights: Option<Loaded<T>>,
}

impl<T: Element> FcLayer<T> {
    /// `input` is the per-sample shape feeding the layer; it is flattened
    /// channel-major.
    pub fn new(input: TensorShape, outputs: usize, activation: Activation) -> Self {
        Self {
            input: input.with_batch(1),
            outputs,
            activation,
            weights: None,
        }
    }

    fn inputs(&self) -> usize {
        self.input.sample_len()
    }

    pub fn load_weights(&mut self, loader: &WeightLoader<'_>, fc: &FcWeights<'_>) -> Result<()> {
        fc.check("fc", self.outputs, self.inputs())?;
        let bias = fc.bias.map_or_else(|| vec![0.0; self.outputs], <[f32]>::to_vec);
        self.weights = Some(Loaded {
            weights: loader.upload(fc.weights)?,
            bias: loader.upload(&bias)?,
        });
        Ok(())
    }
}

impl<T: Element> LayerOps<T> for FcLayer<T> {
    fn name(&self) -> &'static str {
        "fc"
    }

    fn input_shape(&self) -> TensorShape {
        self.input
    }

    fn output_shape(&self) -> TensorShape {
        TensorShape::flat(1, self.outputs)
    }

    fn workspace_size(&self, _max_batch: usize) -> usize {
        0
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
        _workspace: DevSliceMut<'_, T>,
        h: &Handles<'_>,
    ) -> Result<()> {
        let w = self.weights.as_ref().ok_or(RookError::LayerNotLoaded("fc"))?;
        h.blas.gemm_strided_batched(
            h.stream,
            &GemmShape::single(n, self.outputs, self.inputs(), false, true),
            input,
            w.weights.view(),
            output,
        )?;
        ops::bias_activation(
            h.stream,
            output,
            w.bias.view(),
            TensorShape::flat(n, self.outputs),
            Layout::Nchw,
            self.activation,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;
    use rook_core::{Device, DeviceCaps, Stream};
    use rook_kernels::{BlasHandle, DnnHandle};

    fn run<T: Element>(layer: &FcLayer<T>, stream: &Stream, n: usize, x: &[T]) -> Vec<T> {
        let blas = BlasHandle::new(stream).unwrap();
        let dnn = DnnHandle::new(stream);
        let caps = DeviceCaps::default();
        let h = Handles { stream, blas: &blas, dnn: &dnn, caps: &caps };
        let input = DeviceBuffer::from_host(&Device::Host, x).unwrap();
        let mut out = DeviceBuffer::<T>::zeros(&Device::Host, n * layer.output_shape().sample_len()).unwrap();
        let mut ws = DeviceBuffer::<T>::zeros(&Device::Host, 0).unwrap();
        layer.evaluate(n, &mut out.view_mut(), input.view(), None, ws.view_mut(), &h).unwrap();
        out.to_host_vec().unwrap()
    }

    #[test]
    fn test_fc_tanh() {
        let stream = Stream::new(&Device::Host).unwrap();
        let loader = WeightLoader::new(&stream, DeviceCaps::default());
        let mut layer = FcLayer::<f32>::new(TensorShape::flat(1, 3), 2, Activation::Tanh);
        let w = [1.0f32, 0.0, 0.0, 0.0, 1.0, 1.0];
        layer.load_weights(&loader, &FcWeights { weights: &w, bias: Some(&[0.0, -1.0]), dims: None }).unwrap();
        let out = run(&layer, &stream, 2, &[0.5, 1.0, 2.0, -0.5, 0.0, 0.0]);
        let expected = [0.5f32.tanh(), 2.0f32.tanh(), (-0.5f32).tanh(), (-1.0f32).tanh()];
        for (a, b) in out.iter().zip(expected) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_fc_flattens_board_input_in_half() {
        let stream = Stream::new(&Device::Host).unwrap();
        let loader = WeightLoader::new(&stream, DeviceCaps::default());
        let mut layer = FcLayer::<f16>::new(TensorShape::board(1, 2), 1, Activation::None);
        assert_eq!(layer.input_shape().sample_len(), 128);
        let w = vec![1.0f32 / 128.0; 128];
        layer.load_weights(&loader, &FcWeights { weights: &w, bias: None, dims: None }).unwrap();
        let x = vec![f16::from_f32(2.0); 128];
        let out = run(&layer, &stream, 1, &x);
        assert!((out[0].to_f32() - 2.0).abs() < 1e-2);
    }

    #[test]
    fn test_fc_rejects_bad_bias() {
        let stream = Stream::new(&Device::Host).unwrap();
        let loader = WeightLoader::new(&stream, DeviceCaps::default());
        let mut layer = FcLayer::<f32>::new(TensorShape::flat(1, 2), 2, Activation::Relu);
        let err = layer
            .load_weights(&loader, &FcWeights { weights: &[0.0; 4], bias: Some(&[0.0; 3]), dims: None })
            .unwrap_err();
        assert!(matches!(err, RookError::ShapeMismatch { .. }));
    }
}
