//! 1×1 convolution as a batched GEMM.

use rook_core::{
    Activation, DevSlice, DevSliceMut, DeviceBuffer, Element, Layout, Result, RookError, TensorShape, BOARD_SQUARES,
};
use rook_kernels::{ops, GemmShape};

use crate::layer::{Handles, LayerOps};
use crate::loader::WeightLoader;
use crate::weights::ConvWeights;

/// Pointwise convolution of `n` boards with `weights [c_out][c_in]` held
/// in the zero-stride operand.
#[allow(clippy::too_many_arguments)]
pub(crate) fn pointwise<T: Element>(
    h: &Handles<'_>,
    n: usize,
    c_in: usize,
    c_out: usize,
    in_layout: Layout,
    out_layout: Layout,
    weights: DevSlice<'_, T>,
    input: DevSlice<'_, T>,
    out: &mut DevSliceMut<'_, T>,
) -> Result<()> {
    let sq = BOARD_SQUARES;
    match out_layout {
        // out[n] (c_out × 64) = W · X[n], X[n] read as c_in × 64.
        Layout::Nchw => {
            let shape = GemmShape {
                m: c_out,
                n: sq,
                k: c_in,
                trans_a: false,
                trans_b: in_layout == Layout::Nhwc,
                batch: n,
                stride_a: 0,
                stride_b: c_in * sq,
                stride_c: c_out * sq,
            };
            h.blas.gemm_strided_batched(h.stream, &shape, weights, input, out)
        }
        // out[n] (64 × c_out) = X[n] · Wᵀ.
        Layout::Nhwc => {
            if in_layout != Layout::Nhwc {
                return Err(RookError::UnsupportedTopology(
                    "pointwise convolution from NCHW into NHWC".into(),
                ));
            }
            let shape = GemmShape {
                m: sq,
                n: c_out,
                k: c_in,
                trans_a: false,
                trans_b: true,
                batch: n,
                stride_a: sq * c_in,
                stride_b: 0,
                stride_c: sq * c_out,
            };
            h.blas.gemm_strided_batched(h.stream, &shape, input, weights, out)
        }
    }
}

struct Loaded<T: Element> {
    weights: DeviceBuffer<T>,
    bias: DeviceBuffer<T>,
}

/// 1×1 convolution with bias and optional ReLU. The output is always
/// channel-major so it flattens directly into the fully-connected heads.
pub struct Conv1Layer<T: Element> {
    c_in: usize,
    c_out: usize,
    layout: Layout,
    relu: bool,
    weights: Option<Loaded<T>>,
}

impl<T: Element> Conv1Layer<T> {
    /// `layout` is the layout of the input.
    pub fn new(c_in: usize, c_out: usize, layout: Layout, relu: bool) -> Self {
        Self {
            c_in,
            c_out,
            layout,
            relu,
            weights: None,
        }
    }

    pub fn load_weights(&mut self, loader: &WeightLoader<'_>, conv: &ConvWeights<'_>) -> Result<()> {
        conv.check("conv1", self.c_out, self.c_in, 1)?;
        let (filter, bias) = conv.folded(self.c_out);
        self.weights = Some(Loaded {
            weights: loader.upload(&filter)?,
            bias: loader.upload(&bias)?,
        });
        Ok(())
    }
}

impl<T: Element> LayerOps<T> for Conv1Layer<T> {
    fn name(&self) -> &'static str {
        "conv1"
    }

    fn input_shape(&self) -> TensorShape {
        TensorShape::board(1, self.c_in)
    }

    fn output_shape(&self) -> TensorShape {
        TensorShape::board(1, self.c_out)
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
        let w = self.weights.as_ref().ok_or(RookError::LayerNotLoaded("conv1"))?;
        pointwise(h, n, self.c_in, self.c_out, self.layout, Layout::Nchw, w.weights.view(), input, output)?;
        ops::bias_activation(
            h.stream,
            output,
            w.bias.view(),
            TensorShape::board(n, self.c_out),
            Layout::Nchw,
            Activation::relu_if(self.relu),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rook_core::{Device, DeviceCaps, Stream};
    use rook_kernels::{BlasHandle, DnnHandle};

    fn run(layer: &Conv1Layer<f32>, n: usize, x: &[f32]) -> Vec<f32> {
        let stream = Stream::new(&Device::Host).unwrap();
        let blas = BlasHandle::new(&stream).unwrap();
        let dnn = DnnHandle::new(&stream);
        let caps = DeviceCaps::default();
        let h = Handles { stream: &stream, blas: &blas, dnn: &dnn, caps: &caps };
        let input = DeviceBuffer::from_host(&Device::Host, x).unwrap();
        let mut out = DeviceBuffer::<f32>::zeros(&Device::Host, n * layer.output_shape().sample_len()).unwrap();
        let mut ws = DeviceBuffer::<f32>::zeros(&Device::Host, 0).unwrap();
        layer.evaluate(n, &mut out.view_mut(), input.view(), None, ws.view_mut(), &h).unwrap();
        out.to_host_vec().unwrap()
    }

    #[test]
    fn test_nhwc_input_gives_nchw_output() {
        let (n, c_in, c_out) = (2, 3, 2);
        let shape = TensorShape::board(n, c_in);
        // x[n][c][sq] = n + c + sq / 64
        let value = |b: usize, c: usize, sq: usize| b as f32 + c as f32 + sq as f32 / 64.0;
        let mut nchw = vec![0.0f32; shape.numel()];
        let mut nhwc = vec![0.0f32; shape.numel()];
        for b in 0..n {
            for c in 0..c_in {
                for sq in 0..64 {
                    nchw[shape.index(Layout::Nchw, b, c, sq / 8, sq % 8)] = value(b, c, sq);
                    nhwc[shape.index(Layout::Nhwc, b, c, sq / 8, sq % 8)] = value(b, c, sq);
                }
            }
        }
        let filter = [1.0f32, 0.0, 0.0, 0.0, 1.0, -1.0];
        let bias = [0.5f32, 0.0];
        let weights = ConvWeights { filter: &filter, bias: Some(&bias), bn: None, dims: None };

        let stream = Stream::new(&Device::Host).unwrap();
        let loader = WeightLoader::new(&stream, DeviceCaps::default());
        let mut a = Conv1Layer::<f32>::new(c_in, c_out, Layout::Nchw, true);
        a.load_weights(&loader, &weights).unwrap();
        let mut b = Conv1Layer::<f32>::new(c_in, c_out, Layout::Nhwc, true);
        b.load_weights(&loader, &weights).unwrap();

        let out_a = run(&a, n, &nchw);
        let out_b = run(&b, n, &nhwc);
        assert_eq!(out_a, out_b);
        // Channel 0 copies input channel 0 plus bias; channel 1 is relu(c1 - c2) = 0.
        assert_eq!(out_a[5], value(0, 0, 5) + 0.5);
        assert!(out_a[64..128].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_rejects_wrong_filter() {
        let stream = Stream::new(&Device::Host).unwrap();
        let loader = WeightLoader::new(&stream, DeviceCaps::default());
        let filter = [0.0f32; 5];
        let mut layer = Conv1Layer::<f32>::new(3, 2, Layout::Nchw, false);
        let err = layer
            .load_weights(&loader, &ConvWeights { filter: &filter, bias: None, bn: None, dims: None })
            .unwrap_err();
        assert!(matches!(err, RookError::ShapeMismatch { .. }));
    }
}
