//! General convolution with separate bias, batch-norm, skip and ReLU
//! kernels.
//!
//! The convolution itself runs on the vendor DNN primitive when the device
//! has one, otherwise on Winograd (3×3) or a plain GEMM (1×1). This is the
//! layer the decomposed execution mode is built from.

use rook_core::{
    arena_footprint, Activation, DevSlice, DevSliceMut, DeviceBuffer, Element, Layout, Result, RookError,
    TensorShape, WorkspaceArena, BOARD_SIZE, BOARD_SQUARES,
};
use rook_kernels::{ops, winograd_transformed_len, ConvShape, WinogradEpilogue};

use crate::conv1::pointwise;
use crate::layer::{Handles, LayerOps};
use crate::loader::WeightLoader;
use crate::weights::ConvWeights;
use crate::winograd::WinogradFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvOptions {
    pub filter_size: usize,
    pub relu: bool,
    pub use_bias: bool,
    /// Add the `skip` operand before the activation.
    pub skip_add: bool,
}

impl Default for ConvOptions {
    fn default() -> Self {
        Self {
            filter_size: 3,
            relu: true,
            use_bias: true,
            skip_add: false,
        }
    }
}

/// How the raw convolution is computed.
enum Engine<T: Element> {
    /// Vendor primitive on NCHW data with the unfolded filter.
    Vendor { filter: DeviceBuffer<T> },
    Winograd(WinogradFilter<T>),
    Pointwise { filter: DeviceBuffer<T> },
}

/// Post-convolution work.
enum Epilogue<T: Element> {
    Bias(DeviceBuffer<T>),
    BatchNorm {
        means: DeviceBuffer<f32>,
        var_multipliers: DeviceBuffer<f32>,
    },
}

struct Loaded<T: Element> {
    engine: Engine<T>,
    epilogue: Epilogue<T>,
}

/// `out = relu?(conv(x) + bias + skip)`, with batch-norm applied by its own
/// kernel when the vendor primitive is used.
pub struct ConvLayer<T: Element> {
    c_in: usize,
    c_out: usize,
    layout: Layout,
    opts: ConvOptions,
    weights: Option<Loaded<T>>,
}

impl<T: Element> ConvLayer<T> {
    pub fn new(c_in: usize, c_out: usize, layout: Layout, opts: ConvOptions) -> Self {
        Self {
            c_in,
            c_out,
            layout,
            opts,
            weights: None,
        }
    }

    pub fn load_weights(&mut self, loader: &WeightLoader<'_>, conv: &ConvWeights<'_>) -> Result<()> {
        let f = self.opts.filter_size;
        conv.check("conv", self.c_out, self.c_in, f)?;

        let conv = ConvWeights {
            bias: self.opts.use_bias.then_some(conv.bias).flatten(),
            ..*conv
        };
        let loaded = if loader.caps().vendor_convolution {
            let filter = loader.upload(conv.filter)?;
            let epilogue = match conv.bn_kernel_params(self.c_out) {
                Some((means, var_multipliers)) => Epilogue::BatchNorm {
                    means: loader.upload_raw(&means)?,
                    var_multipliers: loader.upload_raw(&var_multipliers)?,
                },
                None => Epilogue::Bias(self.bias_or_zero(loader, conv.bias)?),
            };
            Loaded {
                engine: Engine::Vendor { filter },
                epilogue,
            }
        } else {
            let engine = match f {
                3 => Engine::Winograd(WinogradFilter::load(loader, "conv", &conv, self.c_in, self.c_out)?),
                1 => Engine::Pointwise {
                    filter: loader.upload(&conv.folded(self.c_out).0)?,
                },
                _ => {
                    return Err(RookError::UnsupportedTopology(format!(
                        "{f}x{f} convolution needs a vendor convolution primitive"
                    )))
                }
            };
            let bias = loader.upload(&conv.folded(self.c_out).1)?;
            Loaded {
                engine,
                epilogue: Epilogue::Bias(bias),
            }
        };
        tracing::trace!(
            c_in = self.c_in,
            c_out = self.c_out,
            filter = f,
            vendor = matches!(loaded.engine, Engine::Vendor { .. }),
            "conv loaded"
        );
        self.weights = Some(loaded);
        Ok(())
    }

    fn bias_or_zero(&self, loader: &WeightLoader<'_>, bias: Option<&[f32]>) -> Result<DeviceBuffer<T>> {
        match bias.filter(|_| self.opts.use_bias) {
            Some(b) => loader.upload(b),
            None => loader.upload(&vec![0.0; self.c_out]),
        }
    }

    fn out_len(&self, n: usize) -> usize {
        n * self.c_out * BOARD_SQUARES
    }

    /// Raw convolution of `input` into `arena` scratch, in the layer layout.
    fn convolve<'w>(
        &self,
        engine: &Engine<T>,
        h: &Handles<'_>,
        arena: &mut WorkspaceArena<'w, T>,
        n: usize,
        input: DevSlice<'_, T>,
    ) -> Result<DevSlice<'w, T>> {
        match engine {
            Engine::Vendor { filter } => {
                let in_shape = TensorShape::board(n, self.c_in);
                let nchw_in = match self.layout {
                    Layout::Nchw => None,
                    Layout::Nhwc => {
                        let mut t = arena.take(in_shape.numel())?;
                        ops::convert_tensor::<T, T>(h.stream, &mut t, Layout::Nchw, input, Layout::Nhwc, in_shape)?;
                        Some(t.into_view())
                    }
                };
                let mut raw = arena.take(self.out_len(n))?;
                let shape = ConvShape {
                    n,
                    c_in: self.c_in,
                    c_out: self.c_out,
                    h: BOARD_SIZE,
                    w: BOARD_SIZE,
                    filter_size: self.opts.filter_size,
                };
                h.dnn
                    .convolution_forward(h.stream, &shape, &mut raw, nchw_in.unwrap_or(input), filter.view())?;
                match self.layout {
                    Layout::Nchw => Ok(raw.into_view()),
                    Layout::Nhwc => {
                        let out_shape = TensorShape::board(n, self.c_out);
                        let mut t = arena.take(out_shape.numel())?;
                        ops::convert_tensor::<T, T>(h.stream, &mut t, Layout::Nhwc, raw.view(), Layout::Nchw, out_shape)?;
                        Ok(t.into_view())
                    }
                }
            }
            Engine::Winograd(filter) => {
                let mut v = arena.take(winograd_transformed_len(n, self.c_in))?;
                let mut m = arena.take(winograd_transformed_len(n, self.c_out))?;
                let mut raw = arena.take(self.out_len(n))?;
                ops::winograd_input_transform(h.stream, &mut v, input, n, self.c_in, self.layout)?;
                filter.multiply(h, n, v.view(), &mut m)?;
                ops::winograd_output_transform(
                    h.stream,
                    &mut raw,
                    m.view(),
                    &WinogradEpilogue::none(),
                    n,
                    self.c_out,
                    self.layout,
                )?;
                Ok(raw.into_view())
            }
            Engine::Pointwise { filter } => {
                let mut raw = arena.take(self.out_len(n))?;
                pointwise(h, n, self.c_in, self.c_out, self.layout, self.layout, filter.view(), input, &mut raw)?;
                Ok(raw.into_view())
            }
        }
    }
}

impl<T: Element> LayerOps<T> for ConvLayer<T> {
    fn name(&self) -> &'static str {
        "conv"
    }

    fn input_shape(&self) -> TensorShape {
        TensorShape::board(1, self.c_in)
    }

    fn output_shape(&self) -> TensorShape {
        TensorShape::board(1, self.c_out)
    }

    fn workspace_size(&self, max_batch: usize) -> usize {
        let n = max_batch;
        let (input, output) = (n * self.c_in * BOARD_SQUARES, self.out_len(n));
        // Vendor path with both layout conversions.
        let vendor = arena_footprint(&[input, output, output]);
        let winograd = arena_footprint(&[
            winograd_transformed_len(n, self.c_in),
            winograd_transformed_len(n, self.c_out),
            output,
        ]);
        vendor.max(winograd)
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
        let w = self.weights.as_ref().ok_or(RookError::LayerNotLoaded("conv"))?;
        let skip = if self.opts.skip_add { skip } else { None };
        let shape = TensorShape::board(n, self.c_out);
        let mut arena = WorkspaceArena::new(workspace);
        let conv = self.convolve(&w.engine, h, &mut arena, n, input)?;

        match &w.epilogue {
            Epilogue::BatchNorm { means, var_multipliers } => ops::batch_norm(
                h.stream,
                output,
                conv,
                skip,
                means.view(),
                var_multipliers.view(),
                shape,
                self.layout,
                self.opts.relu,
            ),
            Epilogue::Bias(bias) => {
                match skip {
                    Some(skip) => ops::add_vectors(h.stream, output, conv, skip, shape.numel(), Activation::None)?,
                    None => ops::copy_converted::<T, T>(h.stream, output, conv, shape.numel())?,
                }
                ops::bias_activation(
                    h.stream,
                    output,
                    bias.view(),
                    shape,
                    self.layout,
                    Activation::relu_if(self.opts.relu),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rook_core::{Device, DeviceCaps, Stream};
    use rook_kernels::{BlasHandle, DnnHandle};

    use crate::weights::BatchNorm;

    fn assert_close(a: &[f32], b: &[f32], tol: f32) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert!((x - y).abs() < tol, "element {}: {} vs {}", i, x, y);
        }
    }

    fn random(rng: &mut StdRng, len: usize) -> Vec<f32> {
        (0..len).map(|_| rng.gen_range(-0.5..0.5)).collect()
    }

    fn eval(caps: DeviceCaps, layer_of: impl Fn(&WeightLoader<'_>) -> ConvLayer<f32>, n: usize, x: &[f32], skip: &[f32]) -> Vec<f32> {
        let stream = Stream::new(&Device::Host).unwrap();
        let blas = BlasHandle::new(&stream).unwrap();
        let dnn = DnnHandle::new(&stream);
        let loader = WeightLoader::new(&stream, caps);
        let layer = layer_of(&loader);
        let h = Handles { stream: &stream, blas: &blas, dnn: &dnn, caps: &caps };
        let input = DeviceBuffer::from_host(&Device::Host, x).unwrap();
        let skip = DeviceBuffer::from_host(&Device::Host, skip).unwrap();
        let mut out = DeviceBuffer::<f32>::zeros(&Device::Host, n * layer.output_shape().sample_len()).unwrap();
        let mut ws = DeviceBuffer::<f32>::zeros(&Device::Host, layer.workspace_size(n)).unwrap();
        layer
            .evaluate(n, &mut out.view_mut(), input.view(), Some(skip.view()), ws.view_mut(), &h)
            .unwrap();
        out.to_host_vec().unwrap()
    }

    fn vendor_caps() -> DeviceCaps {
        DeviceCaps::detect(&Device::Host).unwrap()
    }

    fn gemm_caps() -> DeviceCaps {
        DeviceCaps { vendor_convolution: false, ..DeviceCaps::default() }
    }

    #[test]
    fn test_batch_norm_matches_folded_winograd() {
        let (n, c, k) = (2, 3, 5);
        let mut rng = StdRng::seed_from_u64(11);
        let filter = random(&mut rng, k * c * 9);
        let bias = random(&mut rng, k);
        let means = random(&mut rng, k);
        let stddivs: Vec<f32> = (0..k).map(|_| rng.gen_range(0.5..1.5)).collect();
        let x = random(&mut rng, n * c * 64);
        let skip = random(&mut rng, n * k * 64);
        let weights = ConvWeights {
            filter: &filter,
            bias: Some(&bias),
            bn: Some(BatchNorm { means: &means, stddivs: &stddivs }),
            dims: None,
        };
        let opts = ConvOptions { filter_size: 3, relu: true, use_bias: true, skip_add: true };
        for layout in [Layout::Nchw, Layout::Nhwc] {
            let build = |loader: &WeightLoader<'_>| {
                let mut l = ConvLayer::new(c, k, layout, opts);
                l.load_weights(loader, &weights).unwrap();
                l
            };
            let vendor = eval(vendor_caps(), build, n, &x, &skip);
            let winograd = eval(gemm_caps(), build, n, &x, &skip);
            assert_close(&vendor, &winograd, 1e-4);
            assert!(vendor.iter().all(|&v| v >= 0.0));
        }
    }

    #[test]
    fn test_unused_bias_ignored_by_batch_norm() {
        let (n, c, k) = (1, 2, 3);
        let mut rng = StdRng::seed_from_u64(13);
        let filter = random(&mut rng, k * c * 9);
        let bias = random(&mut rng, k);
        let means = random(&mut rng, k);
        let stddivs: Vec<f32> = (0..k).map(|_| rng.gen_range(0.5..1.5)).collect();
        let x = random(&mut rng, n * c * 64);
        let skip = vec![0.0f32; n * k * 64];
        let bn = Some(BatchNorm { means: &means, stddivs: &stddivs });
        let with_bias = ConvWeights { filter: &filter, bias: Some(&bias), bn, dims: None };
        let without_bias = ConvWeights { bias: None, ..with_bias };
        let opts = ConvOptions { filter_size: 3, relu: false, use_bias: false, skip_add: false };
        let build = |weights| {
            move |loader: &WeightLoader<'_>| {
                let mut l = ConvLayer::<f32>::new(c, k, Layout::Nchw, opts);
                l.load_weights(loader, &weights).unwrap();
                l
            }
        };
        let reference = eval(gemm_caps(), build(without_bias), n, &x, &skip);
        assert_close(&eval(vendor_caps(), build(with_bias), n, &x, &skip), &reference, 1e-4);
        assert_close(&eval(gemm_caps(), build(with_bias), n, &x, &skip), &reference, 1e-4);
    }

    #[test]
    fn test_pointwise_matches_vendor() {
        let (n, c, k) = (3, 4, 2);
        let mut rng = StdRng::seed_from_u64(12);
        let filter = random(&mut rng, k * c);
        let bias = random(&mut rng, k);
        let x = random(&mut rng, n * c * 64);
        let skip = vec![0.0f32; n * k * 64];
        let weights = ConvWeights { filter: &filter, bias: Some(&bias), bn: None, dims: None };
        let opts = ConvOptions { filter_size: 1, relu: false, use_bias: true, skip_add: false };
        let build = |loader: &WeightLoader<'_>| {
            let mut l = ConvLayer::new(c, k, Layout::Nhwc, opts);
            l.load_weights(loader, &weights).unwrap();
            l
        };
        assert_close(&eval(vendor_caps(), build, n, &x, &skip), &eval(gemm_caps(), build, n, &x, &skip), 1e-5);
    }

    #[test]
    fn test_unsupported_filter_without_vendor() {
        let stream = Stream::new(&Device::Host).unwrap();
        let loader = WeightLoader::new(&stream, gemm_caps());
        let filter = vec![0.0f32; 25];
        let opts = ConvOptions { filter_size: 5, ..ConvOptions::default() };
        let mut layer = ConvLayer::<f32>::new(1, 1, Layout::Nchw, opts);
        let err = layer
            .load_weights(&loader, &ConvWeights { filter: &filter, bias: None, bn: None, dims: None })
            .unwrap_err();
        assert!(matches!(err, RookError::UnsupportedTopology(_)));
    }

    #[test]
    fn test_evaluate_before_load() {
        let stream = Stream::new(&Device::Host).unwrap();
        let blas = BlasHandle::new(&stream).unwrap();
        let dnn = DnnHandle::new(&stream);
        let caps = DeviceCaps::default();
        let h = Handles { stream: &stream, blas: &blas, dnn: &dnn, caps: &caps };
        let layer = ConvLayer::<f32>::new(1, 1, Layout::Nchw, ConvOptions::default());
        let input = DeviceBuffer::<f32>::zeros(&Device::Host, 64).unwrap();
        let mut out = DeviceBuffer::<f32>::zeros(&Device::Host, 64).unwrap();
        let mut ws = DeviceBuffer::<f32>::zeros(&Device::Host, layer.workspace_size(1)).unwrap();
        let err = layer
            .evaluate(1, &mut out.view_mut(), input.view(), None, ws.view_mut(), &h)
            .unwrap_err();
        assert!(matches!(err, RookError::LayerNotLoaded("conv")));
    }
}
