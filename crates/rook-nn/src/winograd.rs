//! 3×3 convolution as Winograd transforms around one batched GEMM, with
//! bias, SE, skip and ReLU fused into the output transform.

use rook_core::{
    arena_footprint, DevSlice, DevSliceMut, DeviceBuffer, Element, Layout, Result, RookError, TensorShape,
    WorkspaceArena,
};
use rook_kernels::{ops, winograd_transformed_len, GemmShape, WinogradEpilogue};

use crate::layer::{Handles, LayerOps};
use crate::loader::WeightLoader;
use crate::se::{decomposed_workspace, se_decomposed, DeviceSe};
use crate::weights::{ConvWeights, SeParams};

const WINOGRAD_ELEMENTS: usize = 36;
const TILES_PER_BOARD: usize = 4;

/// Filter transformed to `U[36][c_in][c_out]` with its (batch-norm folded) bias.
pub(crate) struct WinogradFilter<T: Element> {
    pub(crate) transformed: DeviceBuffer<T>,
    pub(crate) bias: DeviceBuffer<T>,
    pub(crate) c_in: usize,
    pub(crate) c_out: usize,
}

impl<T: Element> WinogradFilter<T> {
    pub(crate) fn load(
        loader: &WeightLoader<'_>,
        what: &str,
        weights: &ConvWeights<'_>,
        c_in: usize,
        c_out: usize,
    ) -> Result<Self> {
        weights.check(what, c_out, c_in, 3)?;
        let (filter, bias) = weights.folded(c_out);
        let raw = loader.upload::<T>(&filter)?;
        let mut transformed = loader.scratch::<T>(WINOGRAD_ELEMENTS * c_in * c_out)?;
        ops::winograd_filter_transform(loader.stream(), &mut transformed.view_mut(), raw.view(), c_out, c_in)?;
        loader.stream().synchronize()?;
        Ok(Self {
            transformed,
            bias: loader.upload(&bias)?,
            c_in,
            c_out,
        })
    }

    /// `M = V · U` for `n` boards.
    pub(crate) fn multiply(
        &self,
        h: &Handles<'_>,
        n: usize,
        transformed_input: DevSlice<'_, T>,
        out: &mut DevSliceMut<'_, T>,
    ) -> Result<()> {
        let tiles = n * TILES_PER_BOARD;
        let shape = GemmShape {
            m: tiles,
            n: self.c_out,
            k: self.c_in,
            trans_a: false,
            trans_b: false,
            batch: WINOGRAD_ELEMENTS,
            stride_a: tiles * self.c_in,
            stride_b: self.c_in * self.c_out,
            stride_c: tiles * self.c_out,
        };
        h.blas
            .gemm_strided_batched(h.stream, &shape, transformed_input, self.transformed.view(), out)
    }
}

struct Loaded<T: Element> {
    filter: WinogradFilter<T>,
    se: Option<DeviceSe<T>>,
}

/// `out = relu?(SE(conv3x3(x) + bias) + skip)`.
pub struct FusedWinogradConvSeLayer<T: Element> {
    c_in: usize,
    c_out: usize,
    layout: Layout,
    relu: bool,
    use_bias: bool,
    skip_add: bool,
    se_k: Option<usize>,
    weights: Option<Loaded<T>>,
}

impl<T: Element> FusedWinogradConvSeLayer<T> {
    pub fn new(c_in: usize, c_out: usize, layout: Layout, relu: bool, use_bias: bool, skip_add: bool) -> Self {
        Self {
            c_in,
            c_out,
            layout,
            relu,
            use_bias,
            skip_add,
            se_k: None,
            weights: None,
        }
    }

    /// Fuse an SE block of bottleneck `k` into the output transform.
    pub fn with_se(mut self, k: usize) -> Self {
        self.se_k = Some(k);
        self
    }

    pub fn load_weights(
        &mut self,
        loader: &WeightLoader<'_>,
        conv: &ConvWeights<'_>,
        se: Option<&SeParams<'_>>,
    ) -> Result<()> {
        let filter = WinogradFilter::load(loader, "winograd conv", conv, self.c_in, self.c_out)?;
        let se = match (self.se_k, se) {
            (Some(k), Some(p)) => Some(DeviceSe::load(loader, "winograd conv", p, self.c_out, k)?),
            (Some(_), None) => return Err(RookError::MissingTensor("winograd conv se weights".into())),
            (None, _) => None,
        };
        self.weights = Some(Loaded { filter, se });
        Ok(())
    }
}

impl<T: Element> LayerOps<T> for FusedWinogradConvSeLayer<T> {
    fn name(&self) -> &'static str {
        "fused_winograd_conv_se"
    }

    fn input_shape(&self) -> TensorShape {
        TensorShape::board(1, self.c_in)
    }

    fn output_shape(&self) -> TensorShape {
        TensorShape::board(1, self.c_out)
    }

    fn workspace_size(&self, max_batch: usize) -> usize {
        let n = max_batch;
        let base = [
            winograd_transformed_len(n, self.c_in),
            winograd_transformed_len(n, self.c_out),
        ];
        match self.se_k {
            // Fallback keeps the pre-SE activation in scratch too.
            Some(k) => {
                arena_footprint(&[base[0], base[1], n * self.c_out * 64]) + decomposed_workspace(n, self.c_out, k)
            }
            None => arena_footprint(&base),
        }
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
        let w = self.weights.as_ref().ok_or(RookError::LayerNotLoaded("fused_winograd_conv_se"))?;
        let skip = if self.skip_add { skip } else { None };
        let mut arena = WorkspaceArena::new(workspace);
        let mut v = arena.take(winograd_transformed_len(n, self.c_in))?;
        let mut m = arena.take(winograd_transformed_len(n, self.c_out))?;

        ops::winograd_input_transform(h.stream, &mut v, input, n, self.c_in, self.layout)?;
        w.filter.multiply(h, n, v.view(), &mut m)?;

        let bias = self.use_bias.then(|| w.filter.bias.view());
        let fused_se = w
            .se
            .as_ref()
            .filter(|se| h.caps.can_fuse_se(self.c_out, se.k()));
        match (&w.se, fused_se) {
            (Some(se), None) => {
                tracing::trace!(channels = self.c_out, k = se.k(), "winograd conv: SE decomposed");
                let mut pre = arena.take(n * self.c_out * 64)?;
                let epilogue = WinogradEpilogue { bias, ..WinogradEpilogue::none() };
                ops::winograd_output_transform(h.stream, &mut pre, m.view(), &epilogue, n, self.c_out, self.layout)?;
                let shape = TensorShape::board(n, self.c_out);
                se_decomposed(h, &mut arena, output, pre.view(), skip, se, None, shape, self.layout, self.relu)
            }
            _ => {
                let epilogue = WinogradEpilogue {
                    bias,
                    se: fused_se.map(DeviceSe::view),
                    skip,
                    relu: self.relu,
                };
                ops::winograd_output_transform(h.stream, output, m.view(), &epilogue, n, self.c_out, self.layout)
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

    use crate::conv::{ConvLayer, ConvOptions};
    use crate::se::SeLayer;

    fn assert_close(a: &[f32], b: &[f32], tol: f32) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert!((x - y).abs() < tol, "element {}: {} vs {}", i, x, y);
        }
    }

    fn random(rng: &mut StdRng, len: usize) -> Vec<f32> {
        (0..len).map(|_| rng.gen_range(-0.5..0.5)).collect()
    }

    struct Ctx {
        stream: Stream,
        blas: BlasHandle,
        dnn: DnnHandle,
        caps: DeviceCaps,
    }

    impl Ctx {
        fn new(caps: DeviceCaps) -> Self {
            let stream = Stream::new(&Device::Host).unwrap();
            let blas = BlasHandle::new(&stream).unwrap();
            let dnn = DnnHandle::new(&stream);
            Self { stream, blas, dnn, caps }
        }

        fn handles(&self) -> Handles<'_> {
            Handles { stream: &self.stream, blas: &self.blas, dnn: &self.dnn, caps: &self.caps }
        }

        fn eval(&self, layer: &dyn LayerOps<f32>, n: usize, x: &[f32], skip: Option<&[f32]>) -> Vec<f32> {
            let input = DeviceBuffer::from_host(&Device::Host, x).unwrap();
            let skip = skip.map(|s| DeviceBuffer::from_host(&Device::Host, s).unwrap());
            let out_len = n * layer.output_shape().sample_len();
            let mut out = DeviceBuffer::<f32>::zeros(&Device::Host, out_len).unwrap();
            let mut ws = DeviceBuffer::<f32>::zeros(&Device::Host, layer.workspace_size(n)).unwrap();
            layer
                .evaluate(n, &mut out.view_mut(), input.view(), skip.as_ref().map(|s| s.view()), ws.view_mut(), &self.handles())
                .unwrap();
            out.to_host_vec().unwrap()
        }
    }

    #[test]
    fn test_matches_vendor_convolution() {
        let (n, c, k) = (2, 3, 4);
        let mut rng = StdRng::seed_from_u64(3);
        let filter = random(&mut rng, k * c * 9);
        let bias = random(&mut rng, k);
        let x = random(&mut rng, n * c * 64);
        let skip = random(&mut rng, n * k * 64);
        let conv = ConvWeights { filter: &filter, bias: Some(&bias), bn: None, dims: None };

        let ctx = Ctx::new(DeviceCaps::detect(&Device::Host).unwrap());
        let loader = WeightLoader::new(&ctx.stream, ctx.caps);
        let mut wino = FusedWinogradConvSeLayer::<f32>::new(c, k, Layout::Nchw, true, true, true);
        wino.load_weights(&loader, &conv, None).unwrap();
        let opts = ConvOptions { filter_size: 3, relu: true, use_bias: true, skip_add: true };
        let mut vendor = ConvLayer::<f32>::new(c, k, Layout::Nchw, opts);
        vendor.load_weights(&loader, &conv).unwrap();

        assert_close(&ctx.eval(&wino, n, &x, Some(&skip)), &ctx.eval(&vendor, n, &x, Some(&skip)), 1e-4);
    }

    #[test]
    fn test_fused_se_matches_separate_se_layer() {
        let (n, c, k, se_k) = (2, 4, 6, 3);
        let mut rng = StdRng::seed_from_u64(5);
        let filter = random(&mut rng, k * c * 9);
        let bias = random(&mut rng, k);
        let (w1, b1, w2, b2) = (random(&mut rng, se_k * k), random(&mut rng, se_k), random(&mut rng, 2 * k * se_k), random(&mut rng, 2 * k));
        let x = random(&mut rng, n * c * 64);
        let skip = random(&mut rng, n * k * 64);
        let conv = ConvWeights { filter: &filter, bias: Some(&bias), bn: None, dims: None };
        let se = SeParams { w1: &w1, b1: &b1, w2: &w2, b2: &b2 };

        let ctx = Ctx::new(DeviceCaps::default());
        let loader = WeightLoader::new(&ctx.stream, ctx.caps);
        let mut fused = FusedWinogradConvSeLayer::<f32>::new(c, k, Layout::Nhwc, true, true, true).with_se(se_k);
        fused.load_weights(&loader, &conv, Some(&se)).unwrap();

        // conv without bias, then SE adding the conv bias as previous-layer bias.
        let mut plain = FusedWinogradConvSeLayer::<f32>::new(c, k, Layout::Nhwc, false, false, false);
        plain.load_weights(&loader, &conv, None).unwrap();
        let mut se_layer = SeLayer::<f32>::new(k, se_k, Layout::Nhwc, true, true).decomposed();
        se_layer.load_weights(&loader, &se, Some(&bias)).unwrap();

        let expected = ctx.eval(&se_layer, n, &ctx.eval(&plain, n, &x, None), Some(&skip));
        assert_close(&ctx.eval(&fused, n, &x, Some(&skip)), &expected, 1e-4);

        // Same result when the device cannot fuse the SE into the transform.
        let narrow = Ctx::new(DeviceCaps { max_se_fusing_k: 1, ..DeviceCaps::default() });
        let loader = WeightLoader::new(&narrow.stream, narrow.caps);
        fused.load_weights(&loader, &conv, Some(&se)).unwrap();
        assert_close(&narrow.eval(&fused, n, &x, Some(&skip)), &expected, 1e-4);
    }

    #[test]
    fn test_missing_se_weights() {
        let stream = Stream::new(&Device::Host).unwrap();
        let loader = WeightLoader::new(&stream, DeviceCaps::default());
        let filter = vec![0.0f32; 2 * 2 * 9];
        let conv = ConvWeights { filter: &filter, bias: None, bn: None, dims: None };
        let mut layer = FusedWinogradConvSeLayer::<f32>::new(2, 2, Layout::Nchw, true, true, false).with_se(2);
        assert!(matches!(layer.load_weights(&loader, &conv, None), Err(RookError::MissingTensor(_))));
    }
}
