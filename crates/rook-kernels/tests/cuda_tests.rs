//! GPU parity tests: every CUDA kernel against the host runtime.
//! Run with: cargo test -p rook-kernels --features cuda -- --nocapture

#![cfg(feature = "cuda")]

use half::f16;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rook_core::{Activation, Device, DeviceBuffer, DeviceCaps, Layout, Stream, TensorShape};
use rook_kernels::{ops, BlasHandle, GemmShape, SeWeights, WinogradEpilogue};

const GPU: Device = Device::Cuda(0);

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!((x - y).abs() < tol, "element {} differs: {} vs {} (tol={})", i, x, y, tol);
    }
}

fn random(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn streams() -> (Stream, Stream) {
    (Stream::new(&Device::Host).unwrap(), Stream::new(&GPU).unwrap())
}

fn pair(data: &[f32]) -> (DeviceBuffer<f32>, DeviceBuffer<f32>) {
    (DeviceBuffer::from_host(&Device::Host, data).unwrap(), DeviceBuffer::from_host(&GPU, data).unwrap())
}

fn fetch(gpu: &Stream, buf: &DeviceBuffer<f32>) -> Vec<f32> {
    gpu.synchronize().unwrap();
    buf.to_host_vec().unwrap()
}

// ============================================================================
// Elementwise
// ============================================================================

#[test]
fn test_cuda_bias_activation_nhwc() {
    let (hs, gs) = streams();
    let shape = TensorShape::board(3, 5);
    let data = random(shape.numel(), 1);
    let (bias_h, bias_g) = pair(&random(5, 2));
    let (mut h, mut g) = pair(&data);
    ops::bias_activation(&hs, &mut h.view_mut(), bias_h.view(), shape, Layout::Nhwc, Activation::Relu).unwrap();
    ops::bias_activation(&gs, &mut g.view_mut(), bias_g.view(), shape, Layout::Nhwc, Activation::Relu).unwrap();
    assert_close(&fetch(&gs, &g), &h.to_host_vec().unwrap(), 1e-6);
}

#[test]
fn test_cuda_batch_norm_with_skip() {
    let (hs, gs) = streams();
    let shape = TensorShape::board(2, 4);
    let (x_h, x_g) = pair(&random(shape.numel(), 3));
    let (s_h, s_g) = pair(&random(shape.numel(), 4));
    let (m_h, m_g) = pair(&random(4, 5));
    let (v_h, v_g) = pair(&[1.0, 0.5, 2.0, 0.25]);
    let mut out_h = DeviceBuffer::<f32>::zeros(&Device::Host, shape.numel()).unwrap();
    let mut out_g = DeviceBuffer::<f32>::zeros(&GPU, shape.numel()).unwrap();
    ops::batch_norm(&hs, &mut out_h.view_mut(), x_h.view(), Some(s_h.view()), m_h.view(), v_h.view(), shape, Layout::Nchw, true)
        .unwrap();
    ops::batch_norm(&gs, &mut out_g.view_mut(), x_g.view(), Some(s_g.view()), m_g.view(), v_g.view(), shape, Layout::Nchw, true)
        .unwrap();
    assert_close(&fetch(&gs, &out_g), &out_h.to_host_vec().unwrap(), 1e-5);
}

#[test]
fn test_cuda_expand_planes() {
    let (hs, gs) = streams();
    let masks = [0x8000_0000_0000_0001u64, 0xff00, 0, u64::MAX];
    let values = [1.0f32, 2.0, 3.0, 0.5];
    let masks_h = DeviceBuffer::from_host(&Device::Host, &masks).unwrap();
    let masks_g = DeviceBuffer::from_host(&GPU, &masks).unwrap();
    let (val_h, val_g) = pair(&values);
    for layout in [Layout::Nchw, Layout::Nhwc] {
        let mut out_h = DeviceBuffer::<f32>::zeros(&Device::Host, 4 * 64).unwrap();
        let mut out_g = DeviceBuffer::<f32>::zeros(&GPU, 4 * 64).unwrap();
        ops::expand_planes(&hs, &mut out_h.view_mut(), masks_h.view(), val_h.view(), 2, 2, layout).unwrap();
        ops::expand_planes(&gs, &mut out_g.view_mut(), masks_g.view(), val_g.view(), 2, 2, layout).unwrap();
        assert_close(&fetch(&gs, &out_g), &out_h.to_host_vec().unwrap(), 1e-7);
    }
}

#[test]
fn test_cuda_policy_map_skips_sentinels() {
    let (hs, gs) = streams();
    let indices: Vec<i16> = vec![3, -1, 0, 5, -1, 1];
    let idx_h = DeviceBuffer::from_host(&Device::Host, &indices).unwrap();
    let idx_g = DeviceBuffer::from_host(&GPU, &indices).unwrap();
    let (in_h, in_g) = pair(&random(2 * 8, 6));
    let mut out_h = DeviceBuffer::<f32>::zeros(&Device::Host, 2 * 7).unwrap();
    let mut out_g = DeviceBuffer::from_host(&GPU, &[9.0f32; 14]).unwrap();
    ops::policy_map(&hs, &mut out_h.view_mut(), in_h.view(), idx_h.view(), 2, 8, 6, 7).unwrap();
    ops::policy_map(&gs, &mut out_g.view_mut(), in_g.view(), idx_g.view(), 2, 8, 6, 7).unwrap();
    assert_close(&fetch(&gs, &out_g), &out_h.to_host_vec().unwrap(), 1e-7);
}

#[test]
fn test_cuda_convert_layout_and_half() {
    let gs = Stream::new(&GPU).unwrap();
    let shape = TensorShape::board(2, 3);
    let data = random(shape.numel(), 7);
    let src = DeviceBuffer::from_host(&GPU, &data).unwrap();
    let mut half = DeviceBuffer::<f16>::zeros(&GPU, shape.numel()).unwrap();
    let mut back = DeviceBuffer::<f32>::zeros(&GPU, shape.numel()).unwrap();
    ops::convert_tensor::<f32, f16>(&gs, &mut half.view_mut(), Layout::Nhwc, src.view(), Layout::Nchw, shape).unwrap();
    ops::convert_tensor::<f16, f32>(&gs, &mut back.view_mut(), Layout::Nchw, half.view(), Layout::Nhwc, shape).unwrap();
    assert_close(&fetch(&gs, &back), &data, 1e-3);
}

// ============================================================================
// SE and Winograd
// ============================================================================

#[test]
fn test_cuda_se_fused_matches_host() {
    let (hs, gs) = streams();
    let (c, k) = (8, 4);
    let shape = TensorShape::board(3, c);
    let (x_h, x_g) = pair(&random(shape.numel(), 8));
    let (w1_h, w1_g) = pair(&random(k * c, 9));
    let (b1_h, b1_g) = pair(&random(k, 10));
    let (w2_h, w2_g) = pair(&random(2 * c * k, 11));
    let (b2_h, b2_g) = pair(&random(2 * c, 12));
    let (pb_h, pb_g) = pair(&random(c, 13));
    let se_h = SeWeights { w1: w1_h.view(), b1: b1_h.view(), w2: w2_h.view(), b2: b2_h.view(), k };
    let se_g = SeWeights { w1: w1_g.view(), b1: b1_g.view(), w2: w2_g.view(), b2: b2_g.view(), k };
    let caps = DeviceCaps::default();
    for layout in [Layout::Nchw, Layout::Nhwc] {
        let mut out_h = DeviceBuffer::<f32>::zeros(&Device::Host, shape.numel()).unwrap();
        let mut out_g = DeviceBuffer::<f32>::zeros(&GPU, shape.numel()).unwrap();
        assert!(ops::se_fused(&hs, &caps, &mut out_h.view_mut(), x_h.view(), Some(x_h.view()), &se_h, Some(pb_h.view()), shape, layout, true)
            .unwrap());
        assert!(ops::se_fused(&gs, &caps, &mut out_g.view_mut(), x_g.view(), Some(x_g.view()), &se_g, Some(pb_g.view()), shape, layout, true)
            .unwrap());
        assert_close(&fetch(&gs, &out_g), &out_h.to_host_vec().unwrap(), 1e-4);
    }
}

#[test]
fn test_cuda_winograd_pipeline_matches_host() {
    let (hs, gs) = streams();
    let (n, c, k) = (2, 6, 5);
    let tiles = n * 4;
    let (f_h, f_g) = pair(&random(k * c * 9, 14));
    let (x_h, x_g) = pair(&random(n * c * 64, 15));
    let (bias_h, bias_g) = pair(&random(k, 16));

    let run = |s: &Stream, dev: Device, f: &DeviceBuffer<f32>, x: &DeviceBuffer<f32>, bias: &DeviceBuffer<f32>| {
        let mut u = DeviceBuffer::<f32>::zeros(&dev, 36 * c * k).unwrap();
        let mut v = DeviceBuffer::<f32>::zeros(&dev, ops::winograd_transformed_len(n, c)).unwrap();
        let mut m = DeviceBuffer::<f32>::zeros(&dev, ops::winograd_transformed_len(n, k)).unwrap();
        let mut out = DeviceBuffer::<f32>::zeros(&dev, n * k * 64).unwrap();
        let mut next = DeviceBuffer::<f32>::zeros(&dev, ops::winograd_transformed_len(n, k)).unwrap();
        ops::winograd_filter_transform(s, &mut u.view_mut(), f.view(), k, c).unwrap();
        ops::winograd_input_transform(s, &mut v.view_mut(), x.view(), n, c, Layout::Nhwc).unwrap();
        let blas = BlasHandle::new(s).unwrap();
        let shape = GemmShape {
            m: tiles,
            n: k,
            k: c,
            trans_a: false,
            trans_b: false,
            batch: 36,
            stride_a: tiles * c,
            stride_b: c * k,
            stride_c: tiles * k,
        };
        blas.gemm_strided_batched(s, &shape, v.view(), u.view(), &mut m.view_mut()).unwrap();
        let epi = WinogradEpilogue { bias: Some(bias.view()), se: None, skip: None, relu: true };
        ops::winograd_output_input_transform(s, &mut out.view_mut(), &mut next.view_mut(), m.view(), &epi, n, k, Layout::Nhwc)
            .unwrap();
        s.synchronize().unwrap();
        (out.to_host_vec().unwrap(), next.to_host_vec().unwrap())
    };

    let (out_h, next_h) = run(&hs, Device::Host, &f_h, &x_h, &bias_h);
    let (out_g, next_g) = run(&gs, GPU, &f_g, &x_g, &bias_g);
    assert_close(&out_g, &out_h, 1e-3);
    assert_close(&next_g, &next_h, 1e-2);
}

#[test]
fn test_cuda_gemm_transposed_b() {
    let (hs, gs) = streams();
    let (m, n, k) = (7, 5, 9);
    let (a_h, a_g) = pair(&random(m * k, 17));
    let (b_h, b_g) = pair(&random(n * k, 18));
    let shape = GemmShape::single(m, n, k, false, true);
    let mut c_h = DeviceBuffer::<f32>::zeros(&Device::Host, m * n).unwrap();
    let mut c_g = DeviceBuffer::<f32>::zeros(&GPU, m * n).unwrap();
    BlasHandle::new(&hs).unwrap().gemm_strided_batched(&hs, &shape, a_h.view(), b_h.view(), &mut c_h.view_mut()).unwrap();
    BlasHandle::new(&gs).unwrap().gemm_strided_batched(&gs, &shape, a_g.view(), b_g.view(), &mut c_g.view_mut()).unwrap();
    assert_close(&fetch(&gs, &c_g), &c_h.to_host_vec().unwrap(), 1e-4);
}
