//! CUDA kernel launches.
//!
//! Operands arrive as raw device addresses already validated by the
//! dispatch layer; absent optional operands are null and gated by a flag
//! bit, so the kernel never dereferences them.

use cudarc::driver::{DeviceRepr, LaunchAsync, LaunchConfig};
use rook_core::stream::CudaStreamHandle;
use rook_core::{Activation, Element, Layout, Result, RookError, TensorShape, BOARD_SQUARES};

use super::launch::{get_or_load_func, grid_1d, per_sample, typed, typed2, BLOCK_SIZE};
use super::CudaError;

// ============================================================================
// Kernel sources (embedded at compile time)
// ============================================================================

const ELEMENTWISE_CU: &str = concat!(include_str!("kernels/common.cuh"), include_str!("kernels/elementwise.cu"));
const SE_CU: &str = concat!(include_str!("kernels/common.cuh"), include_str!("kernels/se.cu"));
const WINOGRAD_CU: &str = concat!(include_str!("kernels/common.cuh"), include_str!("kernels/winograd.cu"));

const ELEMENTWISE_FNS: &[&str] = &[
    "expand_planes_f32",
    "expand_planes_f16",
    "bias_activation_f32",
    "bias_activation_f16",
    "add_vectors_f32",
    "add_vectors_f16",
    "batch_norm_f32",
    "batch_norm_f16",
    "policy_zero_f32",
    "policy_zero_f16",
    "policy_scatter_f32",
    "policy_scatter_f16",
    "convert_f32_f32",
    "convert_f32_f16",
    "convert_f16_f32",
    "convert_f16_f16",
];

const SE_FNS: &[&str] = &[
    "global_avg_pool_f32",
    "global_avg_pool_f16",
    "global_scale_f32",
    "global_scale_f16",
    "se_fused_f32",
    "se_fused_f16",
];

const WINOGRAD_FNS: &[&str] = &[
    "winograd_filter_f32",
    "winograd_filter_f16",
    "winograd_input_f32",
    "winograd_input_f16",
    "winograd_output_f32",
    "winograd_output_f16",
];

// Flag bits shared with kernels/common.cuh.
const FLAG_BIAS: u32 = 1;
const FLAG_SKIP: u32 = 2;
const FLAG_SE: u32 = 4;
const FLAG_RELU: u32 = 8;
const FLAG_NHWC: u32 = 16;
const FLAG_PREV_BIAS: u32 = 32;
const FLAG_NEXT: u32 = 64;

/// Largest block the fused SE epilogue runs with (one thread per channel).
const MAX_SE_THREADS: usize = 1024;

/// SE weight addresses, passed to kernels by value.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SePtrs {
    pub w1: u64,
    pub b1: u64,
    pub w2: u64,
    pub b2: u64,
    pub k: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SeArgs {
    w1: u64,
    b1: u64,
    w2: u64,
    b2: u64,
    k: u32,
    pad: u32,
}

// Safety: plain-old-data with the same layout as `struct SeArgs` in
// kernels/common.cuh.
unsafe impl DeviceRepr for SeArgs {}

impl From<SePtrs> for SeArgs {
    fn from(p: SePtrs) -> Self {
        SeArgs {
            w1: p.w1,
            b1: p.b1,
            w2: p.w2,
            b2: p.b2,
            k: p.k as u32,
            pad: 0,
        }
    }
}

/// Winograd output-stage operands.
#[derive(Debug, Clone, Copy, Default)]
pub struct EpiloguePtrs {
    pub bias: u64,
    pub skip: u64,
    pub se: SePtrs,
    pub has_se: bool,
    pub relu: bool,
}

fn flag(on: bool, bit: u32) -> u32 {
    if on {
        bit
    } else {
        0
    }
}

fn nhwc(layout: Layout) -> u32 {
    flag(layout == Layout::Nhwc, FLAG_NHWC)
}

fn launch_err(op: &'static str) -> impl Fn(cudarc::driver::DriverError) -> RookError {
    move |e| CudaError::LaunchError(e.to_string()).into_rook(op)
}

fn func(
    s: &CudaStreamHandle,
    module: &'static str,
    source: &str,
    functions: &[&'static str],
    name: &str,
    op: &'static str,
) -> Result<cudarc::driver::CudaFunction> {
    get_or_load_func(&s.device, s.device_idx, module, source, functions, name).map_err(|e| e.into_rook(op))
}

fn elementwise<T: Element>(s: &CudaStreamHandle, base: &str, op: &'static str) -> Result<cudarc::driver::CudaFunction> {
    func(s, "rook_elementwise", ELEMENTWISE_CU, ELEMENTWISE_FNS, &typed(base, T::DTYPE), op)
}

// ============================================================================
// Elementwise
// ============================================================================

pub fn expand_planes<T: Element>(
    s: &CudaStreamHandle,
    out: u64,
    masks: u64,
    values: u64,
    n: usize,
    planes: usize,
    layout: Layout,
) -> Result<()> {
    const OP: &str = "expand_planes";
    let f = elementwise::<T>(s, "expand_planes", OP)?;
    let total = n * planes * BOARD_SQUARES;
    unsafe {
        f.launch_on_stream(
            &s.stream,
            grid_1d(total, BLOCK_SIZE),
            (out, masks, values, n as u32, planes as u32, nhwc(layout)),
        )
    }
    .map_err(launch_err(OP))
}

pub fn bias_activation<T: Element>(
    s: &CudaStreamHandle,
    data: u64,
    bias: u64,
    shape: TensorShape,
    layout: Layout,
    act: Activation,
) -> Result<()> {
    const OP: &str = "bias_activation";
    let f = elementwise::<T>(s, "bias_activation", OP)?;
    let total = shape.numel();
    unsafe {
        f.launch_on_stream(
            &s.stream,
            grid_1d(total, BLOCK_SIZE),
            (
                data,
                bias,
                total as u32,
                shape.c as u32,
                shape.spatial() as u32,
                nhwc(layout),
                act.code(),
            ),
        )
    }
    .map_err(launch_err(OP))
}

#[allow(clippy::too_many_arguments)]
pub fn add_vectors<T: Element>(
    s: &CudaStreamHandle,
    out: u64,
    a: u64,
    a_len: usize,
    b: u64,
    b_len: usize,
    len: usize,
    act: Activation,
) -> Result<()> {
    const OP: &str = "add_vectors";
    let f = elementwise::<T>(s, "add_vectors", OP)?;
    unsafe {
        f.launch_on_stream(
            &s.stream,
            grid_1d(len, BLOCK_SIZE),
            (out, a, a_len as u32, b, b_len as u32, len as u32, act.code()),
        )
    }
    .map_err(launch_err(OP))
}

#[allow(clippy::too_many_arguments)]
pub fn batch_norm<T: Element>(
    s: &CudaStreamHandle,
    out: u64,
    input: u64,
    skip: u64,
    means: u64,
    var_multipliers: u64,
    shape: TensorShape,
    layout: Layout,
    relu: bool,
) -> Result<()> {
    const OP: &str = "batch_norm";
    let f = elementwise::<T>(s, "batch_norm", OP)?;
    let total = shape.numel();
    let flags = nhwc(layout) | flag(skip != 0, FLAG_SKIP) | flag(relu, FLAG_RELU);
    unsafe {
        f.launch_on_stream(
            &s.stream,
            grid_1d(total, BLOCK_SIZE),
            (
                out,
                input,
                skip,
                means,
                var_multipliers,
                total as u32,
                shape.c as u32,
                shape.spatial() as u32,
                flags,
            ),
        )
    }
    .map_err(launch_err(OP))
}

#[allow(clippy::too_many_arguments)]
pub fn policy_map<T: Element>(
    s: &CudaStreamHandle,
    out: u64,
    input: u64,
    indices: u64,
    n: usize,
    input_size: usize,
    used_size: usize,
    output_size: usize,
) -> Result<()> {
    const OP: &str = "policy_map";
    let zero = elementwise::<T>(s, "policy_zero", OP)?;
    let scatter = elementwise::<T>(s, "policy_scatter", OP)?;
    let total_out = n * output_size;
    unsafe {
        zero.launch_on_stream(&s.stream, grid_1d(total_out, BLOCK_SIZE), (out, total_out as u32))
            .map_err(launch_err(OP))?;
        scatter
            .launch_on_stream(
                &s.stream,
                grid_1d(n * used_size, BLOCK_SIZE),
                (
                    out,
                    input,
                    indices,
                    n as u32,
                    input_size as u32,
                    used_size as u32,
                    output_size as u32,
                ),
            )
            .map_err(launch_err(OP))
    }
}

pub fn convert_tensor<S: Element, D: Element>(
    s: &CudaStreamHandle,
    out: u64,
    out_layout: Layout,
    input: u64,
    in_layout: Layout,
    shape: TensorShape,
) -> Result<()> {
    const OP: &str = "convert_tensor";
    let name = typed2("convert", S::DTYPE, D::DTYPE);
    let f = func(s, "rook_elementwise", ELEMENTWISE_CU, ELEMENTWISE_FNS, &name, OP)?;
    let total = shape.numel();
    unsafe {
        f.launch_on_stream(
            &s.stream,
            grid_1d(total, BLOCK_SIZE),
            (
                out,
                input,
                total as u32,
                shape.c as u32,
                shape.spatial() as u32,
                flag(in_layout == Layout::Nhwc, 1),
                flag(out_layout == Layout::Nhwc, 1),
            ),
        )
    }
    .map_err(launch_err(OP))
}

// ============================================================================
// Squeeze-and-excitation
// ============================================================================

fn se_func<T: Element>(s: &CudaStreamHandle, base: &str, op: &'static str) -> Result<cudarc::driver::CudaFunction> {
    func(s, "rook_se", SE_CU, SE_FNS, &typed(base, T::DTYPE), op)
}

pub fn global_avg_pool<T: Element>(
    s: &CudaStreamHandle,
    out: u64,
    input: u64,
    prev_bias: u64,
    shape: TensorShape,
    layout: Layout,
) -> Result<()> {
    const OP: &str = "global_avg_pool";
    let f = se_func::<T>(s, "global_avg_pool", OP)?;
    let flags = nhwc(layout) | flag(prev_bias != 0, FLAG_PREV_BIAS);
    unsafe {
        f.launch_on_stream(
            &s.stream,
            grid_1d(shape.n * shape.c, BLOCK_SIZE),
            (out, input, prev_bias, shape.n as u32, shape.c as u32, flags),
        )
    }
    .map_err(launch_err(OP))
}

#[allow(clippy::too_many_arguments)]
pub fn global_scale<T: Element>(
    s: &CudaStreamHandle,
    out: u64,
    input: u64,
    scale_bias: u64,
    prev_bias: u64,
    skip: u64,
    shape: TensorShape,
    layout: Layout,
    relu: bool,
) -> Result<()> {
    const OP: &str = "global_scale";
    let f = se_func::<T>(s, "global_scale", OP)?;
    let flags = nhwc(layout)
        | flag(prev_bias != 0, FLAG_PREV_BIAS)
        | flag(skip != 0, FLAG_SKIP)
        | flag(relu, FLAG_RELU);
    unsafe {
        f.launch_on_stream(
            &s.stream,
            grid_1d(shape.numel(), BLOCK_SIZE),
            (out, input, scale_bias, prev_bias, skip, shape.n as u32, shape.c as u32, flags),
        )
    }
    .map_err(launch_err(OP))
}

#[allow(clippy::too_many_arguments)]
pub fn se_fused<T: Element>(
    s: &CudaStreamHandle,
    out: u64,
    input: u64,
    skip: u64,
    se: SePtrs,
    prev_bias: u64,
    shape: TensorShape,
    layout: Layout,
    relu: bool,
) -> Result<()> {
    const OP: &str = "se_fused";
    let f = se_func::<T>(s, "se_fused", OP)?;
    let flags = nhwc(layout)
        | flag(prev_bias != 0, FLAG_PREV_BIAS)
        | flag(skip != 0, FLAG_SKIP)
        | flag(relu, FLAG_RELU);
    let cfg: LaunchConfig = per_sample(shape.n, shape.c, shape.c + se.k);
    unsafe {
        f.launch_on_stream(
            &s.stream,
            cfg,
            (out, input, skip, prev_bias, SeArgs::from(se), shape.c as u32, flags),
        )
    }
    .map_err(launch_err(OP))
}

// ============================================================================
// Winograd F(4x4, 3x3)
// ============================================================================

fn winograd_func<T: Element>(s: &CudaStreamHandle, base: &str, op: &'static str) -> Result<cudarc::driver::CudaFunction> {
    func(s, "rook_winograd", WINOGRAD_CU, WINOGRAD_FNS, &typed(base, T::DTYPE), op)
}

pub fn winograd_filter_transform<T: Element>(
    s: &CudaStreamHandle,
    out: u64,
    filter: u64,
    k: usize,
    c: usize,
) -> Result<()> {
    const OP: &str = "winograd_filter_transform";
    let f = winograd_func::<T>(s, "winograd_filter", OP)?;
    unsafe { f.launch_on_stream(&s.stream, grid_1d(k * c, BLOCK_SIZE), (out, filter, k as u32, c as u32)) }
        .map_err(launch_err(OP))
}

pub fn winograd_input_transform<T: Element>(
    s: &CudaStreamHandle,
    out: u64,
    input: u64,
    n: usize,
    c: usize,
    layout: Layout,
) -> Result<()> {
    const OP: &str = "winograd_input_transform";
    let f = winograd_func::<T>(s, "winograd_input", OP)?;
    unsafe {
        f.launch_on_stream(
            &s.stream,
            grid_1d(n * c, BLOCK_SIZE),
            (out, input, n as u32, c as u32, nhwc(layout)),
        )
    }
    .map_err(launch_err(OP))
}

/// Output transform; `next` is null unless the next layer's transformed
/// input should be emitted too.
#[allow(clippy::too_many_arguments)]
pub fn winograd_output_transform<T: Element>(
    s: &CudaStreamHandle,
    out: u64,
    next: u64,
    transformed: u64,
    epilogue: EpiloguePtrs,
    n: usize,
    k: usize,
    layout: Layout,
) -> Result<()> {
    const OP: &str = "winograd_output_transform";
    let f = winograd_func::<T>(s, "winograd_output", OP)?;
    let flags = nhwc(layout)
        | flag(epilogue.bias != 0, FLAG_BIAS)
        | flag(epilogue.skip != 0, FLAG_SKIP)
        | flag(epilogue.has_se, FLAG_SE)
        | flag(epilogue.relu, FLAG_RELU)
        | flag(next != 0, FLAG_NEXT);
    let cfg = if epilogue.has_se {
        if k > MAX_SE_THREADS {
            return Err(RookError::UnsupportedTopology(format!(
                "fused SE epilogue over {} channels exceeds {} threads",
                k, MAX_SE_THREADS
            )));
        }
        per_sample(n, k, k + epilogue.se.k)
    } else {
        per_sample(n, k.min(BLOCK_SIZE), 0)
    };
    unsafe {
        f.launch_on_stream(
            &s.stream,
            cfg,
            (
                out,
                next,
                transformed,
                epilogue.bias,
                epilogue.skip,
                SeArgs::from(epilogue.se),
                n as u32,
                k as u32,
                flags,
            ),
        )
    }
    .map_err(launch_err(OP))
}
