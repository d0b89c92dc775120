//! Kernel dispatch surface.
//!
//! One function per logical operation, generic over the element type.
//! Each validates extents, counts the launch on the stream, and routes to
//! the runtime that owns the stream. Operand views must live on the same
//! runtime as the stream, otherwise `DeviceMismatch` is returned.

use rook_core::{
    ensure_len, Activation, DevSlice, DevSliceMut, DeviceCaps, Element, Layout, Result, RookError, Stream,
    TensorShape, BOARD_SQUARES,
};

use crate::host;
use crate::host::se::HostSe;
use crate::host::winograd::{HostEpilogue, TILES_PER_BOARD, WINOGRAD_ELEMENTS};

/// Squeeze-and-excitation weights on the device.
///
/// `w1` is `[k][c]`, `b1` is `[k]`, `w2` is `[2c][k]`, `b2` is `[2c]`.
pub struct SeWeights<'a, T> {
    pub w1: DevSlice<'a, T>,
    pub b1: DevSlice<'a, T>,
    pub w2: DevSlice<'a, T>,
    pub b2: DevSlice<'a, T>,
    pub k: usize,
}

impl<T> Clone for SeWeights<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SeWeights<'_, T> {}

impl<'a, T> SeWeights<'a, T> {
    fn check(&self, op: &'static str, c: usize) -> Result<()> {
        ensure_len(op, self.k * c, self.w1.len())?;
        ensure_len(op, self.k, self.b1.len())?;
        ensure_len(op, 2 * c * self.k, self.w2.len())?;
        ensure_len(op, 2 * c, self.b2.len())
    }

    fn host(&self, op: &'static str) -> Result<HostSe<'a, T>> {
        Ok(HostSe {
            w1: host(op, self.w1)?,
            b1: host(op, self.b1)?,
            w2: host(op, self.w2)?,
            b2: host(op, self.b2)?,
            k: self.k,
        })
    }
}

/// Work fused into the Winograd output stage:
/// `y = relu?(SE(conv + bias) + skip)`.
pub struct WinogradEpilogue<'a, T> {
    pub bias: Option<DevSlice<'a, T>>,
    pub se: Option<SeWeights<'a, T>>,
    pub skip: Option<DevSlice<'a, T>>,
    pub relu: bool,
}

impl<'a, T> WinogradEpilogue<'a, T> {
    /// Plain output transform.
    pub fn none() -> Self {
        Self {
            bias: None,
            se: None,
            skip: None,
            relu: false,
        }
    }

    fn host(&self, op: &'static str) -> Result<HostEpilogue<'a, T>> {
        Ok(HostEpilogue {
            bias: host_opt(op, self.bias)?,
            se: self.se.map(|se| se.host(op)).transpose()?,
            skip: host_opt(op, self.skip)?,
            relu: self.relu,
        })
    }

    fn check(&self, op: &'static str, n: usize, k: usize) -> Result<()> {
        if let Some(bias) = self.bias {
            ensure_len(op, k, bias.len())?;
        }
        if let Some(skip) = self.skip {
            ensure_len(op, n * k * BOARD_SQUARES, skip.len())?;
        }
        if let Some(se) = &self.se {
            se.check(op, k)?;
        }
        Ok(())
    }
}

/// Elements of a Winograd-transformed tensor of `n` boards and `c` planes.
pub fn winograd_transformed_len(n: usize, c: usize) -> usize {
    WINOGRAD_ELEMENTS * n * TILES_PER_BOARD * c
}

fn host<'a, T>(op: &'static str, s: DevSlice<'a, T>) -> Result<&'a [T]> {
    s.as_host().ok_or(RookError::DeviceMismatch { op })
}

fn host_opt<'a, T>(op: &'static str, s: Option<DevSlice<'a, T>>) -> Result<Option<&'a [T]>> {
    s.map(|s| host(op, s)).transpose()
}

fn host_mut<'s, T>(op: &'static str, s: &'s mut DevSliceMut<'_, T>) -> Result<&'s mut [T]> {
    s.as_host_mut().ok_or(RookError::DeviceMismatch { op })
}

#[cfg(feature = "cuda")]
fn dptr<T>(op: &'static str, s: DevSlice<'_, T>) -> Result<u64> {
    s.as_cuda().map(|r| r.ptr()).ok_or(RookError::DeviceMismatch { op })
}

#[cfg(feature = "cuda")]
fn dptr_opt<T>(op: &'static str, s: Option<DevSlice<'_, T>>) -> Result<u64> {
    s.map_or(Ok(0), |s| dptr(op, s))
}

#[cfg(feature = "cuda")]
fn dptr_mut<T>(op: &'static str, s: &mut DevSliceMut<'_, T>) -> Result<u64> {
    s.as_cuda_mut().map(|r| r.ptr()).ok_or(RookError::DeviceMismatch { op })
}

#[cfg(feature = "cuda")]
fn cuda_se<T>(op: &'static str, se: Option<&SeWeights<'_, T>>) -> Result<crate::cuda::ops::SePtrs> {
    match se {
        Some(se) => Ok(crate::cuda::ops::SePtrs {
            w1: dptr(op, se.w1)?,
            b1: dptr(op, se.b1)?,
            w2: dptr(op, se.w2)?,
            b2: dptr(op, se.b2)?,
            k: se.k,
        }),
        None => Ok(crate::cuda::ops::SePtrs::default()),
    }
}

#[cfg(feature = "cuda")]
fn cuda_epilogue<T>(op: &'static str, e: &WinogradEpilogue<'_, T>) -> Result<crate::cuda::ops::EpiloguePtrs> {
    Ok(crate::cuda::ops::EpiloguePtrs {
        bias: dptr_opt(op, e.bias)?,
        skip: dptr_opt(op, e.skip)?,
        se: cuda_se(op, e.se.as_ref())?,
        has_se: e.se.is_some(),
        relu: e.relu,
    })
}

/// Expand `(mask, value)` input planes of `n` positions into a board tensor.
pub fn expand_planes<T: Element>(
    stream: &Stream,
    out: &mut DevSliceMut<'_, T>,
    masks: DevSlice<'_, u64>,
    values: DevSlice<'_, f32>,
    n: usize,
    planes: usize,
    layout: Layout,
) -> Result<()> {
    const OP: &str = "expand_planes";
    let total = n * planes * BOARD_SQUARES;
    ensure_len(OP, total, out.len())?;
    ensure_len(OP, n * planes, masks.len())?;
    ensure_len(OP, n * planes, values.len())?;
    stream.record(OP);
    match stream {
        Stream::Host(_) => {
            let out = &mut host_mut(OP, out)?[..total];
            host::planes::expand_planes(out, host(OP, masks)?, host(OP, values)?, planes, layout);
            Ok(())
        }
        #[cfg(feature = "cuda")]
        Stream::Cuda(s) => crate::cuda::ops::expand_planes::<T>(
            s,
            dptr_mut(OP, out)?,
            dptr(OP, masks)?,
            dptr(OP, values)?,
            n,
            planes,
            layout,
        ),
    }
}

/// In place `data = act(data + bias[c])` over a tensor of `shape`.
pub fn bias_activation<T: Element>(
    stream: &Stream,
    data: &mut DevSliceMut<'_, T>,
    bias: DevSlice<'_, T>,
    shape: TensorShape,
    layout: Layout,
    act: Activation,
) -> Result<()> {
    const OP: &str = "bias_activation";
    ensure_len(OP, shape.numel(), data.len())?;
    ensure_len(OP, shape.c, bias.len())?;
    stream.record(OP);
    match stream {
        Stream::Host(_) => {
            let data = &mut host_mut(OP, data)?[..shape.numel()];
            host::elementwise::bias_activation(data, host(OP, bias)?, shape, layout, act);
            Ok(())
        }
        #[cfg(feature = "cuda")]
        Stream::Cuda(s) => {
            crate::cuda::ops::bias_activation::<T>(s, dptr_mut(OP, data)?, dptr(OP, bias)?, shape, layout, act)
        }
    }
}

/// `out[i] = act(a[i % |a|] + b[i % |b|])` for `i < len`.
pub fn add_vectors<T: Element>(
    stream: &Stream,
    out: &mut DevSliceMut<'_, T>,
    a: DevSlice<'_, T>,
    b: DevSlice<'_, T>,
    len: usize,
    act: Activation,
) -> Result<()> {
    const OP: &str = "add_vectors";
    ensure_len(OP, len, out.len())?;
    if a.is_empty() || b.is_empty() {
        return Err(RookError::BufferTooSmall {
            op: OP,
            needed: 1,
            available: 0,
        });
    }
    stream.record(OP);
    match stream {
        Stream::Host(_) => {
            let out = &mut host_mut(OP, out)?[..len];
            host::elementwise::add_vectors(out, host(OP, a)?, host(OP, b)?, act);
            Ok(())
        }
        #[cfg(feature = "cuda")]
        Stream::Cuda(s) => crate::cuda::ops::add_vectors::<T>(
            s,
            dptr_mut(OP, out)?,
            dptr(OP, a)?,
            a.len(),
            dptr(OP, b)?,
            b.len(),
            len,
            act,
        ),
    }
}

/// `out = relu?((x - mean[c]) * var_multiplier[c] + skip)`.
#[allow(clippy::too_many_arguments)]
pub fn batch_norm<T: Element>(
    stream: &Stream,
    out: &mut DevSliceMut<'_, T>,
    input: DevSlice<'_, T>,
    skip: Option<DevSlice<'_, T>>,
    means: DevSlice<'_, f32>,
    var_multipliers: DevSlice<'_, f32>,
    shape: TensorShape,
    layout: Layout,
    relu: bool,
) -> Result<()> {
    const OP: &str = "batch_norm";
    let total = shape.numel();
    ensure_len(OP, total, out.len())?;
    ensure_len(OP, total, input.len())?;
    if let Some(skip) = skip {
        ensure_len(OP, total, skip.len())?;
    }
    ensure_len(OP, shape.c, means.len())?;
    ensure_len(OP, shape.c, var_multipliers.len())?;
    stream.record(OP);
    match stream {
        Stream::Host(_) => {
            host::elementwise::batch_norm(
                &mut host_mut(OP, out)?[..total],
                host(OP, input)?,
                host_opt(OP, skip)?,
                host(OP, means)?,
                host(OP, var_multipliers)?,
                shape,
                layout,
                relu,
            );
            Ok(())
        }
        #[cfg(feature = "cuda")]
        Stream::Cuda(s) => crate::cuda::ops::batch_norm::<T>(
            s,
            dptr_mut(OP, out)?,
            dptr(OP, input)?,
            dptr_opt(OP, skip)?,
            dptr(OP, means)?,
            dptr(OP, var_multipliers)?,
            shape,
            layout,
            relu,
        ),
    }
}

/// `out[n][c] = mean over the board of x[n][c] + prev_bias[c]`.
pub fn global_avg_pool<T: Element>(
    stream: &Stream,
    out: &mut DevSliceMut<'_, T>,
    input: DevSlice<'_, T>,
    prev_bias: Option<DevSlice<'_, T>>,
    shape: TensorShape,
    layout: Layout,
) -> Result<()> {
    const OP: &str = "global_avg_pool";
    ensure_len(OP, shape.n * shape.c, out.len())?;
    ensure_len(OP, shape.numel(), input.len())?;
    if let Some(pb) = prev_bias {
        ensure_len(OP, shape.c, pb.len())?;
    }
    stream.record(OP);
    match stream {
        Stream::Host(_) => {
            let out = &mut host_mut(OP, out)?[..shape.n * shape.c];
            host::se::global_avg_pool(out, host(OP, input)?, host_opt(OP, prev_bias)?, shape, layout);
            Ok(())
        }
        #[cfg(feature = "cuda")]
        Stream::Cuda(s) => crate::cuda::ops::global_avg_pool::<T>(
            s,
            dptr_mut(OP, out)?,
            dptr(OP, input)?,
            dptr_opt(OP, prev_bias)?,
            shape,
            layout,
        ),
    }
}

/// `out = relu?(sigmoid(s[n][c]) * (x + prev_bias[c]) + s[n][C + c] + skip)`
/// where `scale_bias` holds `2C` values per sample.
#[allow(clippy::too_many_arguments)]
pub fn global_scale<T: Element>(
    stream: &Stream,
    out: &mut DevSliceMut<'_, T>,
    input: DevSlice<'_, T>,
    scale_bias: DevSlice<'_, T>,
    prev_bias: Option<DevSlice<'_, T>>,
    skip: Option<DevSlice<'_, T>>,
    shape: TensorShape,
    layout: Layout,
    relu: bool,
) -> Result<()> {
    const OP: &str = "global_scale";
    let total = shape.numel();
    ensure_len(OP, total, out.len())?;
    ensure_len(OP, total, input.len())?;
    ensure_len(OP, shape.n * 2 * shape.c, scale_bias.len())?;
    if let Some(skip) = skip {
        ensure_len(OP, total, skip.len())?;
    }
    stream.record(OP);
    match stream {
        Stream::Host(_) => {
            host::se::global_scale(
                &mut host_mut(OP, out)?[..total],
                host(OP, input)?,
                host(OP, scale_bias)?,
                host_opt(OP, prev_bias)?,
                host_opt(OP, skip)?,
                shape,
                layout,
                relu,
            );
            Ok(())
        }
        #[cfg(feature = "cuda")]
        Stream::Cuda(s) => crate::cuda::ops::global_scale::<T>(
            s,
            dptr_mut(OP, out)?,
            dptr(OP, input)?,
            dptr(OP, scale_bias)?,
            dptr_opt(OP, prev_bias)?,
            dptr_opt(OP, skip)?,
            shape,
            layout,
            relu,
        ),
    }
}

/// Whole SE block in one kernel.
///
/// Returns `Ok(false)` without touching `out` when the block exceeds the
/// device's fused-SE limits; the caller then runs the decomposed sequence.
#[allow(clippy::too_many_arguments)]
pub fn se_fused<T: Element>(
    stream: &Stream,
    caps: &DeviceCaps,
    out: &mut DevSliceMut<'_, T>,
    input: DevSlice<'_, T>,
    skip: Option<DevSlice<'_, T>>,
    se: &SeWeights<'_, T>,
    prev_bias: Option<DevSlice<'_, T>>,
    shape: TensorShape,
    layout: Layout,
    relu: bool,
) -> Result<bool> {
    const OP: &str = "se_fused";
    if !caps.can_fuse_se(shape.c, se.k) {
        return Ok(false);
    }
    let total = shape.numel();
    ensure_len(OP, total, out.len())?;
    ensure_len(OP, total, input.len())?;
    if let Some(skip) = skip {
        ensure_len(OP, total, skip.len())?;
    }
    if let Some(pb) = prev_bias {
        ensure_len(OP, shape.c, pb.len())?;
    }
    se.check(OP, shape.c)?;
    stream.record(OP);
    match stream {
        Stream::Host(_) => {
            host::se::se_fused(
                &mut host_mut(OP, out)?[..total],
                host(OP, input)?,
                host_opt(OP, skip)?,
                &se.host(OP)?,
                host_opt(OP, prev_bias)?,
                shape,
                layout,
                relu,
            );
            Ok(true)
        }
        #[cfg(feature = "cuda")]
        Stream::Cuda(s) => crate::cuda::ops::se_fused::<T>(
            s,
            dptr_mut(OP, out)?,
            dptr(OP, input)?,
            dptr_opt(OP, skip)?,
            cuda_se(OP, Some(se))?,
            dptr_opt(OP, prev_bias)?,
            shape,
            layout,
            relu,
        )
        .map(|_| true),
    }
}

/// `U = G g Gᵀ` for a `[k][c][3][3]` filter into `U[36][c][k]`.
pub fn winograd_filter_transform<T: Element>(
    stream: &Stream,
    out: &mut DevSliceMut<'_, T>,
    filter: DevSlice<'_, T>,
    k: usize,
    c: usize,
) -> Result<()> {
    const OP: &str = "winograd_filter_transform";
    ensure_len(OP, WINOGRAD_ELEMENTS * c * k, out.len())?;
    ensure_len(OP, k * c * 9, filter.len())?;
    stream.record(OP);
    match stream {
        Stream::Host(_) => {
            host::winograd::filter_transform(host_mut(OP, out)?, host(OP, filter)?, k, c);
            Ok(())
        }
        #[cfg(feature = "cuda")]
        Stream::Cuda(s) => {
            crate::cuda::ops::winograd_filter_transform::<T>(s, dptr_mut(OP, out)?, dptr(OP, filter)?, k, c)
        }
    }
}

/// `V = Bᵀ d B` for every patch of `n` boards of `c` planes.
pub fn winograd_input_transform<T: Element>(
    stream: &Stream,
    out: &mut DevSliceMut<'_, T>,
    input: DevSlice<'_, T>,
    n: usize,
    c: usize,
    layout: Layout,
) -> Result<()> {
    const OP: &str = "winograd_input_transform";
    ensure_len(OP, winograd_transformed_len(n, c), out.len())?;
    ensure_len(OP, n * c * BOARD_SQUARES, input.len())?;
    stream.record(OP);
    match stream {
        Stream::Host(_) => {
            host::winograd::input_transform(host_mut(OP, out)?, host(OP, input)?, n, c, layout);
            Ok(())
        }
        #[cfg(feature = "cuda")]
        Stream::Cuda(s) => {
            crate::cuda::ops::winograd_input_transform::<T>(s, dptr_mut(OP, out)?, dptr(OP, input)?, n, c, layout)
        }
    }
}

/// `out = epilogue(Aᵀ M A)` for `n` boards of `k` output planes.
pub fn winograd_output_transform<T: Element>(
    stream: &Stream,
    out: &mut DevSliceMut<'_, T>,
    transformed: DevSlice<'_, T>,
    epilogue: &WinogradEpilogue<'_, T>,
    n: usize,
    k: usize,
    layout: Layout,
) -> Result<()> {
    const OP: &str = "winograd_output_transform";
    ensure_len(OP, n * k * BOARD_SQUARES, out.len())?;
    ensure_len(OP, winograd_transformed_len(n, k), transformed.len())?;
    epilogue.check(OP, n, k)?;
    stream.record(OP);
    match stream {
        Stream::Host(_) => {
            let epi = epilogue.host(OP)?;
            host::winograd::output_transform(host_mut(OP, out)?, host(OP, transformed)?, &epi, n, k, layout);
            Ok(())
        }
        #[cfg(feature = "cuda")]
        Stream::Cuda(s) => crate::cuda::ops::winograd_output_transform::<T>(
            s,
            dptr_mut(OP, out)?,
            0,
            dptr(OP, transformed)?,
            cuda_epilogue(OP, epilogue)?,
            n,
            k,
            layout,
        ),
    }
}

/// Output transform that also emits the next convolution's transformed
/// input into `next` (`[36][n·4][k]`).
#[allow(clippy::too_many_arguments)]
pub fn winograd_output_input_transform<T: Element>(
    stream: &Stream,
    out: &mut DevSliceMut<'_, T>,
    next: &mut DevSliceMut<'_, T>,
    transformed: DevSlice<'_, T>,
    epilogue: &WinogradEpilogue<'_, T>,
    n: usize,
    k: usize,
    layout: Layout,
) -> Result<()> {
    const OP: &str = "winograd_output_input_transform";
    ensure_len(OP, n * k * BOARD_SQUARES, out.len())?;
    ensure_len(OP, winograd_transformed_len(n, k), next.len())?;
    ensure_len(OP, winograd_transformed_len(n, k), transformed.len())?;
    epilogue.check(OP, n, k)?;
    stream.record(OP);
    match stream {
        Stream::Host(_) => {
            let epi = epilogue.host(OP)?;
            let out = host_mut(OP, out)?;
            host::winograd::output_transform(out, host(OP, transformed)?, &epi, n, k, layout);
            host::winograd::input_transform(host_mut(OP, next)?, out, n, k, layout);
            Ok(())
        }
        #[cfg(feature = "cuda")]
        Stream::Cuda(s) => crate::cuda::ops::winograd_output_transform::<T>(
            s,
            dptr_mut(OP, out)?,
            dptr_mut(OP, next)?,
            dptr(OP, transformed)?,
            cuda_epilogue(OP, epilogue)?,
            n,
            k,
            layout,
        ),
    }
}

/// Scatter raw convolution-policy planes into the move space.
#[allow(clippy::too_many_arguments)]
pub fn policy_map<T: Element>(
    stream: &Stream,
    out: &mut DevSliceMut<'_, T>,
    input: DevSlice<'_, T>,
    indices: DevSlice<'_, i16>,
    n: usize,
    input_size: usize,
    used_size: usize,
    output_size: usize,
) -> Result<()> {
    const OP: &str = "policy_map";
    ensure_len(OP, n * output_size, out.len())?;
    ensure_len(OP, n * input_size, input.len())?;
    ensure_len(OP, used_size, indices.len())?;
    ensure_len(OP, used_size, input_size)?;
    stream.record(OP);
    match stream {
        Stream::Host(_) => {
            let out = &mut host_mut(OP, out)?[..n * output_size];
            host::planes::policy_map(out, host(OP, input)?, host(OP, indices)?, input_size, used_size, output_size);
            Ok(())
        }
        #[cfg(feature = "cuda")]
        Stream::Cuda(s) => crate::cuda::ops::policy_map::<T>(
            s,
            dptr_mut(OP, out)?,
            dptr(OP, input)?,
            dptr(OP, indices)?,
            n,
            input_size,
            used_size,
            output_size,
        ),
    }
}

/// Convert element type and/or layout of a board tensor of `shape`.
pub fn convert_tensor<S: Element, D: Element>(
    stream: &Stream,
    out: &mut DevSliceMut<'_, D>,
    out_layout: Layout,
    input: DevSlice<'_, S>,
    in_layout: Layout,
    shape: TensorShape,
) -> Result<()> {
    const OP: &str = "convert_tensor";
    let total = shape.numel();
    ensure_len(OP, total, out.len())?;
    ensure_len(OP, total, input.len())?;
    stream.record(OP);
    match stream {
        Stream::Host(_) => {
            let out = &mut host_mut(OP, out)?[..total];
            host::elementwise::convert_tensor(out, out_layout, &host(OP, input)?[..total], in_layout, shape);
            Ok(())
        }
        #[cfg(feature = "cuda")]
        Stream::Cuda(s) => crate::cuda::ops::convert_tensor::<S, D>(
            s,
            dptr_mut(OP, out)?,
            out_layout,
            dptr(OP, input)?,
            in_layout,
            shape,
        ),
    }
}

/// Convert the element type of the first `len` elements.
pub fn copy_converted<S: Element, D: Element>(
    stream: &Stream,
    out: &mut DevSliceMut<'_, D>,
    input: DevSlice<'_, S>,
    len: usize,
) -> Result<()> {
    const OP: &str = "copy_converted";
    ensure_len(OP, len, out.len())?;
    ensure_len(OP, len, input.len())?;
    stream.record(OP);
    match stream {
        Stream::Host(_) => {
            let out = &mut host_mut(OP, out)?[..len];
            host::elementwise::copy_converted(out, &host(OP, input)?[..len]);
            Ok(())
        }
        #[cfg(feature = "cuda")]
        Stream::Cuda(s) => {
            let shape = TensorShape::flat(1, len);
            crate::cuda::ops::convert_tensor::<S, D>(
                s,
                dptr_mut(OP, out)?,
                Layout::Nchw,
                dptr(OP, input)?,
                Layout::Nchw,
                shape,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;
    use rook_core::{Device, DeviceBuffer};

    fn host_stream() -> Stream {
        Stream::new(&Device::Host).unwrap()
    }

    #[test]
    fn test_launches_are_counted() {
        let stream = host_stream();
        let mut out = DeviceBuffer::<f32>::zeros(&Device::Host, 4).unwrap();
        let a = DeviceBuffer::from_host(&Device::Host, &[1.0f32, 2.0]).unwrap();
        add_vectors(&stream, &mut out.view_mut(), a.view(), a.view(), 4, Activation::None).unwrap();
        assert_eq!(stream.launches(), 1);
        assert_eq!(out.to_host_vec().unwrap(), vec![2.0, 4.0, 2.0, 4.0]);
    }

    #[test]
    fn test_se_fused_declines_above_caps() {
        let stream = host_stream();
        let caps = DeviceCaps {
            max_se_fusing_k: 1,
            ..DeviceCaps::default()
        };
        let shape = TensorShape::board(1, 2);
        let x = DeviceBuffer::from_host(&Device::Host, &vec![1.0f32; shape.numel()]).unwrap();
        let w = DeviceBuffer::<f32>::zeros(&Device::Host, 16).unwrap();
        let mut out = DeviceBuffer::from_host(&Device::Host, &vec![-7.0f32; shape.numel()]).unwrap();
        let se = SeWeights {
            w1: w.view(),
            b1: w.view(),
            w2: w.view(),
            b2: w.view(),
            k: 2,
        };
        let fused = se_fused(&stream, &caps, &mut out.view_mut(), x.view(), None, &se, None, shape, Layout::Nchw, true)
            .unwrap();
        assert!(!fused);
        assert_eq!(stream.launches(), 0);
        assert!(out.to_host_vec().unwrap().iter().all(|&v| v == -7.0));

        let fused = se_fused(
            &stream,
            &DeviceCaps::default(),
            &mut out.view_mut(),
            x.view(),
            None,
            &se,
            None,
            shape,
            Layout::Nchw,
            true,
        )
        .unwrap();
        assert!(fused);
        assert!(out.to_host_vec().unwrap().iter().all(|&v| (v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_output_input_transform_feeds_next_layer() {
        let stream = host_stream();
        let (n, k) = (2, 3);
        let len = winograd_transformed_len(n, k);
        let m: Vec<f32> = (0..len).map(|i| (i as f32 * 0.13).sin()).collect();
        let m = DeviceBuffer::from_host(&Device::Host, &m).unwrap();
        let mut out = DeviceBuffer::<f32>::zeros(&Device::Host, n * k * 64).unwrap();
        let mut next = DeviceBuffer::<f32>::zeros(&Device::Host, len).unwrap();
        let epi = WinogradEpilogue { relu: true, ..WinogradEpilogue::none() };
        winograd_output_input_transform(
            &stream,
            &mut out.view_mut(),
            &mut next.view_mut(),
            m.view(),
            &epi,
            n,
            k,
            Layout::Nhwc,
        )
        .unwrap();
        let mut expected = DeviceBuffer::<f32>::zeros(&Device::Host, len).unwrap();
        winograd_input_transform(&stream, &mut expected.view_mut(), out.view(), n, k, Layout::Nhwc).unwrap();
        assert_eq!(next.to_host_vec().unwrap(), expected.to_host_vec().unwrap());
        assert!(out.to_host_vec().unwrap().iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_copy_converted_to_half() {
        let stream = host_stream();
        let src = DeviceBuffer::from_host(&Device::Host, &[0.25f32, -2.0, 9.0]).unwrap();
        let mut dst = DeviceBuffer::<f16>::zeros(&Device::Host, 2).unwrap();
        copy_converted(&stream, &mut dst.view_mut(), src.view(), 2).unwrap();
        let v: Vec<f32> = dst.to_host_vec().unwrap().iter().map(|h| h.to_f32()).collect();
        assert_eq!(v, vec![0.25, -2.0]);
        assert!(copy_converted(&stream, &mut dst.view_mut(), src.view(), 3).is_err());
    }

    #[test]
    fn test_policy_map_checks_table_length() {
        let stream = host_stream();
        let input = DeviceBuffer::<f32>::zeros(&Device::Host, 8).unwrap();
        let idx = DeviceBuffer::from_host(&Device::Host, &[0i16, 1]).unwrap();
        let mut out = DeviceBuffer::<f32>::zeros(&Device::Host, 4).unwrap();
        let err = policy_map(&stream, &mut out.view_mut(), input.view(), idx.view(), 1, 8, 4, 4).unwrap_err();
        assert!(matches!(err, RookError::BufferTooSmall { .. }));
    }
}
