//! BLAS handle bound to one stream.

use rook_core::{ensure_len, DevSlice, DevSliceMut, Device, Element, Result, RookError, Stream};

/// Row-major strided-batched GEMM problem: `C[i] = op(A[i]) · op(B[i])`
/// with `op(A)` of shape `m × k` and `op(B)` of shape `k × n`.
///
/// `A` is stored `m × k` (`k × m` when `trans_a`), `B` is stored `k × n`
/// (`n × k` when `trans_b`). A zero stride shares one operand across the
/// whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmShape {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub trans_a: bool,
    pub trans_b: bool,
    pub batch: usize,
    pub stride_a: usize,
    pub stride_b: usize,
    pub stride_c: usize,
}

impl GemmShape {
    /// One unbatched product.
    pub fn single(m: usize, n: usize, k: usize, trans_a: bool, trans_b: bool) -> Self {
        Self {
            m,
            n,
            k,
            trans_a,
            trans_b,
            batch: 1,
            stride_a: m * k,
            stride_b: k * n,
            stride_c: m * n,
        }
    }

    /// Elements each operand must provide.
    fn extents(&self) -> (usize, usize, usize) {
        let last = self.batch.saturating_sub(1);
        (
            last * self.stride_a + self.m * self.k,
            last * self.stride_b + self.k * self.n,
            last * self.stride_c + self.m * self.n,
        )
    }
}

/// Matrix-multiply handle. Work is ordered on the stream it is used with.
pub enum BlasHandle {
    Host,
    #[cfg(feature = "cuda")]
    Cuda(crate::cuda::blas::CudaBlasHandle),
}

impl BlasHandle {
    /// Create a handle bound to `stream`.
    pub fn new(stream: &Stream) -> Result<Self> {
        match stream {
            Stream::Host(_) => Ok(BlasHandle::Host),
            #[cfg(feature = "cuda")]
            Stream::Cuda(s) => crate::cuda::blas::CudaBlasHandle::new(s).map(BlasHandle::Cuda),
        }
    }

    pub fn device(&self) -> Device {
        match self {
            BlasHandle::Host => Device::Host,
            #[cfg(feature = "cuda")]
            BlasHandle::Cuda(h) => Device::Cuda(h.device_idx()),
        }
    }

    /// Issue `C = op(A) · op(B)` for every batch item.
    pub fn gemm_strided_batched<T: Element>(
        &self,
        stream: &Stream,
        shape: &GemmShape,
        a: DevSlice<'_, T>,
        b: DevSlice<'_, T>,
        c: &mut DevSliceMut<'_, T>,
    ) -> Result<()> {
        const OP: &str = "gemm_strided_batched";
        if shape.batch == 0 {
            return Ok(());
        }
        if shape.batch > 1 && shape.stride_c < shape.m * shape.n {
            return Err(RookError::InvalidConfig(format!(
                "gemm output stride {} overlaps a {}x{} result",
                shape.stride_c, shape.m, shape.n
            )));
        }
        let (need_a, need_b, need_c) = shape.extents();
        ensure_len(OP, need_a, a.len())?;
        ensure_len(OP, need_b, b.len())?;
        ensure_len(OP, need_c, c.len())?;
        stream.record(OP);

        match self {
            BlasHandle::Host => {
                let (a, b) = match (a.as_host(), b.as_host()) {
                    (Some(a), Some(b)) => (a, b),
                    _ => return Err(RookError::DeviceMismatch { op: OP }),
                };
                let c = c.as_host_mut().ok_or(RookError::DeviceMismatch { op: OP })?;
                crate::host::gemm::gemm_strided_batched(shape, a, b, c);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            BlasHandle::Cuda(h) => h.gemm_strided_batched(shape, a, b, c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rook_core::DeviceBuffer;

    #[test]
    fn test_host_handle_gemm() {
        let stream = Stream::new(&Device::Host).unwrap();
        let blas = BlasHandle::new(&stream).unwrap();
        assert_eq!(blas.device(), Device::Host);
        let a = DeviceBuffer::from_host(&Device::Host, &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let b = DeviceBuffer::from_host(&Device::Host, &[1.0f32, 0.0, 0.0, 1.0]).unwrap();
        let mut c = DeviceBuffer::<f32>::zeros(&Device::Host, 4).unwrap();
        blas.gemm_strided_batched(&stream, &GemmShape::single(2, 2, 2, false, false), a.view(), b.view(), &mut c.view_mut())
            .unwrap();
        assert_eq!(c.to_host_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_rejects_short_operands() {
        let stream = Stream::new(&Device::Host).unwrap();
        let blas = BlasHandle::new(&stream).unwrap();
        let a = DeviceBuffer::<f32>::zeros(&Device::Host, 3).unwrap();
        let b = DeviceBuffer::<f32>::zeros(&Device::Host, 4).unwrap();
        let mut c = DeviceBuffer::<f32>::zeros(&Device::Host, 4).unwrap();
        let err = blas
            .gemm_strided_batched(&stream, &GemmShape::single(2, 2, 2, false, false), a.view(), b.view(), &mut c.view_mut())
            .unwrap_err();
        assert!(matches!(err, RookError::BufferTooSmall { .. }));
    }
}
