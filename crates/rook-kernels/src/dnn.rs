//! Vendor DNN convolution handle.
//!
//! Only the host runtime provides a convolution primitive. On devices
//! without one, convolution layers run through the Winograd/GEMM kernels.

use rook_core::{ensure_len, DevSlice, DevSliceMut, Element, Result, RookError, Stream};

/// Same-padded convolution problem in NCHW.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvShape {
    pub n: usize,
    pub c_in: usize,
    pub c_out: usize,
    pub h: usize,
    pub w: usize,
    pub filter_size: usize,
}

pub enum DnnHandle {
    Host,
    /// The device has no convolution primitive.
    Unavailable,
}

impl DnnHandle {
    pub fn new(stream: &Stream) -> Self {
        match stream {
            Stream::Host(_) => DnnHandle::Host,
            #[cfg(feature = "cuda")]
            Stream::Cuda(_) => DnnHandle::Unavailable,
        }
    }

    pub fn supports_convolution(&self) -> bool {
        matches!(self, DnnHandle::Host)
    }

    /// `out = conv(input, filter)`; filter is OIHW.
    pub fn convolution_forward<T: Element>(
        &self,
        stream: &Stream,
        shape: &ConvShape,
        out: &mut DevSliceMut<'_, T>,
        input: DevSlice<'_, T>,
        filter: DevSlice<'_, T>,
    ) -> Result<()> {
        const OP: &str = "convolution_forward";
        let plane = shape.h * shape.w;
        ensure_len(OP, shape.n * shape.c_in * plane, input.len())?;
        ensure_len(OP, shape.n * shape.c_out * plane, out.len())?;
        ensure_len(OP, shape.c_out * shape.c_in * shape.filter_size * shape.filter_size, filter.len())?;
        match self {
            DnnHandle::Host => {
                stream.record(OP);
                let (input, filter) = match (input.as_host(), filter.as_host()) {
                    (Some(i), Some(f)) => (i, f),
                    _ => return Err(RookError::DeviceMismatch { op: OP }),
                };
                let out = out.as_host_mut().ok_or(RookError::DeviceMismatch { op: OP })?;
                crate::host::conv::conv2d_nchw(
                    &mut out[..shape.n * shape.c_out * plane],
                    input,
                    filter,
                    shape.c_in,
                    shape.c_out,
                    shape.h,
                    shape.w,
                    shape.filter_size,
                );
                Ok(())
            }
            DnnHandle::Unavailable => Err(RookError::Launch {
                op: OP,
                reason: "no convolution primitive on this device".into(),
            }),
        }
    }
}
