//! cuBLAS handle bound to a context stream.

use cudarc::cublas::sys::cublasOperation_t;
use cudarc::cublas::{CudaBlas, Gemm, GemmConfig, StridedBatchedConfig};
use half::f16;
use rook_core::buffer::{CudaRegion, CudaRegionMut};
use rook_core::stream::CudaStreamHandle;
use rook_core::{DType, DevSlice, DevSliceMut, Element, Result, RookError};

use crate::blas::GemmShape;

use super::CudaError;

pub struct CudaBlasHandle {
    blas: CudaBlas,
    device_idx: usize,
}

// cuBLAS handles may be used from any thread as long as calls do not
// overlap; each handle belongs to exactly one computation context.
unsafe impl Send for CudaBlasHandle {}
unsafe impl Sync for CudaBlasHandle {}

impl CudaBlasHandle {
    pub fn new(stream: &CudaStreamHandle) -> Result<Self> {
        let blas = CudaBlas::new(stream.device.clone())
            .map_err(|e| CudaError::Blas(e.to_string()).into_rook("cublas_create"))?;
        unsafe { blas.set_stream(Some(&stream.stream)) }
            .map_err(|e| CudaError::Blas(e.to_string()).into_rook("cublas_set_stream"))?;
        Ok(Self {
            blas,
            device_idx: stream.device_idx,
        })
    }

    pub fn device_idx(&self) -> usize {
        self.device_idx
    }

    /// Row-major problem issued as its column-major transpose:
    /// `Cᵀ = op(B)ᵀ · op(A)ᵀ`.
    pub fn gemm_strided_batched<T: Element>(
        &self,
        shape: &GemmShape,
        a: DevSlice<'_, T>,
        b: DevSlice<'_, T>,
        c: &mut DevSliceMut<'_, T>,
    ) -> Result<()> {
        const OP: &str = "gemm_strided_batched";
        let a = a.as_cuda().ok_or(RookError::DeviceMismatch { op: OP })?;
        let b = b.as_cuda().ok_or(RookError::DeviceMismatch { op: OP })?;
        let c = c.as_cuda_mut().ok_or(RookError::DeviceMismatch { op: OP })?;
        // Safety: the element type is selected by the matching DTYPE tag.
        unsafe {
            match T::DTYPE {
                DType::F32 => self.issue::<f32>(shape, a.reinterpret(), b.reinterpret(), &mut c.reinterpret()),
                DType::F16 => self.issue::<f16>(shape, a.reinterpret(), b.reinterpret(), &mut c.reinterpret()),
            }
        }
    }

    fn issue<U: Element>(
        &self,
        shape: &GemmShape,
        a: CudaRegion<'_, U>,
        b: CudaRegion<'_, U>,
        c: &mut CudaRegionMut<'_, U>,
    ) -> Result<()>
    where
        CudaBlas: Gemm<U>,
    {
        let op = |t: bool| {
            if t {
                cublasOperation_t::CUBLAS_OP_T
            } else {
                cublasOperation_t::CUBLAS_OP_N
            }
        };
        let cfg = StridedBatchedConfig {
            gemm: GemmConfig {
                transa: op(shape.trans_b),
                transb: op(shape.trans_a),
                m: shape.n as i32,
                n: shape.m as i32,
                k: shape.k as i32,
                alpha: U::from_f32(1.0),
                lda: if shape.trans_b { shape.k } else { shape.n } as i32,
                ldb: if shape.trans_a { shape.m } else { shape.k } as i32,
                beta: U::from_f32(0.0),
                ldc: shape.n as i32,
            },
            batch_size: shape.batch as i32,
            stride_a: shape.stride_b as i64,
            stride_b: shape.stride_a as i64,
            stride_c: shape.stride_c as i64,
        };
        unsafe { self.blas.gemm_strided_batched(cfg, &b, &a, c) }
            .map_err(|e| CudaError::Blas(e.to_string()).into_rook("gemm_strided_batched"))
    }
}
