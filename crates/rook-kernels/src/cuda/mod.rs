//! CUDA runtime for the kernel library.
//!
//! Kernel sources under `kernels/` are compiled to PTX with NVRTC on first
//! use and cached per device. GEMM goes through cuBLAS bound to the
//! context's stream.

pub mod blas;
pub mod launch;
pub mod ops;

pub use rook_core::cuda::{device_count, get_device, is_cuda_available, CudaError};
