//! # rook-kernels
//!
//! Stateless, batch-parallel numeric kernels for residual-tower inference,
//! plus the BLAS and DNN handles layers bind to their stream.
//!
//! Every kernel is reached through [`ops`], which routes to the runtime that
//! owns the stream:
//! - `host`: rayon-parallel reference kernels with a tiled SIMD GEMM
//! - `cuda`: NVRTC-compiled kernels and cuBLAS (feature `cuda`)

pub mod blas;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod dnn;
pub mod host;
pub mod ops;
pub mod simd;

pub use blas::{BlasHandle, GemmShape};
pub use dnn::{ConvShape, DnnHandle};
pub use ops::{winograd_transformed_len, SeWeights, WinogradEpilogue};
pub use simd::SimdCapability;
