//! Host runtime kernels.
//!
//! Plain slice-in, slice-out functions, data-parallel over samples with
//! rayon and accumulating in `f32` regardless of the storage type.

pub mod conv;
pub mod elementwise;
pub mod gemm;
pub mod planes;
pub mod se;
pub mod winograd;
