//! # rook-core
//!
//! Foundation types for the rook inference engine: element types, tensor
//! layouts, devices and their capability limits, scoped device buffers,
//! execution streams and the engine-wide error type.

pub mod buffer;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod device;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod stream;

pub use buffer::{arena_footprint, DevSlice, DevSliceMut, DeviceBuffer, WorkspaceArena};
pub use device::{Device, DeviceCaps};
pub use dtype::{DType, DeviceScalar, Element};
pub use error::{ensure_len, ErrorKind, RookError};
pub use layout::{sigmoid, Activation, Layout, TensorShape, BOARD_SIZE, BOARD_SQUARES};
pub use stream::Stream;

pub type Result<T> = std::result::Result<T, RookError>;
