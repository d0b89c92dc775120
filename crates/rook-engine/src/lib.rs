//! # rook-engine
//!
//! Builds a residual-tower network from a [`WeightSet`], keeps it resident
//! on one device and evaluates batches of encoded positions:
//!
//! - [`weights`]: topology description and named tensors
//! - [`network`]: layer graph, weight loading, forward pass
//! - [`context`]: per-stream computation contexts and their pool
//! - [`staging`]: host/device input and output buffers
//! - [`engine`]: the thread-safe evaluation entry point
//! - [`computation`]: queue-then-compute batch interface

pub mod computation;
pub mod config;
pub mod context;
pub mod engine;
pub mod network;
pub mod staging;
pub mod weights;

pub use computation::Computation;
pub use config::{EngineConfig, ExecutionMode, LeasePolicy};
pub use context::{ComputeContext, ContextLease, ContextPool};
pub use engine::{softmax, Engine, EvalResult, Value};
pub use network::{Network, NetworkOptions, NetworkState};
pub use staging::{HeadOutput, InputPlane, PositionPlanes, StagingBuffer, StagingPool};
pub use weights::{HeadDims, NamedTensor, NetworkTopology, PolicyHead, ValueHead, WeightSet, INPUT_PLANES};
