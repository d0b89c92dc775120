//! # rook-nn
//!
//! Layers of the residual-tower network. Each layer owns its weights on the
//! device, records the shape of its logical input, and is evaluated against
//! caller-provided activation and workspace views.

pub mod conv;
pub mod conv1;
pub mod fc;
pub mod layer;
pub mod loader;
pub mod policy;
pub mod policy_map;
pub mod residual;
pub mod se;
pub mod weights;
pub mod winograd;

pub use conv::{ConvLayer, ConvOptions};
pub use conv1::Conv1Layer;
pub use fc::FcLayer;
pub use layer::{Handles, Layer, LayerOps};
pub use loader::WeightLoader;
pub use policy::{move_index, Promotion, CONV_POLICY_PLANES, CONV_POLICY_USED_PLANES, NUM_POLICY_OUTPUTS};
pub use policy_map::PolicyMapLayer;
pub use residual::ResidualBlock;
pub use se::SeLayer;
pub use weights::{BatchNorm, ConvWeights, FcWeights, LayerWeights, SeParams};
pub use winograd::FusedWinogradConvSeLayer;
