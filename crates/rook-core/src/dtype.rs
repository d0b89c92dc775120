use std::fmt;

use half::f16;
use serde::{Deserialize, Serialize};

/// Numeric precision the network is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 16-bit IEEE 754 half-precision float
    F16,
    /// 32-bit IEEE 754 single-precision float
    #[default]
    F32,
}

impl DType {
    /// Size in bytes of a single element.
    pub fn element_size(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::F32 => 4,
        }
    }

    /// Number of bytes needed to store `n` elements of this dtype.
    pub fn storage_bytes(&self, n: usize) -> usize {
        self.element_size() * n
    }

    /// Parse the names used on the command line and in backend options.
    pub fn parse(s: &str) -> Option<DType> {
        match s.to_ascii_lowercase().as_str() {
            "f16" | "fp16" | "half" => Some(DType::F16),
            "f32" | "fp32" | "float" => Some(DType::F32),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F16 => write!(f, "f16"),
            DType::F32 => write!(f, "f32"),
        }
    }
}

/// Anything that can live in a device buffer.
///
/// On the CUDA runtime this additionally requires the `cudarc` marker
/// traits for kernel arguments and zero-initialized allocation.
#[cfg(feature = "cuda")]
pub trait DeviceScalar:
    Copy
    + Default
    + Send
    + Sync
    + fmt::Debug
    + 'static
    + cudarc::driver::DeviceRepr
    + cudarc::driver::ValidAsZeroBits
    + Unpin
{
}

#[cfg(feature = "cuda")]
impl<T> DeviceScalar for T where
    T: Copy
        + Default
        + Send
        + Sync
        + fmt::Debug
        + 'static
        + cudarc::driver::DeviceRepr
        + cudarc::driver::ValidAsZeroBits
        + Unpin
{
}

/// Anything that can live in a device buffer.
#[cfg(not(feature = "cuda"))]
pub trait DeviceScalar: Copy + Default + Send + Sync + fmt::Debug + 'static {}

#[cfg(not(feature = "cuda"))]
impl<T> DeviceScalar for T where T: Copy + Default + Send + Sync + fmt::Debug + 'static {}

/// Floating-point element type of activations and weights.
///
/// Every generic layer and kernel is parameterized by this tag instead of
/// being duplicated per precision. Arithmetic is done in `f32`; `T` is the
/// storage format.
pub trait Element: DeviceScalar + PartialEq {
    const DTYPE: DType;

    fn from_f32(v: f32) -> Self;

    fn to_f32(self) -> f32;

    fn zero() -> Self {
        Self::default()
    }
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        v
    }

    #[inline(always)]
    fn to_f32(self) -> f32 {
        self
    }
}

impl Element for f16 {
    const DTYPE: DType = DType::F16;

    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }

    #[inline(always)]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }
}
