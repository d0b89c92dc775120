//! CUDA device context management.
//!
//! Lazily initialized singleton `CudaDevice` handles per GPU index, shared
//! by buffers, streams and kernel launchers.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use cudarc::driver::sys::CUdevice_attribute;
use cudarc::driver::CudaDevice;
use parking_lot::Mutex;

use crate::device::{DeviceCaps, MAX_RES_BLOCK_FUSING_SE_K, MAX_RES_BLOCK_FUSING_SE_K_FP16_LARGE};
use crate::{Device, RookError};

static DEVICES: OnceLock<Mutex<HashMap<usize, Arc<CudaDevice>>>> = OnceLock::new();

fn devices() -> &'static Mutex<HashMap<usize, Arc<CudaDevice>>> {
    DEVICES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Get or create the CUDA device handle for the given GPU index.
pub fn get_device(device_idx: usize) -> Result<Arc<CudaDevice>, CudaError> {
    let mut map = devices().lock();
    if let Some(dev) = map.get(&device_idx) {
        return Ok(Arc::clone(dev));
    }
    let dev = CudaDevice::new(device_idx)
        .map_err(|e| CudaError::DeviceInit(format!("device {}: {}", device_idx, e)))?;
    tracing::debug!(device_idx, name = ?dev.name().ok(), "initialized CUDA device");
    map.insert(device_idx, Arc::clone(&dev));
    Ok(dev)
}

/// Check if any CUDA device is available.
pub fn is_cuda_available() -> bool {
    get_device(0).is_ok()
}

/// Number of available CUDA devices.
pub fn device_count() -> usize {
    CudaDevice::count().map(|n| n as usize).unwrap_or(0)
}

/// Kernel limits of a CUDA device. Ampere and later have the register
/// file for the wide fp16 SE epilogue.
pub(crate) fn detect_caps(device_idx: usize) -> crate::Result<DeviceCaps> {
    let dev = get_device(device_idx).map_err(|e| e.into_rook("detect_caps"))?;
    let major = dev
        .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
        .map_err(|e| CudaError::DeviceInit(e.to_string()).into_rook("detect_caps"))?;
    let minor = dev
        .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
        .map_err(|e| CudaError::DeviceInit(e.to_string()).into_rook("detect_caps"))?;
    let se_k_fp16 = if major >= 8 {
        MAX_RES_BLOCK_FUSING_SE_K_FP16_LARGE
    } else {
        MAX_RES_BLOCK_FUSING_SE_K
    };
    tracing::info!(device_idx, sm = format!("{}.{}", major, minor), "CUDA device capabilities");
    Ok(DeviceCaps {
        max_res_block_fusing_se_k_fp16: se_k_fp16,
        vendor_convolution: false,
        fp16: major > 5 || (major == 5 && minor >= 3),
        ..DeviceCaps::default()
    })
}

/// CUDA-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum CudaError {
    #[error("CUDA device init failed: {0}")]
    DeviceInit(String),

    #[error("PTX compilation failed for module '{module}': {msg}")]
    PtxCompile { module: String, msg: String },

    #[error("Failed to load module '{module}': {msg}")]
    ModuleLoad { module: String, msg: String },

    #[error("Function '{func}' not found in module '{module}'")]
    FuncNotFound { module: String, func: String },

    #[error("CUDA kernel launch failed: {0}")]
    LaunchError(String),

    #[error("CUDA memory error: {0}")]
    MemoryError(String),

    #[error("cuBLAS error: {0}")]
    Blas(String),
}

impl CudaError {
    /// Attach the failing operation and lift into the engine's error type.
    pub fn into_rook(self, op: &'static str) -> RookError {
        match self {
            CudaError::DeviceInit(reason) => RookError::DeviceUnavailable {
                device: Device::Cuda(0),
                reason,
            },
            CudaError::MemoryError(reason) => RookError::Allocation { op, bytes: 0, reason },
            other => RookError::Launch {
                op,
                reason: other.to_string(),
            },
        }
    }
}
