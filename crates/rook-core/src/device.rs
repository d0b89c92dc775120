use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dtype::DType;

/// Device the network is resident on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Host-emulated accelerator: host memory, in-order streams,
    /// rayon-parallel kernels.
    #[default]
    Host,
    /// CUDA GPU with device index
    Cuda(usize),
}

impl Device {
    pub fn is_host(&self) -> bool {
        matches!(self, Device::Host)
    }

    pub fn is_cuda(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }

    /// Parse `host`, `cuda` or `cuda:N`.
    pub fn parse(s: &str) -> Option<Device> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "host" | "cpu" => Some(Device::Host),
            "cuda" | "gpu" => Some(Device::Cuda(0)),
            _ => {
                let idx = s.strip_prefix("cuda:").or_else(|| s.strip_prefix("gpu:"))?;
                idx.parse().ok().map(Device::Cuda)
            }
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Host => write!(f, "host"),
            Device::Cuda(idx) => write!(f, "cuda:{}", idx),
        }
    }
}

/// Residual blocks wider than this are not fused into one kernel chain.
pub const MAX_RES_BLOCK_FUSING_CHANNELS: usize = 384;
/// Largest SE bottleneck fused into a residual block.
pub const MAX_RES_BLOCK_FUSING_SE_K: usize = 128;
/// Largest SE bottleneck fused into a residual block by the fp16 kernel on
/// devices with large register files.
pub const MAX_RES_BLOCK_FUSING_SE_K_FP16_LARGE: usize = 512;
/// Widest tensor the standalone fused SE kernel handles.
pub const MAX_SE_FUSING_CHANNELS: usize = 384;
/// Largest bottleneck the standalone fused SE kernel handles.
pub const MAX_SE_FUSING_K: usize = 128;

/// Kernel capability limits of one device.
///
/// Detected once at engine construction; every field can be overridden
/// from configuration to force a particular execution path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceCaps {
    pub max_res_block_fusing_channels: usize,
    pub max_res_block_fusing_se_k: usize,
    pub max_res_block_fusing_se_k_fp16: usize,
    pub max_se_fusing_channels: usize,
    pub max_se_fusing_k: usize,
    /// A vendor DNN convolution primitive is available.
    pub vendor_convolution: bool,
    /// Half-precision storage and arithmetic are supported.
    pub fp16: bool,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            max_res_block_fusing_channels: MAX_RES_BLOCK_FUSING_CHANNELS,
            max_res_block_fusing_se_k: MAX_RES_BLOCK_FUSING_SE_K,
            max_res_block_fusing_se_k_fp16: MAX_RES_BLOCK_FUSING_SE_K,
            max_se_fusing_channels: MAX_SE_FUSING_CHANNELS,
            max_se_fusing_k: MAX_SE_FUSING_K,
            vendor_convolution: false,
            fp16: true,
        }
    }
}

impl DeviceCaps {
    /// Capabilities of `device`.
    pub fn detect(device: &Device) -> crate::Result<DeviceCaps> {
        match device {
            Device::Host => Ok(DeviceCaps {
                max_res_block_fusing_se_k_fp16: MAX_RES_BLOCK_FUSING_SE_K_FP16_LARGE,
                vendor_convolution: true,
                ..DeviceCaps::default()
            }),
            #[cfg(feature = "cuda")]
            Device::Cuda(idx) => crate::cuda::detect_caps(*idx),
            #[cfg(not(feature = "cuda"))]
            Device::Cuda(_) => Err(crate::RookError::DeviceUnavailable {
                device: *device,
                reason: "built without the `cuda` feature".into(),
            }),
        }
    }

    /// Whether a residual block of `channels` with an SE bottleneck of
    /// `se_k` (0 when absent) runs as fused Winograd kernels.
    pub fn can_fuse_residual(&self, channels: usize, se_k: usize, dtype: DType) -> bool {
        let se_limit = match dtype {
            DType::F16 => self.max_res_block_fusing_se_k_fp16,
            DType::F32 => self.max_res_block_fusing_se_k,
        };
        channels <= self.max_res_block_fusing_channels && se_k <= se_limit
    }

    /// Whether the standalone fused SE kernel covers this block.
    pub fn can_fuse_se(&self, channels: usize, se_k: usize) -> bool {
        channels <= self.max_se_fusing_channels && se_k <= self.max_se_fusing_k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_parse_display() {
        assert_eq!(Device::parse("cuda:1"), Some(Device::Cuda(1)));
        assert_eq!(Device::parse("host"), Some(Device::Host));
        assert_eq!(Device::parse("tpu"), None);
        assert_eq!(format!("{}", Device::Cuda(0)), "cuda:0");
        assert!(Device::default().is_host());
    }

    #[test]
    fn test_host_caps() {
        let caps = DeviceCaps::detect(&Device::Host).unwrap();
        assert!(caps.vendor_convolution);
        assert!(caps.can_fuse_residual(256, 32, DType::F32));
        assert!(!caps.can_fuse_residual(512, 32, DType::F32));
        assert!(!caps.can_fuse_residual(256, 256, DType::F32));
        assert!(caps.can_fuse_residual(256, 256, DType::F16));
    }

    #[test]
    fn test_se_limits() {
        let caps = DeviceCaps {
            max_se_fusing_k: 16,
            ..DeviceCaps::default()
        };
        assert!(caps.can_fuse_se(64, 16));
        assert!(!caps.can_fuse_se(64, 32));
    }

    #[test]
    fn test_caps_override_from_json() {
        let caps: DeviceCaps = serde_json::from_str(r#"{"max_se_fusing_channels": 0}"#).unwrap();
        assert_eq!(caps.max_se_fusing_channels, 0);
        assert_eq!(caps.max_res_block_fusing_channels, MAX_RES_BLOCK_FUSING_CHANNELS);
    }
}
