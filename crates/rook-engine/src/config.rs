//! Engine configuration.

use std::path::Path;

use rook_core::{DType, Device, DeviceCaps, Layout, Result, RookError};
use serde::{Deserialize, Serialize};

/// How layers are selected when the network is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Winograd convolutions with bias, SE, skip and ReLU fused into the
    /// output transform; whole residual blocks fused where caps allow.
    #[default]
    Fused,
    /// Vendor/plain convolutions with every epilogue step a separate
    /// kernel. Slower; used as the reference path.
    Decomposed,
}

/// What happens when every computation context is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeasePolicy {
    #[default]
    Wait,
    /// Fail with `ContextUnavailable` instead of blocking.
    NoWait,
}

/// Everything fixed for the lifetime of an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub device: Device,
    pub max_batch_size: usize,
    pub precision: DType,
    /// Number of computation contexts, i.e. batches in flight at once.
    pub concurrency: usize,
    pub layout: Layout,
    pub mode: ExecutionMode,
    pub lease_policy: LeasePolicy,
    /// Replaces the detected device capabilities when set.
    pub caps: Option<DeviceCaps>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: Device::Host,
            max_batch_size: 256,
            precision: DType::F32,
            concurrency: 1,
            layout: Layout::Nchw,
            mode: ExecutionMode::Fused,
            lease_policy: LeasePolicy::Wait,
            caps: None,
        }
    }
}

impl EngineConfig {
    /// Parse a backend option string such as
    /// `"max_batch=256,precision=fp16,threads=2,layout=nhwc,mode=fused"`.
    /// Unknown keys are rejected; missing keys keep their defaults.
    pub fn from_backend_options(options: &str) -> Result<Self> {
        let mut cfg = Self::default();
        for item in options.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| RookError::InvalidConfig(format!("expected key=value, got '{}'", item)))?;
            let (key, value) = (key.trim(), value.trim());
            let bad = || RookError::InvalidConfig(format!("bad value '{}' for '{}'", value, key));
            match key {
                "gpu" | "device" => {
                    cfg.device = match value.parse::<usize>() {
                        Ok(idx) => Device::Cuda(idx),
                        Err(_) => Device::parse(value).ok_or_else(bad)?,
                    }
                }
                "max_batch" | "max_batch_size" => cfg.max_batch_size = value.parse().map_err(|_| bad())?,
                "precision" | "dtype" => cfg.precision = DType::parse(value).ok_or_else(bad)?,
                "threads" | "concurrency" | "multi_stream" => cfg.concurrency = value.parse().map_err(|_| bad())?,
                "layout" => cfg.layout = Layout::parse(value).ok_or_else(bad)?,
                "mode" => {
                    cfg.mode = match value.to_ascii_lowercase().as_str() {
                        "fused" => ExecutionMode::Fused,
                        "decomposed" | "reference" => ExecutionMode::Decomposed,
                        _ => return Err(bad()),
                    }
                }
                "lease" | "lease_policy" => {
                    cfg.lease_policy = match value.to_ascii_lowercase().as_str() {
                        "wait" => LeasePolicy::Wait,
                        "nowait" | "no_wait" => LeasePolicy::NoWait,
                        _ => return Err(bad()),
                    }
                }
                _ => return Err(RookError::InvalidConfig(format!("unknown backend option '{}'", key))),
            }
        }
        Ok(cfg)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| RookError::InvalidConfig(format!("config json: {}", e)))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RookError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// Capabilities the engine runs with: the override if one is set,
    /// otherwise what the device reports.
    pub fn effective_caps(&self) -> Result<DeviceCaps> {
        match self.caps {
            Some(caps) => Ok(caps),
            None => DeviceCaps::detect(&self.device),
        }
    }

    pub fn validate(&self, caps: &DeviceCaps) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(RookError::InvalidConfig("max_batch_size must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(RookError::InvalidConfig("concurrency must be at least 1".into()));
        }
        if self.precision == DType::F16 && !caps.fp16 {
            return Err(RookError::InvalidConfig(format!(
                "device {} does not support fp16",
                self.device
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_options() {
        let cfg = EngineConfig::from_backend_options("max_batch=64, precision=fp16,threads=2,layout=nhwc,mode=decomposed")
            .unwrap();
        assert_eq!(cfg.max_batch_size, 64);
        assert_eq!(cfg.precision, DType::F16);
        assert_eq!(cfg.concurrency, 2);
        assert_eq!(cfg.layout, Layout::Nhwc);
        assert_eq!(cfg.mode, ExecutionMode::Decomposed);
        assert_eq!(cfg.device, Device::Host);

        let cfg = EngineConfig::from_backend_options("gpu=1,lease=nowait").unwrap();
        assert_eq!(cfg.device, Device::Cuda(1));
        assert_eq!(cfg.lease_policy, LeasePolicy::NoWait);
    }

    #[test]
    fn test_backend_options_errors() {
        assert!(EngineConfig::from_backend_options("max_batch=lots").is_err());
        assert!(EngineConfig::from_backend_options("colour=blue").is_err());
        assert!(EngineConfig::from_backend_options("precision").is_err());
        assert_eq!(EngineConfig::from_backend_options("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_json_partial() {
        let cfg = EngineConfig::from_json(r#"{"max_batch_size": 8, "caps": {"max_se_fusing_k": 4}}"#).unwrap();
        assert_eq!(cfg.max_batch_size, 8);
        assert_eq!(cfg.concurrency, 1);
        assert_eq!(cfg.effective_caps().unwrap().max_se_fusing_k, 4);
    }

    #[test]
    fn test_validate() {
        let caps = DeviceCaps::default();
        assert!(EngineConfig::default().validate(&caps).is_ok());
        let zero = EngineConfig { max_batch_size: 0, ..EngineConfig::default() };
        assert!(zero.validate(&caps).is_err());
        let half = EngineConfig { precision: DType::F16, ..EngineConfig::default() };
        assert!(half.validate(&DeviceCaps { fp16: false, ..caps }).is_err());
    }
}
