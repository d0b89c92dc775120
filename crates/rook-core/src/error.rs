use crate::device::Device;

/// Broad class of a [`RookError`], used by callers to decide whether a
/// failure is a bad network/config, a device problem, or API misuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The network or configuration can never run. Fatal, reported once.
    Configuration,
    /// The device refused an allocation or a launch. Fatal.
    Resource,
    /// The caller broke a lifecycle or capacity rule.
    Contract,
}

/// Errors produced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum RookError {
    #[error("shape mismatch in {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("missing weight tensor '{0}'")]
    MissingTensor(String),

    #[error("unsupported network topology: {0}")]
    UnsupportedTopology(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("batch of {requested} positions exceeds capacity {capacity}")]
    BatchTooLarge { requested: usize, capacity: usize },

    #[error("device {device} unavailable: {reason}")]
    DeviceUnavailable { device: Device, reason: String },

    #[error("{op}: allocation of {bytes} bytes failed: {reason}")]
    Allocation {
        op: &'static str,
        bytes: usize,
        reason: String,
    },

    #[error("{op}: launch failed: {reason}")]
    Launch { op: &'static str, reason: String },

    #[error("{op}: operands live on different devices")]
    DeviceMismatch { op: &'static str },

    #[error("{op}: buffer too small (need {needed} elements, have {available})")]
    BufferTooSmall {
        op: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("{0} evaluated before its weights were loaded")]
    LayerNotLoaded(&'static str),

    #[error("network is not ready for evaluation")]
    NotReady,

    #[error("no computation context available")]
    ContextUnavailable,
}

impl RookError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RookError::ShapeMismatch { .. }
            | RookError::MissingTensor(_)
            | RookError::UnsupportedTopology(_)
            | RookError::InvalidConfig(_)
            | RookError::BatchTooLarge { .. } => ErrorKind::Configuration,
            RookError::DeviceUnavailable { .. }
            | RookError::Allocation { .. }
            | RookError::Launch { .. }
            | RookError::DeviceMismatch { .. }
            | RookError::BufferTooSmall { .. } => ErrorKind::Resource,
            RookError::LayerNotLoaded(_) | RookError::NotReady | RookError::ContextUnavailable => {
                ErrorKind::Contract
            }
        }
    }

    pub fn shape(what: impl Into<String>, expected: &[usize], got: &[usize]) -> Self {
        RookError::ShapeMismatch {
            what: what.into(),
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}

/// Fail with [`RookError::BufferTooSmall`] unless `available >= needed`.
pub fn ensure_len(op: &'static str, needed: usize, available: usize) -> Result<(), RookError> {
    if available < needed {
        return Err(RookError::BufferTooSmall {
            op,
            needed,
            available,
        });
    }
    Ok(())
}
