//! Execution streams.
//!
//! Kernels are issued onto a stream and complete in issue order. Results
//! written by a stream are only valid on the host after
//! [`Stream::synchronize`].

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{Device, Result};

/// In-order execution queue bound to one device.
pub enum Stream {
    Host(HostStream),
    #[cfg(feature = "cuda")]
    Cuda(CudaStreamHandle),
}

impl Stream {
    /// Create a new stream on `device`.
    pub fn new(device: &Device) -> Result<Stream> {
        match device {
            Device::Host => Ok(Stream::Host(HostStream::default())),
            #[cfg(feature = "cuda")]
            Device::Cuda(idx) => CudaStreamHandle::new(*idx).map(Stream::Cuda),
            #[cfg(not(feature = "cuda"))]
            Device::Cuda(_) => Err(crate::RookError::DeviceUnavailable {
                device: *device,
                reason: "built without the `cuda` feature".into(),
            }),
        }
    }

    pub fn device(&self) -> Device {
        match self {
            Stream::Host(_) => Device::Host,
            #[cfg(feature = "cuda")]
            Stream::Cuda(s) => Device::Cuda(s.device_idx),
        }
    }

    /// Block until all work issued on this stream has completed.
    pub fn synchronize(&self) -> Result<()> {
        match self {
            Stream::Host(_) => Ok(()),
            #[cfg(feature = "cuda")]
            Stream::Cuda(s) => s.synchronize(),
        }
    }

    /// Number of kernels issued so far.
    pub fn launches(&self) -> u64 {
        match self {
            Stream::Host(s) => s.launches.load(Ordering::Relaxed),
            #[cfg(feature = "cuda")]
            Stream::Cuda(s) => s.launches.load(Ordering::Relaxed),
        }
    }

    /// Count one kernel issue on this stream.
    pub fn record(&self, op: &'static str) {
        let seq = match self {
            Stream::Host(s) => s.launches.fetch_add(1, Ordering::Relaxed),
            #[cfg(feature = "cuda")]
            Stream::Cuda(s) => s.launches.fetch_add(1, Ordering::Relaxed),
        };
        tracing::trace!(op, seq, device = %self.device(), "kernel issued");
    }
}

/// Host stream. Kernels run to completion on the issuing thread, which
/// trivially preserves issue order.
#[derive(Debug, Default)]
pub struct HostStream {
    launches: AtomicU64,
}

#[cfg(feature = "cuda")]
pub struct CudaStreamHandle {
    pub device: std::sync::Arc<cudarc::driver::CudaDevice>,
    pub device_idx: usize,
    pub stream: cudarc::driver::CudaStream,
    launches: AtomicU64,
}

#[cfg(feature = "cuda")]
impl CudaStreamHandle {
    fn new(device_idx: usize) -> Result<Self> {
        use crate::cuda::{get_device, CudaError};

        let device = get_device(device_idx).map_err(|e| e.into_rook("stream_create"))?;
        let stream = device
            .fork_default_stream()
            .map_err(|e| CudaError::LaunchError(e.to_string()).into_rook("stream_create"))?;
        Ok(Self {
            device,
            device_idx,
            stream,
            launches: AtomicU64::new(0),
        })
    }

    fn synchronize(&self) -> Result<()> {
        use crate::cuda::CudaError;

        self.device
            .wait_for(&self.stream)
            .and_then(|_| self.device.synchronize())
            .map_err(|e| CudaError::LaunchError(e.to_string()).into_rook("stream_synchronize"))
    }
}
