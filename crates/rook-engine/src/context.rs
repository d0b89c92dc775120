//! Computation contexts and the pool that leases them.

use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex};
use rook_core::{Device, DeviceBuffer, Element, Result, RookError, Stream};
use rook_kernels::{BlasHandle, DnnHandle};

use crate::config::LeasePolicy;

/// Activation buffers rotated through by the forward pass.
pub const ACTIVATION_BUFFERS: usize = 3;

/// Everything one in-flight evaluation needs: a stream with its BLAS and
/// DNN handles, the shared-size workspace and the activation buffers.
pub struct ComputeContext<T: Element> {
    pub(crate) stream: Stream,
    pub(crate) blas: BlasHandle,
    pub(crate) dnn: DnnHandle,
    pub(crate) workspace: DeviceBuffer<T>,
    pub(crate) activations: Vec<DeviceBuffer<T>>,
}

impl<T: Element> ComputeContext<T> {
    /// `workspace_len` and `activation_len` are in elements.
    pub fn new(device: &Device, workspace_len: usize, activation_len: usize) -> Result<Self> {
        let stream = Stream::new(device)?;
        let blas = BlasHandle::new(&stream)?;
        let dnn = DnnHandle::new(&stream);
        let workspace = DeviceBuffer::zeros(device, workspace_len)?;
        let activations = (0..ACTIVATION_BUFFERS)
            .map(|_| DeviceBuffer::zeros(device, activation_len))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            stream,
            blas,
            dnn,
            workspace,
            activations,
        })
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Device bytes held by this context.
    pub fn nbytes(&self) -> usize {
        self.workspace.nbytes() + self.activations.iter().map(DeviceBuffer::nbytes).sum::<usize>()
    }
}

/// Fixed set of contexts shared by concurrent callers.
pub struct ContextPool<T: Element> {
    free: Mutex<Vec<ComputeContext<T>>>,
    available: Condvar,
    size: usize,
}

impl<T: Element> ContextPool<T> {
    pub fn new(contexts: Vec<ComputeContext<T>>) -> Self {
        Self {
            size: contexts.len(),
            free: Mutex::new(contexts),
            available: Condvar::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Block until a context is free.
    pub fn lease(&self) -> ContextLease<'_, T> {
        let mut free = self.free.lock();
        loop {
            if let Some(ctx) = free.pop() {
                return ContextLease { pool: self, ctx: Some(ctx) };
            }
            self.available.wait(&mut free);
        }
    }

    /// Take a free context or fail with `ContextUnavailable`.
    pub fn try_lease(&self) -> Result<ContextLease<'_, T>> {
        self.free
            .lock()
            .pop()
            .map(|ctx| ContextLease { pool: self, ctx: Some(ctx) })
            .ok_or(RookError::ContextUnavailable)
    }

    pub fn lease_with(&self, policy: LeasePolicy) -> Result<ContextLease<'_, T>> {
        match policy {
            LeasePolicy::Wait => Ok(self.lease()),
            LeasePolicy::NoWait => self.try_lease(),
        }
    }

    fn give_back(&self, ctx: ComputeContext<T>) {
        self.free.lock().push(ctx);
        self.available.notify_one();
    }
}

/// A context on loan; returned to its pool on drop.
pub struct ContextLease<'a, T: Element> {
    pool: &'a ContextPool<T>,
    ctx: Option<ComputeContext<T>>,
}

impl<T: Element> Deref for ContextLease<'_, T> {
    type Target = ComputeContext<T>;

    fn deref(&self) -> &ComputeContext<T> {
        match &self.ctx {
            Some(c) => c,
            None => unreachable!("context lease used after release"),
        }
    }
}

impl<T: Element> DerefMut for ContextLease<'_, T> {
    fn deref_mut(&mut self) -> &mut ComputeContext<T> {
        match &mut self.ctx {
            Some(c) => c,
            None => unreachable!("context lease used after release"),
        }
    }
}

impl<T: Element> Drop for ContextLease<'_, T> {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.pool.give_back(ctx);
        }
    }
}
