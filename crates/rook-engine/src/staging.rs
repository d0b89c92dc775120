//! Host-visible input/output buffers and their device mirrors.
//!
//! One [`StagingBuffer`] holds everything a batch needs to cross the
//! host/device boundary: input plane masks and values going in, policy,
//! value and moves-left coming out. Buffers are sized for the engine's
//! maximum batch once and reused; a call uses a prefix.

use parking_lot::Mutex;
use rook_core::{DevSlice, DevSliceMut, Device, DeviceBuffer, Result, RookError, Stream};
use rook_nn::NUM_POLICY_OUTPUTS;
use serde::{Deserialize, Serialize};

use crate::weights::INPUT_PLANES;

/// One input plane: squares set in `mask` take `value`, all others are zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct InputPlane {
    pub mask: u64,
    pub value: f32,
}

impl InputPlane {
    pub fn new(mask: u64, value: f32) -> Self {
        Self { mask, value }
    }
}

/// Encoded position: exactly [`INPUT_PLANES`] planes.
pub type PositionPlanes = Vec<InputPlane>;

/// Which output a network head writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadOutput {
    Policy,
    Value,
    MovesLeft,
}

struct DeviceMirror {
    masks: DeviceBuffer<u64>,
    values: DeviceBuffer<f32>,
    policy: DeviceBuffer<f32>,
    value: DeviceBuffer<f32>,
    moves_left: Option<DeviceBuffer<f32>>,
}

pub struct StagingBuffer {
    capacity: usize,
    value_len: usize,
    masks: Vec<u64>,
    values: Vec<f32>,
    policy: Vec<f32>,
    value: Vec<f32>,
    moves_left: Option<Vec<f32>>,
    device: DeviceMirror,
}

impl StagingBuffer {
    /// Allocate for `capacity` positions. `wdl` selects a 3-way value output.
    pub fn new(device: &Device, capacity: usize, wdl: bool, moves_left: bool) -> Result<Self> {
        let value_len = if wdl { 3 } else { 1 };
        let inputs = capacity * INPUT_PLANES;
        let mirror = DeviceMirror {
            masks: DeviceBuffer::zeros(device, inputs)?,
            values: DeviceBuffer::zeros(device, inputs)?,
            policy: DeviceBuffer::zeros(device, capacity * NUM_POLICY_OUTPUTS)?,
            value: DeviceBuffer::zeros(device, capacity * value_len)?,
            moves_left: moves_left.then(|| DeviceBuffer::zeros(device, capacity)).transpose()?,
        };
        Ok(Self {
            capacity,
            value_len,
            masks: vec![0; inputs],
            values: vec![0.0; inputs],
            policy: vec![0.0; capacity * NUM_POLICY_OUTPUTS],
            value: vec![0.0; capacity * value_len],
            moves_left: moves_left.then(|| vec![0.0; capacity]),
            device: mirror,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Values per sample in the value output: 1 (scalar) or 3 (WDL).
    pub fn value_len(&self) -> usize {
        self.value_len
    }

    pub fn has_moves_left(&self) -> bool {
        self.moves_left.is_some()
    }

    /// Write position `i` of the batch.
    pub fn set_position(&mut self, i: usize, planes: &[InputPlane]) -> Result<()> {
        if i >= self.capacity {
            return Err(RookError::BatchTooLarge {
                requested: i + 1,
                capacity: self.capacity,
            });
        }
        if planes.len() != INPUT_PLANES {
            return Err(RookError::shape("input planes", &[INPUT_PLANES], &[planes.len()]));
        }
        let base = i * INPUT_PLANES;
        for (p, plane) in planes.iter().enumerate() {
            self.masks[base + p] = plane.mask;
            self.values[base + p] = plane.value;
        }
        Ok(())
    }

    /// Copy the inputs of the first `n` positions to the device.
    pub fn upload_inputs(&mut self, stream: &Stream, n: usize) -> Result<()> {
        self.check_batch(n)?;
        let len = n * INPUT_PLANES;
        self.device.masks.copy_from_host(stream, &self.masks[..len])?;
        self.device.values.copy_from_host(stream, &self.values[..len])
    }

    /// Copy the outputs of the first `n` positions back. Waits for `stream`.
    pub fn download_outputs(&mut self, stream: &Stream, n: usize) -> Result<()> {
        self.check_batch(n)?;
        self.device
            .policy
            .copy_to_host(stream, &mut self.policy[..n * NUM_POLICY_OUTPUTS])?;
        self.device.value.copy_to_host(stream, &mut self.value[..n * self.value_len])?;
        if let (Some(dev), Some(host)) = (&self.device.moves_left, &mut self.moves_left) {
            dev.copy_to_host(stream, &mut host[..n])?;
        }
        Ok(())
    }

    fn check_batch(&self, n: usize) -> Result<()> {
        if n > self.capacity {
            return Err(RookError::BatchTooLarge {
                requested: n,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    pub(crate) fn device_inputs(&self) -> (DevSlice<'_, u64>, DevSlice<'_, f32>) {
        (self.device.masks.view(), self.device.values.view())
    }

    pub(crate) fn device_output(&mut self, head: HeadOutput) -> Result<DevSliceMut<'_, f32>> {
        match head {
            HeadOutput::Policy => Ok(self.device.policy.view_mut()),
            HeadOutput::Value => Ok(self.device.value.view_mut()),
            HeadOutput::MovesLeft => self
                .device
                .moves_left
                .as_mut()
                .map(DeviceBuffer::view_mut)
                .ok_or_else(|| RookError::InvalidConfig("staging buffer has no moves-left output".into())),
        }
    }

    /// Raw policy logits of position `i`.
    pub fn policy(&self, i: usize) -> &[f32] {
        &self.policy[i * NUM_POLICY_OUTPUTS..(i + 1) * NUM_POLICY_OUTPUTS]
    }

    /// Raw value output of position `i`: one tanh value or three WDL logits.
    pub fn value(&self, i: usize) -> &[f32] {
        &self.value[i * self.value_len..(i + 1) * self.value_len]
    }

    pub fn moves_left(&self, i: usize) -> Option<f32> {
        self.moves_left.as_ref().map(|m| m[i])
    }
}

/// Pool of staging buffers for one engine. Grows when every buffer is in
/// use; buffers are never freed before the pool.
pub struct StagingPool {
    device: Device,
    capacity: usize,
    wdl: bool,
    moves_left: bool,
    free: Mutex<Vec<StagingBuffer>>,
}

impl StagingPool {
    pub fn new(device: Device, capacity: usize, wdl: bool, moves_left: bool) -> Self {
        Self {
            device,
            capacity,
            wdl,
            moves_left,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Take a buffer, allocating one if none is free.
    pub fn acquire(&self) -> Result<StagingLease<'_>> {
        let buffer = match self.free.lock().pop() {
            Some(b) => b,
            None => {
                tracing::debug!(device = %self.device, capacity = self.capacity, "allocating staging buffer");
                StagingBuffer::new(&self.device, self.capacity, self.wdl, self.moves_left)?
            }
        };
        Ok(StagingLease {
            pool: self,
            buffer: Some(buffer),
        })
    }

    pub fn release(&self, buffer: StagingBuffer) {
        self.free.lock().push(buffer);
    }

    /// Buffers currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

/// A staging buffer on loan; returned to its pool on drop.
pub struct StagingLease<'a> {
    pool: &'a StagingPool,
    buffer: Option<StagingBuffer>,
}

impl std::ops::Deref for StagingLease<'_> {
    type Target = StagingBuffer;

    fn deref(&self) -> &StagingBuffer {
        match &self.buffer {
            Some(b) => b,
            None => unreachable!("staging lease used after release"),
        }
    }
}

impl std::ops::DerefMut for StagingLease<'_> {
    fn deref_mut(&mut self) -> &mut StagingBuffer {
        match &mut self.buffer {
            Some(b) => b,
            None => unreachable!("staging lease used after release"),
        }
    }
}

impl Drop for StagingLease<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planes(value: f32) -> PositionPlanes {
        (0..INPUT_PLANES).map(|p| InputPlane::new(1 << (p % 64), value)).collect()
    }

    #[test]
    fn test_pool_reuses_buffers() {
        let pool = StagingPool::new(Device::Host, 4, true, false);
        {
            let a = pool.acquire().unwrap();
            let _b = pool.acquire().unwrap();
            assert_eq!(a.value_len(), 3);
            assert!(!a.has_moves_left());
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.idle(), 2);
        let _c = pool.acquire().unwrap();
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_set_position_checks() {
        let mut buf = StagingBuffer::new(&Device::Host, 2, false, true).unwrap();
        buf.set_position(1, &planes(1.0)).unwrap();
        assert!(matches!(buf.set_position(2, &planes(1.0)), Err(RookError::BatchTooLarge { .. })));
        assert!(matches!(buf.set_position(0, &planes(1.0)[..3]), Err(RookError::ShapeMismatch { .. })));
        let stream = Stream::new(&Device::Host).unwrap();
        assert!(buf.upload_inputs(&stream, 3).is_err());
        buf.upload_inputs(&stream, 2).unwrap();
        let (masks, values) = buf.device_inputs();
        assert_eq!(masks.as_host().unwrap()[INPUT_PLANES + 1], 2);
        assert_eq!(values.as_host().unwrap()[INPUT_PLANES], 1.0);
    }
}
