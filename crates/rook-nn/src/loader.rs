//! Moves host weights onto a device.

use rook_core::{Device, DeviceBuffer, DeviceCaps, DeviceScalar, Element, Result, Stream};
use rook_kernels::ops;

/// Load-time helper bound to one stream.
///
/// `f32` data is uploaded once and converted to the layer's element type
/// by a device kernel. The stream is synchronized before each upload's
/// staging copy is released.
pub struct WeightLoader<'a> {
    stream: &'a Stream,
    caps: DeviceCaps,
}

impl<'a> WeightLoader<'a> {
    pub fn new(stream: &'a Stream, caps: DeviceCaps) -> Self {
        Self { stream, caps }
    }

    pub fn stream(&self) -> &'a Stream {
        self.stream
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    pub fn device(&self) -> Device {
        self.stream.device()
    }

    /// Upload `f32` weights as `T`.
    pub fn upload<T: Element>(&self, data: &[f32]) -> Result<DeviceBuffer<T>> {
        let device = self.device();
        let staging = DeviceBuffer::<f32>::from_host(&device, data)?;
        let mut out = DeviceBuffer::<T>::zeros(&device, data.len())?;
        ops::copy_converted::<f32, T>(self.stream, &mut out.view_mut(), staging.view(), data.len())?;
        self.stream.synchronize()?;
        Ok(out)
    }

    /// Upload data that stays in its host type (indices, `f32` batch-norm
    /// parameters).
    pub fn upload_raw<S: DeviceScalar>(&self, data: &[S]) -> Result<DeviceBuffer<S>> {
        DeviceBuffer::from_host(&self.device(), data)
    }

    /// Scratch buffer of `T` for one-time transforms.
    pub fn scratch<T: Element>(&self, len: usize) -> Result<DeviceBuffer<T>> {
        DeviceBuffer::zeros(&self.device(), len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    #[test]
    fn test_upload_converts_on_device() {
        let stream = Stream::new(&Device::Host).unwrap();
        let loader = WeightLoader::new(&stream, DeviceCaps::default());
        let buf = loader.upload::<f16>(&[1.5, -0.25]).unwrap();
        let back: Vec<f32> = buf.to_host_vec().unwrap().iter().map(|h| h.to_f32()).collect();
        assert_eq!(back, vec![1.5, -0.25]);
        assert_eq!(stream.launches(), 1);
    }
}
