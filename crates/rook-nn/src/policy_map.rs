//! Gather of the raw convolution policy planes into the move index space.

use rook_core::{DevSlice, DevSliceMut, DeviceBuffer, Element, Layout, Result, RookError, TensorShape, BOARD_SQUARES};
use rook_kernels::ops;

use crate::layer::{Handles, LayerOps};
use crate::loader::WeightLoader;
use crate::policy::{conv_policy_map, conv_policy_map_nhwc, CONV_POLICY_PLANES, CONV_POLICY_USED_PLANES, NUM_POLICY_OUTPUTS};

/// Maps `[80][8][8]` raw policy planes to the 1858 move logits. Outputs no
/// plane maps to are zero.
pub struct PolicyMapLayer<T: Element> {
    layout: Layout,
    indices: Option<DeviceBuffer<i16>>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Element> PolicyMapLayer<T> {
    /// `layout` is the layout of the raw planes.
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            indices: None,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn load_weights(&mut self, loader: &WeightLoader<'_>) -> Result<()> {
        let indices = match self.layout {
            Layout::Nchw => loader.upload_raw(conv_policy_map())?,
            Layout::Nhwc => loader.upload_raw(&conv_policy_map_nhwc())?,
        };
        self.indices = Some(indices);
        Ok(())
    }

    fn used_size(&self) -> usize {
        match self.layout {
            // Planes past the used ones are never read.
            Layout::Nchw => CONV_POLICY_USED_PLANES * BOARD_SQUARES,
            Layout::Nhwc => CONV_POLICY_PLANES * BOARD_SQUARES,
        }
    }
}

impl<T: Element> LayerOps<T> for PolicyMapLayer<T> {
    fn name(&self) -> &'static str {
        "policy_map"
    }

    fn input_shape(&self) -> TensorShape {
        TensorShape::board(1, CONV_POLICY_PLANES)
    }

    fn output_shape(&self) -> TensorShape {
        TensorShape::flat(1, NUM_POLICY_OUTPUTS)
    }

    fn workspace_size(&self, _max_batch: usize) -> usize {
        0
    }

    fn is_loaded(&self) -> bool {
        self.indices.is_some()
    }

    fn evaluate(
        &self,
        n: usize,
        output: &mut DevSliceMut<'_, T>,
        input: DevSlice<'_, T>,
        _skip: Option<DevSlice<'_, T>>,
        _workspace: DevSliceMut<'_, T>,
        h: &Handles<'_>,
    ) -> Result<()> {
        let indices = self.indices.as_ref().ok_or(RookError::LayerNotLoaded("policy_map"))?;
        ops::policy_map(
            h.stream,
            output,
            input,
            indices.view(),
            n,
            CONV_POLICY_PLANES * BOARD_SQUARES,
            self.used_size(),
            NUM_POLICY_OUTPUTS,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rook_core::{Device, DeviceCaps, Stream};
    use rook_kernels::{BlasHandle, DnnHandle};

    use crate::policy::{move_index, Promotion};

    fn run(layout: Layout, raw: &[f32]) -> Vec<f32> {
        let stream = Stream::new(&Device::Host).unwrap();
        let blas = BlasHandle::new(&stream).unwrap();
        let dnn = DnnHandle::new(&stream);
        let caps = DeviceCaps::default();
        let h = Handles { stream: &stream, blas: &blas, dnn: &dnn, caps: &caps };
        let loader = WeightLoader::new(&stream, caps);
        let mut layer = PolicyMapLayer::<f32>::new(layout);
        layer.load_weights(&loader).unwrap();
        let n = raw.len() / (CONV_POLICY_PLANES * 64);
        let input = DeviceBuffer::from_host(&Device::Host, raw).unwrap();
        let mut out = DeviceBuffer::<f32>::zeros(&Device::Host, n * NUM_POLICY_OUTPUTS).unwrap();
        let mut ws = DeviceBuffer::<f32>::zeros(&Device::Host, 0).unwrap();
        layer.evaluate(n, &mut out.view_mut(), input.view(), None, ws.view_mut(), &h).unwrap();
        out.to_host_vec().unwrap()
    }

    #[test]
    fn test_known_moves_land_in_place() {
        let shape = TensorShape::board(1, CONV_POLICY_PLANES);
        let mut nchw = vec![0.0f32; shape.numel()];
        let mut nhwc = vec![0.0f32; shape.numel()];
        // e2e4: north, distance 2 from square 12.
        let e2e4 = (1usize, 12usize, 3.0f32);
        // a7a8=N: under-promotion plane 64 + 0 * 3 + 1.
        let a7a8n = (65usize, 48usize, -2.0f32);
        for (plane, sq, v) in [e2e4, a7a8n] {
            nchw[shape.index(Layout::Nchw, 0, plane, sq / 8, sq % 8)] = v;
            nhwc[shape.index(Layout::Nhwc, 0, plane, sq / 8, sq % 8)] = v;
        }
        for (layout, raw) in [(Layout::Nchw, &nchw), (Layout::Nhwc, &nhwc)] {
            let out = run(layout, raw);
            assert_eq!(out[move_index(12, 28, None).unwrap()], 3.0);
            assert_eq!(out[move_index(48, 56, Some(Promotion::Knight)).unwrap()], -2.0);
            assert_eq!(out.iter().filter(|&&v| v != 0.0).count(), 2);
        }
    }

    #[test]
    fn test_padding_planes_ignored() {
        let mut raw = vec![0.0f32; 2 * CONV_POLICY_PLANES * 64];
        let second = CONV_POLICY_PLANES * 64;
        for v in &mut raw[second + CONV_POLICY_USED_PLANES * 64..] {
            *v = 7.0;
        }
        let out = run(Layout::Nchw, &raw);
        assert!(out.iter().all(|&v| v == 0.0));
    }
}
