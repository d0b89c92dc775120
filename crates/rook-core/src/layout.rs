//! Logical tensor shapes and memory layouts.
//!
//! Device buffers are flat; the `(N, C, H, W)` shape and the layout travel
//! alongside them. Changing layout always goes through a conversion kernel.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Side length of the board every spatial tensor is laid over.
pub const BOARD_SIZE: usize = 8;

/// Squares per board plane.
pub const BOARD_SQUARES: usize = BOARD_SIZE * BOARD_SIZE;

/// Memory layout of a 4D activation tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// Channel-major: `((n * C + c) * H + h) * W + w`.
    #[default]
    Nchw,
    /// Channel-minor: `((n * H + h) * W + w) * C + c`.
    Nhwc,
}

impl Layout {
    pub fn parse(s: &str) -> Option<Layout> {
        match s.to_ascii_lowercase().as_str() {
            "nchw" => Some(Layout::Nchw),
            "nhwc" => Some(Layout::Nhwc),
            _ => None,
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::Nchw => write!(f, "NCHW"),
            Layout::Nhwc => write!(f, "NHWC"),
        }
    }
}

/// Logical `(N, C, H, W)` extent of an activation tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorShape {
    pub n: usize,
    pub c: usize,
    pub h: usize,
    pub w: usize,
}

impl TensorShape {
    pub fn new(n: usize, c: usize, h: usize, w: usize) -> Self {
        Self { n, c, h, w }
    }

    /// `n` boards of `c` planes.
    pub fn board(n: usize, c: usize) -> Self {
        Self::new(n, c, BOARD_SIZE, BOARD_SIZE)
    }

    /// `n` rows of `c` features (fully-connected activations).
    pub fn flat(n: usize, c: usize) -> Self {
        Self::new(n, c, 1, 1)
    }

    /// Same per-sample extent with `n` samples.
    pub fn with_batch(self, n: usize) -> Self {
        Self { n, ..self }
    }

    pub fn numel(&self) -> usize {
        self.n * self.c * self.h * self.w
    }

    /// Elements per sample.
    pub fn sample_len(&self) -> usize {
        self.c * self.h * self.w
    }

    /// Spatial positions per sample.
    pub fn spatial(&self) -> usize {
        self.h * self.w
    }

    /// Flat offset of element `(n, c, h, w)` in `layout`.
    #[inline(always)]
    pub fn index(&self, layout: Layout, n: usize, c: usize, h: usize, w: usize) -> usize {
        match layout {
            Layout::Nchw => ((n * self.c + c) * self.h + h) * self.w + w,
            Layout::Nhwc => ((n * self.h + h) * self.w + w) * self.c + c,
        }
    }

    /// Channel of the element stored at flat offset `i`.
    #[inline(always)]
    pub fn channel_of(&self, layout: Layout, i: usize) -> usize {
        match layout {
            Layout::Nchw => (i / self.spatial()) % self.c,
            Layout::Nhwc => i % self.c,
        }
    }

    pub fn dims(&self) -> Vec<usize> {
        vec![self.n, self.c, self.h, self.w]
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}, {}]", self.n, self.c, self.h, self.w)
    }
}

/// Pointwise nonlinearity fused into a kernel epilogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    None,
    Relu,
    Tanh,
    Sigmoid,
}

impl Activation {
    #[inline(always)]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::None => x,
            Activation::Relu => x.max(0.0),
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => sigmoid(x),
        }
    }

    /// Stable integer tag passed to device kernels.
    pub fn code(self) -> u32 {
        match self {
            Activation::None => 0,
            Activation::Relu => 1,
            Activation::Tanh => 2,
            Activation::Sigmoid => 3,
        }
    }

    pub fn relu_if(relu: bool) -> Self {
        if relu {
            Activation::Relu
        } else {
            Activation::None
        }
    }
}

#[inline(always)]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_layouts() {
        let s = TensorShape::board(2, 3);
        assert_eq!(s.numel(), 2 * 3 * 64);
        assert_eq!(s.index(Layout::Nchw, 1, 2, 0, 1), (1 * 3 + 2) * 64 + 1);
        assert_eq!(s.index(Layout::Nhwc, 1, 2, 0, 1), (64 + 1) * 3 + 2);
    }

    #[test]
    fn test_channel_of_inverts_index() {
        let s = TensorShape::board(2, 5);
        for layout in [Layout::Nchw, Layout::Nhwc] {
            for c in 0..5 {
                let i = s.index(layout, 1, c, 3, 4);
                assert_eq!(s.channel_of(layout, i), c);
            }
        }
    }

    #[test]
    fn test_activation() {
        assert_eq!(Activation::Relu.apply(-2.0), 0.0);
        assert_eq!(Activation::None.apply(-2.0), -2.0);
        assert!((Activation::Sigmoid.apply(0.0) - 0.5).abs() < 1e-7);
        assert!((Activation::Tanh.apply(100.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_layout_parse() {
        assert_eq!(Layout::parse("NHWC"), Some(Layout::Nhwc));
        assert_eq!(Layout::parse("chw"), None);
    }
}
