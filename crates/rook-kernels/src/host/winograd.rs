//! Winograd F(4×4, 3×3) transforms over 8×8 boards.
//!
//! A board splits into 2×2 output tiles of 4×4; each tile reads a 6×6
//! input patch. Transformed tensors are laid out element-major so that the
//! 36 per-element products form one strided-batched GEMM:
//!
//! * filters: `U[36][C][K]`
//! * inputs:  `V[36][N·4][C]`
//! * products: `M[36][N·4][K] = V · U`

use rayon::prelude::*;
use rook_core::{Activation, Element, Layout, TensorShape, BOARD_SIZE, BOARD_SQUARES};

use super::se::{excite, HostSe};

/// Transformed elements per tile.
pub const WINOGRAD_ELEMENTS: usize = 36;
/// Output tiles per board.
pub const TILES_PER_BOARD: usize = 4;

const G: [[f32; 3]; 6] = [
    [1.0 / 4.0, 0.0, 0.0],
    [-1.0 / 6.0, -1.0 / 6.0, -1.0 / 6.0],
    [-1.0 / 6.0, 1.0 / 6.0, -1.0 / 6.0],
    [1.0 / 24.0, 1.0 / 12.0, 1.0 / 6.0],
    [1.0 / 24.0, -1.0 / 12.0, 1.0 / 6.0],
    [0.0, 0.0, 1.0],
];

const BT: [[f32; 6]; 6] = [
    [4.0, 0.0, -5.0, 0.0, 1.0, 0.0],
    [0.0, -4.0, -4.0, 1.0, 1.0, 0.0],
    [0.0, 4.0, -4.0, -1.0, 1.0, 0.0],
    [0.0, -2.0, -1.0, 2.0, 1.0, 0.0],
    [0.0, 2.0, -1.0, -2.0, 1.0, 0.0],
    [0.0, 4.0, 0.0, -5.0, 0.0, 1.0],
];

const AT: [[f32; 6]; 4] = [
    [1.0, 1.0, 1.0, 1.0, 1.0, 0.0],
    [0.0, 1.0, -1.0, 2.0, -2.0, 0.0],
    [0.0, 1.0, 1.0, 4.0, 4.0, 0.0],
    [0.0, 1.0, -1.0, 8.0, -8.0, 1.0],
];

/// `a · b`
fn mat_mul<const R: usize, const I: usize, const C: usize>(
    a: &[[f32; I]; R],
    b: &[[f32; C]; I],
) -> [[f32; C]; R] {
    let mut out = [[0.0f32; C]; R];
    for r in 0..R {
        for i in 0..I {
            let av = a[r][i];
            for c in 0..C {
                out[r][c] += av * b[i][c];
            }
        }
    }
    out
}

/// `a · bᵀ`
fn mat_mul_t<const R: usize, const I: usize, const C: usize>(
    a: &[[f32; I]; R],
    b: &[[f32; I]; C],
) -> [[f32; C]; R] {
    let mut out = [[0.0f32; C]; R];
    for r in 0..R {
        for c in 0..C {
            out[r][c] = (0..I).map(|i| a[r][i] * b[c][i]).sum();
        }
    }
    out
}

/// `U = G g Gᵀ` for every `(k, c)` 3×3 filter (OIHW input).
pub fn filter_transform<T: Element>(out: &mut [T], filter: &[T], k: usize, c: usize) {
    for kk in 0..k {
        for ch in 0..c {
            let base = (kk * c + ch) * 9;
            let mut g = [[0.0f32; 3]; 3];
            for (i, row) in g.iter_mut().enumerate() {
                for (j, v) in row.iter_mut().enumerate() {
                    *v = filter[base + i * 3 + j].to_f32();
                }
            }
            let u = mat_mul_t(&mat_mul(&G, &g), &G);
            for (e, v) in u.iter().flatten().enumerate() {
                out[(e * c + ch) * k + kk] = T::from_f32(*v);
            }
        }
    }
}

/// `V = Bᵀ d B` for every 6×6 patch of every board.
pub fn input_transform<T: Element>(out: &mut [T], input: &[T], n: usize, c: usize, layout: Layout) {
    let shape = TensorShape::board(n, c);
    let tiles = n * TILES_PER_BOARD;
    let per_sample: Vec<Vec<f32>> = (0..n)
        .into_par_iter()
        .map(|s| {
            // [e][t][ch]
            let mut local = vec![0.0f32; WINOGRAD_ELEMENTS * TILES_PER_BOARD * c];
            let mut padded = [[0.0f32; BOARD_SIZE + 2]; BOARD_SIZE + 2];
            for ch in 0..c {
                for (h, row) in padded.iter_mut().skip(1).take(BOARD_SIZE).enumerate() {
                    for (w, v) in row.iter_mut().skip(1).take(BOARD_SIZE).enumerate() {
                        *v = input[shape.index(layout, s, ch, h, w)].to_f32();
                    }
                }
                for t in 0..TILES_PER_BOARD {
                    let (ty, tx) = (t / 2 * 4, t % 2 * 4);
                    let mut d = [[0.0f32; 6]; 6];
                    for (i, row) in d.iter_mut().enumerate() {
                        row.copy_from_slice(&padded[ty + i][tx..tx + 6]);
                    }
                    let v = mat_mul_t(&mat_mul(&BT, &d), &BT);
                    for (e, val) in v.iter().flatten().enumerate() {
                        local[(e * TILES_PER_BOARD + t) * c + ch] = *val;
                    }
                }
            }
            local
        })
        .collect();

    for (s, local) in per_sample.iter().enumerate() {
        for e in 0..WINOGRAD_ELEMENTS {
            for t in 0..TILES_PER_BOARD {
                let src = &local[(e * TILES_PER_BOARD + t) * c..(e * TILES_PER_BOARD + t + 1) * c];
                let dst = (e * tiles + s * TILES_PER_BOARD + t) * c;
                for (o, v) in out[dst..dst + c].iter_mut().zip(src) {
                    *o = T::from_f32(*v);
                }
            }
        }
    }
}

/// What the output transform fuses after `Y = Aᵀ M A`.
pub struct HostEpilogue<'a, T> {
    pub bias: Option<&'a [T]>,
    pub se: Option<HostSe<'a, T>>,
    pub skip: Option<&'a [T]>,
    pub relu: bool,
}

/// `out = relu?(SE(Aᵀ M A + bias) + skip)` for every board.
pub fn output_transform<T: Element>(
    out: &mut [T],
    transformed: &[T],
    epilogue: &HostEpilogue<'_, T>,
    n: usize,
    k: usize,
    layout: Layout,
) {
    let shape = TensorShape::board(n, k);
    let tiles = n * TILES_PER_BOARD;
    let act = Activation::relu_if(epilogue.relu);
    out[..shape.numel()]
        .par_chunks_mut(k * BOARD_SQUARES)
        .enumerate()
        .for_each(|(s, sample)| {
            // [k][64]
            let mut vals = vec![0.0f32; k * BOARD_SQUARES];
            for kk in 0..k {
                let board = &mut vals[kk * BOARD_SQUARES..(kk + 1) * BOARD_SQUARES];
                for t in 0..TILES_PER_BOARD {
                    let mut m = [[0.0f32; 6]; 6];
                    for (e, v) in m.iter_mut().flatten().enumerate() {
                        *v = transformed[(e * tiles + s * TILES_PER_BOARD + t) * k + kk].to_f32();
                    }
                    let y = mat_mul_t(&mat_mul(&AT, &m), &AT);
                    let (ty, tx) = (t / 2 * 4, t % 2 * 4);
                    for (i, row) in y.iter().enumerate() {
                        let start = (ty + i) * BOARD_SIZE + tx;
                        board[start..start + 4].copy_from_slice(row);
                    }
                }
                if let Some(bias) = epilogue.bias {
                    let b = bias[kk].to_f32();
                    board.iter_mut().for_each(|v| *v += b);
                }
            }
            if let Some(se) = &epilogue.se {
                excite(&mut vals, k, se);
            }
            for kk in 0..k {
                for sq in 0..BOARD_SQUARES {
                    let (h, w) = (sq / BOARD_SIZE, sq % BOARD_SIZE);
                    let mut v = vals[kk * BOARD_SQUARES + sq];
                    if let Some(skip) = epilogue.skip {
                        v += skip[shape.index(layout, s, kk, h, w)].to_f32();
                    }
                    sample[shape.index(layout, 0, kk, h, w)] = T::from_f32(act.apply(v));
                }
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::conv::conv2d_nchw;
    use crate::host::gemm::gemm_strided_batched;
    use crate::blas::GemmShape;

    fn winograd_conv(input: &[f32], filter: &[f32], n: usize, c: usize, k: usize, layout: Layout) -> Vec<f32> {
        let tiles = n * TILES_PER_BOARD;
        let mut u = vec![0.0f32; 36 * c * k];
        filter_transform(&mut u, filter, k, c);
        let mut v = vec![0.0f32; 36 * tiles * c];
        input_transform(&mut v, input, n, c, layout);
        let mut m = vec![0.0f32; 36 * tiles * k];
        let shape = GemmShape {
            m: tiles,
            n: k,
            k: c,
            trans_a: false,
            trans_b: false,
            batch: 36,
            stride_a: tiles * c,
            stride_b: c * k,
            stride_c: tiles * k,
        };
        gemm_strided_batched(&shape, &v, &u, &mut m);
        let mut out = vec![0.0f32; n * k * 64];
        let epi = HostEpilogue { bias: None, se: None, skip: None, relu: false };
        output_transform(&mut out, &m, &epi, n, k, layout);
        out
    }

    fn signal(len: usize, f: f32) -> Vec<f32> {
        (0..len).map(|i| (i as f32 * f).sin()).collect()
    }

    #[test]
    fn test_matches_direct_convolution() {
        let (n, c, k) = (2, 3, 4);
        let input = signal(n * c * 64, 0.37);
        let filter = signal(k * c * 9, 0.91);
        let mut direct = vec![0.0f32; n * k * 64];
        conv2d_nchw(&mut direct, &input, &filter, c, k, 8, 8, 3);
        let wino = winograd_conv(&input, &filter, n, c, k, Layout::Nchw);
        for (i, (a, b)) in wino.iter().zip(&direct).enumerate() {
            assert!((a - b).abs() < 1e-4, "index {}: {} vs {}", i, a, b);
        }
    }

    #[test]
    fn test_nhwc_matches_nchw() {
        let (n, c, k) = (1, 2, 3);
        let shape_in = TensorShape::board(n, c);
        let shape_out = TensorShape::board(n, k);
        let input = signal(n * c * 64, 0.53);
        let filter = signal(k * c * 9, 0.29);
        let mut input_nhwc = vec![0.0f32; input.len()];
        crate::host::elementwise::convert_tensor(&mut input_nhwc, Layout::Nhwc, &input, Layout::Nchw, shape_in);
        let nchw = winograd_conv(&input, &filter, n, c, k, Layout::Nchw);
        let nhwc = winograd_conv(&input_nhwc, &filter, n, c, k, Layout::Nhwc);
        for kk in 0..k {
            for sq in 0..64 {
                let a = nchw[shape_out.index(Layout::Nchw, 0, kk, sq / 8, sq % 8)];
                let b = nhwc[shape_out.index(Layout::Nhwc, 0, kk, sq / 8, sq % 8)];
                assert!((a - b).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_epilogue_bias_skip_relu() {
        let (n, k) = (1, 2);
        let tiles = n * TILES_PER_BOARD;
        let m = vec![0.0f32; 36 * tiles * k];
        let bias = [1.0f32, -1.0];
        let skip = vec![0.5f32; n * k * 64];
        let epi = HostEpilogue { bias: Some(&bias[..]), se: None, skip: Some(&skip[..]), relu: true };
        let mut out = vec![0.0f32; n * k * 64];
        output_transform(&mut out, &m, &epi, n, k, Layout::Nchw);
        assert!(out[..64].iter().all(|&v| v == 1.5));
        assert!(out[64..].iter().all(|&v| v == 0.0));
    }
}
