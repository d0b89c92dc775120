//! Direct convolution, the host runtime's vendor DNN primitive.

use rayon::prelude::*;
use rook_core::Element;

/// Same-padded `f×f` convolution, NCHW in and out, OIHW filter, no bias.
///
/// `input` is `[n][c_in][h][w]`, `out` is `[n][c_out][h][w]`.
#[allow(clippy::too_many_arguments)]
pub fn conv2d_nchw<T: Element>(
    out: &mut [T],
    input: &[T],
    filter: &[T],
    c_in: usize,
    c_out: usize,
    h: usize,
    w: usize,
    f: usize,
) {
    let plane = h * w;
    let pad = (f / 2) as isize;
    let filter: Vec<f32> = filter.iter().map(|v| v.to_f32()).collect();
    out.par_chunks_mut(plane).enumerate().for_each(|(idx, out_plane)| {
        let (s, co) = (idx / c_out, idx % c_out);
        let mut acc = vec![0.0f32; plane];
        for ci in 0..c_in {
            let src = &input[(s * c_in + ci) * plane..(s * c_in + ci + 1) * plane];
            let taps = &filter[(co * c_in + ci) * f * f..(co * c_in + ci + 1) * f * f];
            for y in 0..h {
                for x in 0..w {
                    let mut sum = 0.0f32;
                    for ky in 0..f {
                        let sy = y as isize + ky as isize - pad;
                        if sy < 0 || sy >= h as isize {
                            continue;
                        }
                        for kx in 0..f {
                            let sx = x as isize + kx as isize - pad;
                            if sx < 0 || sx >= w as isize {
                                continue;
                            }
                            sum += taps[ky * f + kx] * src[sy as usize * w + sx as usize].to_f32();
                        }
                    }
                    acc[y * w + x] += sum;
                }
            }
        }
        for (o, v) in out_plane.iter_mut().zip(&acc) {
            *o = T::from_f32(*v);
        }
    });
}
