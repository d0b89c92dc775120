use rayon::prelude::*;
use rook_core::{Element, Layout, TensorShape, BOARD_SIZE, BOARD_SQUARES};

/// Expand packed `(mask, value)` planes into a dense board tensor.
///
/// Square `sq` of plane `p` of sample `n` is `values[n * planes + p]` when
/// bit `sq` of the mask is set, zero otherwise.
pub fn expand_planes<T: Element>(out: &mut [T], masks: &[u64], values: &[f32], planes: usize, layout: Layout) {
    let shape = TensorShape::board(1, planes);
    out.par_chunks_mut(planes * BOARD_SQUARES)
        .enumerate()
        .for_each(|(n, sample)| {
            for p in 0..planes {
                let mask = masks[n * planes + p];
                let value = values[n * planes + p];
                for sq in 0..BOARD_SQUARES {
                    let v = if (mask >> sq) & 1 == 1 { value } else { 0.0 };
                    let (h, w) = (sq / BOARD_SIZE, sq % BOARD_SIZE);
                    sample[shape.index(layout, 0, p, h, w)] = T::from_f32(v);
                }
            }
        });
}

/// Scatter raw convolution-policy outputs into the move space.
///
/// `out` is zero-filled first; then `out[j] = input[i]` for each
/// `indices[i] = j >= 0`. Negative indices mark padding.
pub fn policy_map<T: Element>(
    out: &mut [T],
    input: &[T],
    indices: &[i16],
    input_size: usize,
    used_size: usize,
    output_size: usize,
) {
    out.par_chunks_mut(output_size).enumerate().for_each(|(n, sample_out)| {
        sample_out.iter_mut().for_each(|v| *v = T::zero());
        let sample_in = &input[n * input_size..n * input_size + used_size];
        for (v, &j) in sample_in.iter().zip(&indices[..used_size]) {
            if j >= 0 {
                sample_out[j as usize] = *v;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_single_bit() {
        let masks = [1u64 << 9, 0];
        let values = [0.5f32, 1.0];
        let mut out = vec![7.0f32; 2 * 64];
        expand_planes(&mut out, &masks, &values, 2, Layout::Nchw);
        assert_eq!(out[9], 0.5);
        assert_eq!(out.iter().filter(|&&v| v != 0.0).count(), 1);
    }

    #[test]
    fn test_expand_nhwc() {
        let masks = [0u64, u64::MAX];
        let values = [1.0f32, 2.0];
        let mut out = vec![0.0f32; 2 * 64];
        expand_planes(&mut out, &masks, &values, 2, Layout::Nhwc);
        for sq in 0..64 {
            assert_eq!(out[sq * 2], 0.0);
            assert_eq!(out[sq * 2 + 1], 2.0);
        }
    }

    #[test]
    fn test_policy_map_sentinels() {
        let input = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let indices = [2i16, -1, 0];
        let mut out = vec![9.0f32; 2 * 3];
        policy_map(&mut out, &input, &indices, 3, 3, 3);
        assert_eq!(out, vec![3.0, 0.0, 1.0, 6.0, 0.0, 4.0]);
    }
}
