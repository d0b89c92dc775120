use rayon::prelude::*;
use rook_core::{Activation, Element, Layout, TensorShape};

/// Chunk size for elementwise parallel loops.
const CHUNK: usize = 4096;

/// `data = act(data + bias[c])` in place.
pub fn bias_activation<T: Element>(data: &mut [T], bias: &[T], shape: TensorShape, layout: Layout, act: Activation) {
    let per_sample = shape.sample_len();
    data.par_chunks_mut(per_sample).for_each(|sample| {
        for (i, x) in sample.iter_mut().enumerate() {
            let c = shape.channel_of(layout, i);
            *x = T::from_f32(act.apply(x.to_f32() + bias[c].to_f32()));
        }
    });
}

/// `out[i] = act(a[i % |a|] + b[i % |b|])`.
pub fn add_vectors<T: Element>(out: &mut [T], a: &[T], b: &[T], act: Activation) {
    out.par_chunks_mut(CHUNK).enumerate().for_each(|(blk, chunk)| {
        let base = blk * CHUNK;
        for (j, o) in chunk.iter_mut().enumerate() {
            let i = base + j;
            let v = a[i % a.len()].to_f32() + b[i % b.len()].to_f32();
            *o = T::from_f32(act.apply(v));
        }
    });
}

/// `out = relu?((x - mean[c]) * mult[c] + skip)`.
#[allow(clippy::too_many_arguments)]
pub fn batch_norm<T: Element>(
    out: &mut [T],
    input: &[T],
    skip: Option<&[T]>,
    means: &[f32],
    var_multipliers: &[f32],
    shape: TensorShape,
    layout: Layout,
    relu: bool,
) {
    let act = Activation::relu_if(relu);
    out.par_chunks_mut(CHUNK).enumerate().for_each(|(blk, chunk)| {
        let base = blk * CHUNK;
        for (j, o) in chunk.iter_mut().enumerate() {
            let i = base + j;
            let c = shape.channel_of(layout, i);
            let mut v = (input[i].to_f32() - means[c]) * var_multipliers[c];
            if let Some(skip) = skip {
                v += skip[i].to_f32();
            }
            *o = T::from_f32(act.apply(v));
        }
    });
}

/// Convert element type and/or layout of a board tensor.
pub fn convert_tensor<S: Element, D: Element>(
    out: &mut [D],
    out_layout: Layout,
    input: &[S],
    in_layout: Layout,
    shape: TensorShape,
) {
    if in_layout == out_layout {
        return copy_converted(out, input);
    }
    let per_sample = shape.sample_len();
    out.par_chunks_mut(per_sample).enumerate().for_each(|(n, sample)| {
        for c in 0..shape.c {
            for h in 0..shape.h {
                for w in 0..shape.w {
                    let dst = shape.index(out_layout, 0, c, h, w);
                    let src = shape.index(in_layout, n, c, h, w);
                    sample[dst] = D::from_f32(input[src].to_f32());
                }
            }
        }
    });
}

/// Flat element-type conversion of `out.len()` elements.
pub fn copy_converted<S: Element, D: Element>(out: &mut [D], input: &[S]) {
    out.par_chunks_mut(CHUNK)
        .zip(input.par_chunks(CHUNK))
        .for_each(|(o, i)| {
            for (d, s) in o.iter_mut().zip(i) {
                *d = D::from_f32(s.to_f32());
            }
        });
}
