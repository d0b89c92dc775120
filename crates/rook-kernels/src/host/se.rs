//! Squeeze-and-excitation kernels.

use rayon::prelude::*;
use rook_core::{sigmoid, Activation, Element, Layout, TensorShape};

/// SE weights as seen by a host kernel.
///
/// `w1` is `[k][c]`, `b1` is `[k]`, `w2` is `[2c][k]`, `b2` is `[2c]`.
/// The first `c` outputs of the second layer are gates, the rest shifts.
#[derive(Clone, Copy)]
pub struct HostSe<'a, T> {
    pub w1: &'a [T],
    pub b1: &'a [T],
    pub w2: &'a [T],
    pub b2: &'a [T],
    pub k: usize,
}

/// Apply squeeze-and-excitation in place to one sample stored
/// channel-major (`[c][spatial]`) in `f32`.
pub fn excite<T: Element>(vals: &mut [f32], c: usize, se: &HostSe<'_, T>) {
    let spatial = vals.len() / c;
    let pooled: Vec<f32> = vals
        .chunks_exact(spatial)
        .map(|plane| plane.iter().sum::<f32>() / spatial as f32)
        .collect();
    let hidden: Vec<f32> = (0..se.k)
        .map(|j| {
            let row = &se.w1[j * c..(j + 1) * c];
            let dot: f32 = row.iter().zip(&pooled).map(|(w, p)| w.to_f32() * p).sum();
            (dot + se.b1[j].to_f32()).max(0.0)
        })
        .collect();
    let fc2 = |i: usize| -> f32 {
        let row = &se.w2[i * se.k..(i + 1) * se.k];
        let dot: f32 = row.iter().zip(&hidden).map(|(w, h)| w.to_f32() * h).sum();
        dot + se.b2[i].to_f32()
    };
    for (ch, plane) in vals.chunks_exact_mut(spatial).enumerate() {
        let gate = sigmoid(fc2(ch));
        let shift = fc2(c + ch);
        for v in plane.iter_mut() {
            *v = gate * *v + shift;
        }
    }
}

/// Whole SE block for every sample:
/// `out = relu?(SE(x + prev_bias) + skip)`.
#[allow(clippy::too_many_arguments)]
pub fn se_fused<T: Element>(
    out: &mut [T],
    input: &[T],
    skip: Option<&[T]>,
    se: &HostSe<'_, T>,
    prev_bias: Option<&[T]>,
    shape: TensorShape,
    layout: Layout,
    relu: bool,
) {
    let act = Activation::relu_if(relu);
    let per_sample = shape.sample_len();
    let spatial = shape.spatial();
    out.par_chunks_mut(per_sample).enumerate().for_each(|(n, sample)| {
        let mut vals = vec![0.0f32; per_sample];
        for c in 0..shape.c {
            let pb = prev_bias.map_or(0.0, |b| b[c].to_f32());
            for s in 0..spatial {
                let (h, w) = (s / shape.w, s % shape.w);
                vals[c * spatial + s] = input[shape.index(layout, n, c, h, w)].to_f32() + pb;
            }
        }
        excite(&mut vals, shape.c, se);
        for c in 0..shape.c {
            for s in 0..spatial {
                let (h, w) = (s / shape.w, s % shape.w);
                let mut v = vals[c * spatial + s];
                if let Some(skip) = skip {
                    v += skip[shape.index(layout, n, c, h, w)].to_f32();
                }
                sample[shape.index(layout, 0, c, h, w)] = T::from_f32(act.apply(v));
            }
        }
    });
}

/// `out[n][c] = mean(x[n][c]) + prev_bias[c]`.
pub fn global_avg_pool<T: Element>(
    out: &mut [T],
    input: &[T],
    prev_bias: Option<&[T]>,
    shape: TensorShape,
    layout: Layout,
) {
    let spatial = shape.spatial();
    out.par_chunks_mut(shape.c).enumerate().for_each(|(n, pooled)| {
        for (c, p) in pooled.iter_mut().enumerate() {
            let mut sum = 0.0f32;
            for s in 0..spatial {
                sum += input[shape.index(layout, n, c, s / shape.w, s % shape.w)].to_f32();
            }
            let pb = prev_bias.map_or(0.0, |b| b[c].to_f32());
            *p = T::from_f32(sum / spatial as f32 + pb);
        }
    });
}

/// `out = relu?(sigmoid(s[n][c]) * (x + prev_bias[c]) + s[n][C + c] + skip)`.
#[allow(clippy::too_many_arguments)]
pub fn global_scale<T: Element>(
    out: &mut [T],
    input: &[T],
    scale_bias: &[T],
    prev_bias: Option<&[T]>,
    skip: Option<&[T]>,
    shape: TensorShape,
    layout: Layout,
    relu: bool,
) {
    let act = Activation::relu_if(relu);
    let per_sample = shape.sample_len();
    out.par_chunks_mut(per_sample).enumerate().for_each(|(n, sample)| {
        let sb = &scale_bias[n * 2 * shape.c..(n + 1) * 2 * shape.c];
        for (i, o) in sample.iter_mut().enumerate() {
            let c = shape.channel_of(layout, i);
            let src = n * per_sample + i;
            let x = input[src].to_f32() + prev_bias.map_or(0.0, |b| b[c].to_f32());
            let mut v = sigmoid(sb[c].to_f32()) * x + sb[shape.c + c].to_f32();
            if let Some(skip) = skip {
                v += skip[src].to_f32();
            }
            *o = T::from_f32(act.apply(v));
        }
    });
}
