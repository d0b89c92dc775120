//! Tiled strided-batched GEMM for the host runtime.
//!
//! Operands are unpacked to row-major `f32` once per batch item (applying
//! the requested transposes), multiplied with a cache-blocked kernel that
//! dispatches to AVX2/FMA when available, and rounded back to `T`.

use rayon::prelude::*;
use rook_core::Element;

use crate::blas::GemmShape;
use crate::simd::{GemmTier, SimdCapability};

/// 64×64 tiles fit comfortably in L1 cache (~32KB for f32).
const TILE_M: usize = 64;
const TILE_N: usize = 64;
const TILE_K: usize = 64;

/// Rows per task when a single large GEMM is split across threads.
const ROW_BLOCK: usize = 16;

/// `C[i] = op(A[i]) · op(B[i])` for every batch item, row-major.
pub fn gemm_strided_batched<T: Element>(shape: &GemmShape, a: &[T], b: &[T], c: &mut [T]) {
    let tier = SimdCapability::detect().gemm_tier();
    let GemmShape { m, n, k, .. } = *shape;
    if m == 0 || n == 0 {
        return;
    }

    if shape.batch == 1 {
        let a_op = unpack(a, 0, m, k, shape.trans_a);
        let b_op = unpack(b, 0, k, n, shape.trans_b);
        c[..m * n]
            .par_chunks_mut(ROW_BLOCK * n)
            .enumerate()
            .for_each(|(blk, c_rows)| {
                let rows = c_rows.len() / n;
                let a_rows = &a_op[blk * ROW_BLOCK * k..(blk * ROW_BLOCK + rows) * k];
                let mut acc = vec![0.0f32; rows * n];
                tiled_matmul(tier, a_rows, &b_op, &mut acc, rows, n, k);
                store(c_rows, &acc);
            });
        return;
    }

    let shared_a = (shape.stride_a == 0).then(|| unpack(a, 0, m, k, shape.trans_a));
    let shared_b = (shape.stride_b == 0).then(|| unpack(b, 0, k, n, shape.trans_b));
    c.par_chunks_mut(shape.stride_c)
        .take(shape.batch)
        .enumerate()
        .for_each(|(i, c_item)| {
            let a_own;
            let a_op = match &shared_a {
                Some(a) => a,
                None => {
                    a_own = unpack(a, i * shape.stride_a, m, k, shape.trans_a);
                    &a_own
                }
            };
            let b_own;
            let b_op = match &shared_b {
                Some(b) => b,
                None => {
                    b_own = unpack(b, i * shape.stride_b, k, n, shape.trans_b);
                    &b_own
                }
            };
            let mut acc = vec![0.0f32; m * n];
            tiled_matmul(tier, a_op, b_op, &mut acc, m, n, k);
            store(&mut c_item[..m * n], &acc);
        });
}

/// Row-major `rows × cols` copy of `op(X)`, where `X` starts at `offset`
/// and is stored `cols × rows` when `trans` is set.
fn unpack<T: Element>(src: &[T], offset: usize, rows: usize, cols: usize, trans: bool) -> Vec<f32> {
    let src = &src[offset..offset + rows * cols];
    if !trans {
        return src.iter().map(|v| v.to_f32()).collect();
    }
    let mut out = vec![0.0f32; rows * cols];
    for (c, src_row) in src.chunks_exact(rows).enumerate() {
        for (r, v) in src_row.iter().enumerate() {
            out[r * cols + c] = v.to_f32();
        }
    }
    out
}

fn store<T: Element>(dst: &mut [T], acc: &[f32]) {
    for (d, v) in dst.iter_mut().zip(acc) {
        *d = T::from_f32(*v);
    }
}

fn tiled_matmul(tier: GemmTier, a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize) {
    match tier {
        #[cfg(target_arch = "x86_64")]
        GemmTier::Avx2Fma => {
            // Safety: the tier is only selected when AVX2 and FMA were detected.
            unsafe { tiled_matmul_avx2(a, b, c, m, n, k) }
        }
        _ => tiled_matmul_scalar(a, b, c, m, n, k),
    }
}

/// Scalar tiled matmul, accumulating into `c`.
fn tiled_matmul_scalar(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize) {
    for i0 in (0..m).step_by(TILE_M) {
        let i_end = (i0 + TILE_M).min(m);
        for p0 in (0..k).step_by(TILE_K) {
            let p_end = (p0 + TILE_K).min(k);
            for j0 in (0..n).step_by(TILE_N) {
                let j_end = (j0 + TILE_N).min(n);
                for i in i0..i_end {
                    let c_row = &mut c[i * n + j0..i * n + j_end];
                    for p in p0..p_end {
                        let a_val = a[i * k + p];
                        let b_row = &b[p * n + j0..p * n + j_end];
                        for (cv, bv) in c_row.iter_mut().zip(b_row) {
                            *cv += a_val * bv;
                        }
                    }
                }
            }
        }
    }
}

/// AVX2 tiled matmul: 8 lanes per step in the inner loop.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn tiled_matmul_avx2(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize) {
    use std::arch::x86_64::*;

    for i0 in (0..m).step_by(TILE_M) {
        let i_end = (i0 + TILE_M).min(m);
        for p0 in (0..k).step_by(TILE_K) {
            let p_end = (p0 + TILE_K).min(k);
            for j0 in (0..n).step_by(TILE_N) {
                let j_end = (j0 + TILE_N).min(n);
                for i in i0..i_end {
                    for p in p0..p_end {
                        let a_scalar = a[i * k + p];
                        let a_val = _mm256_set1_ps(a_scalar);
                        let mut j = j0;
                        while j + 8 <= j_end {
                            let c_ptr = c.as_mut_ptr().add(i * n + j);
                            let b_ptr = b.as_ptr().add(p * n + j);
                            let acc = _mm256_fmadd_ps(a_val, _mm256_loadu_ps(b_ptr), _mm256_loadu_ps(c_ptr));
                            _mm256_storeu_ps(c_ptr, acc);
                            j += 8;
                        }
                        while j < j_end {
                            c[i * n + j] += a_scalar * b[p * n + j];
                            j += 1;
                        }
                    }
                }
            }
        }
    }
}
