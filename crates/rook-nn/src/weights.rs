//! Host-side weight views handed to `load_weights`.
//!
//! All tensors arrive as `f32`; conversion to the layer's element type
//! happens on the device during load.

use rook_core::{Result, RookError};

/// Unfolded batch-norm parameters. `stddivs` already hold `1 / sqrt(var + eps)`.
#[derive(Debug, Clone, Copy)]
pub struct BatchNorm<'a> {
    pub means: &'a [f32],
    pub stddivs: &'a [f32],
}

/// Convolution filter (`[c_out][c_in][f][f]`) with optional bias and
/// batch-norm.
#[derive(Debug, Clone, Copy)]
pub struct ConvWeights<'a> {
    pub filter: &'a [f32],
    pub bias: Option<&'a [f32]>,
    pub bn: Option<BatchNorm<'a>>,
    /// Declared filter shape; must equal `[c_out, c_in, f, f]` when present.
    pub dims: Option<&'a [usize]>,
}

impl<'a> ConvWeights<'a> {
    pub fn check(&self, what: &str, c_out: usize, c_in: usize, filter_size: usize) -> Result<()> {
        let expected = [c_out, c_in, filter_size, filter_size];
        check_dims(&format!("{} filter", what), &expected, self.dims, self.filter.len())?;
        if let Some(bias) = self.bias {
            check_len(&format!("{} bias", what), c_out, bias.len())?;
        }
        if let Some(bn) = self.bn {
            check_len(&format!("{} bn_means", what), c_out, bn.means.len())?;
            check_len(&format!("{} bn_stddivs", what), c_out, bn.stddivs.len())?;
        }
        Ok(())
    }

    /// Filter and bias with batch-norm folded in:
    /// `w' = w * stddiv[k]`, `b' = (b - mean[k]) * stddiv[k]`.
    /// The bias is all zeros when neither bias nor batch-norm is present.
    pub fn folded(&self, c_out: usize) -> (Vec<f32>, Vec<f32>) {
        let mut filter = self.filter.to_vec();
        let mut bias = self.bias.map_or_else(|| vec![0.0; c_out], <[f32]>::to_vec);
        if let Some(bn) = self.bn {
            let per_out = filter.len() / c_out.max(1);
            for (k, chunk) in filter.chunks_exact_mut(per_out).enumerate() {
                chunk.iter_mut().for_each(|w| *w *= bn.stddivs[k]);
                bias[k] = (bias[k] - bn.means[k]) * bn.stddivs[k];
            }
        }
        (filter, bias)
    }

    /// Batch-norm kernel parameters with the bias absorbed into the means:
    /// `(x + b - mean) * s == (x - (mean - b)) * s`.
    pub fn bn_kernel_params(&self, c_out: usize) -> Option<(Vec<f32>, Vec<f32>)> {
        self.bn.map(|bn| {
            let means = (0..c_out)
                .map(|k| bn.means[k] - self.bias.map_or(0.0, |b| b[k]))
                .collect();
            (means, bn.stddivs.to_vec())
        })
    }
}

/// Fully-connected weights, `[out][in]` row-major.
#[derive(Debug, Clone, Copy)]
pub struct FcWeights<'a> {
    pub weights: &'a [f32],
    pub bias: Option<&'a [f32]>,
    /// Declared weight shape; must equal `[out, in]` when present.
    pub dims: Option<&'a [usize]>,
}

impl FcWeights<'_> {
    pub fn check(&self, what: &str, outputs: usize, inputs: usize) -> Result<()> {
        check_dims(&format!("{} weights", what), &[outputs, inputs], self.dims, self.weights.len())?;
        if let Some(bias) = self.bias {
            check_len(&format!("{} bias", what), outputs, bias.len())?;
        }
        Ok(())
    }
}

/// Squeeze-and-excitation weights: `w1 [k][c]`, `b1 [k]`, `w2 [2c][k]`, `b2 [2c]`.
#[derive(Debug, Clone, Copy)]
pub struct SeParams<'a> {
    pub w1: &'a [f32],
    pub b1: &'a [f32],
    pub w2: &'a [f32],
    pub b2: &'a [f32],
}

impl SeParams<'_> {
    /// Bottleneck width implied by `b1`.
    pub fn k(&self) -> usize {
        self.b1.len()
    }

    pub fn check(&self, what: &str, c: usize, k: usize) -> Result<()> {
        check_len(&format!("{} se.w1", what), k * c, self.w1.len())?;
        check_len(&format!("{} se.b1", what), k, self.b1.len())?;
        check_len(&format!("{} se.w2", what), 2 * c * k, self.w2.len())?;
        check_len(&format!("{} se.b2", what), 2 * c, self.b2.len())
    }
}

/// Weights for one layer, matched against the layer kind at load.
#[derive(Debug, Clone, Copy)]
pub enum LayerWeights<'a> {
    Conv(ConvWeights<'a>),
    Fc(FcWeights<'a>),
    /// The policy map carries its own generated table.
    PolicyMap,
    Se {
        se: SeParams<'a>,
        prev_bias: Option<&'a [f32]>,
    },
    FusedWinograd {
        conv: ConvWeights<'a>,
        se: Option<SeParams<'a>>,
    },
    Residual {
        conv1: ConvWeights<'a>,
        conv2: ConvWeights<'a>,
        se: Option<SeParams<'a>>,
    },
}

impl LayerWeights<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            LayerWeights::Conv(_) => "conv",
            LayerWeights::Fc(_) => "fc",
            LayerWeights::PolicyMap => "policy_map",
            LayerWeights::Se { .. } => "se",
            LayerWeights::FusedWinograd { .. } => "fused_winograd",
            LayerWeights::Residual { .. } => "residual",
        }
    }
}

/// Exact shape check. A declared shape with the right element count but a
/// different arrangement is still a mismatch.
fn check_dims(what: &str, expected: &[usize], declared: Option<&[usize]>, len: usize) -> Result<()> {
    match declared {
        Some(dims) if dims != expected => Err(RookError::shape(what, expected, dims)),
        _ if len != expected.iter().product::<usize>() => Err(RookError::shape(what, expected, &[len])),
        _ => Ok(()),
    }
}

fn check_len(what: &str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(RookError::shape(what, &[expected], &[got]));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_batch_norm() {
        let filter = [1.0f32, 2.0, 3.0, 4.0];
        let bias = [1.0f32, -1.0];
        let means = [0.5f32, 1.0];
        let stddivs = [2.0f32, 0.5];
        let w = ConvWeights {
            filter: &filter,
            bias: Some(&bias),
            bn: Some(BatchNorm { means: &means, stddivs: &stddivs }),
            dims: None,
        };
        let (f, b) = w.folded(2);
        assert_eq!(f, vec![2.0, 4.0, 1.5, 2.0]);
        assert_eq!(b, vec![1.0, -1.0]);

        let (m, s) = w.bn_kernel_params(2).unwrap();
        assert_eq!(m, vec![-0.5, 2.0]);
        assert_eq!(s, vec![2.0, 0.5]);
    }

    #[test]
    fn test_fold_without_bias_or_bn() {
        let filter = [1.0f32; 9];
        let w = ConvWeights { filter: &filter, bias: None, bn: None, dims: None };
        let (f, b) = w.folded(1);
        assert_eq!(f, filter.to_vec());
        assert_eq!(b, vec![0.0]);
        assert!(w.bn_kernel_params(1).is_none());
    }

    #[test]
    fn test_conv_check_reports_shape() {
        let filter = [0.0f32; 8];
        let w = ConvWeights { filter: &filter, bias: None, bn: None, dims: None };
        let err = w.check("input", 1, 1, 3).unwrap_err();
        assert!(matches!(err, RookError::ShapeMismatch { .. }));
        assert!(w.check("input", 8, 1, 1).is_ok());
    }

    #[test]
    fn test_declared_dims_must_match_exactly() {
        let filter = [0.0f32; 2 * 4 * 9];
        let w = ConvWeights { filter: &filter, bias: None, bn: None, dims: Some(&[2, 4, 3, 3]) };
        assert!(w.check("conv", 2, 4, 3).is_ok());
        let swapped = ConvWeights { dims: Some(&[4, 2, 3, 3]), ..w };
        let err = swapped.check("conv", 2, 4, 3).unwrap_err();
        assert!(matches!(err, RookError::ShapeMismatch { .. }));

        let weights = [0.0f32; 6];
        let fc = FcWeights { weights: &weights, bias: None, dims: Some(&[2, 3]) };
        assert!(fc.check("fc", 2, 3).is_ok());
        let transposed = FcWeights { dims: Some(&[3, 2]), ..fc };
        assert!(matches!(transposed.check("fc", 2, 3), Err(RookError::ShapeMismatch { .. })));
        assert!(FcWeights { dims: None, ..fc }.check("fc", 3, 2).is_ok());
    }

    #[test]
    fn test_se_check() {
        let (c, k) = (4, 2);
        let w1 = vec![0.0f32; k * c];
        let b1 = vec![0.0f32; k];
        let w2 = vec![0.0f32; 2 * c * k];
        let b2 = vec![0.0f32; 2 * c];
        let se = SeParams { w1: &w1, b1: &b1, w2: &w2, b2: &b2 };
        assert_eq!(se.k(), 2);
        assert!(se.check("block", c, k).is_ok());
        assert!(se.check("block", c + 1, k).is_err());
    }
}
