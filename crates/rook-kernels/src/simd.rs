//! Runtime SIMD capability detection for the host GEMM.

use std::sync::OnceLock;

/// SIMD capabilities detected at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimdCapability {
    pub avx2: bool,
    pub fma: bool,
    pub neon: bool,
}

/// Inner-loop implementation the host GEMM dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GemmTier {
    Scalar,
    Avx2Fma,
}

static DETECTED: OnceLock<SimdCapability> = OnceLock::new();

impl SimdCapability {
    /// Detect SIMD capabilities for the current CPU.
    pub fn detect() -> &'static SimdCapability {
        DETECTED.get_or_init(|| {
            #[cfg(target_arch = "x86_64")]
            {
                SimdCapability {
                    avx2: is_x86_feature_detected!("avx2"),
                    fma: is_x86_feature_detected!("fma"),
                    neon: false,
                }
            }

            #[cfg(target_arch = "aarch64")]
            {
                SimdCapability {
                    avx2: false,
                    fma: false,
                    neon: true,
                }
            }

            #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
            {
                SimdCapability {
                    avx2: false,
                    fma: false,
                    neon: false,
                }
            }
        })
    }

    pub fn gemm_tier(&self) -> GemmTier {
        if self.avx2 && self.fma {
            GemmTier::Avx2Fma
        } else {
            GemmTier::Scalar
        }
    }

    /// Best available SIMD tier as a human-readable string.
    pub fn best_tier(&self) -> &'static str {
        if self.avx2 {
            "AVX2"
        } else if self.neon {
            "NEON"
        } else {
            "scalar"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_is_stable() {
        let cap = SimdCapability::detect();
        assert_eq!(cap, SimdCapability::detect());
    }

    #[test]
    fn test_gemm_tier() {
        let scalar = SimdCapability { avx2: false, fma: false, neon: true };
        assert_eq!(scalar.gemm_tier(), GemmTier::Scalar);
        assert_eq!(scalar.best_tier(), "NEON");

        let avx2_no_fma = SimdCapability { avx2: true, fma: false, neon: false };
        assert_eq!(avx2_no_fma.gemm_tier(), GemmTier::Scalar);

        let avx2 = SimdCapability { avx2: true, fma: true, neon: false };
        assert_eq!(avx2.gemm_tier(), GemmTier::Avx2Fma);
    }
}
