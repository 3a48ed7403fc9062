//! Sampling and confidence bounds for the statistical check.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Pick up to `size` ids with a seeded RNG. The result is sorted.
pub fn sample_ids(ids: &[i64], size: usize, seed: u64) -> Vec<i64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut picked: Vec<i64> = ids.choose_multiple(&mut rng, size).copied().collect();
    picked.sort_unstable();
    picked
}

/// Two-sided z value for a confidence level in (0, 1).
pub fn z_for_confidence(confidence: f64) -> f64 {
    let c = confidence.clamp(0.5, 0.999_999);
    inverse_normal_cdf(1.0 - (1.0 - c) / 2.0)
}

/// Upper end of the Wilson score interval for `failures` out of `n`.
pub fn wilson_upper(failures: usize, n: usize, z: f64) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let n = n as f64;
    let p = failures as f64 / n;
    let z2 = z * z;
    let centre = p + z2 / (2.0 * n);
    let margin = z * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt();
    ((centre + margin) / (1.0 + z2 / n)).min(1.0)
}

/// Mismatch-rate upper bound for a sample of `n` drawn from `population`.
///
/// A sample that covers the whole population is a census: the observed rate
/// is exact.
pub fn mismatch_upper_bound(failures: usize, n: usize, population: usize, confidence: f64) -> f64 {
    if n == 0 {
        return 0.0;
    }
    if n >= population {
        return failures as f64 / n as f64;
    }
    wilson_upper(failures, n, z_for_confidence(confidence))
}

/// Acklam's rational approximation of the standard normal quantile
/// (relative error below 1.15e-9).
fn inverse_normal_cdf(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_69e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const P_LOW: f64 = 0.02425;

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_z_values() {
        assert!((z_for_confidence(0.95) - 1.959_964).abs() < 1e-5);
        assert!((z_for_confidence(0.90) - 1.644_854).abs() < 1e-5);
        assert!((z_for_confidence(0.99) - 2.575_829).abs() < 1e-5);
    }

    #[test]
    fn test_wilson_upper() {
        // Zero failures in 400 at 95%: upper bound is about 0.95%.
        let upper = wilson_upper(0, 400, z_for_confidence(0.95));
        assert!(upper > 0.009 && upper < 0.0096, "{upper}");

        let upper = wilson_upper(10, 100, z_for_confidence(0.95));
        assert!(upper > 0.17 && upper < 0.18, "{upper}");

        assert_eq!(wilson_upper(0, 0, 1.96), 0.0);
    }

    #[test]
    fn test_census_is_exact() {
        assert_eq!(mismatch_upper_bound(0, 50, 50, 0.95), 0.0);
        assert_eq!(mismatch_upper_bound(1, 50, 50, 0.95), 0.02);
        assert!(mismatch_upper_bound(0, 50, 5000, 0.95) > 0.0);
    }

    #[test]
    fn test_sample_is_seeded() {
        let ids: Vec<i64> = (1..=1000).collect();
        let a = sample_ids(&ids, 25, 7);
        let b = sample_ids(&ids, 25, 7);
        assert_eq!(a, b);
        assert_eq!(a.len(), 25);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
        assert_ne!(a, sample_ids(&ids, 25, 8));

        assert_eq!(sample_ids(&ids[..3], 25, 7), vec![1, 2, 3]);
    }
}
