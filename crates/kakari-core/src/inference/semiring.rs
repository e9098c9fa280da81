//! Scalar semirings the span chart is filled over.

/// A commutative semiring over log-space scores.
///
/// `times` is ordinary addition for every semiring used here, so only the
/// additive operation varies.
pub trait Semiring {
    /// Additive identity (an impossible derivation).
    const ZERO: f64 = f64::NEG_INFINITY;

    /// Multiplicative identity (an empty derivation).
    const ONE: f64 = 0.0;

    /// Combine two alternative derivations.
    fn plus(a: f64, b: f64) -> f64;
}

/// Viterbi semiring: best derivation wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxSemiring;

impl Semiring for MaxSemiring {
    #[inline]
    fn plus(a: f64, b: f64) -> f64 {
        if b > a { b } else { a }
    }
}

/// Log semiring: derivations are summed in probability space.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSemiring;

impl Semiring for LogSemiring {
    #[inline]
    fn plus(a: f64, b: f64) -> f64 {
        log_add(a, b)
    }
}

/// `ln(exp(a) + exp(b))` without overflow; `-inf` is the identity.
#[inline]
pub fn log_add(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

/// Log-sum-exp of a slice, shifted by its maximum. Empty or all `-inf` gives `-inf`.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}
