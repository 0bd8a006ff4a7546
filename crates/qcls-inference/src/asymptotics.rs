//! Asymptotic formulae for the one-sided profile-likelihood test statistic.
//!
//! Closed forms from Cowan, Cranmer, Gross, Vitells (arXiv:1007.1727). Every
//! function here is plain arithmetic over already-fitted quantities.

use qcls_core::{Error, Result};
use statrs::function::erf::{erfc, erfc_inv};
use std::f64::consts::SQRT_2;

/// Expected-band order used for results: `-2σ, -1σ, median, +1σ, +2σ`.
pub const NSIGMA_ORDER: [i32; 5] = [-2, -1, 0, 1, 2];

const CLB_MIN: f64 = 1e-300;

/// Standard normal CDF `Φ(x)`.
#[inline]
pub fn normal_cdf(x: f64) -> f64 {
    // erfc keeps the tails accurate: Φ(x) = 0.5 * erfc(-x / sqrt(2))
    0.5 * erfc(-x / SQRT_2)
}

/// Standard normal survival function `1 - Φ(x)`.
#[inline]
pub fn normal_sf(x: f64) -> f64 {
    0.5 * erfc(x / SQRT_2)
}

/// Standard normal quantile `Φ⁻¹(p)`; `±∞` at `p = 1` / `p = 0`.
pub fn normal_quantile(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    -SQRT_2 * erfc_inv(2.0 * p)
}

/// One-sided p-value to significance `Z = Φ⁻¹(1 - p)`.
pub fn p_value_to_significance(p: f64) -> f64 {
    -normal_quantile(p)
}

/// Significance to one-sided p-value `p = 1 - Φ(Z)`.
pub fn significance_to_p_value(z: f64) -> f64 {
    normal_sf(z)
}

/// `CLs+b / CLb`, robust to underflow of both terms in the far tails.
#[inline]
pub fn safe_cls(clsb: f64, clb: f64) -> f64 {
    if !(clsb.is_finite() && clb.is_finite()) {
        return 0.0;
    }
    if clb <= CLB_MIN {
        return if clsb <= CLB_MIN { 0.0 } else { 1.0 };
    }
    (clsb / clb).clamp(0.0, 1.0)
}

/// p-values of one tested hypothesis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AsymptoticPValues {
    /// Test statistic on the data.
    pub q: f64,
    /// Test statistic on the background-only Asimov data.
    pub q_a: f64,
    /// `p_{s+b}`.
    pub clsb: f64,
    /// `1 - p_b`.
    pub clb: f64,
    /// `CLs = CLs+b / CLb`.
    pub cls: f64,
    /// Significance of the signal+background p-value.
    pub significance: f64,
}

/// CLs from `q_mu`, `q_mu,A` and the tilde flag.
///
/// For the plain statistic, or the tilde statistic with `q <= q_A`:
/// `p_sb = 1 - Φ(√q)`, `1 - p_b = Φ(√q_A - √q)`.
/// For the tilde statistic with `q > q_A`:
/// `p_sb = 1 - Φ((q + q_A) / 2√q_A)`, `1 - p_b = 1 - Φ((q - q_A) / 2√q_A)`.
pub fn cls(q: f64, q_a: f64, tilde: bool) -> Result<AsymptoticPValues> {
    if q.is_nan() || q_a.is_nan() {
        return Err(Error::Computation(format!("NaN test statistic (q={}, q_A={})", q, q_a)));
    }
    let q = q.max(0.0);
    let q_a = q_a.max(0.0);
    let sqrt_q = q.sqrt();
    let sqrt_qa = q_a.sqrt();

    let (clsb, clb) = if !tilde || q <= q_a || sqrt_qa <= 0.0 {
        (normal_sf(sqrt_q), normal_cdf(sqrt_qa - sqrt_q))
    } else {
        let two_sqrt_qa = 2.0 * sqrt_qa;
        (normal_sf((q + q_a) / two_sqrt_qa), normal_sf((q - q_a) / two_sqrt_qa))
    };

    Ok(AsymptoticPValues {
        q,
        q_a,
        clsb,
        clb,
        cls: safe_cls(clsb, clb),
        significance: p_value_to_significance(clsb),
    })
}

/// Expected CLs when the data fluctuate by `n_sigma` around the background-only
/// expectation (positive `n_sigma` = upward, weaker limit).
pub fn expected_cls(sqrt_q_a: f64, n_sigma: f64) -> f64 {
    safe_cls(normal_cdf(n_sigma - sqrt_q_a), normal_cdf(n_sigma))
}

/// Median expected CLs, `2 (1 - Φ(√q_A))`.
pub fn median_cls(q_a: f64) -> f64 {
    expected_cls(q_a.max(0.0).sqrt(), 0.0)
}

/// Closed-form expected limit at `n_sigma` from the median limit.
///
/// `σ = median / Φ⁻¹(1 - α/2)`, `μ_N = σ (Φ⁻¹(1 - α Φ(N)) + N)`.
pub fn closed_form_band(median: f64, n_sigma: f64, alpha: f64) -> f64 {
    let sigma = median / normal_quantile(1.0 - 0.5 * alpha);
    sigma * (normal_quantile(1.0 - alpha * normal_cdf(n_sigma)) + n_sigma)
}

/// Asimov width of the POI estimator at `mu`, `σ = |μ| / √q_A`.
pub fn asimov_sigma(mu: f64, q_a: f64) -> Option<f64> {
    (q_a > 0.0 && q_a.is_finite()).then(|| mu.abs() / q_a.sqrt())
}
