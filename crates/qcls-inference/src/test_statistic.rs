//! One-sided profile-likelihood-ratio test statistics for upper limits.
//!
//! `q_mu = 2 (NLL(mu, θ̂_mu) - NLL(μ̂, θ̂))`, floored at 0 and set to 0 when
//! `μ̂ > mu`. The tilde variant bounds `μ̂` at zero: when the free fit lands
//! below zero the reference becomes the conditional fit at `mu = 0`.

use qcls_core::{Error, FitResult, Result};

/// Which statistic to compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatistic {
    /// `q_mu`.
    Qmu,
    /// `q̃_mu` (POI bounded at zero in the reference fit).
    QmuTilde,
}

impl TestStatistic {
    /// Statistic selected by a tilde flag.
    pub fn from_tilde(tilde: bool) -> Self {
        if tilde { Self::QmuTilde } else { Self::Qmu }
    }

    /// `true` for the tilde variant.
    pub fn is_tilde(self) -> bool {
        self == Self::QmuTilde
    }

    /// Evaluate at `mu` from the fit pair.
    ///
    /// `at_zero` is the conditional fit at `mu = 0`; the tilde variant needs it
    /// whenever `μ̂ < 0`.
    pub fn evaluate(
        self,
        mu: f64,
        poi: usize,
        conditional: &FitResult,
        unconditional: &FitResult,
        at_zero: Option<&FitResult>,
    ) -> Result<f64> {
        let mu_hat = *unconditional.parameters.get(poi).ok_or_else(|| {
            Error::Validation(format!("POI index {} out of range for fit result", poi))
        })?;
        match self {
            Self::Qmu => q_mu(mu, mu_hat, conditional.nll, unconditional.nll),
            Self::QmuTilde => {
                let nll_zero = if mu_hat < 0.0 {
                    Some(
                        at_zero
                            .ok_or_else(|| {
                                Error::Computation(
                                    "tilde statistic needs the mu = 0 fit when mu_hat < 0".into(),
                                )
                            })?
                            .nll,
                    )
                } else {
                    None
                };
                q_mu_tilde(mu, mu_hat, conditional.nll, unconditional.nll, nll_zero)
            }
        }
    }
}

fn check_finite(values: &[f64]) -> Result<()> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(Error::Computation(format!("non-finite NLL in test statistic: {:?}", values)))
    }
}

/// `q_mu` from the conditional and unconditional NLL values.
pub fn q_mu(mu: f64, mu_hat: f64, nll_mu: f64, nll_hat: f64) -> Result<f64> {
    check_finite(&[mu_hat, nll_mu, nll_hat])?;
    if mu_hat > mu {
        return Ok(0.0);
    }
    Ok((2.0 * (nll_mu - nll_hat)).max(0.0))
}

/// `q̃_mu`; `nll_zero` is `NLL(0, θ̂_0)` and is only read when `μ̂ < 0`.
pub fn q_mu_tilde(
    mu: f64,
    mu_hat: f64,
    nll_mu: f64,
    nll_hat: f64,
    nll_zero: Option<f64>,
) -> Result<f64> {
    if mu_hat >= 0.0 {
        return q_mu(mu, mu_hat, nll_mu, nll_hat);
    }
    let nll_zero = nll_zero.ok_or_else(|| {
        Error::Computation("tilde statistic needs NLL(0) when mu_hat < 0".into())
    })?;
    q_mu(mu, 0.0, nll_mu, nll_zero)
}

/// Raw `2 ΔNLL` on Asimov data, floored at 0 but not one-sided.
///
/// Used for `q_mu,A` where the sign of `mu` relative to the Asimov `μ̂` must not
/// zero the statistic (negative-band searches).
pub fn asimov_q(nll_mu: f64, nll_hat: f64) -> Result<f64> {
    check_finite(&[nll_mu, nll_hat])?;
    Ok((2.0 * (nll_mu - nll_hat)).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use qcls_core::{CovarianceQuality, FitStatus};

    fn fit(nll: f64, params: Vec<f64>) -> FitResult {
        FitResult {
            status: FitStatus::Converged,
            nll,
            uncertainties: vec![0.0; params.len()],
            parameters: params,
            covariance_quality: CovarianceQuality::NotComputed,
            n_attempts: 1,
            n_evaluations: 1,
        }
    }

    /// Gaussian-constraint toy: `x ~ N(mu, 1)` gives `NLL(mu) = (x - mu)^2 / 2`.
    fn toy_nll(x: f64, mu: f64) -> f64 {
        0.5 * (x - mu) * (x - mu)
    }

    #[test]
    fn test_q_mu_one_sided() {
        assert_eq!(q_mu(1.0, 1.5, 3.0, 2.0).unwrap(), 0.0);
        assert_relative_eq!(q_mu(2.0, 0.5, 3.0, 2.0).unwrap(), 2.0);
        // negative differences from imperfect fits are floored
        assert_eq!(q_mu(2.0, 0.5, 1.9, 2.0).unwrap(), 0.0);
        assert!(q_mu(2.0, 0.5, f64::NAN, 2.0).is_err());
    }

    #[test]
    fn test_tilde_equals_clamped_mu_hat() {
        for x in [-2.5, -1.0, -0.1] {
            let mu_hat = x;
            for mu in [0.5, 1.0, 2.0, 3.5] {
                let tilde = q_mu_tilde(
                    mu,
                    mu_hat,
                    toy_nll(x, mu),
                    toy_nll(x, mu_hat),
                    Some(toy_nll(x, 0.0)),
                )
                .unwrap();
                // non-tilde statistic with mu_hat clamped at 0 and the reference
                // likelihood evaluated there
                let clamped = q_mu(mu, 0.0, toy_nll(x, mu), toy_nll(x, 0.0)).unwrap();
                assert_relative_eq!(tilde, clamped, epsilon = 1e-12);
                // closed form: mu^2 - 2 mu x
                assert_relative_eq!(tilde, mu * mu - 2.0 * mu * x, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_tilde_matches_plain_for_positive_mu_hat() {
        let x = 0.8;
        let a = q_mu_tilde(2.0, x, toy_nll(x, 2.0), toy_nll(x, x), None).unwrap();
        let b = q_mu(2.0, x, toy_nll(x, 2.0), toy_nll(x, x)).unwrap();
        assert_eq!(a, b);
        assert!(q_mu_tilde(2.0, -x, 1.0, 0.0, None).is_err());
    }

    #[test]
    fn test_evaluate_from_fits() {
        let x = -1.0;
        let cond = fit(toy_nll(x, 2.0), vec![2.0]);
        let uncond = fit(toy_nll(x, x), vec![x]);
        let zero = fit(toy_nll(x, 0.0), vec![0.0]);

        let q = TestStatistic::Qmu.evaluate(2.0, 0, &cond, &uncond, None).unwrap();
        assert_relative_eq!(q, 9.0, epsilon = 1e-12);

        let qt = TestStatistic::QmuTilde.evaluate(2.0, 0, &cond, &uncond, Some(&zero)).unwrap();
        assert_relative_eq!(qt, 8.0, epsilon = 1e-12);
        assert!(TestStatistic::QmuTilde.evaluate(2.0, 0, &cond, &uncond, None).is_err());
        assert!(TestStatistic::Qmu.evaluate(2.0, 3, &cond, &uncond, None).is_err());
    }

    #[test]
    fn test_asimov_q_two_sided() {
        assert_relative_eq!(asimov_q(toy_nll(0.0, -1.5), toy_nll(0.0, 0.0)).unwrap(), 2.25);
    }
}
