//! Common data types for quickcls

use serde::{Deserialize, Serialize};

/// Outcome of a (possibly retried) minimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    /// The minimizer reported convergence.
    Converged,
    /// Every attempt ended in a backend error; no usable minimum.
    Failed,
    /// The retry ladder ran out without convergence; best-found point kept.
    RetryLimitReached,
}

/// Quality of the covariance estimate attached to a fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovarianceQuality {
    /// Errors were not requested.
    NotComputed,
    /// Hessian inverted, all variances positive.
    Accurate,
    /// Inversion failed; diagonal approximation used.
    Approximate,
    /// No usable error estimate.
    Unavailable,
}

/// Fit result containing parameter estimates and uncertainties
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    /// Convergence status
    pub status: FitStatus,

    /// Negative log-likelihood at minimum (without any internal offset)
    pub nll: f64,

    /// Best-fit values of all parameters (model order, constants included)
    pub parameters: Vec<f64>,

    /// Parameter uncertainties (0 for constant parameters or when not computed)
    pub uncertainties: Vec<f64>,

    /// Covariance quality flag
    pub covariance_quality: CovarianceQuality,

    /// Minimizer invocations consumed (1 + retries)
    pub n_attempts: usize,

    /// Objective evaluations summed over attempts
    pub n_evaluations: usize,
}

impl FitResult {
    /// `true` if the minimizer converged.
    pub fn converged(&self) -> bool {
        self.status == FitStatus::Converged
    }

    /// Retries beyond the first attempt.
    pub fn n_retries(&self) -> usize {
        self.n_attempts.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_result() {
        let result = FitResult {
            status: FitStatus::RetryLimitReached,
            nll: 12.5,
            parameters: vec![1.0, 2.0],
            uncertainties: vec![0.0, 0.0],
            covariance_quality: CovarianceQuality::NotComputed,
            n_attempts: 4,
            n_evaluations: 100,
        };
        assert!(!result.converged());
        assert_eq!(result.n_retries(), 3);
    }
}
