//! Limit-run configuration.

use crate::minimizer::MinimizerConfig;
use qcls_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Options of one asymptotic limit run.
///
/// Blinding wins over the observed-limit and conditional-expected switches:
/// see [`LimitConfig::observed_enabled`] and [`LimitConfig::conditional_expected`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    /// Confidence level of the exclusion (CLs target is `1 - target_cl`).
    pub target_cl: f64,
    /// Relative precision on the limit.
    pub precision: f64,
    /// Rebuild Asimov data per band instead of using the closed form.
    pub better_bands: bool,
    /// Also refine the negative bands, profiling at the band POI value.
    pub better_negative_bands: bool,
    /// Also refine the negative bands, profiling at zero.
    pub profile_neg_at_zero: bool,
    /// Use `q̃_mu` (POI bounded at zero).
    pub do_tilde: bool,
    /// Never read the observed data.
    pub do_blind: bool,
    /// Compute the expected limit and bands.
    pub do_exp: bool,
    /// Compute the observed limit (ignored when blind).
    pub do_obs: bool,
    /// Profile Asimov nuisance parameters on observed data (ignored when blind).
    pub cond_expected: bool,
    /// Start conditional fits from an extrapolation of previous scan points.
    pub use_predictive_fit: bool,
    /// Evaluation cap per limit search.
    pub max_iterations: usize,
    /// Non-converged fits tolerated per run before aborting.
    pub max_failed_fits: usize,
    /// Run observed and band scans on the rayon pool.
    pub parallel: bool,
    /// Output container name.
    pub folder_name: String,
    /// Output record name.
    pub record_name: String,
    /// Minimizer settings.
    pub minimizer: MinimizerConfig,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            target_cl: 0.95,
            precision: 0.005,
            better_bands: true,
            better_negative_bands: false,
            profile_neg_at_zero: false,
            do_tilde: true,
            do_blind: true,
            do_exp: true,
            do_obs: true,
            cond_expected: true,
            use_predictive_fit: false,
            max_iterations: 100,
            max_failed_fits: 50,
            parallel: true,
            folder_name: "limits".to_string(),
            record_name: "results".to_string(),
            minimizer: MinimizerConfig::default(),
        }
    }
}

impl LimitConfig {
    /// CLs value the scan solves for.
    pub fn alpha(&self) -> f64 {
        1.0 - self.target_cl
    }

    /// Observed limit requested and allowed.
    pub fn observed_enabled(&self) -> bool {
        self.do_obs && !self.do_blind
    }

    /// Asimov data profiled on observed data.
    pub fn conditional_expected(&self) -> bool {
        self.cond_expected && !self.do_blind
    }

    /// Negative bands get their own Asimov data.
    pub fn refine_negative_bands(&self) -> bool {
        self.better_bands && (self.better_negative_bands || self.profile_neg_at_zero)
    }

    /// Reject contradictory or out-of-range options.
    pub fn validate(&self) -> Result<()> {
        if !(self.target_cl > 0.0 && self.target_cl < 1.0) {
            return Err(Error::Configuration(format!(
                "target CL must be in (0, 1), got {}",
                self.target_cl
            )));
        }
        if !(self.precision > 0.0 && self.precision < 1.0) {
            return Err(Error::Configuration(format!(
                "precision must be in (0, 1), got {}",
                self.precision
            )));
        }
        if self.max_iterations < 2 {
            return Err(Error::Configuration(format!(
                "max iterations must be >= 2, got {}",
                self.max_iterations
            )));
        }
        if self.better_negative_bands && self.profile_neg_at_zero {
            return Err(Error::Configuration(
                "better negative bands and profiling negative bands at zero are mutually exclusive"
                    .to_string(),
            ));
        }
        if (self.better_negative_bands || self.profile_neg_at_zero) && !self.better_bands {
            log::warn!("negative-band refinement requested without better bands; ignoring it");
        }
        if !self.do_exp && !self.observed_enabled() {
            return Err(Error::Configuration(
                "nothing to compute: expected limits disabled and observed limit disabled or blinded"
                    .to_string(),
            ));
        }
        if self.folder_name.is_empty() || self.record_name.is_empty() {
            return Err(Error::Configuration("output names must not be empty".to_string()));
        }
        self.minimizer.validate()
    }
}
