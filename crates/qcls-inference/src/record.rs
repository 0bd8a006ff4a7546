//! Persisted limit record.

use crate::bands::LimitEstimate;
use crate::limits::{LimitResult, RunPhase};
use crate::scanner::LimitStatus;
use qcls_core::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Flat results record: one limit per key plus per-limit bookkeeping.
///
/// Keys of the maps are `obs`, `exp_m2`, `exp_m1`, `exp_0`, `exp_p1`, `exp_p2`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitRecord {
    /// Container name.
    pub folder: String,
    /// Record name.
    pub name: String,
    /// Scanned POI.
    pub poi: String,
    /// Exclusion confidence level.
    pub target_cl: f64,
    /// Observed limit.
    pub obs_limit: Option<f64>,
    /// Expected limit, -2σ.
    pub exp_limit_m2: Option<f64>,
    /// Expected limit, -1σ.
    pub exp_limit_m1: Option<f64>,
    /// Median expected limit.
    pub exp_limit_0: Option<f64>,
    /// Expected limit, +1σ.
    pub exp_limit_p1: Option<f64>,
    /// Expected limit, +2σ.
    pub exp_limit_p2: Option<f64>,
    /// `μ̂` on observed data.
    pub mu_hat: Option<f64>,
    /// Error on `μ̂`.
    pub mu_hat_error: Option<f64>,
    /// CLs evaluations per limit.
    pub iterations: BTreeMap<String, usize>,
    /// Non-converged fits per limit.
    pub failed_fits: BTreeMap<String, usize>,
    /// Termination state per limit.
    pub status: BTreeMap<String, LimitStatus>,
    /// `false` for limits that should not be quoted.
    pub reliable: BTreeMap<String, bool>,
    /// Non-converged fits over the whole run.
    pub total_failed_fits: usize,
    /// Final run state.
    pub state: RunPhase,
    /// Observed data was not read.
    pub blind: bool,
}

fn band_key(n_sigma: i32) -> String {
    match n_sigma {
        0 => "exp_0".to_string(),
        n if n < 0 => format!("exp_m{}", -n),
        n => format!("exp_p{}", n),
    }
}

fn finite(x: f64) -> Option<f64> {
    x.is_finite().then_some(x)
}

impl LimitRecord {
    /// Flatten a [`LimitResult`].
    pub fn from_result(result: &LimitResult, folder: &str, name: &str) -> Self {
        let mut record = Self {
            folder: folder.to_string(),
            name: name.to_string(),
            poi: result.poi.clone(),
            target_cl: result.target_cl,
            obs_limit: None,
            exp_limit_m2: None,
            exp_limit_m1: None,
            exp_limit_0: None,
            exp_limit_p1: None,
            exp_limit_p2: None,
            mu_hat: result.mu_hat.map(|f| f.value),
            mu_hat_error: result.mu_hat.map(|f| f.error),
            iterations: BTreeMap::new(),
            failed_fits: BTreeMap::new(),
            status: BTreeMap::new(),
            reliable: BTreeMap::new(),
            total_failed_fits: result.failed_fits,
            state: result.phase,
            blind: result.blind,
        };

        if let Some(obs) = &result.observed {
            record.obs_limit = finite(obs.mu);
            record.note("obs", obs);
        }
        for band in &result.expected {
            let value = finite(band.estimate.mu);
            match band.n_sigma {
                -2 => record.exp_limit_m2 = value,
                -1 => record.exp_limit_m1 = value,
                0 => record.exp_limit_0 = value,
                1 => record.exp_limit_p1 = value,
                2 => record.exp_limit_p2 = value,
                _ => {}
            }
            record.note(&band_key(band.n_sigma), &band.estimate);
        }
        record
    }

    fn note(&mut self, key: &str, estimate: &LimitEstimate) {
        self.iterations.insert(key.to_string(), estimate.iterations);
        self.failed_fits.insert(key.to_string(), estimate.failed_fits);
        self.status.insert(key.to_string(), estimate.status);
        self.reliable.insert(key.to_string(), estimate.status.is_reliable() && estimate.mu.is_finite());
    }

    /// Write as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let s = serde_json::to_string_pretty(self)?;
        std::fs::write(path, s)?;
        Ok(())
    }
}
