//! Datasets: the observed data and generated Asimov pseudo-data.

use serde::{Deserialize, Serialize};

/// How nuisance parameters were profiled when an Asimov dataset was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conditioning {
    /// NPs profiled on observed data with the POI fixed at the profiling value.
    Conditional,
    /// NPs taken from the global best fit to observed data.
    Unconditional,
    /// NPs left at their snapshot values (no fit, observed data never read).
    Nominal,
}

/// Origin of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DatasetKind {
    /// Real data supplied by the caller.
    Observed,
    /// Deterministic expectation at POI value `mu`.
    Asimov {
        /// POI value used to generate the pseudo-observations.
        mu: f64,
        /// Profiling mode for the nuisance parameters.
        conditioning: Conditioning,
        /// POI value at which the nuisance parameters were profiled.
        profile_mu: f64,
    },
}

/// Main-measurement observations plus (for Asimov data) global-observable values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Dataset name.
    pub name: String,
    /// Origin.
    pub kind: DatasetKind,
    /// Main observations (bin counts, measured values).
    pub main: Vec<f64>,
    /// Global-observable values to use with this dataset. `None` keeps the model's.
    #[serde(default)]
    pub global_observables: Option<Vec<f64>>,
}

impl Dataset {
    /// Observed dataset.
    pub fn observed(name: impl Into<String>, main: Vec<f64>) -> Self {
        Self { name: name.into(), kind: DatasetKind::Observed, main, global_observables: None }
    }

    /// `true` for the real (non-Asimov) data.
    pub fn is_observed(&self) -> bool {
        matches!(self.kind, DatasetKind::Observed)
    }

    /// Generating POI value for Asimov data.
    pub fn asimov_mu(&self) -> Option<f64> {
        match self.kind {
            DatasetKind::Asimov { mu, .. } => Some(mu),
            DatasetKind::Observed => None,
        }
    }
}
