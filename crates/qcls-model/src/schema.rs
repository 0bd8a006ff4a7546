//! JSON workspace schema for binned counting models

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Counting-experiment workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    /// Channels (regions)
    pub channels: Vec<Channel>,
    /// Default observed data, one entry per channel
    pub observations: Vec<Observation>,
    /// Additional named datasets
    #[serde(default)]
    pub datasets: Vec<NamedDataset>,
    /// Measurement (POI and parameter overrides)
    pub measurement: Measurement,
    /// Named parameter snapshots
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
    /// Schema version
    #[serde(default)]
    pub version: Option<String>,
}

/// Channel (region)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    /// Channel name
    pub name: String,
    /// Samples in this channel
    pub samples: Vec<Sample>,
}

/// Sample (process)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    /// Sample name
    pub name: String,
    /// Expected event counts per bin
    pub data: Vec<f64>,
    /// Modifiers (systematics)
    #[serde(default)]
    pub modifiers: Vec<Modifier>,
}

/// Modifier (systematic uncertainty)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Modifier {
    /// normfactor: free-floating normalization (e.g., POI)
    #[serde(rename = "normfactor")]
    NormFactor {
        /// Modifier name.
        name: String,
    },

    /// normsys: exponentially interpolated normalization uncertainty
    #[serde(rename = "normsys")]
    NormSys {
        /// Modifier name.
        name: String,
        /// Scale factors at +-1 sigma.
        data: NormSysData,
    },

    /// histosys: linearly interpolated shape uncertainty
    #[serde(rename = "histosys")]
    HistoSys {
        /// Modifier name.
        name: String,
        /// Up/down templates.
        data: HistoSysData,
    },
}

impl Modifier {
    /// Modifier (and parameter) name.
    pub fn name(&self) -> &str {
        match self {
            Modifier::NormFactor { name }
            | Modifier::NormSys { name, .. }
            | Modifier::HistoSys { name, .. } => name,
        }
    }
}

/// normsys scale factors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormSysData {
    /// Factor at +1 sigma
    pub hi: f64,
    /// Factor at -1 sigma
    pub lo: f64,
}

/// histosys templates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoSysData {
    /// Template at +1 sigma
    pub hi_data: Vec<f64>,
    /// Template at -1 sigma
    pub lo_data: Vec<f64>,
}

/// Observed counts for one channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// Channel name
    pub name: String,
    /// Counts per bin
    pub data: Vec<f64>,
}

/// Extra dataset selectable by name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedDataset {
    /// Dataset name
    pub name: String,
    /// Per-channel observations
    pub observations: Vec<Observation>,
}

/// Measurement definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Measurement {
    /// Measurement name
    pub name: String,
    /// POI name (must match a normfactor)
    pub poi: String,
    /// Per-parameter overrides
    #[serde(default)]
    pub parameters: Vec<ParameterConfig>,
}

/// Parameter override
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterConfig {
    /// Parameter name
    pub name: String,
    /// Initial value
    #[serde(default)]
    pub init: Option<f64>,
    /// Bounds `[lo, hi]`
    #[serde(default)]
    pub bounds: Option<(f64, f64)>,
    /// Hold constant
    #[serde(default)]
    pub fixed: bool,
}

/// Named snapshot of parameter values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot name
    pub name: String,
    /// Parameter values by name
    pub values: BTreeMap<String, f64>,
}
