//! Parameter state: values, ranges and constant flags.
//!
//! A [`ParameterState`] is an explicit value that every minimization receives by
//! `&mut`. Parallel computations each work on their own clone, so the
//! floating/constant flags are never shared mutable state.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Role of a parameter inside the statistical model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamRole {
    /// Parameter of interest (scanned axis).
    Poi,
    /// Nuisance parameter (profiled at every evaluation point).
    Nuisance,
    /// Global observable (auxiliary measurement, always constant).
    GlobalObservable,
}

/// A single model parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter name (unique within a state).
    pub name: String,
    /// Current value.
    pub value: f64,
    /// Allowed range `(lo, hi)`.
    pub bounds: (f64, f64),
    /// Held constant during minimization.
    pub constant: bool,
    /// Role in the model.
    pub role: ParamRole,
}

impl Parameter {
    /// Create a floating parameter.
    pub fn new(name: impl Into<String>, value: f64, bounds: (f64, f64), role: ParamRole) -> Self {
        Self { name: name.into(), value, bounds, constant: role == ParamRole::GlobalObservable, role }
    }
}

/// Ordered, clonable set of model parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterState {
    params: Vec<Parameter>,
}

impl ParameterState {
    /// Build a state from parameters. Names must be unique.
    pub fn new(params: Vec<Parameter>) -> Result<Self> {
        for (i, p) in params.iter().enumerate() {
            if params[..i].iter().any(|q| q.name == p.name) {
                return Err(Error::ModelValidation(format!("duplicate parameter name '{}'", p.name)));
            }
        }
        Ok(Self { params })
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// `true` if there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// All parameters in model order.
    pub fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    /// Parameter at `idx`.
    pub fn get(&self, idx: usize) -> Option<&Parameter> {
        self.params.get(idx)
    }

    /// Index of the parameter called `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }

    fn require(&self, idx: usize) -> Result<()> {
        if idx < self.params.len() {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "parameter index {} out of range ({} parameters)",
                idx,
                self.params.len()
            )))
        }
    }

    /// Index of `name`, or a validation error.
    pub fn require_index(&self, name: &str) -> Result<usize> {
        self.index_of(name)
            .ok_or_else(|| Error::Validation(format!("unknown parameter '{}'", name)))
    }

    /// Current value vector in model order.
    pub fn values(&self) -> Vec<f64> {
        self.params.iter().map(|p| p.value).collect()
    }

    /// Bounds in model order.
    pub fn bounds(&self) -> Vec<(f64, f64)> {
        self.params.iter().map(|p| p.bounds).collect()
    }

    /// Value of parameter `idx`.
    pub fn value(&self, idx: usize) -> f64 {
        self.params[idx].value
    }

    /// Set the value of parameter `idx` (not clamped).
    pub fn set_value(&mut self, idx: usize, value: f64) -> Result<()> {
        self.require(idx)?;
        self.params[idx].value = value;
        Ok(())
    }

    /// Set the range of parameter `idx`. The value is clamped into the new range.
    pub fn set_range(&mut self, idx: usize, lo: f64, hi: f64) -> Result<()> {
        self.require(idx)?;
        if !(lo <= hi) {
            return Err(Error::Validation(format!(
                "invalid range [{}, {}] for '{}'",
                lo, hi, self.params[idx].name
            )));
        }
        let p = &mut self.params[idx];
        p.bounds = (lo, hi);
        p.value = p.value.clamp(lo, hi);
        Ok(())
    }

    /// Set the constant flag of parameter `idx`.
    pub fn set_constant(&mut self, idx: usize, constant: bool) -> Result<()> {
        self.require(idx)?;
        self.params[idx].constant = constant;
        Ok(())
    }

    /// Set the constant flag of every parameter with `role`.
    pub fn set_all_constant(&mut self, role: ParamRole, constant: bool) {
        for p in self.params.iter_mut().filter(|p| p.role == role) {
            p.constant = constant;
        }
    }

    /// Indices of parameters with `role`, in model order.
    pub fn indices_by_role(&self, role: ParamRole) -> Vec<usize> {
        self.params.iter().enumerate().filter(|(_, p)| p.role == role).map(|(i, _)| i).collect()
    }

    /// Indices of floating (non-constant) parameters.
    pub fn floating_indices(&self) -> Vec<usize> {
        self.params.iter().enumerate().filter(|(_, p)| !p.constant).map(|(i, _)| i).collect()
    }

    /// Overwrite values from a full-length vector.
    pub fn set_values(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.params.len() {
            return Err(Error::Validation(format!(
                "value vector length {} != parameter count {}",
                values.len(),
                self.params.len()
            )));
        }
        for (p, &v) in self.params.iter_mut().zip(values) {
            p.value = v;
        }
        Ok(())
    }

    /// Global-observable values in model order.
    pub fn global_observables(&self) -> Vec<f64> {
        self.params.iter().filter(|p| p.role == ParamRole::GlobalObservable).map(|p| p.value).collect()
    }

    /// Overwrite global-observable values (model order of the GO subset).
    pub fn set_global_observables(&mut self, globs: &[f64]) -> Result<()> {
        let idx = self.indices_by_role(ParamRole::GlobalObservable);
        if idx.len() != globs.len() {
            return Err(Error::Validation(format!(
                "global observable count mismatch: {} != {}",
                globs.len(),
                idx.len()
            )));
        }
        for (i, &g) in idx.into_iter().zip(globs) {
            self.params[i].value = g;
        }
        Ok(())
    }
}

/// Hypothesis descriptor for a parameter of interest.
///
/// Produced by the CLI from `name`, `name=val` or `name=val_lo_hi`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoiSpec {
    /// POI name.
    pub name: String,
    /// Starting (or fixed) value.
    #[serde(default)]
    pub value: Option<f64>,
    /// Optional new range.
    #[serde(default)]
    pub range: Option<(f64, f64)>,
    /// Keep this POI fixed at `value`.
    #[serde(default)]
    pub constant: bool,
}

impl PoiSpec {
    /// Floating POI with its model defaults.
    pub fn floating(name: impl Into<String>) -> Self {
        Self { name: name.into(), value: None, range: None, constant: false }
    }

    /// POI fixed at `value`.
    pub fn fixed(name: impl Into<String>, value: f64) -> Self {
        Self { name: name.into(), value: Some(value), range: None, constant: true }
    }

    /// Floating POI starting at `value` with range `[lo, hi]`.
    pub fn ranged(name: impl Into<String>, value: f64, lo: f64, hi: f64) -> Self {
        Self { name: name.into(), value: Some(value), range: Some((lo, hi)), constant: false }
    }
}

/// Which parameters play which part in a limit run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// POI descriptors. Empty means "float the first POI of the model".
    #[serde(default)]
    pub pois: Vec<PoiSpec>,
    /// Nuisance parameters held constant for the whole run.
    #[serde(default)]
    pub fixed_nuisances: Vec<String>,
    /// Snapshot used as starting point and nominal Asimov point.
    #[serde(default)]
    pub snapshot: Option<String>,
}
