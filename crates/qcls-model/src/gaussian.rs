//! Gaussian measurement model.
//!
//! Each main observation `x_i ~ N(mu * s_i + b_i + theta * d_i, sigma_i)`. The
//! optional nuisance `theta` carries a unit Gaussian constraint against the
//! global observable `nom_theta`. With one bin, `s = 1`, `b = 0`, `sigma = 1` and
//! no systematic this is the textbook case where `q_mu,A = mu^2`.

use qcls_core::{Dataset, Error, ParamRole, Parameter, ParameterState, Result, StatModel};

/// Natural log of `sqrt(2π)`.
const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_7;

/// POI name used by [`GaussianModel`].
pub const POI_NAME: &str = "mu";
/// Nuisance-parameter name used when a systematic is attached.
pub const NP_NAME: &str = "theta";
/// Global-observable name paired with [`NP_NAME`].
pub const GLOB_NAME: &str = "nom_theta";

#[inline]
fn normal_nll(x: f64, mean: f64, sigma: f64) -> f64 {
    let z = (x - mean) / sigma;
    0.5 * z * z + sigma.ln() + LN_SQRT_2PI
}

/// Multi-bin Gaussian measurement with an optional correlated systematic.
#[derive(Debug, Clone)]
pub struct GaussianModel {
    signal: Vec<f64>,
    background: Vec<f64>,
    sigma: Vec<f64>,
    systematic: Option<Vec<f64>>,
    poi_bounds: (f64, f64),
}

impl GaussianModel {
    /// Build a model from per-bin signal, background and resolution.
    pub fn new(signal: Vec<f64>, background: Vec<f64>, sigma: Vec<f64>) -> Result<Self> {
        if signal.is_empty() {
            return Err(Error::ModelValidation("signal must not be empty".to_string()));
        }
        if signal.len() != background.len() || signal.len() != sigma.len() {
            return Err(Error::ModelValidation(format!(
                "length mismatch: signal={} background={} sigma={}",
                signal.len(),
                background.len(),
                sigma.len()
            )));
        }
        if let Some(s) = sigma.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(Error::ModelValidation(format!("sigma must be finite and > 0, got {}", s)));
        }
        Ok(Self { signal, background, sigma, systematic: None, poi_bounds: (-20.0, 20.0) })
    }

    /// Single measurement `x ~ N(mu, 1)`.
    pub fn unit() -> Self {
        Self {
            signal: vec![1.0],
            background: vec![0.0],
            sigma: vec![1.0],
            systematic: None,
            poi_bounds: (-20.0, 20.0),
        }
    }

    /// Attach a constrained systematic shifting bin `i` by `theta * delta[i]`.
    pub fn with_systematic(mut self, delta: Vec<f64>) -> Result<Self> {
        if delta.len() != self.signal.len() {
            return Err(Error::ModelValidation(format!(
                "systematic length {} != bins {}",
                delta.len(),
                self.signal.len()
            )));
        }
        self.systematic = Some(delta);
        Ok(self)
    }

    /// Override the POI range.
    pub fn with_poi_bounds(mut self, lo: f64, hi: f64) -> Self {
        self.poi_bounds = (lo, hi);
        self
    }

    /// Observed dataset with the given measurements.
    pub fn dataset(&self, main: Vec<f64>) -> Dataset {
        Dataset::observed("obsData", main)
    }

    fn mean(&self, values: &[f64], i: usize) -> f64 {
        let mu = values[0];
        let shift = match &self.systematic {
            Some(d) => values[1] * d[i],
            None => 0.0,
        };
        mu * self.signal[i] + self.background[i] + shift
    }
}

impl StatModel for GaussianModel {
    fn parameters(&self) -> ParameterState {
        let mut params = vec![Parameter::new(POI_NAME, 1.0, self.poi_bounds, ParamRole::Poi)];
        if self.systematic.is_some() {
            params.push(Parameter::new(NP_NAME, 0.0, (-5.0, 5.0), ParamRole::Nuisance));
            params.push(Parameter::new(GLOB_NAME, 0.0, (-10.0, 10.0), ParamRole::GlobalObservable));
        }
        ParameterState::new(params).unwrap_or_default()
    }

    fn n_main(&self) -> usize {
        self.signal.len()
    }

    fn nll(&self, values: &[f64], data: &Dataset) -> Result<f64> {
        let n_params = if self.systematic.is_some() { 3 } else { 1 };
        if values.len() != n_params {
            return Err(Error::Validation(format!(
                "expected {} parameters, got {}",
                n_params,
                values.len()
            )));
        }
        if data.main.len() != self.signal.len() {
            return Err(Error::Validation(format!(
                "dataset '{}' has {} observations, model expects {}",
                data.name,
                data.main.len(),
                self.signal.len()
            )));
        }
        let mut nll = 0.0;
        for (i, &x) in data.main.iter().enumerate() {
            nll += normal_nll(x, self.mean(values, i), self.sigma[i]);
        }
        if self.systematic.is_some() {
            nll += normal_nll(values[2], values[1], 1.0);
        }
        Ok(nll)
    }

    fn expected_main(&self, values: &[f64]) -> Result<Vec<f64>> {
        Ok((0..self.signal.len()).map(|i| self.mean(values, i)).collect())
    }

    fn asimov_global_observables(&self, values: &[f64]) -> Result<Vec<f64>> {
        Ok(if self.systematic.is_some() { vec![values[1]] } else { vec![] })
    }
}
