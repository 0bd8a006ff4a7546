//! Binned counting model built from a [`Workspace`].
//!
//! Main measurement: independent Poisson bins. Each `normsys`/`histosys`
//! modifier adds a nuisance parameter `alpha` with a unit Gaussian constraint
//! against a global observable `nom_<name>`. Additional `normfactor`s become
//! unconstrained nuisance parameters.

use crate::schema::{Modifier, Observation, Workspace};
use qcls_core::{Dataset, Error, ParamRole, Parameter, ParameterState, Result, StatModel};
use statrs::function::gamma::ln_gamma;
use std::collections::HashMap;

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_7;
const LAMBDA_FLOOR: f64 = 1e-10;

const NORM_BOUNDS: (f64, f64) = (0.0, 10.0);
const ALPHA_BOUNDS: (f64, f64) = (-5.0, 5.0);
const GLOB_BOUNDS: (f64, f64) = (-10.0, 10.0);

/// Default name of the observed dataset.
pub const DEFAULT_DATA_NAME: &str = "obsData";

#[derive(Debug, Clone)]
enum BinModifier {
    Scale { param: usize },
    NormSys { param: usize, hi: f64, lo: f64 },
    HistoSys { param: usize, hi: Vec<f64>, lo: Vec<f64> },
}

#[derive(Debug, Clone)]
struct CompiledSample {
    offset: usize,
    nominal: Vec<f64>,
    modifiers: Vec<BinModifier>,
}

/// Constraint pairing a nuisance parameter with its global observable.
#[derive(Debug, Clone, Copy)]
struct Constraint {
    param: usize,
    glob: usize,
}

/// Poisson counting model with Gaussian-constrained systematics.
#[derive(Debug, Clone)]
pub struct CountingModel {
    state: ParameterState,
    channels: Vec<(String, usize)>,
    samples: Vec<CompiledSample>,
    constraints: Vec<Constraint>,
    n_main: usize,
    datasets: Vec<(String, Vec<f64>)>,
    snapshots: HashMap<String, ParameterState>,
}

/// Piecewise-exponential normalisation interpolation.
fn normsys_factor(alpha: f64, hi: f64, lo: f64) -> f64 {
    if alpha >= 0.0 { hi.powf(alpha) } else { lo.powf(-alpha) }
}

/// Piecewise-linear shape interpolation (shift relative to nominal).
fn histosys_delta(alpha: f64, nominal: f64, hi: f64, lo: f64) -> f64 {
    if alpha >= 0.0 { alpha * (hi - nominal) } else { alpha * (nominal - lo) }
}

impl CountingModel {
    /// Create model from a counting workspace
    pub fn from_workspace(ws: &Workspace) -> Result<Self> {
        if ws.channels.is_empty() {
            return Err(Error::ModelValidation("workspace has no channels".to_string()));
        }

        let mut params: Vec<Parameter> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut constraints = Vec::new();
        let mut pending_globs: Vec<(String, usize)> = Vec::new();

        let mut channels = Vec::with_capacity(ws.channels.len());
        let mut samples = Vec::new();
        let mut offset = 0usize;

        for channel in &ws.channels {
            let n_bins = channel.samples.first().map(|s| s.data.len()).ok_or_else(|| {
                Error::ModelValidation(format!("channel '{}' has no samples", channel.name))
            })?;
            if n_bins == 0 {
                return Err(Error::ModelValidation(format!("channel '{}' has no bins", channel.name)));
            }

            for sample in &channel.samples {
                if sample.data.len() != n_bins {
                    return Err(Error::ModelValidation(format!(
                        "sample '{}' in channel '{}' has {} bins, expected {}",
                        sample.name,
                        channel.name,
                        sample.data.len(),
                        n_bins
                    )));
                }

                let mut modifiers = Vec::with_capacity(sample.modifiers.len());
                for m in &sample.modifiers {
                    let name = m.name().to_string();
                    let param = match index.get(&name) {
                        Some(&i) => i,
                        None => {
                            let i = params.len();
                            let p = match m {
                                Modifier::NormFactor { .. } if name == ws.measurement.poi => {
                                    Parameter::new(&name, 1.0, NORM_BOUNDS, ParamRole::Poi)
                                }
                                Modifier::NormFactor { .. } => {
                                    Parameter::new(&name, 1.0, NORM_BOUNDS, ParamRole::Nuisance)
                                }
                                _ => {
                                    pending_globs.push((name.clone(), i));
                                    Parameter::new(&name, 0.0, ALPHA_BOUNDS, ParamRole::Nuisance)
                                }
                            };
                            params.push(p);
                            index.insert(name.clone(), i);
                            i
                        }
                    };

                    modifiers.push(match m {
                        Modifier::NormFactor { .. } => BinModifier::Scale { param },
                        Modifier::NormSys { data, .. } => {
                            if !(data.hi > 0.0 && data.lo > 0.0) {
                                return Err(Error::ModelValidation(format!(
                                    "normsys '{}' factors must be > 0 (hi={}, lo={})",
                                    name, data.hi, data.lo
                                )));
                            }
                            BinModifier::NormSys { param, hi: data.hi, lo: data.lo }
                        }
                        Modifier::HistoSys { data, .. } => {
                            if data.hi_data.len() != n_bins || data.lo_data.len() != n_bins {
                                return Err(Error::ModelValidation(format!(
                                    "histosys '{}' template length mismatch",
                                    name
                                )));
                            }
                            BinModifier::HistoSys {
                                param,
                                hi: data.hi_data.clone(),
                                lo: data.lo_data.clone(),
                            }
                        }
                    });
                }

                samples.push(CompiledSample { offset, nominal: sample.data.clone(), modifiers });
            }

            channels.push((channel.name.clone(), n_bins));
            offset += n_bins;
        }

        // Global observables go after every fit parameter, in constraint order.
        for (name, param) in pending_globs {
            let glob = params.len();
            params.push(Parameter::new(
                format!("nom_{}", name),
                0.0,
                GLOB_BOUNDS,
                ParamRole::GlobalObservable,
            ));
            constraints.push(Constraint { param, glob });
        }

        if !params.iter().any(|p| p.role == ParamRole::Poi) {
            return Err(Error::ModelValidation(format!(
                "POI '{}' is not a normfactor of any sample",
                ws.measurement.poi
            )));
        }

        let mut state = ParameterState::new(params)?;
        for cfg in &ws.measurement.parameters {
            let idx = state.index_of(&cfg.name).ok_or_else(|| {
                Error::ModelValidation(format!("measurement overrides unknown parameter '{}'", cfg.name))
            })?;
            if let Some((lo, hi)) = cfg.bounds {
                state
                    .set_range(idx, lo, hi)
                    .map_err(|e| Error::ModelValidation(e.to_string()))?;
            }
            if let Some(init) = cfg.init {
                state.set_value(idx, init)?;
            }
            if cfg.fixed {
                state.set_constant(idx, true)?;
            }
        }

        let mut datasets = vec![(
            DEFAULT_DATA_NAME.to_string(),
            Self::flatten_observations(&channels, &ws.observations)?,
        )];
        for d in &ws.datasets {
            datasets.push((d.name.clone(), Self::flatten_observations(&channels, &d.observations)?));
        }

        let mut snapshots = HashMap::new();
        for snap in &ws.snapshots {
            let mut s = state.clone();
            for (name, &v) in &snap.values {
                let idx = s.index_of(name).ok_or_else(|| {
                    Error::ModelValidation(format!(
                        "snapshot '{}' sets unknown parameter '{}'",
                        snap.name, name
                    ))
                })?;
                s.set_value(idx, v)?;
            }
            snapshots.insert(snap.name.clone(), s);
        }

        log::debug!(
            "counting model: {} channels, {} bins, {} parameters, {} constraints",
            channels.len(),
            offset,
            state.len(),
            constraints.len()
        );

        Ok(Self { state, channels, samples, constraints, n_main: offset, datasets, snapshots })
    }

    fn flatten_observations(channels: &[(String, usize)], obs: &[Observation]) -> Result<Vec<f64>> {
        let mut main = Vec::new();
        for (name, n_bins) in channels {
            let o = obs.iter().find(|o| &o.name == name).ok_or_else(|| {
                Error::ModelValidation(format!("no observations for channel '{}'", name))
            })?;
            if o.data.len() != *n_bins {
                return Err(Error::ModelValidation(format!(
                    "channel '{}' has {} observed bins, expected {}",
                    name,
                    o.data.len(),
                    n_bins
                )));
            }
            if let Some(n) = o.data.iter().find(|n| !(n.is_finite() && **n >= 0.0)) {
                return Err(Error::ModelValidation(format!(
                    "channel '{}' has invalid observed count {}",
                    name, n
                )));
            }
            main.extend_from_slice(&o.data);
        }
        Ok(main)
    }

    /// Channel names with their bin counts, in main-observation order.
    pub fn channels(&self) -> &[(String, usize)] {
        &self.channels
    }

    /// Dataset by name (`obsData` is the default observations).
    pub fn dataset(&self, name: &str) -> Result<Dataset> {
        self.datasets
            .iter()
            .find(|(n, _)| n == name)
            .map(|(n, main)| Dataset::observed(n.clone(), main.clone()))
            .ok_or_else(|| Error::Validation(format!("dataset '{}' does not exist", name)))
    }
}

impl StatModel for CountingModel {
    fn parameters(&self) -> ParameterState {
        self.state.clone()
    }

    fn snapshot(&self, name: &str) -> Option<ParameterState> {
        self.snapshots.get(name).cloned()
    }

    fn n_main(&self) -> usize {
        self.n_main
    }

    fn nll(&self, values: &[f64], data: &Dataset) -> Result<f64> {
        if data.main.len() != self.n_main {
            return Err(Error::Validation(format!(
                "dataset '{}' has {} observations, model expects {}",
                data.name,
                data.main.len(),
                self.n_main
            )));
        }
        let lambda = self.expected_main(values)?;

        let mut nll = 0.0;
        for (&n, &lam) in data.main.iter().zip(&lambda) {
            let lam = lam.max(LAMBDA_FLOOR);
            nll += lam - n * lam.ln() + ln_gamma(n + 1.0);
        }
        for c in &self.constraints {
            let pull = values[c.param] - values[c.glob];
            nll += 0.5 * pull * pull + LN_SQRT_2PI;
        }
        if !nll.is_finite() {
            return Err(Error::Computation(format!("non-finite NLL at {:?}", values)));
        }
        Ok(nll)
    }

    fn expected_main(&self, values: &[f64]) -> Result<Vec<f64>> {
        if values.len() != self.state.len() {
            return Err(Error::Validation(format!(
                "expected {} parameters, got {}",
                self.state.len(),
                values.len()
            )));
        }
        let mut out = vec![0.0; self.n_main];
        for s in &self.samples {
            for (b, &nom) in s.nominal.iter().enumerate() {
                let mut shifted = nom;
                for m in &s.modifiers {
                    if let BinModifier::HistoSys { param, hi, lo } = m {
                        shifted += histosys_delta(values[*param], nom, hi[b], lo[b]);
                    }
                }
                let mut factor = 1.0;
                for m in &s.modifiers {
                    match m {
                        BinModifier::Scale { param } => factor *= values[*param],
                        BinModifier::NormSys { param, hi, lo } => {
                            factor *= normsys_factor(values[*param], *hi, *lo)
                        }
                        BinModifier::HistoSys { .. } => {}
                    }
                }
                out[s.offset + b] += factor * shifted;
            }
        }
        Ok(out)
    }

    fn asimov_global_observables(&self, values: &[f64]) -> Result<Vec<f64>> {
        Ok(self.constraints.iter().map(|c| values[c.param]).collect())
    }
}
