//! Asimov datasets: deterministic expectation at a POI hypothesis.

use crate::minimizer::RobustMinimizer;
use crate::optimizer::MinimizerBackend;
use qcls_core::{
    Conditioning, Dataset, DatasetKind, Error, FitResult, ParameterState, Result, StatModel,
};

/// A generated Asimov dataset plus the fit that conditioned it.
#[derive(Debug, Clone)]
pub struct AsimovData {
    /// Pseudo-data with its own global-observable values.
    pub dataset: Dataset,
    /// Parameter point the expectation was evaluated at.
    pub values: Vec<f64>,
    /// Conditioning fit; `None` for [`Conditioning::Nominal`].
    pub fit: Option<FitResult>,
}

/// Profiling POI value for an Asimov hypothesis at `mu`.
///
/// With `neg_at_zero`, hypotheses below zero are profiled at zero.
pub fn profile_point(mu: f64, neg_at_zero: bool) -> f64 {
    if neg_at_zero && mu < 0.0 { 0.0 } else { mu }
}

/// Builds Asimov datasets for one model and POI.
pub struct AsimovBuilder<'a, M: StatModel + ?Sized, B: MinimizerBackend> {
    model: &'a M,
    minimizer: &'a RobustMinimizer<B>,
    poi: usize,
}

impl<'a, M: StatModel + ?Sized, B: MinimizerBackend> AsimovBuilder<'a, M, B> {
    /// Builder for POI index `poi`.
    pub fn new(model: &'a M, minimizer: &'a RobustMinimizer<B>, poi: usize) -> Self {
        Self { model, minimizer, poi }
    }

    /// Asimov data at `mu`.
    ///
    /// `Conditional` profiles the nuisance parameters on `observed` at the fixed
    /// POI value `profile_mu`; `Unconditional` takes them from the global fit;
    /// `Nominal` keeps the values in `state` and never reads data. `state` is
    /// only read: each build works on its own clone.
    pub fn build(
        &self,
        mu: f64,
        conditioning: Conditioning,
        profile_mu: f64,
        observed: Option<&Dataset>,
        state: &ParameterState,
    ) -> Result<AsimovData> {
        if !mu.is_finite() || !profile_mu.is_finite() {
            return Err(Error::Computation(format!(
                "non-finite Asimov hypothesis (mu={}, profile_mu={})",
                mu, profile_mu
            )));
        }
        let mut work = state.clone();

        let fit = match conditioning {
            Conditioning::Nominal => None,
            Conditioning::Conditional | Conditioning::Unconditional => {
                let data = observed.ok_or_else(|| {
                    Error::Configuration(format!(
                        "{:?} Asimov data needs observed data",
                        conditioning
                    ))
                })?;
                if conditioning == Conditioning::Conditional {
                    ensure_in_range(&mut work, self.poi, profile_mu)?;
                    work.set_value(self.poi, profile_mu)?;
                    work.set_constant(self.poi, true)?;
                } else {
                    work.set_constant(self.poi, false)?;
                }
                let fit = self.minimizer.minimize(self.model, data, &mut work)?;
                if !fit.converged() {
                    log::warn!(
                        "Asimov conditioning fit ({:?}, profile mu={}) status {:?}; using best point",
                        conditioning,
                        profile_mu,
                        fit.status
                    );
                }
                Some(fit)
            }
        };

        let mut values = work.values();
        values[self.poi] = mu;
        let main = self.model.expected_main(&values)?;
        if main.len() != self.model.n_main() {
            return Err(Error::Computation(format!(
                "model produced {} expected observations, expected {}",
                main.len(),
                self.model.n_main()
            )));
        }
        if let Some(v) = main.iter().find(|v| !v.is_finite()) {
            return Err(Error::Computation(format!("non-finite Asimov expectation {} at mu={}", v, mu)));
        }
        let globs = self.model.asimov_global_observables(&values)?;

        log::debug!("built Asimov data at mu={} ({:?}, profile mu={})", mu, conditioning, profile_mu);

        Ok(AsimovData {
            dataset: Dataset {
                name: asimov_name(mu),
                kind: DatasetKind::Asimov { mu, conditioning, profile_mu },
                main,
                global_observables: Some(globs),
            },
            values,
            fit,
        })
    }
}

/// Widen the range of `idx` so that it contains `value`.
pub(crate) fn ensure_in_range(state: &mut ParameterState, idx: usize, value: f64) -> Result<()> {
    let p = state
        .get(idx)
        .ok_or_else(|| Error::Validation(format!("parameter index {} out of range", idx)))?;
    let (lo, hi) = p.bounds;
    if value < lo || value > hi {
        let span = (hi - lo).abs().max(1.0);
        let (new_lo, new_hi) = if value < lo { (value - 0.1 * span, hi) } else { (lo, value + 0.1 * span) };
        log::debug!("widening range of '{}' to [{}, {}]", p.name, new_lo, new_hi);
        state.set_range(idx, new_lo, new_hi)?;
    }
    Ok(())
}

fn asimov_name(mu: f64) -> String {
    format!("asimovData_{}", format!("{:.6}", mu).trim_end_matches('0').trim_end_matches('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minimizer::MinimizerConfig;
    use approx::assert_relative_eq;
    use qcls_core::{ParamRole, StatModel};
    use qcls_model::GaussianModel;

    fn systematic_model() -> GaussianModel {
        GaussianModel::unit().with_systematic(vec![1.0]).unwrap()
    }

    #[test]
    fn test_nominal_asimov_does_not_fit() {
        let m = GaussianModel::unit();
        let min = RobustMinimizer::new(MinimizerConfig::default());
        let b = AsimovBuilder::new(&m, &min, 0);
        let a = b.build(1.5, Conditioning::Nominal, 1.5, None, &m.parameters()).unwrap();
        assert!(a.fit.is_none());
        assert_eq!(a.dataset.main, vec![1.5]);
        assert_eq!(a.dataset.global_observables, Some(vec![]));
        assert_eq!(a.dataset.asimov_mu(), Some(1.5));
        assert_eq!(a.dataset.name, "asimovData_1.5");
    }

    #[test]
    fn test_conditional_asimov_profiles_nuisances() {
        let m = systematic_model();
        let min = RobustMinimizer::new(MinimizerConfig::default());
        let obs = m.dataset(vec![2.0]);
        let b = AsimovBuilder::new(&m, &min, 0);
        let a = b.build(0.0, Conditioning::Conditional, 0.0, Some(&obs), &m.parameters()).unwrap();
        assert!(a.fit.as_ref().unwrap().converged());
        // theta_hat(mu = 0) = x / 2 with a unit constraint
        assert_relative_eq!(a.dataset.main[0], 1.0, epsilon = 1e-4);
        assert_relative_eq!(a.dataset.global_observables.as_ref().unwrap()[0], 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_unconditional_asimov_resets_poi() {
        let m = systematic_model();
        let min = RobustMinimizer::new(MinimizerConfig::default());
        let obs = m.dataset(vec![2.0]);
        let b = AsimovBuilder::new(&m, &min, 0);
        let a = b.build(0.0, Conditioning::Unconditional, 0.0, Some(&obs), &m.parameters()).unwrap();
        let fit = a.fit.unwrap();
        assert_relative_eq!(fit.parameters[0], 2.0, epsilon = 1e-3);
        assert_eq!(a.values[0], 0.0);
        assert_relative_eq!(a.dataset.main[0], 0.0, epsilon = 1e-3);
    }

    #[test]
    fn test_construction_is_idempotent() {
        let m = systematic_model();
        let min = RobustMinimizer::new(MinimizerConfig::default());
        let obs = m.dataset(vec![1.3]);
        let state = m.parameters();
        let b = AsimovBuilder::new(&m, &min, 0);
        for cond in [Conditioning::Conditional, Conditioning::Unconditional, Conditioning::Nominal] {
            let a1 = b.build(0.7, cond, 0.7, Some(&obs), &state).unwrap();
            let a2 = b.build(0.7, cond, 0.7, Some(&obs), &state).unwrap();
            assert_eq!(a1.dataset, a2.dataset);
        }
    }

    #[test]
    fn test_conditional_without_data_is_error() {
        let m = GaussianModel::unit();
        let min = RobustMinimizer::new(MinimizerConfig::default());
        let b = AsimovBuilder::new(&m, &min, 0);
        let r = b.build(1.0, Conditioning::Conditional, 1.0, None, &m.parameters());
        assert!(matches!(r, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_profile_point_and_range() {
        assert_eq!(profile_point(-1.0, true), 0.0);
        assert_eq!(profile_point(-1.0, false), -1.0);
        assert_eq!(profile_point(2.0, true), 2.0);

        let mut s = GaussianModel::unit().with_poi_bounds(0.0, 5.0).parameters();
        ensure_in_range(&mut s, 0, -1.0).unwrap();
        let (lo, hi) = s.get(0).unwrap().bounds;
        assert!(lo < -1.0 && hi == 5.0);
        assert_eq!(s.indices_by_role(ParamRole::Poi), vec![0]);
    }
}
