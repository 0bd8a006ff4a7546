//! Core traits for quickcls
//!
//! The limit-setting engine in `qcls-inference` depends only on [`StatModel`],
//! never on a concrete likelihood. Models are immutable during a run; all
//! mutable fit state lives in a [`ParameterState`] owned by the caller.

use crate::{Dataset, ParameterState, Result};

/// Statistical model interface consumed by the limit engine.
pub trait StatModel: Send + Sync {
    /// Nominal parameter state (values, ranges, constant flags, roles).
    fn parameters(&self) -> ParameterState;

    /// Named snapshot of parameter values, if the model carries one.
    fn snapshot(&self, _name: &str) -> Option<ParameterState> {
        None
    }

    /// Number of main observations a dataset for this model must have.
    fn n_main(&self) -> usize;

    /// Negative log-likelihood of `data` at the full parameter vector `values`.
    ///
    /// Global-observable values are read from `values`, not from `data`.
    fn nll(&self, values: &[f64], data: &Dataset) -> Result<f64>;

    /// Expected main observations at `values` (used to build Asimov data).
    fn expected_main(&self, values: &[f64]) -> Result<Vec<f64>>;

    /// Global-observable values that make every auxiliary measurement agree
    /// with the nuisance parameters in `values` (GO model order).
    fn asimov_global_observables(&self, values: &[f64]) -> Result<Vec<f64>>;
}

impl<M: StatModel + ?Sized> StatModel for &M {
    fn parameters(&self) -> ParameterState {
        (**self).parameters()
    }

    fn snapshot(&self, name: &str) -> Option<ParameterState> {
        (**self).snapshot(name)
    }

    fn n_main(&self) -> usize {
        (**self).n_main()
    }

    fn nll(&self, values: &[f64], data: &Dataset) -> Result<f64> {
        (**self).nll(values, data)
    }

    fn expected_main(&self, values: &[f64]) -> Result<Vec<f64>> {
        (**self).expected_main(values)
    }

    fn asimov_global_observables(&self, values: &[f64]) -> Result<Vec<f64>> {
        (**self).asimov_global_observables(values)
    }
}
