//! Blind runs must never evaluate the likelihood on observed data.

use qcls_core::{Dataset, ModelConfig, ParameterState, Result, StatModel};
use qcls_inference::{AsymptoticLimitTool, LimitConfig, RunPhase};
use qcls_model::GaussianModel;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts likelihood evaluations on observed datasets.
struct SpyModel {
    inner: GaussianModel,
    observed_reads: AtomicUsize,
}

impl SpyModel {
    fn new(inner: GaussianModel) -> Self {
        Self { inner, observed_reads: AtomicUsize::new(0) }
    }

    fn reads(&self) -> usize {
        self.observed_reads.load(Ordering::Relaxed)
    }
}

impl StatModel for SpyModel {
    fn parameters(&self) -> ParameterState {
        self.inner.parameters()
    }

    fn n_main(&self) -> usize {
        self.inner.n_main()
    }

    fn nll(&self, values: &[f64], data: &Dataset) -> Result<f64> {
        if data.is_observed() {
            self.observed_reads.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.nll(values, data)
    }

    fn expected_main(&self, values: &[f64]) -> Result<Vec<f64>> {
        self.inner.expected_main(values)
    }

    fn asimov_global_observables(&self, values: &[f64]) -> Result<Vec<f64>> {
        self.inner.asimov_global_observables(values)
    }
}

fn spy() -> SpyModel {
    SpyModel::new(GaussianModel::unit().with_systematic(vec![0.5]).unwrap())
}

#[test]
fn test_blind_run_never_reads_observed_data() {
    let m = spy();
    // Poisoned observations: any read would leak NaN into the limits.
    let data = m.inner.dataset(vec![f64::NAN]);
    let tool = AsymptoticLimitTool::new(LimitConfig::default()).unwrap();
    let r = tool.run(&m, &ModelConfig::default(), &data).unwrap();

    assert_eq!(m.reads(), 0);
    assert!(r.blind);
    assert_eq!(r.phase, RunPhase::Done);
    assert!(r.observed.is_none());
    assert!(r.mu_hat.is_none());
    assert_eq!(r.expected.len(), 5);
    assert!(r.expected.iter().all(|b| b.estimate.mu.is_finite() && b.estimate.status.is_reliable()));
}

#[test]
fn test_blind_run_ignores_observed_and_conditional_options() {
    let m = spy();
    let data = m.inner.dataset(vec![0.7]);
    let cfg = LimitConfig { do_obs: true, cond_expected: true, ..LimitConfig::default() };
    let blind = AsymptoticLimitTool::new(cfg).unwrap().run(&m, &ModelConfig::default(), &data).unwrap();
    assert_eq!(m.reads(), 0);

    // Blind expected limits equal unconditional-free expected limits on any data.
    let nominal = LimitConfig { do_blind: false, do_obs: false, cond_expected: false, ..LimitConfig::default() };
    let other = m.inner.dataset(vec![-3.0]);
    let r = AsymptoticLimitTool::new(nominal).unwrap().run(&m, &ModelConfig::default(), &other).unwrap();
    assert_eq!(blind.expected, r.expected);
}

#[test]
fn test_unblinded_run_reads_observed_data() {
    let m = spy();
    let data = m.inner.dataset(vec![0.7]);
    let cfg = LimitConfig { do_blind: false, ..LimitConfig::default() };
    let r = AsymptoticLimitTool::new(cfg).unwrap().run(&m, &ModelConfig::default(), &data).unwrap();
    assert!(m.reads() > 0);
    assert!(!r.blind);
    assert!(r.observed.is_some());
    assert!(r.mu_hat.is_some());
}

#[test]
fn test_blind_without_expected_is_rejected() {
    let m = spy();
    let cfg = LimitConfig { do_exp: false, ..LimitConfig::default() };
    assert!(AsymptoticLimitTool::new(cfg).is_err());
    assert_eq!(m.reads(), 0);
}
