//! Profile likelihood of one dataset.
//!
//! [`ProfiledData`] keeps the unconditional fit of a dataset (and, for the tilde
//! statistic, the conditional fit at zero) so that a scan only pays for the
//! conditional fit at each tested POI value. [`HypothesisTester`] runs those
//! fits through the [`RobustMinimizer`] and the shared [`FailureBudget`].

use crate::asimov::ensure_in_range;
use crate::asymptotics::{self, AsymptoticPValues};
use crate::minimizer::{FailureBudget, PredictiveStart, RobustMinimizer};
use crate::optimizer::MinimizerBackend;
use crate::test_statistic::{TestStatistic, asimov_q};
use qcls_core::{Dataset, FitResult, ParameterState, Result, StatModel};

/// A dataset with its reference fits and scan-local fit state.
#[derive(Debug, Clone)]
pub struct ProfiledData {
    dataset: Dataset,
    state: ParameterState,
    unconditional: FitResult,
    at_zero: Option<FitResult>,
    predictor: PredictiveStart,
    failed_fits: usize,
}

impl ProfiledData {
    /// The dataset.
    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Unconditional (global) fit.
    pub fn unconditional(&self) -> &FitResult {
        &self.unconditional
    }

    /// Non-converged fits on this dataset so far.
    pub fn failed_fits(&self) -> usize {
        self.failed_fits
    }

    /// Forget scan-local history (predictive starts, failure count).
    ///
    /// Used when a clone starts a new independent scan.
    pub fn reset_scan(&mut self) {
        self.predictor = PredictiveStart::default();
        self.failed_fits = 0;
    }
}

/// Runs the fits behind `q_mu` for one model and POI.
pub struct HypothesisTester<'a, M: StatModel + ?Sized, B: MinimizerBackend> {
    model: &'a M,
    minimizer: &'a RobustMinimizer<B>,
    budget: &'a FailureBudget,
    poi: usize,
    statistic: TestStatistic,
    predictive: bool,
}

impl<'a, M: StatModel + ?Sized, B: MinimizerBackend> HypothesisTester<'a, M, B> {
    /// Tester for POI index `poi`.
    pub fn new(
        model: &'a M,
        minimizer: &'a RobustMinimizer<B>,
        budget: &'a FailureBudget,
        poi: usize,
        statistic: TestStatistic,
        predictive: bool,
    ) -> Self {
        Self { model, minimizer, budget, poi, statistic, predictive }
    }

    /// POI index.
    pub fn poi(&self) -> usize {
        self.poi
    }

    /// Statistic in use.
    pub fn statistic(&self) -> TestStatistic {
        self.statistic
    }

    /// Count a fit made outside the tester (Asimov conditioning) against the budget.
    pub fn record_fit(&self, fit: &FitResult) -> Result<()> {
        self.budget.record(fit)
    }

    /// Unconditional fit of `dataset` starting from `state`.
    pub fn profile(&self, dataset: Dataset, state: &ParameterState, with_errors: bool) -> Result<ProfiledData> {
        let mut work = state.clone();
        work.set_constant(self.poi, false)?;
        let fit = if with_errors {
            self.minimizer.minimize_with_errors(self.model, &dataset, &mut work)?
        } else {
            self.minimizer.minimize(self.model, &dataset, &mut work)?
        };
        self.budget.record(&fit)?;
        let failed_fits = usize::from(!fit.converged());
        log::debug!(
            "[{}] unconditional fit: mu_hat={:.6} nll={:.6} status={:?}",
            dataset.name,
            fit.parameters[self.poi],
            fit.nll,
            fit.status
        );
        Ok(ProfiledData {
            dataset,
            state: work,
            unconditional: fit,
            at_zero: None,
            predictor: PredictiveStart::default(),
            failed_fits,
        })
    }

    /// Conditional fit with the POI fixed at `mu`.
    pub fn conditional(&self, data: &mut ProfiledData, mu: f64) -> Result<FitResult> {
        let mut work = data.state.clone();
        ensure_in_range(&mut work, self.poi, mu)?;

        let start = if self.predictive {
            data.predictor.predict(mu, &work.bounds())
        } else {
            None
        };
        work.set_values(&start.unwrap_or_else(|| data.unconditional.parameters.clone()))?;
        work.set_value(self.poi, mu)?;
        work.set_constant(self.poi, true)?;

        let fit = self.minimizer.minimize(self.model, &data.dataset, &mut work)?;
        self.budget.record(&fit)?;
        if !fit.converged() {
            data.failed_fits += 1;
            log::warn!("[{}] conditional fit at mu={} status {:?}", data.dataset.name, mu, fit.status);
        }
        if self.predictive && fit.status != qcls_core::FitStatus::Failed {
            data.predictor.record(mu, &fit.parameters);
        }
        Ok(fit)
    }

    fn zero_fit(&self, data: &mut ProfiledData) -> Result<FitResult> {
        if let Some(f) = &data.at_zero {
            return Ok(f.clone());
        }
        let fit = self.conditional(data, 0.0)?;
        data.at_zero = Some(fit.clone());
        Ok(fit)
    }

    /// `q_mu` (or `q̃_mu`) on `data`.
    pub fn q_mu(&self, data: &mut ProfiledData, mu: f64) -> Result<f64> {
        let cond = self.conditional(data, mu)?;
        let mu_hat = data.unconditional.parameters[self.poi];
        let at_zero = if self.statistic.is_tilde() && mu_hat < 0.0 {
            Some(self.zero_fit(data)?)
        } else {
            None
        };
        self.statistic.evaluate(mu, self.poi, &cond, &data.unconditional, at_zero.as_ref())
    }

    /// `q_mu,A` on background-only Asimov data: two-sided, floored at zero.
    pub fn q_asimov(&self, asimov: &mut ProfiledData, mu: f64) -> Result<f64> {
        let cond = self.conditional(asimov, mu)?;
        asimov_q(cond.nll, asimov.unconditional.nll)
    }

    /// Asymptotic p-values at `mu` for `data`, with `q_mu,A` from `asimov`.
    pub fn p_values(
        &self,
        data: &mut ProfiledData,
        asimov: &mut ProfiledData,
        mu: f64,
    ) -> Result<AsymptoticPValues> {
        let q = self.q_mu(data, mu)?;
        let q_a = self.q_asimov(asimov, mu)?;
        let p = asymptotics::cls(q, q_a, self.statistic.is_tilde())?;
        log::debug!(
            "[{}] mu={:.6} q={:.6} q_A={:.6} CLs+b={:.4e} CLb={:.4e} CLs={:.4e}",
            data.dataset.name,
            mu,
            p.q,
            p.q_a,
            p.clsb,
            p.clb,
            p.cls
        );
        Ok(p)
    }

    /// Median expected CLs at `mu`: `q = q_A` on the background-only Asimov data.
    pub fn median_cls(&self, asimov: &mut ProfiledData, mu: f64) -> Result<f64> {
        let q_a = self.q_asimov(asimov, mu)?;
        Ok(asymptotics::median_cls(q_a))
    }
}
