//! Robust likelihood minimization.
//!
//! [`RobustMinimizer`] runs one fit of a [`StatModel`] on a [`Dataset`] over the
//! floating parameters of a [`ParameterState`], retrying along a deterministic
//! escalation ladder ([`RetryLadder`]) when the backend does not converge.
//! On success the best-fit values are written back into the state.

use crate::optimizer::{
    LbfgsbOptimizer, MinimizerBackend, ObjectiveFunction, OptimizationResult, OptimizerConfig,
    clamp_params,
};
use nalgebra::DMatrix;
use qcls_core::{
    CovarianceQuality, Dataset, Error, FitResult, FitStatus, ParameterState, Result, StatModel,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Highest supported strategy level.
pub const MAX_STRATEGY: u8 = 2;

/// Minimizer settings shared by every fit of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinimizerConfig {
    /// Starting strategy level (0-2). Retries escalate from here.
    pub strategy: u8,
    /// Verbosity: `< 0` silent, `0` summary, `>= 1` every attempt.
    pub print_level: i32,
    /// Offset the NLL by its start-point value during minimization.
    pub nll_offset: bool,
    /// Constant-term optimization: `0` none, `>= 1` cache the last evaluation.
    pub optimize_const: u8,
    /// Retries after the first attempt.
    pub max_retries: usize,
    /// Seed of the start-point jitter used by late retries.
    pub seed: u64,
    /// Jitter amplitude as a fraction of each parameter's range.
    pub jitter_fraction: f64,
    /// Only report exhausted ladders, not individual failed attempts.
    pub kill_below_fatal: bool,
    /// Iteration cap at strategy 0.
    pub max_iter: u64,
    /// Gradient tolerance at strategy 0.
    pub tol: f64,
}

impl Default for MinimizerConfig {
    fn default() -> Self {
        Self {
            strategy: 0,
            print_level: -1,
            nll_offset: true,
            optimize_const: 2,
            max_retries: 3,
            seed: 1234,
            jitter_fraction: 0.05,
            kill_below_fatal: true,
            max_iter: 1000,
            tol: 1e-6,
        }
    }
}

impl MinimizerConfig {
    /// Check option ranges.
    pub fn validate(&self) -> Result<()> {
        if self.strategy > MAX_STRATEGY {
            return Err(Error::Configuration(format!(
                "minimizer strategy must be 0..={}, got {}",
                MAX_STRATEGY, self.strategy
            )));
        }
        if self.optimize_const > 2 {
            return Err(Error::Configuration(format!(
                "optimize-constant level must be 0..=2, got {}",
                self.optimize_const
            )));
        }
        if !(0.0..1.0).contains(&self.jitter_fraction) {
            return Err(Error::Configuration(format!(
                "jitter fraction must be in [0, 1), got {}",
                self.jitter_fraction
            )));
        }
        if !(self.tol > 0.0 && self.tol.is_finite()) || self.max_iter == 0 {
            return Err(Error::Configuration(format!(
                "invalid optimizer tolerance/iterations: tol={} max_iter={}",
                self.tol, self.max_iter
            )));
        }
        Ok(())
    }

    fn base_optimizer(&self) -> OptimizerConfig {
        OptimizerConfig { max_iter: self.max_iter, tol: self.tol, ..OptimizerConfig::default() }
    }
}

/// One rung of the escalation ladder.
#[derive(Debug, Clone, PartialEq)]
pub struct Escalation {
    /// Zero-based attempt number.
    pub attempt: usize,
    /// Strategy level used for this attempt.
    pub strategy: u8,
    /// Perturb the start point before this attempt.
    pub jitter: bool,
    /// Backend settings derived from `strategy`.
    pub optimizer: OptimizerConfig,
}

/// Transition after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Stop: the attempt converged.
    Converged,
    /// Run another attempt with escalated settings.
    Retry(Escalation),
    /// Stop: retries used up.
    Exhausted,
}

/// Deterministic retry schedule: `Attempt(k) -> Converged | Retry(k+1) | Exhausted`.
///
/// Attempt `k` runs at strategy `min(base + k, 2)`; from the second retry on the
/// start point is jittered.
#[derive(Debug, Clone)]
pub struct RetryLadder {
    base_strategy: u8,
    max_retries: usize,
    base: OptimizerConfig,
}

impl RetryLadder {
    /// Ladder for a minimizer configuration.
    pub fn new(config: &MinimizerConfig) -> Self {
        Self {
            base_strategy: config.strategy.min(MAX_STRATEGY),
            max_retries: config.max_retries,
            base: config.base_optimizer(),
        }
    }

    fn rung(&self, attempt: usize) -> Escalation {
        let strategy = (self.base_strategy as usize + attempt).min(MAX_STRATEGY as usize) as u8;
        Escalation {
            attempt,
            strategy,
            jitter: attempt >= 2,
            optimizer: OptimizerConfig::for_strategy(&self.base, strategy),
        }
    }

    /// First attempt.
    pub fn first(&self) -> Escalation {
        self.rung(0)
    }

    /// Decide what follows `current`.
    pub fn step(&self, current: &Escalation, converged: bool) -> AttemptOutcome {
        if converged {
            AttemptOutcome::Converged
        } else if current.attempt >= self.max_retries {
            AttemptOutcome::Exhausted
        } else {
            AttemptOutcome::Retry(self.rung(current.attempt + 1))
        }
    }
}

/// Run-wide count of non-converged fits.
#[derive(Debug)]
pub struct FailureBudget {
    budget: usize,
    failed: AtomicUsize,
}

impl FailureBudget {
    /// Allow up to `budget` failed fits.
    pub fn new(budget: usize) -> Self {
        Self { budget, failed: AtomicUsize::new(0) }
    }

    /// Count `fit` if it did not converge; error once the budget is exceeded.
    pub fn record(&self, fit: &FitResult) -> Result<()> {
        if fit.converged() {
            return Ok(());
        }
        let failed = self.failed.fetch_add(1, Ordering::Relaxed) + 1;
        if failed > self.budget {
            return Err(Error::FitBudgetExhausted { failed, budget: self.budget });
        }
        Ok(())
    }

    /// Failed fits so far.
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Start-point predictor along a scan.
///
/// With one previous fit the next start is that fit; with two it is the linear
/// extrapolation in the scanned POI value.
#[derive(Debug, Clone, Default)]
pub struct PredictiveStart {
    history: Vec<(f64, Vec<f64>)>,
}

impl PredictiveStart {
    /// Remember the best fit at POI value `mu`.
    pub fn record(&mut self, mu: f64, values: &[f64]) {
        if self.history.len() == 2 {
            self.history.remove(0);
        }
        self.history.push((mu, values.to_vec()));
    }

    /// Predicted start for `mu`, clamped into `bounds`.
    pub fn predict(&self, mu: f64, bounds: &[(f64, f64)]) -> Option<Vec<f64>> {
        match self.history.as_slice() {
            [] => None,
            [(_, v)] => Some(clamp_params(v, bounds)),
            [(mu0, v0), (mu1, v1)] => {
                let dmu = mu1 - mu0;
                if dmu.abs() < 1e-12 {
                    return Some(clamp_params(v1, bounds));
                }
                let t = (mu - mu1) / dmu;
                let pred: Vec<f64> = v0.iter().zip(v1).map(|(a, b)| b + t * (b - a)).collect();
                Some(clamp_params(&pred, bounds))
            }
            _ => None,
        }
    }
}

#[derive(Default)]
struct EvalCache {
    params: Vec<f64>,
    value: f64,
    valid: bool,
}

/// NLL restricted to the floating parameters.
struct ProfiledObjective<'a, M: StatModel + ?Sized> {
    model: &'a M,
    data: &'a Dataset,
    full: Vec<f64>,
    floating: &'a [usize],
    offset: f64,
    cache: Option<Mutex<EvalCache>>,
}

impl<M: StatModel + ?Sized> ProfiledObjective<'_, M> {
    fn expand(&self, params: &[f64]) -> Vec<f64> {
        let mut full = self.full.clone();
        for (&i, &v) in self.floating.iter().zip(params) {
            full[i] = v;
        }
        full
    }

    fn raw_nll(&self, params: &[f64]) -> Result<f64> {
        let v = self.model.nll(&self.expand(params), self.data)?;
        if v.is_finite() {
            Ok(v)
        } else {
            Err(Error::Computation(format!("non-finite NLL on dataset '{}'", self.data.name)))
        }
    }
}

impl<M: StatModel + ?Sized> ObjectiveFunction for ProfiledObjective<'_, M> {
    fn eval(&self, params: &[f64]) -> Result<f64> {
        let Some(cache) = &self.cache else {
            return Ok(self.raw_nll(params)? - self.offset);
        };
        let mut c = cache.lock().map_err(|_| Error::Computation("NLL cache poisoned".into()))?;
        if c.valid && c.params == params {
            return Ok(c.value);
        }
        let value = self.raw_nll(params)? - self.offset;
        c.params = params.to_vec();
        c.value = value;
        c.valid = true;
        Ok(value)
    }
}

fn jitter_start(start: &[f64], bounds: &[(f64, f64)], fraction: f64, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let jittered: Vec<f64> = start
        .iter()
        .zip(bounds)
        .map(|(&x, &(lo, hi))| {
            let width = if (hi - lo).is_finite() { hi - lo } else { 2.0 * x.abs().max(1.0) };
            x + fraction * width * rng.gen_range(-1.0..1.0)
        })
        .collect();
    clamp_params(&jittered, bounds)
}

/// Retrying minimizer over a [`StatModel`].
pub struct RobustMinimizer<B: MinimizerBackend = LbfgsbOptimizer> {
    backend: B,
    config: MinimizerConfig,
    ladder: RetryLadder,
}

impl RobustMinimizer<LbfgsbOptimizer> {
    /// L-BFGS-B backed minimizer.
    pub fn new(config: MinimizerConfig) -> Self {
        Self::with_backend(LbfgsbOptimizer::new(), config)
    }
}

impl<B: MinimizerBackend> RobustMinimizer<B> {
    /// Minimizer with an explicit backend.
    pub fn with_backend(backend: B, config: MinimizerConfig) -> Self {
        let ladder = RetryLadder::new(&config);
        Self { backend, config, ladder }
    }

    /// Access the configuration.
    pub fn config(&self) -> &MinimizerConfig {
        &self.config
    }

    /// Access the backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Minimize the NLL of `data` over the floating parameters of `state`.
    ///
    /// Global observables carried by `data` are written into `state` first. On a
    /// usable result the best-fit values replace the floating values of `state`;
    /// a `Failed` result leaves them untouched.
    pub fn minimize<M: StatModel + ?Sized>(
        &self,
        model: &M,
        data: &Dataset,
        state: &mut ParameterState,
    ) -> Result<FitResult> {
        self.run(model, data, state, false)
    }

    /// Like [`Self::minimize`], plus a numerical Hessian for parameter errors.
    pub fn minimize_with_errors<M: StatModel + ?Sized>(
        &self,
        model: &M,
        data: &Dataset,
        state: &mut ParameterState,
    ) -> Result<FitResult> {
        self.run(model, data, state, true)
    }

    fn run<M: StatModel + ?Sized>(
        &self,
        model: &M,
        data: &Dataset,
        state: &mut ParameterState,
        hesse: bool,
    ) -> Result<FitResult> {
        if let Some(globs) = &data.global_observables {
            state.set_global_observables(globs)?;
        }

        let floating = state.floating_indices();
        let all_bounds = state.bounds();
        let bounds: Vec<(f64, f64)> = floating.iter().map(|&i| all_bounds[i]).collect();
        let full = state.values();

        if floating.is_empty() {
            let nll = model.nll(&full, data)?;
            let status = if nll.is_finite() { FitStatus::Converged } else { FitStatus::Failed };
            return Ok(FitResult {
                status,
                nll,
                parameters: full.clone(),
                uncertainties: vec![0.0; full.len()],
                covariance_quality: CovarianceQuality::NotComputed,
                n_attempts: 0,
                n_evaluations: 1,
            });
        }

        let start: Vec<f64> = clamp_params(
            &floating.iter().map(|&i| full[i]).collect::<Vec<_>>(),
            &bounds,
        );

        let mut objective = ProfiledObjective {
            model,
            data,
            full: full.clone(),
            floating: &floating,
            offset: 0.0,
            cache: (self.config.optimize_const > 0).then(|| Mutex::new(EvalCache::default())),
        };
        if self.config.nll_offset {
            match objective.raw_nll(&start) {
                Ok(v) => objective.offset = v,
                Err(e) => log::debug!("nll offset unavailable at start point: {}", e),
            }
        }

        let mut esc = self.ladder.first();
        let mut best: Option<OptimizationResult> = None;
        let mut next_start = start.clone();
        let mut attempts = 0usize;
        let mut evaluations = 0usize;
        let mut last_error: Option<Error> = None;

        loop {
            let x0 = if esc.jitter {
                jitter_start(
                    &next_start,
                    &bounds,
                    self.config.jitter_fraction,
                    self.config.seed.wrapping_add(esc.attempt as u64),
                )
            } else {
                next_start.clone()
            };

            attempts += 1;
            let converged = match self.backend.minimize(&objective, &x0, &bounds, &esc.optimizer) {
                Ok(r) => {
                    evaluations += r.n_fev;
                    if self.config.print_level >= 1 {
                        log::debug!(
                            "[{}] attempt {} strategy {}: {} ({})",
                            data.name,
                            esc.attempt,
                            esc.strategy,
                            r,
                            r.message
                        );
                    }
                    let converged = r.converged;
                    if !converged && !self.config.kill_below_fatal {
                        log::warn!(
                            "[{}] fit attempt {} (strategy {}) did not converge: {}",
                            data.name,
                            esc.attempt,
                            esc.strategy,
                            r.message
                        );
                    }
                    let better = match &best {
                        None => true,
                        Some(b) => converged || (!b.converged && r.fval < b.fval),
                    };
                    if better {
                        next_start = r.parameters.clone();
                        best = Some(r);
                    }
                    converged
                }
                Err(e) => {
                    if !self.config.kill_below_fatal {
                        log::warn!("[{}] fit attempt {} failed: {}", data.name, esc.attempt, e);
                    }
                    last_error = Some(e);
                    false
                }
            };

            match self.ladder.step(&esc, converged) {
                AttemptOutcome::Converged | AttemptOutcome::Exhausted => break,
                AttemptOutcome::Retry(next) => esc = next,
            }
        }

        let Some(best) = best else {
            log::warn!(
                "[{}] minimization failed after {} attempts: {}",
                data.name,
                attempts,
                last_error.map(|e| e.to_string()).unwrap_or_default()
            );
            // Best available value: the NLL at the start point, NaN if even that fails.
            let parameters = objective.expand(&start);
            let nll = objective.raw_nll(&start).unwrap_or(f64::NAN);
            return Ok(FitResult {
                status: FitStatus::Failed,
                nll,
                parameters,
                uncertainties: vec![0.0; full.len()],
                covariance_quality: CovarianceQuality::Unavailable,
                n_attempts: attempts,
                n_evaluations: evaluations,
            });
        };

        let status = if best.converged {
            FitStatus::Converged
        } else {
            log::warn!(
                "[{}] fit did not converge after {} attempts (best nll offset {:.6}): {}",
                data.name,
                attempts,
                best.fval,
                best.message
            );
            FitStatus::RetryLimitReached
        };

        let parameters = objective.expand(&best.parameters);
        state.set_values(&parameters)?;

        let (uncertainties, covariance_quality) = if hesse {
            let objective = ProfiledObjective { cache: None, ..objective };
            hesse_errors(&objective, &best.parameters, &floating, parameters.len())
        } else {
            (vec![0.0; parameters.len()], CovarianceQuality::NotComputed)
        };

        let nll = model.nll(&parameters, data)?;
        if self.config.print_level >= 0 {
            log::info!(
                "[{}] nll={:.6} status={:?} attempts={} backend={}",
                data.name,
                nll,
                status,
                attempts,
                self.backend.name()
            );
        }
        Ok(FitResult {
            status,
            nll,
            parameters,
            uncertainties,
            covariance_quality,
            n_attempts: attempts,
            n_evaluations: evaluations,
        })
    }
}

/// Central-difference Hessian over the floating parameters, inverted for errors.
fn hesse_errors<M: StatModel + ?Sized>(
    objective: &ProfiledObjective<'_, M>,
    at: &[f64],
    floating: &[usize],
    n_total: usize,
) -> (Vec<f64>, CovarianceQuality) {
    let n = at.len();
    let mut h = DMatrix::<f64>::zeros(n, n);
    let f = |x: &[f64]| objective.eval(x).unwrap_or(f64::NAN);
    let steps: Vec<f64> = at.iter().map(|x| 1e-4 * x.abs().max(1.0)).collect();
    let f0 = f(at);

    for i in 0..n {
        for j in i..n {
            let v = if i == j {
                let mut xp = at.to_vec();
                let mut xm = at.to_vec();
                xp[i] += steps[i];
                xm[i] -= steps[i];
                (f(&xp) - 2.0 * f0 + f(&xm)) / (steps[i] * steps[i])
            } else {
                let mut pp = at.to_vec();
                let mut pm = at.to_vec();
                let mut mp = at.to_vec();
                let mut mm = at.to_vec();
                pp[i] += steps[i];
                pp[j] += steps[j];
                pm[i] += steps[i];
                pm[j] -= steps[j];
                mp[i] -= steps[i];
                mp[j] += steps[j];
                mm[i] -= steps[i];
                mm[j] -= steps[j];
                (f(&pp) - f(&pm) - f(&mp) + f(&mm)) / (4.0 * steps[i] * steps[j])
            };
            h[(i, j)] = v;
            h[(j, i)] = v;
        }
    }

    let mut errors = vec![0.0; n_total];
    if h.iter().any(|v| !v.is_finite()) {
        return (errors, CovarianceQuality::Unavailable);
    }

    if let Some(cov) = h.clone().try_inverse() {
        let variances: Vec<f64> = (0..n).map(|i| cov[(i, i)]).collect();
        if variances.iter().all(|v| v.is_finite() && *v > 0.0) {
            for (k, &i) in floating.iter().enumerate() {
                errors[i] = variances[k].sqrt();
            }
            return (errors, CovarianceQuality::Accurate);
        }
    }

    log::warn!("Hessian inversion failed, using diagonal approximation");
    let mut any = false;
    for (k, &i) in floating.iter().enumerate() {
        let d = h[(k, k)];
        if d.is_finite() && d > 0.0 {
            errors[i] = 1.0 / d.sqrt();
            any = true;
        }
    }
    (errors, if any { CovarianceQuality::Approximate } else { CovarianceQuality::Unavailable })
}
