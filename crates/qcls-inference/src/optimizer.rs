//! Optimization backend
//!
//! One bounded minimization per call. [`LbfgsbOptimizer`] runs argmin's L-BFGS
//! with a More-Thuente line search; box constraints are enforced by clamping
//! every evaluation point and projecting the gradient at active bounds. Retries,
//! offsets and caching live one level up in [`crate::minimizer`].

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use qcls_core::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Backend settings for a single attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerConfig {
    /// Iteration cap.
    pub max_iter: u64,
    /// Gradient-norm tolerance.
    pub tol: f64,
    /// L-BFGS history length.
    pub m: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { max_iter: 1000, tol: 1e-6, m: 10 }
    }
}

impl OptimizerConfig {
    /// Settings for a minimizer strategy level (0 = fast, 2 = careful).
    ///
    /// Each level above 0 tightens the tolerance tenfold and extends the
    /// iteration cap and the curvature history.
    pub fn for_strategy(base: &OptimizerConfig, strategy: u8) -> Self {
        match strategy {
            0 => base.clone(),
            1 => Self { max_iter: base.max_iter * 2, tol: base.tol * 0.1, m: base.m.max(15) },
            _ => Self { max_iter: base.max_iter * 5, tol: base.tol * 0.01, m: base.m.max(20) },
        }
    }

    /// Cost-change tolerance handed to argmin alongside `tol`.
    fn cost_tolerance(&self) -> f64 {
        if self.tol == 0.0 { 0.0 } else { (0.1 * self.tol).max(1e-12) }
    }
}

/// Outcome of one backend attempt.
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    /// Best point found, inside the bounds.
    pub parameters: Vec<f64>,
    /// Objective at `parameters`.
    pub fval: f64,
    /// Solver iterations.
    pub n_iter: u64,
    /// Objective evaluations.
    pub n_fev: usize,
    /// Gradient evaluations.
    pub n_gev: usize,
    /// Solver reported convergence at a finite value.
    pub converged: bool,
    /// Solver termination reason.
    pub message: String,
}

impl fmt::Display for OptimizationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fval={:.6} iter={} fev={} gev={} converged={} ({})",
            self.fval, self.n_iter, self.n_fev, self.n_gev, self.converged, self.message
        )
    }
}

/// Scalar objective over the floating parameters.
pub trait ObjectiveFunction: Send + Sync {
    /// Value at `params`.
    fn eval(&self, params: &[f64]) -> Result<f64>;

    /// Gradient at `params`. Defaults to central differences.
    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        central_difference(|p| self.eval(p), params)
    }
}

/// Central-difference gradient with a step scaled to each coordinate.
fn central_difference<F>(mut f: F, params: &[f64]) -> Result<Vec<f64>>
where
    F: FnMut(&[f64]) -> Result<f64>,
{
    let mut point = params.to_vec();
    let mut grad = Vec::with_capacity(params.len());
    for i in 0..params.len() {
        let x = params[i];
        let h = 1e-8 * x.abs().max(1.0);
        point[i] = x + h;
        let up = f(&point)?;
        point[i] = x - h;
        let down = f(&point)?;
        point[i] = x;
        grad.push((up - down) / (2.0 * h));
    }
    Ok(grad)
}

/// A minimization backend: one call, one attempt, no retries.
pub trait MinimizerBackend: Send + Sync {
    /// Minimize `objective` from `init` inside `bounds`.
    fn minimize(
        &self,
        objective: &dyn ObjectiveFunction,
        init: &[f64],
        bounds: &[(f64, f64)],
        config: &OptimizerConfig,
    ) -> Result<OptimizationResult>;

    /// Backend name for logs.
    fn name(&self) -> &str;
}

pub(crate) fn clamp_params(params: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    params.iter().zip(bounds).map(|(&v, &(lo, hi))| v.clamp(lo, hi)).collect()
}

/// Zero gradient components that push out of the box at an active bound.
fn project_gradient(grad: &mut [f64], point: &[f64], bounds: &[(f64, f64)]) {
    const AT_BOUND: f64 = 1e-12;
    for ((g, &x), &(lo, hi)) in grad.iter_mut().zip(point).zip(bounds) {
        let pushes_below = x <= lo + AT_BOUND && *g > 0.0;
        let pushes_above = x >= hi - AT_BOUND && *g < 0.0;
        if pushes_below || pushes_above {
            *g = 0.0;
        }
    }
}

fn to_argmin(e: Error) -> argmin::core::Error {
    argmin::core::Error::msg(e.to_string())
}

#[derive(Default)]
struct EvalCounters {
    cost: AtomicUsize,
    grad: AtomicUsize,
}

/// Objective seen through the box: argmin only ever evaluates clamped points.
struct BoxedObjective<'a> {
    objective: &'a dyn ObjectiveFunction,
    bounds: &'a [(f64, f64)],
    counters: &'a EvalCounters,
}

impl CostFunction for BoxedObjective<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<f64, argmin::core::Error> {
        self.counters.cost.fetch_add(1, Ordering::Relaxed);
        self.objective.eval(&clamp_params(params, self.bounds)).map_err(to_argmin)
    }
}

impl Gradient for BoxedObjective<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, params: &Self::Param) -> std::result::Result<Vec<f64>, argmin::core::Error> {
        self.counters.grad.fetch_add(1, Ordering::Relaxed);
        let point = clamp_params(params, self.bounds);
        let mut g = self.objective.gradient(&point).map_err(to_argmin)?;
        project_gradient(&mut g, &point, self.bounds);
        Ok(g)
    }
}

/// L-BFGS with box constraints (bounds via clamping).
#[derive(Debug, Clone, Copy, Default)]
pub struct LbfgsbOptimizer;

impl LbfgsbOptimizer {
    /// Create the optimizer
    pub fn new() -> Self {
        Self
    }
}

fn converged(best_cost: f64, status: &TerminationStatus) -> bool {
    best_cost.is_finite()
        && matches!(
            status,
            TerminationStatus::Terminated(
                TerminationReason::SolverConverged | TerminationReason::TargetCostReached
            )
        )
}

impl MinimizerBackend for LbfgsbOptimizer {
    fn minimize(
        &self,
        objective: &dyn ObjectiveFunction,
        init: &[f64],
        bounds: &[(f64, f64)],
        config: &OptimizerConfig,
    ) -> Result<OptimizationResult> {
        if init.len() != bounds.len() {
            return Err(Error::Validation(format!(
                "start point has {} values for {} bounds",
                init.len(),
                bounds.len()
            )));
        }

        let counters = EvalCounters::default();
        let problem = BoxedObjective { objective, bounds, counters: &counters };
        let solver = LBFGS::new(MoreThuenteLineSearch::new(), config.m)
            .with_tolerance_grad(config.tol)
            .and_then(|s| s.with_tolerance_cost(config.cost_tolerance()))
            .map_err(|e| Error::Configuration(format!("optimizer tolerance: {e}")))?;

        let start = clamp_params(init, bounds);
        let res = Executor::new(problem, solver)
            .configure(|state| state.param(start).max_iters(config.max_iter))
            .run()
            .map_err(|e| Error::Computation(format!("L-BFGS run failed: {e}")))?;

        let state = res.state();
        let best = state
            .get_best_param()
            .ok_or_else(|| Error::Computation("L-BFGS returned no best point".to_string()))?;
        let fval = state.get_best_cost();
        let status = state.get_termination_status();

        Ok(OptimizationResult {
            parameters: clamp_params(best, bounds),
            fval,
            n_iter: state.get_iter(),
            n_fev: counters.cost.load(Ordering::Relaxed),
            n_gev: counters.grad.load(Ordering::Relaxed),
            converged: converged(fval, status),
            message: status.to_string(),
        })
    }

    fn name(&self) -> &str {
        "lbfgsb"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Gaussian NLL in (mu, theta) with analytic gradient, minimum at (1.2, -0.4).
    struct TwoParamNll;

    impl ObjectiveFunction for TwoParamNll {
        fn eval(&self, p: &[f64]) -> Result<f64> {
            Ok(0.5 * (p[0] - 1.2).powi(2) + 0.5 * ((p[1] + 0.4) / 0.5).powi(2))
        }

        fn gradient(&self, p: &[f64]) -> Result<Vec<f64>> {
            Ok(vec![p[0] - 1.2, (p[1] + 0.4) / 0.25])
        }
    }

    #[test]
    fn test_free_minimum() {
        let r = LbfgsbOptimizer
            .minimize(&TwoParamNll, &[0.0, 0.0], &[(-10.0, 10.0), (-5.0, 5.0)], &OptimizerConfig::default())
            .unwrap();
        assert!(r.converged, "{}", r);
        assert_relative_eq!(r.parameters[0], 1.2, epsilon = 1e-4);
        assert_relative_eq!(r.parameters[1], -0.4, epsilon = 1e-4);
        assert!(r.n_fev > 0 && r.n_gev > 0);
    }

    #[test]
    fn test_poi_bound_is_active() {
        // mu >= 2 pins the POI at the bound; theta is unaffected.
        let r = LbfgsbOptimizer
            .minimize(&TwoParamNll, &[3.0, 0.0], &[(2.0, 10.0), (-5.0, 5.0)], &OptimizerConfig::default())
            .unwrap();
        assert!(r.converged, "{}", r);
        assert_relative_eq!(r.parameters[0], 2.0, epsilon = 1e-6);
        assert_relative_eq!(r.parameters[1], -0.4, epsilon = 1e-4);
    }

    struct PoissonNll {
        n: f64,
    }

    impl ObjectiveFunction for PoissonNll {
        fn eval(&self, p: &[f64]) -> Result<f64> {
            let lam = p[0];
            Ok(lam - self.n * lam.ln())
        }
    }

    #[test]
    fn test_numeric_gradient_path() {
        let r = LbfgsbOptimizer
            .minimize(&PoissonNll { n: 7.0 }, &[2.0], &[(1e-3, 50.0)], &OptimizerConfig::default())
            .unwrap();
        assert!(r.converged, "{}", r);
        assert_relative_eq!(r.parameters[0], 7.0, epsilon = 1e-3);
    }

    #[test]
    fn test_central_difference_matches_analytic() {
        let p = [0.3, 0.7];
        let numeric = central_difference(|x| TwoParamNll.eval(x), &p).unwrap();
        let exact = TwoParamNll.gradient(&p).unwrap();
        for (a, b) in numeric.iter().zip(&exact) {
            assert_relative_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_projection_only_at_active_bounds() {
        let bounds = [(0.0, 1.0), (0.0, 1.0), (0.0, 1.0)];
        let mut g = vec![1.0, -1.0, 1.0];
        project_gradient(&mut g, &[0.0, 1.0, 0.5], &bounds);
        assert_eq!(g, vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_strategy_levels_tighten() {
        let base = OptimizerConfig::default();
        let s1 = OptimizerConfig::for_strategy(&base, 1);
        let s2 = OptimizerConfig::for_strategy(&base, 2);
        assert_eq!(OptimizerConfig::for_strategy(&base, 0), base);
        assert!(s1.tol < base.tol && s2.tol < s1.tol);
        assert!(s2.max_iter > s1.max_iter && s1.max_iter > base.max_iter);
        assert_eq!(OptimizerConfig::for_strategy(&base, 7), s2);
    }

    #[test]
    fn test_length_mismatch_is_error() {
        let r = LbfgsbOptimizer.minimize(&TwoParamNll, &[0.0], &[(0.0, 1.0), (0.0, 1.0)], &OptimizerConfig::default());
        assert!(matches!(r, Err(Error::Validation(_))));
    }
}
