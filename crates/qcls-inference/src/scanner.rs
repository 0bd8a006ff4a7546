//! Root finding along the POI axis.
//!
//! [`LimitScanner`] locates the POI value where a decreasing confidence
//! function (CLs, or an expected-CLs proxy) crosses a target. The function is
//! mapped to `z = Φ⁻¹(1 - value)`, which is close to linear in the POI for
//! asymptotic CLs, and the bracket is narrowed by safeguarded interpolation in
//! `z` until its width is within `precision * mu`.

use crate::asymptotics::normal_quantile;
use qcls_core::{Error, Result};
use serde::{Deserialize, Serialize};

const VALUE_FLOOR: f64 = 1e-300;
const VALUE_CEIL: f64 = 1.0 - 1e-15;
const MONOTONE_TOL: f64 = 1e-6;
const MIN_T: f64 = 1e-9;

/// One evaluated point of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitPoint {
    /// Tested POI value.
    pub mu: f64,
    /// Function value (CLs) at `mu`.
    pub cls: f64,
    /// `false` when a fit behind this value did not converge.
    #[serde(default = "default_reliable")]
    pub reliable: bool,
}

fn default_reliable() -> bool {
    true
}

/// Value returned by a scanned function, with the quality of the fits behind it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanValue {
    /// Function value.
    pub value: f64,
    /// All fits behind `value` converged.
    pub reliable: bool,
}

impl ScanValue {
    /// Value computed from at least one non-converged fit.
    pub fn degraded(value: f64) -> Self {
        Self { value, reliable: false }
    }
}

impl From<f64> for ScanValue {
    fn from(value: f64) -> Self {
        Self { value, reliable: true }
    }
}

/// How a limit search ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitStatus {
    /// Bracket narrowed to the requested precision.
    Converged,
    /// Iteration cap hit first; the value is the best estimate so far.
    MaxIterations,
    /// The trace was not non-increasing; the crossing may be wrong.
    NonMonotone,
    /// A fit needed by the scan did not converge.
    FitFailure,
    /// No estimate (aborted run or evaluation error).
    Failed,
}

impl LimitStatus {
    /// `true` only for a clean convergence.
    pub fn is_reliable(self) -> bool {
        self == Self::Converged
    }
}

/// Side of zero to search on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `mu > 0`.
    Positive,
    /// `mu < 0`.
    Negative,
}

impl Direction {
    /// Direction of the sign of `x` (zero counts as positive).
    pub fn of(x: f64) -> Self {
        if x < 0.0 { Self::Negative } else { Self::Positive }
    }

    fn sign(self) -> f64 {
        match self {
            Self::Positive => 1.0,
            Self::Negative => -1.0,
        }
    }
}

/// Result of one crossing search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Crossing {
    /// POI value of the crossing.
    pub mu: f64,
    /// Function evaluations used.
    pub iterations: usize,
    /// Evaluated points in evaluation order.
    pub trace: Vec<LimitPoint>,
    /// Termination state.
    pub status: LimitStatus,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    t: f64,
    z: f64,
}

/// `z = Φ⁻¹(1 - value)`, evaluated as `-Φ⁻¹(value)` to keep small values resolved.
fn to_z(value: f64) -> f64 {
    -normal_quantile(value.clamp(VALUE_FLOOR, VALUE_CEIL))
}

/// Crossing search with a relative precision on the POI.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitScanner {
    precision: f64,
    max_iterations: usize,
}

impl LimitScanner {
    /// Scanner stopping at bracket width `precision * mu` or `max_iterations` evaluations.
    pub fn new(precision: f64, max_iterations: usize) -> Result<Self> {
        if !(precision > 0.0 && precision < 1.0) {
            return Err(Error::Configuration(format!(
                "precision must be in (0, 1), got {}",
                precision
            )));
        }
        if max_iterations < 2 {
            return Err(Error::Configuration(format!(
                "max iterations must be >= 2, got {}",
                max_iterations
            )));
        }
        Ok(Self { precision, max_iterations })
    }

    /// Relative precision.
    pub fn precision(&self) -> f64 {
        self.precision
    }

    /// Find `mu` with `f(mu) = target`, starting at `guess`.
    ///
    /// `f` must decrease away from zero in `direction` and exceed `target` near
    /// zero. Errors from `f` abort the search; values marked unreliable are
    /// used as they are and flagged in the trace.
    pub fn find_crossing<F, V>(&self, target: f64, guess: f64, direction: Direction, mut f: F) -> Result<Crossing>
    where
        F: FnMut(f64) -> Result<V>,
        V: Into<ScanValue>,
    {
        if !(target > 0.0 && target < 1.0) {
            return Err(Error::Configuration(format!("target must be in (0, 1), got {}", target)));
        }
        let sign = direction.sign();
        let z_target = to_z(target);

        let mut t = sign * guess;
        if !(t.is_finite() && t > MIN_T) {
            t = 1.0;
        }

        let mut trace: Vec<LimitPoint> = Vec::new();
        let mut below: Vec<Node> = Vec::new();
        let mut lo: Option<Node> = None;
        let mut hi: Option<Node> = None;
        let mut last_moved_lo: Option<bool> = None;
        let mut same_side = 0usize;
        let mut converged = false;

        while trace.len() < self.max_iterations {
            let ScanValue { value, reliable } = f(sign * t)?.into();
            if value.is_nan() {
                return Err(Error::Computation(format!("NaN CLs at mu={}", sign * t)));
            }
            if !reliable {
                log::warn!("CLs at mu={} comes from a non-converged fit", sign * t);
            }
            trace.push(LimitPoint { mu: sign * t, cls: value, reliable });
            let node = Node { t, z: to_z(value) };

            let moved_lo = value > target;
            if moved_lo {
                lo = Some(node);
            } else {
                hi = Some(node);
                below.push(node);
            }
            same_side = if last_moved_lo == Some(moved_lo) { same_side + 1 } else { 0 };
            last_moved_lo = Some(moved_lo);

            if value == target {
                converged = true;
                break;
            }

            t = match (lo, hi) {
                (Some(l), Some(h)) => {
                    let tol = self.precision * l.t;
                    if h.t - l.t <= tol {
                        converged = true;
                        break;
                    }
                    let mut next = if same_side >= 2 || h.z <= l.z {
                        0.5 * (l.t + h.t)
                    } else {
                        let guess = l.t + (z_target - l.z) * (h.t - l.t) / (h.z - l.z);
                        // step past the estimate toward the stale end
                        if moved_lo { guess + 0.5 * tol } else { guess - 0.5 * tol }
                    };
                    let margin = (0.25 * tol).min(0.25 * (h.t - l.t));
                    next = next.clamp(l.t + margin, h.t - margin);
                    next
                }
                (Some(l), None) => {
                    let secant = trace_secant(&trace, sign, z_target).filter(|s| *s > l.t);
                    secant.map_or(2.0 * l.t, |s| s.clamp(1.1 * l.t, 4.0 * l.t))
                }
                (None, Some(h)) => {
                    let secant = nodes_secant(&below, z_target).filter(|s| *s > 0.0 && *s < h.t);
                    let next = secant.map_or(0.5 * h.t, |s| s.clamp(0.25 * h.t, 0.9 * h.t));
                    if next < MIN_T {
                        return Err(Error::Computation(format!(
                            "no crossing of {} found on the {:?} side of zero",
                            target, direction
                        )));
                    }
                    next
                }
                (None, None) => {
                    return Err(Error::Computation("limit scan lost its bracket".into()));
                }
            };
        }

        let iterations = trace.len();
        let t_final = match (lo, hi) {
            (Some(l), Some(h)) => {
                let est = if h.z > l.z {
                    l.t + (z_target - l.z) * (h.t - l.t) / (h.z - l.z)
                } else {
                    0.5 * (l.t + h.t)
                };
                est.clamp(l.t, h.t)
            }
            (Some(l), None) => l.t,
            (None, Some(h)) => h.t,
            (None, None) => {
                return Err(Error::Computation("limit scan evaluated no points".into()));
            }
        };
        let t_final = match trace.last() {
            Some(p) if p.cls == target => sign * p.mu,
            _ => t_final,
        };

        let mut status = if converged { LimitStatus::Converged } else { LimitStatus::MaxIterations };
        if !converged {
            log::warn!(
                "limit scan stopped after {} evaluations without reaching precision {}",
                iterations,
                self.precision
            );
        }
        if let Some((a, b)) = first_violation(&trace, sign) {
            log::warn!(
                "non-monotone CLs trace: CLs({})={:.6} < CLs({})={:.6}",
                a.mu,
                a.cls,
                b.mu,
                b.cls
            );
            status = LimitStatus::NonMonotone;
        }

        Ok(Crossing { mu: sign * t_final, iterations, trace, status })
    }
}

/// Secant through the last two points of the trace, in `z`.
fn trace_secant(trace: &[LimitPoint], sign: f64, z_target: f64) -> Option<f64> {
    let n = trace.len();
    if n < 2 {
        return None;
    }
    let a = Node { t: sign * trace[n - 2].mu, z: to_z(trace[n - 2].cls) };
    let b = Node { t: sign * trace[n - 1].mu, z: to_z(trace[n - 1].cls) };
    secant(a, b, z_target)
}

fn nodes_secant(nodes: &[Node], z_target: f64) -> Option<f64> {
    match nodes {
        [.., a, b] => secant(*a, *b, z_target),
        _ => None,
    }
}

fn secant(a: Node, b: Node, z_target: f64) -> Option<f64> {
    let dz = b.z - a.z;
    let dt = b.t - a.t;
    if dz.abs() < 1e-12 || dt.abs() < 1e-15 {
        return None;
    }
    let s = b.t + (z_target - b.z) * dt / dz;
    s.is_finite().then_some(s)
}

/// First pair `(a, b)` with `|a.mu| < |b.mu|` but `a.cls < b.cls` beyond tolerance.
fn first_violation(trace: &[LimitPoint], sign: f64) -> Option<(LimitPoint, LimitPoint)> {
    let mut sorted = trace.to_vec();
    sorted.sort_by(|a, b| (sign * a.mu).total_cmp(&(sign * b.mu)));
    sorted.windows(2).find(|w| w[1].cls > w[0].cls + MONOTONE_TOL).map(|w| (w[0], w[1]))
}

/// Check a trace for a CLs increase along `direction`.
pub fn is_monotone(trace: &[LimitPoint], direction: Direction) -> bool {
    first_violation(trace, direction.sign()).is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asymptotics::{median_cls, normal_quantile, normal_sf};
    use approx::assert_relative_eq;

    fn scanner() -> LimitScanner {
        LimitScanner::new(0.005, 100).unwrap()
    }

    #[test]
    fn test_precision_on_analytic_cls() {
        // Unit Gaussian median CLs: 2 (1 - Φ(mu)); crossing at Φ⁻¹(0.975).
        let truth = normal_quantile(0.975);
        for guess in [0.1, 1.0, 1.96, 5.0, 50.0] {
            let c = scanner()
                .find_crossing(0.05, guess, Direction::Positive, |mu| Ok(median_cls(mu * mu)))
                .unwrap();
            assert_eq!(c.status, LimitStatus::Converged);
            assert!((c.mu - truth).abs() / truth <= 0.005, "guess {}: {} vs {}", guess, c.mu, truth);
            assert_eq!(c.iterations, c.trace.len());
        }
    }

    #[test]
    fn test_clsb_crossing() {
        let truth = normal_quantile(0.95);
        let c = scanner()
            .find_crossing(0.05, 1.0, Direction::Positive, |mu| Ok(normal_sf(mu)))
            .unwrap();
        assert_relative_eq!(c.mu, truth, max_relative = 0.005);
    }

    #[test]
    fn test_non_linear_function() {
        // CLs(mu) = exp(-mu^3); crossing at (ln 20)^(1/3).
        let truth = 20.0_f64.ln().cbrt();
        let c = scanner()
            .find_crossing(0.05, 0.3, Direction::Positive, |mu: f64| Ok((-mu.powi(3)).exp()))
            .unwrap();
        assert_eq!(c.status, LimitStatus::Converged);
        assert!((c.mu - truth).abs() / truth <= 0.005);
    }

    #[test]
    fn test_negative_direction() {
        let truth = -1.0;
        let c = scanner()
            .find_crossing(
                2.0 * normal_sf(1.0),
                -0.5,
                Direction::Negative,
                |mu: f64| Ok(2.0 * normal_sf(mu.abs())),
            )
            .unwrap();
        assert!(c.mu < 0.0);
        assert!((c.mu - truth).abs() <= 0.005);
        assert!(c.trace.iter().all(|p| p.mu < 0.0));
    }

    #[test]
    fn test_max_iterations_is_reported() {
        let s = LimitScanner::new(1e-6, 3).unwrap();
        let c = s
            .find_crossing(0.05, 100.0, Direction::Positive, |mu| Ok(median_cls(mu * mu)))
            .unwrap();
        assert_eq!(c.status, LimitStatus::MaxIterations);
        assert_eq!(c.iterations, 3);
        assert!(c.mu.is_finite());
    }

    #[test]
    fn test_non_monotone_trace_detected() {
        // CLs rises between the first two expansion points.
        let f = |mu: f64| {
            Ok(if mu < 1.5 {
                0.3
            } else if mu < 3.0 {
                0.4
            } else {
                0.01
            })
        };
        let c = scanner().find_crossing(0.05, 1.0, Direction::Positive, f).unwrap();
        assert_eq!(c.status, LimitStatus::NonMonotone);
        assert!(!c.status.is_reliable());
        assert!((c.mu - 3.0).abs() <= 0.02);
    }

    #[test]
    fn test_errors_propagate() {
        let r = scanner().find_crossing(0.05, 1.0, Direction::Positive, |_| {
            Err::<f64, _>(Error::Computation("boom".into()))
        });
        assert!(r.is_err());
        assert!(scanner().find_crossing(0.05, 1.0, Direction::Positive, |_| Ok(f64::NAN)).is_err());
        assert!(LimitScanner::new(0.0, 10).is_err());
        assert!(scanner().find_crossing(1.5, 1.0, Direction::Positive, |_| Ok(0.5)).is_err());
    }

    #[test]
    fn test_monotone_helper() {
        let p = |mu, cls| LimitPoint { mu, cls, reliable: true };
        let t = [p(1.0, 0.5), p(2.0, 0.1)];
        assert!(is_monotone(&t, Direction::Positive));
        let t = [p(1.0, 0.1), p(2.0, 0.5)];
        assert!(!is_monotone(&t, Direction::Positive));
    }

    #[test]
    fn test_degraded_points_are_flagged_in_trace() {
        // Every evaluation above mu = 2.5 reports a non-converged fit.
        let truth = normal_quantile(0.975);
        let c = scanner()
            .find_crossing(0.05, 3.0, Direction::Positive, |mu: f64| {
                let v = median_cls(mu * mu);
                Ok(if mu > 2.5 { ScanValue::degraded(v) } else { ScanValue::from(v) })
            })
            .unwrap();
        assert!((c.mu - truth).abs() / truth <= 0.005);
        assert!(!c.trace[0].reliable);
        assert!(c.trace.iter().all(|p| p.reliable == (p.mu <= 2.5)));
    }

    #[test]
    fn test_trace_points_without_flag_deserialize_as_reliable() {
        let p: LimitPoint = serde_json::from_str(r#"{"mu": 1.5, "cls": 0.2}"#).unwrap();
        assert!(p.reliable);
    }
}
