//! Expected limits: median and ±1σ/±2σ bands.
//!
//! The median comes from the background-only Asimov data, where `q_mu = q_mu,A`.
//! Bands use the closed form `μ_N = σ (Φ⁻¹(1 - α Φ(N)) + N)` or, with better
//! bands, a fresh Asimov dataset generated at the POI value where
//! `√q_mu,A = |N|`, scanned as if it were observed data.

use crate::asimov::{AsimovBuilder, profile_point};
use crate::asymptotics::{self, asimov_sigma, closed_form_band, normal_quantile};
use crate::optimizer::MinimizerBackend;
use crate::profile::{HypothesisTester, ProfiledData};
use crate::scanner::{Crossing, Direction, LimitPoint, LimitScanner, LimitStatus, ScanValue};
use qcls_core::{Conditioning, Dataset, ParameterState, Result, StatModel};
use serde::{Deserialize, Serialize};

/// A limit with the bookkeeping of the search that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitEstimate {
    /// Limit on the POI (`NaN` when the search failed).
    pub mu: f64,
    /// CLs evaluations used.
    pub iterations: usize,
    /// Non-converged fits met on the way.
    pub failed_fits: usize,
    /// Termination state.
    pub status: LimitStatus,
    /// Scan trace.
    pub trace: Vec<LimitPoint>,
}

impl LimitEstimate {
    /// Estimate from a finished crossing search.
    pub fn from_crossing(crossing: Crossing, failed_fits: usize) -> Self {
        let status = if failed_fits > 0 && crossing.status == LimitStatus::Converged {
            LimitStatus::FitFailure
        } else {
            crossing.status
        };
        Self { mu: crossing.mu, iterations: crossing.iterations, failed_fits, status, trace: crossing.trace }
    }

    /// Placeholder for a search that did not run to completion.
    pub fn failed() -> Self {
        Self { mu: f64::NAN, iterations: 0, failed_fits: 0, status: LimitStatus::Failed, trace: Vec::new() }
    }
}

/// Band settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandOptions {
    /// `1 - CL`.
    pub alpha: f64,
    /// Asimov-refined positive bands.
    pub better_bands: bool,
    /// Asimov-refined negative bands too.
    pub refine_negative: bool,
    /// Profile negative-band Asimov data at zero.
    pub profile_neg_at_zero: bool,
    /// Take negative-band nuisance values from the global fit to observed data.
    pub unconditional_negative: bool,
    /// Conditioning for the band Asimov data.
    pub conditioning: Conditioning,
}

/// Computes the median expected limit and its bands.
pub struct BandComputer<'t, 'a, M: StatModel + ?Sized, B: MinimizerBackend> {
    tester: &'t HypothesisTester<'a, M, B>,
    builder: &'t AsimovBuilder<'a, M, B>,
    scanner: LimitScanner,
    options: BandOptions,
}

impl<'t, 'a, M: StatModel + ?Sized, B: MinimizerBackend> BandComputer<'t, 'a, M, B> {
    /// Band computer over a tester and an Asimov builder.
    pub fn new(
        tester: &'t HypothesisTester<'a, M, B>,
        builder: &'t AsimovBuilder<'a, M, B>,
        scanner: LimitScanner,
        options: BandOptions,
    ) -> Self {
        Self { tester, builder, scanner, options }
    }

    fn z_median(&self) -> f64 {
        normal_quantile(1.0 - 0.5 * self.options.alpha)
    }

    /// Conditioning of the Asimov data for band `n_sigma`.
    ///
    /// Without observed data everything is nominal. Negative bands use the
    /// global fit when `unconditional_negative` is set.
    pub fn band_conditioning(&self, n_sigma: i32, has_observed: bool) -> Conditioning {
        match self.options.conditioning {
            Conditioning::Nominal => Conditioning::Nominal,
            _ if !has_observed => Conditioning::Nominal,
            _ if n_sigma < 0 && self.options.unconditional_negative => Conditioning::Unconditional,
            c => c,
        }
    }

    /// First guess of the median limit from the Asimov width at `at`.
    pub fn median_guess(&self, asimov: &mut ProfiledData, at: f64) -> Result<f64> {
        let at = if at > 0.0 && at.is_finite() { at } else { 1.0 };
        let q_a = self.tester.q_asimov(asimov, at)?;
        Ok(asimov_sigma(at, q_a).map_or(at, |sigma| sigma * self.z_median()))
    }

    /// Median expected limit on the background-only Asimov data.
    pub fn median(&self, asimov: &mut ProfiledData, guess: f64) -> Result<LimitEstimate> {
        asimov.reset_scan();
        let tester = self.tester;
        let crossing = self.scanner.find_crossing(self.options.alpha, guess, Direction::Positive, |mu| {
            median_point(tester, asimov, mu)
        })?;
        log::info!("median expected limit: {:.6} ({:?})", crossing.mu, crossing.status);
        Ok(LimitEstimate::from_crossing(crossing, asimov.failed_fits()))
    }

    /// CLs limit on `data`, with `q_mu,A` from `asimov`.
    pub fn limit_on(
        &self,
        data: &mut ProfiledData,
        asimov: &mut ProfiledData,
        guess: f64,
    ) -> Result<LimitEstimate> {
        data.reset_scan();
        asimov.reset_scan();
        let tester = self.tester;
        let crossing = self.scanner.find_crossing(self.options.alpha, guess, Direction::Positive, |mu| {
            let before = data.failed_fits() + asimov.failed_fits();
            let cls = tester.p_values(data, asimov, mu)?.cls;
            Ok(scan_value(cls, data.failed_fits() + asimov.failed_fits() == before))
        })?;
        Ok(LimitEstimate::from_crossing(crossing, data.failed_fits() + asimov.failed_fits()))
    }

    /// Expected limit at `n_sigma` given the median.
    ///
    /// `asimov` is the background-only Asimov data, `observed` the real data
    /// used for conditional Asimov generation (`None` when blind), `state` the
    /// run's starting parameter state.
    pub fn band(
        &self,
        n_sigma: i32,
        median: &LimitEstimate,
        asimov: &mut ProfiledData,
        observed: Option<&Dataset>,
        state: &ParameterState,
    ) -> Result<LimitEstimate> {
        let n = f64::from(n_sigma);
        let closed = closed_form_band(median.mu, n, self.options.alpha);
        let refine = self.options.better_bands && (n_sigma > 0 || self.options.refine_negative);
        if n_sigma == 0 {
            return Ok(median.clone());
        }
        if !refine || !median.mu.is_finite() {
            return Ok(LimitEstimate {
                mu: closed,
                iterations: 0,
                failed_fits: 0,
                status: median.status,
                trace: Vec::new(),
            });
        }

        // POI value where the Asimov statistic reaches |N|: 2 (1 - Φ(√q_A)) = 2 (1 - Φ(|N|)).
        asimov.reset_scan();
        let tester = self.tester;
        let target = 2.0 * asymptotics::normal_sf(n.abs());
        let guess = n * median.mu / self.z_median();
        let locate = self.scanner.find_crossing(target, guess, Direction::of(n), |mu| {
            median_point(tester, asimov, mu)
        })?;
        let mu_n = locate.mu;
        let mut failed_fits = asimov.failed_fits();
        log::debug!("band {:+}σ: Asimov POI value {:.6} ({:?})", n_sigma, mu_n, locate.status);

        let profile_mu = profile_point(mu_n, n_sigma < 0 && self.options.profile_neg_at_zero);
        let conditioning = self.band_conditioning(n_sigma, observed.is_some());
        let band_data = self.builder.build(mu_n, conditioning, profile_mu, observed, state)?;
        if let Some(fit) = &band_data.fit {
            tester.record_fit(fit)?;
            if !fit.converged() {
                failed_fits += 1;
            }
        }
        let mut band_profile = tester.profile(band_data.dataset, state, false)?;

        let mut estimate = self.limit_on(&mut band_profile, asimov, closed)?;
        estimate.iterations += locate.iterations;
        estimate.failed_fits += failed_fits;
        if estimate.status == LimitStatus::Converged {
            if failed_fits > 0 {
                estimate.status = LimitStatus::FitFailure;
            } else if locate.status != LimitStatus::Converged {
                estimate.status = locate.status;
            }
        }
        log::info!("expected limit {:+}σ: {:.6} (closed form {:.6})", n_sigma, estimate.mu, closed);
        Ok(estimate)
    }
}

fn scan_value(value: f64, reliable: bool) -> ScanValue {
    if reliable { ScanValue::from(value) } else { ScanValue::degraded(value) }
}

/// Median expected CLs at `mu`, flagged when its conditional fit failed.
fn median_point<M: StatModel + ?Sized, B: MinimizerBackend>(
    tester: &HypothesisTester<'_, M, B>,
    asimov: &mut ProfiledData,
    mu: f64,
) -> Result<ScanValue> {
    let before = asimov.failed_fits();
    let cls = tester.median_cls(asimov, mu)?;
    Ok(scan_value(cls, asimov.failed_fits() == before))
}
