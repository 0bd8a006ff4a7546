//! Asymptotic CLs upper limits: the run entry point.
//!
//! [`AsymptoticLimitTool::run`] validates the configuration and the model,
//! prepares one parameter state, builds the background-only Asimov data and
//! then computes the median expected limit, the four bands and (unblinded)
//! the observed limit. Bands and the observed scan are independent and run on
//! the rayon pool, each on its own clone of the fit state.

use crate::asimov::AsimovBuilder;
use crate::bands::{BandComputer, BandOptions, LimitEstimate};
use crate::config::LimitConfig;
use crate::minimizer::{FailureBudget, RobustMinimizer};
use crate::optimizer::{LbfgsbOptimizer, MinimizerBackend};
use crate::profile::{HypothesisTester, ProfiledData};
use crate::record::LimitRecord;
use crate::scanner::{LimitScanner, LimitStatus};
use crate::test_statistic::TestStatistic;
use qcls_core::{
    Conditioning, Dataset, Error, ModelConfig, ParamRole, ParameterState, Result, StatModel,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Run state machine.
///
/// `Init -> ModelValidated -> {ObservedScan | ExpectedScan} -> Done | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Nothing checked yet.
    Init,
    /// Configuration and model accepted.
    ModelValidated,
    /// Observed limit being computed.
    ObservedScan,
    /// Expected limits being computed.
    ExpectedScan,
    /// All requested limits attempted.
    Done,
    /// Aborted after the fit-failure budget ran out.
    Failed,
}

/// Expected limit at one band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandLimit {
    /// Band offset in standard deviations (0 = median).
    pub n_sigma: i32,
    /// The limit.
    pub estimate: LimitEstimate,
}

/// Best fit of the POI on observed data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoiFit {
    /// `μ̂`.
    pub value: f64,
    /// Hessian error on `μ̂` (0 when unavailable).
    pub error: f64,
}

/// Outcome of a limit run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitResult {
    /// Final run state.
    pub phase: RunPhase,
    /// Every state the run entered, in order.
    #[serde(default)]
    pub phases: Vec<RunPhase>,
    /// Scanned POI.
    pub poi: String,
    /// Exclusion confidence level.
    pub target_cl: f64,
    /// Observed limit (absent when blind or disabled).
    pub observed: Option<LimitEstimate>,
    /// Expected limits in `-2σ, -1σ, median, +1σ, +2σ` order (empty when disabled).
    pub expected: Vec<BandLimit>,
    /// Unconditional POI fit on observed data (absent when blind).
    pub mu_hat: Option<PoiFit>,
    /// Non-converged fits over the whole run.
    pub failed_fits: usize,
    /// Observed data was never read.
    pub blind: bool,
}

impl LimitResult {
    /// Expected limit at `n_sigma`.
    pub fn expected_at(&self, n_sigma: i32) -> Option<&LimitEstimate> {
        self.expected.iter().find(|b| b.n_sigma == n_sigma).map(|b| &b.estimate)
    }

    /// Median expected limit.
    pub fn median(&self) -> Option<f64> {
        self.expected_at(0).map(|e| e.mu)
    }

    /// Persistable record.
    pub fn to_record(&self, config: &LimitConfig) -> LimitRecord {
        LimitRecord::from_result(self, &config.folder_name, &config.record_name)
    }
}

/// Parameter state and POI index prepared for a run.
#[derive(Debug, Clone)]
pub struct PreparedModel {
    /// Starting state (snapshot applied, roles' constant flags set).
    pub state: ParameterState,
    /// Index of the scanned POI.
    pub poi: usize,
}

/// Check the model and turn a [`ModelConfig`] into a starting state.
///
/// Global observables are held constant, nuisance parameters float unless
/// listed as fixed, and POIs are constant unless named by the configuration
/// (or, with none named, the first POI of the model floats). The scanned
/// parameter is the first floating descriptor naming a POI of the model.
pub fn prepare_model<M: StatModel + ?Sized>(model: &M, model_config: &ModelConfig) -> Result<PreparedModel> {
    let mut state = match &model_config.snapshot {
        Some(name) => model.snapshot(name).ok_or_else(|| {
            Error::ModelValidation(format!("snapshot '{}' does not exist in the model", name))
        })?,
        None => model.parameters(),
    };
    validate_model(model, &state)?;

    state.set_all_constant(ParamRole::GlobalObservable, true);
    state.set_all_constant(ParamRole::Nuisance, false);
    state.set_all_constant(ParamRole::Poi, true);

    for name in &model_config.fixed_nuisances {
        match state.index_of(name) {
            Some(i) if state.parameters()[i].role == ParamRole::Nuisance => {
                log::info!("fixing nuisance parameter {}", name);
                state.set_constant(i, true)?;
            }
            Some(_) => log::warn!("'{}' is not a nuisance parameter; not fixing it", name),
            None => log::warn!("no nuisance parameter matches '{}'", name),
        }
    }

    let mut scanned: Option<usize> = None;
    if model_config.pois.is_empty() {
        let first = state.indices_by_role(ParamRole::Poi)[0];
        log::info!("no POI specified; floating the first POI '{}'", state.parameters()[first].name);
        state.set_constant(first, false)?;
        scanned = Some(first);
    }
    for spec in &model_config.pois {
        let Some(idx) = state.index_of(&spec.name) else {
            log::warn!("variable '{}' not in model; skipping", spec.name);
            continue;
        };
        let role = state.parameters()[idx].role;
        if role == ParamRole::GlobalObservable {
            log::warn!("'{}' is a global observable; ignoring its descriptor", spec.name);
            continue;
        }
        if let Some((lo, hi)) = spec.range {
            state
                .set_range(idx, lo, hi)
                .map_err(|e| Error::ModelValidation(format!("POI '{}': {}", spec.name, e)))?;
        }
        if let Some(v) = spec.value {
            state.set_value(idx, v)?;
        }
        state.set_constant(idx, spec.constant)?;
        if role != ParamRole::Poi {
            log::info!("'{}' is not a POI; it is configured but not scanned", spec.name);
        } else if !spec.constant {
            scanned.get_or_insert(idx);
        }
    }
    let poi = scanned.ok_or_else(|| {
        Error::ModelValidation("no floating POI of the model among the requested descriptors".to_string())
    })?;

    Ok(PreparedModel { state, poi })
}

fn validate_model<M: StatModel + ?Sized>(model: &M, state: &ParameterState) -> Result<()> {
    if state.indices_by_role(ParamRole::Poi).is_empty() {
        return Err(Error::ModelValidation("model has no parameters of interest".to_string()));
    }
    if model.n_main() == 0 {
        return Err(Error::ModelValidation("model has no main observations".to_string()));
    }
    for p in state.parameters() {
        let (lo, hi) = p.bounds;
        if !(lo.is_finite() && hi.is_finite() && lo < hi) {
            return Err(Error::ModelValidation(format!(
                "parameter '{}' has malformed range [{}, {}]",
                p.name, lo, hi
            )));
        }
        if !(p.value.is_finite() && p.value >= lo && p.value <= hi) {
            return Err(Error::ModelValidation(format!(
                "parameter '{}' value {} outside its range [{}, {}]",
                p.name, p.value, lo, hi
            )));
        }
    }
    let n_globs = state.indices_by_role(ParamRole::GlobalObservable).len();
    let globs = model.asimov_global_observables(&state.values())?;
    if globs.len() != n_globs {
        return Err(Error::ModelValidation(format!(
            "model reports {} global observables, parameter state has {}",
            globs.len(),
            n_globs
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Observed,
    Band(i32),
}

const BAND_TASKS: [i32; 4] = [2, 1, -1, -2];

/// Asymptotic CLs limit calculator.
pub struct AsymptoticLimitTool<B: MinimizerBackend = LbfgsbOptimizer> {
    config: LimitConfig,
    minimizer: RobustMinimizer<B>,
}

impl AsymptoticLimitTool<LbfgsbOptimizer> {
    /// Tool with the default optimizer backend.
    pub fn new(config: LimitConfig) -> Result<Self> {
        let minimizer = RobustMinimizer::new(config.minimizer.clone());
        Self::with_minimizer(config, minimizer)
    }
}

impl<B: MinimizerBackend> AsymptoticLimitTool<B> {
    /// Tool with an explicit minimizer; the configuration is validated here.
    pub fn with_minimizer(config: LimitConfig, minimizer: RobustMinimizer<B>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, minimizer })
    }

    /// Run configuration.
    pub fn config(&self) -> &LimitConfig {
        &self.config
    }

    /// Minimizer used for every fit.
    pub fn minimizer(&self) -> &RobustMinimizer<B> {
        &self.minimizer
    }

    /// Compute the limits.
    ///
    /// Configuration and model-validation problems are returned as errors before
    /// any fit. Once fitting has started the run always returns a
    /// [`LimitResult`]; an exhausted fit-failure budget ends it in
    /// [`RunPhase::Failed`] with whatever limits were completed.
    pub fn run<M: StatModel + ?Sized>(
        &self,
        model: &M,
        model_config: &ModelConfig,
        data: &Dataset,
    ) -> Result<LimitResult> {
        let cfg = &self.config;
        let mut phases = vec![RunPhase::Init];
        log::debug!("run phase {:?}", RunPhase::Init);

        let prepared = prepare_model(model, model_config)?;
        if data.main.len() != model.n_main() {
            return Err(Error::ModelValidation(format!(
                "dataset '{}' has {} observations, model expects {}",
                data.name,
                data.main.len(),
                model.n_main()
            )));
        }
        let poi = prepared.poi;
        let state = prepared.state;
        let poi_name = state.parameters()[poi].name.clone();
        advance(&mut phases, RunPhase::ModelValidated);

        // Observed data is unreachable from here on when blind.
        let observed: Option<&Dataset> = if cfg.do_blind { None } else { Some(data) };
        if cfg.do_blind {
            log::info!("blind run: observed data will not be read");
        }

        let budget = FailureBudget::new(cfg.max_failed_fits);
        let statistic = TestStatistic::from_tilde(cfg.do_tilde);
        let tester =
            HypothesisTester::new(model, &self.minimizer, &budget, poi, statistic, cfg.use_predictive_fit);
        let builder = AsimovBuilder::new(model, &self.minimizer, poi);
        let scanner = LimitScanner::new(cfg.precision, cfg.max_iterations)?;
        let conditioning = if cfg.conditional_expected() {
            Conditioning::Conditional
        } else {
            Conditioning::Nominal
        };
        let bands = BandComputer::new(
            &tester,
            &builder,
            scanner,
            BandOptions {
                alpha: cfg.alpha(),
                better_bands: cfg.better_bands,
                refine_negative: cfg.refine_negative_bands(),
                profile_neg_at_zero: cfg.profile_neg_at_zero,
                unconditional_negative: cfg.better_negative_bands,
                conditioning,
            },
        );

        let mut result = LimitResult {
            phase: RunPhase::ModelValidated,
            phases: Vec::new(),
            poi: poi_name,
            target_cl: cfg.target_cl,
            observed: None,
            expected: Vec::new(),
            mu_hat: None,
            failed_fits: 0,
            blind: cfg.do_blind,
        };

        let outcome = self.compute(&tester, &builder, &bands, &state, observed, conditioning, &mut result, &mut phases);
        result.failed_fits = budget.failed();
        match outcome {
            Ok(()) => advance(&mut phases, RunPhase::Done),
            Err(e @ Error::FitBudgetExhausted { .. }) => {
                log::error!("limit run aborted: {}", e);
                advance(&mut phases, RunPhase::Failed);
            }
            Err(e) => return Err(e),
        }
        result.phase = phases.last().copied().unwrap_or(RunPhase::Init);
        result.phases = phases;
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn compute<M: StatModel + ?Sized>(
        &self,
        tester: &HypothesisTester<'_, M, B>,
        builder: &AsimovBuilder<'_, M, B>,
        bands: &BandComputer<'_, '_, M, B>,
        state: &ParameterState,
        observed: Option<&Dataset>,
        conditioning: Conditioning,
        result: &mut LimitResult,
        phases: &mut Vec<RunPhase>,
    ) -> Result<()> {
        let cfg = &self.config;
        let poi = tester.poi();

        // Background-only Asimov data, the reference for every q_mu,A.
        let asimov0 = builder.build(0.0, conditioning, 0.0, observed, state)?;
        if let Some(fit) = &asimov0.fit {
            tester.record_fit(fit)?;
        }
        let mut asimov = tester.profile(asimov0.dataset, state, false)?;

        let mut observed_profile: Option<ProfiledData> = None;
        if cfg.observed_enabled() {
            if let Some(data) = observed {
                let p = tester.profile(data.clone(), state, true)?;
                let fit = p.unconditional();
                let mu_hat = PoiFit { value: fit.parameters[poi], error: fit.uncertainties[poi] };
                log::info!("mu_hat = {:.6} +/- {:.6}", mu_hat.value, mu_hat.error);
                result.mu_hat = Some(mu_hat);
                observed_profile = Some(p);
            }
        }

        let start_mu = state.value(poi);
        let guess = bands.median_guess(&mut asimov, start_mu)?;

        let median = if cfg.do_exp {
            advance(phases, RunPhase::ExpectedScan);
            let m = match bands.median(&mut asimov, guess) {
                Ok(m) => m,
                Err(e @ Error::FitBudgetExhausted { .. }) => {
                    result.expected.push(BandLimit { n_sigma: 0, estimate: LimitEstimate::failed() });
                    return Err(e);
                }
                Err(e) => {
                    log::error!("median expected limit failed: {}", e);
                    LimitEstimate::failed()
                }
            };
            Some(m)
        } else {
            None
        };

        let mut tasks: Vec<Task> = Vec::new();
        if observed_profile.is_some() {
            tasks.push(Task::Observed);
        }
        if median.is_some() {
            tasks.extend(BAND_TASKS.iter().map(|&n| Task::Band(n)));
        }
        if tasks.contains(&Task::Observed) {
            advance(phases, RunPhase::ObservedScan);
        }

        let obs_guess = median.as_ref().map(|m| m.mu).filter(|m| m.is_finite()).unwrap_or(guess);
        let run_task = |task: Task| -> (Task, Result<LimitEstimate>) {
            let mut asimov = asimov.clone();
            let r = match task {
                Task::Observed => match &observed_profile {
                    Some(p) => {
                        let mut p = p.clone();
                        bands.limit_on(&mut p, &mut asimov, obs_guess)
                    }
                    None => Err(Error::Computation("observed data unavailable".into())),
                },
                Task::Band(n) => match &median {
                    Some(m) => bands.band(n, m, &mut asimov, observed, state),
                    None => Err(Error::Computation("median expected limit unavailable".into())),
                },
            };
            (task, r)
        };

        let outcomes: Vec<(Task, Result<LimitEstimate>)> = if cfg.parallel {
            tasks.par_iter().map(|&t| run_task(t)).collect()
        } else {
            tasks.iter().map(|&t| run_task(t)).collect()
        };

        let mut budget_error: Option<Error> = None;
        let mut band_results: Vec<BandLimit> = Vec::new();
        for (task, r) in outcomes {
            let estimate = match r {
                Ok(e) => e,
                Err(e @ Error::FitBudgetExhausted { .. }) => {
                    budget_error.get_or_insert(e);
                    LimitEstimate::failed()
                }
                Err(e) => {
                    log::error!("{:?} limit failed: {}", task, e);
                    LimitEstimate::failed()
                }
            };
            match task {
                Task::Observed => {
                    log::info!("observed limit: {:.6} ({:?})", estimate.mu, estimate.status);
                    result.observed = Some(estimate);
                }
                Task::Band(n) => band_results.push(BandLimit { n_sigma: n, estimate }),
            }
        }
        if let Some(m) = median {
            band_results.push(BandLimit { n_sigma: 0, estimate: m });
            band_results.sort_by_key(|b| b.n_sigma);
            result.expected = band_results;
        }

        for b in &result.expected {
            if b.estimate.status != LimitStatus::Converged {
                log::warn!("expected limit {:+}σ is unreliable: {:?}", b.n_sigma, b.estimate.status);
            }
        }

        match budget_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn advance(phases: &mut Vec<RunPhase>, to: RunPhase) {
    if let Some(from) = phases.last() {
        log::debug!("run phase {:?} -> {:?}", from, to);
    }
    phases.push(to);
}
