//! Limits on the binned counting fixture (Poisson bins, normsys + histosys).

use qcls_core::{Conditioning, ModelConfig, PoiSpec, StatModel};
use qcls_inference::{
    AsimovBuilder, AsymptoticLimitTool, FailureBudget, HypothesisTester, LimitConfig, LimitRecord,
    LimitStatus, MinimizerConfig, RobustMinimizer, RunPhase, TestStatistic,
};
use qcls_model::counting::DEFAULT_DATA_NAME;
use qcls_model::schema::Workspace;
use qcls_model::CountingModel;
use qcls_model::simplemodels::single_channel;

fn load_fixture() -> CountingModel {
    let json = include_str!("../../../tests/fixtures/counting_workspace.json");
    let ws: Workspace = serde_json::from_str(json).unwrap();
    CountingModel::from_workspace(&ws).unwrap()
}

fn unblinded() -> LimitConfig {
    LimitConfig { do_blind: false, ..LimitConfig::default() }
}

#[test]
fn test_fixture_limits_are_ordered() {
    let model = load_fixture();
    let data = model.dataset(DEFAULT_DATA_NAME).unwrap();
    let tool = AsymptoticLimitTool::new(unblinded()).unwrap();
    let r = tool.run(&model, &ModelConfig::default(), &data).unwrap();

    assert_eq!(r.phase, RunPhase::Done);
    assert_eq!(r.poi, "mu");
    let mus: Vec<f64> = r.expected.iter().map(|b| b.estimate.mu).collect();
    assert_eq!(mus.len(), 5);
    assert!(mus.iter().all(|m| m.is_finite() && *m > 0.0), "bands: {:?}", mus);
    assert!(mus.windows(2).all(|w| w[0] < w[1]), "bands not ordered: {:?}", mus);
    let median = r.median().unwrap();
    assert!(median > 0.5 && median < 6.0, "median {}", median);

    let obs = r.observed.as_ref().unwrap();
    assert!(obs.mu.is_finite() && obs.mu > 0.0);
    // Small upward fluctuation in both bins.
    assert!(r.mu_hat.unwrap().value > 0.0);
    assert!(obs.mu > median);

    for b in &r.expected {
        assert_eq!(b.estimate.status, LimitStatus::Converged, "{:+}σ", b.n_sigma);
        assert!(b.estimate.iterations >= 2);
    }
    assert_eq!(r.failed_fits, 0);
}

#[test]
fn test_background_only_data_observed_near_median() {
    let model = load_fixture();
    let data = model.dataset("bkgOnly").unwrap();
    let tool = AsymptoticLimitTool::new(unblinded()).unwrap();
    let r = tool.run(&model, &ModelConfig::default(), &data).unwrap();
    let obs = r.observed.as_ref().unwrap().mu;
    let median = r.median().unwrap();
    assert!((obs - median).abs() / median < 0.02, "obs {} median {}", obs, median);
}

#[test]
fn test_snapshot_and_fixed_nuisance() {
    let model = load_fixture();
    let data = model.dataset(DEFAULT_DATA_NAME).unwrap();
    let tool = AsymptoticLimitTool::new(LimitConfig::default()).unwrap();

    let free = tool.run(&model, &ModelConfig::default(), &data).unwrap();
    let mc = ModelConfig {
        pois: vec![PoiSpec::floating("mu")],
        fixed_nuisances: vec!["bkg_norm".into()],
        snapshot: Some("nominalNuis".into()),
    };
    let fixed = tool.run(&model, &mc, &data).unwrap();
    // Removing a systematic tightens the expected limit.
    assert!(fixed.median().unwrap() < free.median().unwrap());
}

#[test]
fn test_cls_in_unit_interval_and_decreasing() {
    let model = load_fixture();
    let data = model.dataset(DEFAULT_DATA_NAME).unwrap();
    let min = RobustMinimizer::new(MinimizerConfig::default());
    let budget = FailureBudget::new(50);
    let state = model.parameters();
    let poi = state.index_of("mu").unwrap();
    let tester = HypothesisTester::new(&model, &min, &budget, poi, TestStatistic::QmuTilde, false);
    let builder = AsimovBuilder::new(&model, &min, poi);

    let a0 = builder.build(0.0, Conditioning::Nominal, 0.0, None, &state).unwrap();
    let mut asimov = tester.profile(a0.dataset, &state, false).unwrap();
    let mut obs = tester.profile(data, &state, false).unwrap();

    let mut prev = f64::INFINITY;
    for i in 1..=12 {
        let mu = 0.5 * f64::from(i);
        let p = tester.p_values(&mut obs, &mut asimov, mu).unwrap();
        assert!((0.0..=1.0).contains(&p.cls));
        assert!(p.clsb <= p.clb + 1e-12);
        assert!(p.cls <= prev + 1e-6, "CLs increased at mu={}", mu);
        prev = p.cls;
    }
    assert_eq!(budget.failed(), 0);
}

#[test]
fn test_record_from_counting_run() {
    let ws = single_channel(&[12.0], &[50.0], 0.1);
    let model = CountingModel::from_workspace(&ws).unwrap();
    let data = model.dataset(DEFAULT_DATA_NAME).unwrap();
    let cfg = LimitConfig::default();
    let r = AsymptoticLimitTool::new(cfg.clone()).unwrap().run(&model, &ModelConfig::default(), &data).unwrap();
    let rec = r.to_record(&cfg);

    assert_eq!(rec.folder, "limits");
    assert_eq!(rec.name, "results");
    assert!(rec.blind);
    assert_eq!(rec.obs_limit, None);
    let exp = [rec.exp_limit_m2, rec.exp_limit_m1, rec.exp_limit_0, rec.exp_limit_p1, rec.exp_limit_p2];
    assert!(exp.iter().all(Option::is_some));
    assert_eq!(rec.reliable.len(), 5);

    let back: LimitRecord = serde_json::from_str(&serde_json::to_string(&rec).unwrap()).unwrap();
    assert_eq!(back, rec);
}

#[test]
fn test_refined_negative_bands_on_fixture() {
    let model = load_fixture();
    let data = model.dataset(DEFAULT_DATA_NAME).unwrap();
    let closed_negative = AsymptoticLimitTool::new(unblinded())
        .unwrap()
        .run(&model, &ModelConfig::default(), &data)
        .unwrap();

    for cfg in [
        LimitConfig { better_negative_bands: true, ..unblinded() },
        LimitConfig { profile_neg_at_zero: true, ..unblinded() },
    ] {
        let r = AsymptoticLimitTool::new(cfg).unwrap().run(&model, &ModelConfig::default(), &data).unwrap();
        assert_eq!(r.phase, RunPhase::Done);
        let mus: Vec<f64> = r.expected.iter().map(|b| b.estimate.mu).collect();
        assert!(mus.iter().all(|m| m.is_finite() && *m > 0.0), "bands: {:?}", mus);
        assert!(mus.windows(2).all(|w| w[0] < w[1]), "bands not ordered: {:?}", mus);
        for n in [-2, -1] {
            let refined = r.expected_at(n).unwrap();
            assert!(refined.iterations > 0);
            // Poisson bins: refinement moves the band, but not far from the closed form.
            let closed = closed_negative.expected_at(n).unwrap().mu;
            assert!((refined.mu - closed).abs() / closed < 0.25, "{:+}σ: {} vs {}", n, refined.mu, closed);
        }
        assert_eq!(r.median(), closed_negative.median());
    }
}

#[test]
fn test_predictive_fit_on_fixture() {
    let model = load_fixture();
    let data = model.dataset(DEFAULT_DATA_NAME).unwrap();
    let base = LimitConfig { parallel: false, ..unblinded() };
    let plain = AsymptoticLimitTool::new(base.clone()).unwrap();
    let predictive = AsymptoticLimitTool::new(LimitConfig { use_predictive_fit: true, ..base }).unwrap();
    let a = plain.run(&model, &ModelConfig::default(), &data).unwrap();
    let b = predictive.run(&model, &ModelConfig::default(), &data).unwrap();

    assert_eq!(b.phase, RunPhase::Done);
    for (x, y) in a.expected.iter().zip(&b.expected) {
        let (p, q) = (x.estimate.mu, y.estimate.mu);
        assert!((p - q).abs() / p < 0.01, "{:+}σ: {} vs {}", x.n_sigma, p, q);
    }
    let (p, q) = (a.observed.unwrap().mu, b.observed.unwrap().mu);
    assert!((p - q).abs() / p < 0.01, "observed: {} vs {}", p, q);
}
