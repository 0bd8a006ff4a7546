use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use qcls_core::{Conditioning, ModelConfig, StatModel};
use qcls_inference::{
    AsimovBuilder, AsymptoticLimitTool, FailureBudget, HypothesisTester, LimitConfig,
    MinimizerConfig, RobustMinimizer, TestStatistic,
};
use qcls_model::{CountingModel, DEFAULT_DATA_NAME, Workspace};
use std::hint::black_box;

fn load_counting_model() -> CountingModel {
    let json = include_str!("../../../tests/fixtures/counting_workspace.json");
    let ws: Workspace = serde_json::from_str(json).unwrap();
    CountingModel::from_workspace(&ws).unwrap()
}

fn bench_asimov_build(c: &mut Criterion) {
    let model = load_counting_model();
    let min = RobustMinimizer::new(MinimizerConfig::default());
    let state = model.parameters();
    let poi = state.index_of("mu").unwrap();
    let builder = AsimovBuilder::new(&model, &min, poi);

    c.bench_function("asimov_build_nominal_counting", |b| {
        b.iter(|| {
            let a = builder.build(black_box(0.0), Conditioning::Nominal, 0.0, None, &state).unwrap();
            black_box(a)
        })
    });
}

fn bench_cls_point(c: &mut Criterion) {
    let model = load_counting_model();
    let data = model.dataset(DEFAULT_DATA_NAME).unwrap();
    let min = RobustMinimizer::new(MinimizerConfig::default());
    let budget = FailureBudget::new(usize::MAX);
    let state = model.parameters();
    let poi = state.index_of("mu").unwrap();
    let tester = HypothesisTester::new(&model, &min, &budget, poi, TestStatistic::QmuTilde, false);
    let builder = AsimovBuilder::new(&model, &min, poi);
    let a0 = builder.build(0.0, Conditioning::Nominal, 0.0, None, &state).unwrap();
    let asimov = tester.profile(a0.dataset, &state, false).unwrap();
    let obs = tester.profile(data, &state, false).unwrap();

    let mut group = c.benchmark_group("cls_qtilde");
    for mu in [0.5f64, 1.0, 2.0, 4.0] {
        group.bench_with_input(BenchmarkId::new("counting", mu), &mu, |b, &m| {
            b.iter(|| {
                let mut o = obs.clone();
                let mut a = asimov.clone();
                black_box(tester.p_values(&mut o, &mut a, black_box(m)).unwrap())
            })
        });
    }
    group.finish();
}

fn bench_full_run(c: &mut Criterion) {
    let model = load_counting_model();
    let data = model.dataset(DEFAULT_DATA_NAME).unwrap();

    let mut group = c.benchmark_group("limit_run_counting");
    group.sample_size(10);
    for better_bands in [false, true] {
        let cfg = LimitConfig { do_blind: false, better_bands, ..LimitConfig::default() };
        let tool = AsymptoticLimitTool::new(cfg).unwrap();
        group.bench_with_input(BenchmarkId::new("better_bands", better_bands), &tool, |b, t| {
            b.iter(|| black_box(t.run(&model, &ModelConfig::default(), &data).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_asimov_build, bench_cls_point, bench_full_run);
criterion_main!(benches);
