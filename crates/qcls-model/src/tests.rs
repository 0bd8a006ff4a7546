//! Tests for the counting workspace parser and model

use super::schema::*;
use super::simplemodels::single_channel;
use super::*;
use approx::assert_relative_eq;
use qcls_core::{ParamRole, StatModel};

fn load_counting_workspace() -> Workspace {
    let json = include_str!("../../../tests/fixtures/counting_workspace.json");
    serde_json::from_str(json).expect("Failed to parse counting_workspace.json")
}

#[test]
fn test_parse_counting_workspace() {
    let ws = load_counting_workspace();
    assert_eq!(ws.channels.len(), 1);
    assert_eq!(ws.channels[0].samples.len(), 2);
    assert_eq!(ws.observations[0].data, vec![53.0, 65.0]);
    assert_eq!(ws.measurement.poi, "mu");
    assert_eq!(ws.datasets[0].name, "bkgOnly");
    assert_eq!(ws.snapshots[0].name, "nominalNuis");
}

#[test]
fn test_model_parameter_layout() {
    let model = CountingModel::from_workspace(&load_counting_workspace()).unwrap();
    let s = model.parameters();
    let names: Vec<&str> = s.parameters().iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["mu", "bkg_norm", "bkg_shape", "nom_bkg_norm", "nom_bkg_shape"]);
    assert_eq!(s.indices_by_role(ParamRole::Poi), vec![0]);
    assert_eq!(s.indices_by_role(ParamRole::GlobalObservable), vec![3, 4]);
    assert_eq!(s.get(0).unwrap().bounds, (-10.0, 10.0));
    assert_eq!(model.n_main(), 2);
}

#[test]
fn test_expected_main_nominal_and_shifted() {
    let model = CountingModel::from_workspace(&load_counting_workspace()).unwrap();
    let exp = model.expected_main(&[1.0, 0.0, 0.0, 0.0, 0.0]).unwrap();
    assert_relative_eq!(exp[0], 55.0, epsilon = 1e-12);
    assert_relative_eq!(exp[1], 70.0, epsilon = 1e-12);

    // normsys +1 sigma scales background by 1.1, histosys +1 uses hi template.
    let exp = model.expected_main(&[0.0, 1.0, 1.0, 0.0, 0.0]).unwrap();
    assert_relative_eq!(exp[0], 52.0 * 1.1, epsilon = 1e-9);
    assert_relative_eq!(exp[1], 61.0 * 1.1, epsilon = 1e-9);

    let exp = model.expected_main(&[0.0, 0.0, -0.5, 0.0, 0.0]).unwrap();
    assert_relative_eq!(exp[0], 49.0, epsilon = 1e-9);
}

#[test]
fn test_nll_minimum_near_truth_for_asimov_like_data() {
    let model = CountingModel::from_workspace(&load_counting_workspace()).unwrap();
    let d = model.dataset("bkgOnly").unwrap();
    let at_zero = model.nll(&[0.0, 0.0, 0.0, 0.0, 0.0], &d).unwrap();
    let at_one = model.nll(&[1.0, 0.0, 0.0, 0.0, 0.0], &d).unwrap();
    assert!(at_one > at_zero);
}

#[test]
fn test_asimov_globs_follow_nuisances() {
    let model = CountingModel::from_workspace(&load_counting_workspace()).unwrap();
    let globs = model.asimov_global_observables(&[1.0, 0.3, -0.2, 0.0, 0.0]).unwrap();
    assert_eq!(globs, vec![0.3, -0.2]);
}

#[test]
fn test_snapshot_and_unknown_dataset() {
    let model = CountingModel::from_workspace(&load_counting_workspace()).unwrap();
    let snap = model.snapshot("nominalNuis").unwrap();
    assert_eq!(snap.value(0), 0.0);
    assert!(model.snapshot("missing").is_none());
    assert!(model.dataset("nope").is_err());
    assert_eq!(model.dataset(DEFAULT_DATA_NAME).unwrap().main, vec![53.0, 65.0]);
}

#[test]
fn test_missing_poi_rejected() {
    let mut ws = single_channel(&[1.0], &[10.0], 0.1);
    ws.measurement.poi = "xsec".to_string();
    assert!(CountingModel::from_workspace(&ws).is_err());
}

#[test]
fn test_bin_mismatch_rejected() {
    let mut ws = single_channel(&[1.0, 2.0], &[10.0, 12.0], 0.1);
    ws.observations[0].data = vec![10.0];
    assert!(CountingModel::from_workspace(&ws).is_err());
}
