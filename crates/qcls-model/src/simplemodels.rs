//! Simple workspace builders for quick experiments and tests.

use super::schema::{Channel, Measurement, Modifier, NormSysData, Observation, Sample, Workspace};

/// Single-channel workspace: a signal sample scaled by `mu` and one background
/// sample with a normalisation uncertainty (`normsys`, relative `bkg_rel_unc`).
///
/// Observations default to the background-only expectation.
///
/// # Panics
/// Panics if `signal` and `bkg` have different lengths or are empty.
pub fn single_channel(signal: &[f64], bkg: &[f64], bkg_rel_unc: f64) -> Workspace {
    assert!(!signal.is_empty(), "signal must not be empty");
    assert_eq!(signal.len(), bkg.len(), "signal and bkg must have the same length");

    Workspace {
        channels: vec![Channel {
            name: "singlechannel".to_string(),
            samples: vec![
                Sample {
                    name: "signal".to_string(),
                    data: signal.to_vec(),
                    modifiers: vec![Modifier::NormFactor { name: "mu".to_string() }],
                },
                Sample {
                    name: "background".to_string(),
                    data: bkg.to_vec(),
                    modifiers: vec![Modifier::NormSys {
                        name: "bkg_norm".to_string(),
                        data: NormSysData { hi: 1.0 + bkg_rel_unc, lo: 1.0 - bkg_rel_unc },
                    }],
                },
            ],
        }],
        observations: vec![Observation { name: "singlechannel".to_string(), data: bkg.to_vec() }],
        datasets: vec![],
        measurement: Measurement {
            name: "Measurement".to_string(),
            poi: "mu".to_string(),
            parameters: vec![],
        },
        snapshots: vec![],
        version: Some("1.0.0".to_string()),
    }
}
