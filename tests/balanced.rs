mod common;

use common::{base, consts, cross, list, power, run, source, Unpacked};
use ndarray::Array1;
use num_complex::Complex64;
use roachcal::experiment::balanced::{BmNoise, BmTone};
use roachcal_json::{Config, SimModel, Status};
use std::path::Path;

fn balanced(datadir: &Path) -> Config {
    let mut config = base(datadir, SimModel::Balanced);
    config.cal_pow_info = Some(power(list(&["a2", "b2"]), 7));
    config.crosspow_info = Some(cross(list(&["ab_re", "ab_im"]), 7));
    config.synth_info = Some(power(list(&["out2"]), 7));
    config.const_brams_info = Some(consts(list(&["c_re", "c_im"]), 7));
    config
}

#[tokio::test]
async fn noise_calibration_cancels() {
    let datadir = tempfile::tempdir().unwrap();
    let archive = run(balanced(datadir.path()), BmNoise).await.unwrap();
    let bundle = Unpacked::new(&archive).await;
    assert_eq!(bundle.testinfo().status, Status::Complete);

    let mut npz = bundle.npz("cancellation.npz");
    let cancellation: Array1<f64> = npz.by_name("cancellation").unwrap();
    assert_eq!(cancellation.len(), 128);
    assert!(
        cancellation.iter().all(|&db| db > 20.0),
        "cancellation {cancellation}"
    );

    // the measured ideal output is the one predicted from the input spectra
    let ideal: Array1<f64> = npz.by_name("ideal").unwrap();
    let predicted: Array1<f64> = npz.by_name("predicted_ideal").unwrap();
    for (measured, predicted) in ideal.iter().zip(predicted.iter()) {
        approx::assert_relative_eq!(*measured, *predicted, max_relative = 1e-3);
    }

    let mut params = bundle.npz("ab_params.npz");
    // the ideal coefficient adds the input powers, up to the path imbalance
    let aa: Array1<f64> = params.by_name("aa").unwrap();
    let bb: Array1<f64> = params.by_name("bb").unwrap();
    for k in 1..ideal.len() {
        let ratio_db = 10.0 * (ideal[k] / (aa[k] + bb[k])).log10();
        assert!(ratio_db.abs() < 0.5, "channel {k}: ideal / (aa + bb) = {ratio_db} dB");
    }

    let coefficients: Array1<Complex64> = params.by_name("consts").unwrap();
    // the second input is in quadrature with a 0.5 dB, 5 degree imbalance
    let expected = Complex64::from_polar(10f64.powf(-0.5 / 20.0), 85f64.to_radians());
    for c in coefficients.iter().skip(1) {
        approx::assert_abs_diff_eq!(c.re, expected.re, epsilon = 0.05);
        approx::assert_abs_diff_eq!(c.im, expected.im, epsilon = 0.05);
    }
    assert!(bundle.root.join("cal_rawdata").join("noise.npz").is_file());
}

#[tokio::test]
async fn tone_calibration_rejects_rf() {
    let datadir = tempfile::tempdir().unwrap();
    let mut config = balanced(datadir.path());
    config.rf_source = Some(source(100.0, Vec::new()));
    config.test_source = Some(source(100.0, Vec::new()));
    config.cal_chnl_step = 16;
    config.syn_chnl_step = 32;
    let archive = run(config, BmTone).await.unwrap();
    let bundle = Unpacked::new(&archive).await;
    assert_eq!(bundle.testinfo().experiment, "bm_calibrator");

    let mut srr = bundle.npz("srr.npz");
    let rejection: Array1<f64> = srr.by_name("rejection").unwrap();
    assert_eq!(rejection.len(), 4);
    assert!(rejection.iter().all(|&db| db > 20.0), "rejection {rejection}");
}

#[tokio::test]
async fn tone_calibration_needs_test_source() {
    let datadir = tempfile::tempdir().unwrap();
    let mut config = balanced(datadir.path());
    config.rf_source = Some(source(100.0, Vec::new()));
    let err = run(config, BmTone).await.unwrap_err();
    assert!(err.to_string().contains("test_source"));
}
