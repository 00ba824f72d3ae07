mod common;

use common::{base, cross, list, power, run, source, Unpacked};
use ndarray::{Array1, Array2};
use roachcal::experiment::adcsync::{AdcSync, Domain};
use roachcal_json::{Config, SimModel, SnapshotInfo, Status};
use std::path::Path;

fn adcs(datadir: &Path, delays: Vec<i64>) -> Config {
    let mut config = base(datadir, SimModel::Adc);
    config.snapshots = (0..2)
        .map(|j| SnapshotInfo {
            zdok: j,
            names: vec![format!("adc{j}_snap")],
            delay_reg: Some(format!("adc{j}_delay")),
        })
        .collect();
    config.sim.adc_delays = delays;
    config
}

#[tokio::test]
async fn frequency_domain_sync() {
    let datadir = tempfile::tempdir().unwrap();
    let mut config = adcs(datadir.path(), vec![0, 30]);
    config.rf_source = Some(source(100.0, Vec::new()));
    config.cal_pow_info = Some(power(list(&["adc0_pow", "adc1_pow"]), 10));
    config.crosspow_info = Some(cross(list(&["x01_re", "x01_im"]), 10));
    config.cal_chnl_start = 1;
    config.cal_chnl_stop = Some(100);
    config.cal_chnl_step = 10;

    let archive = run(config, AdcSync::new(Domain::Frequency)).await.unwrap();
    let bundle = Unpacked::new(&archive).await;
    let info = bundle.testinfo();
    assert_eq!(info.experiment, "adc_sync_freq");
    assert_eq!(info.status, Status::Complete);
    assert_eq!(info.nchannels, 1024);

    let mut npz = bundle.npz("adcsync.npz");
    let delays: Array1<i64> = npz.by_name("delays").unwrap();
    assert_eq!(delays.to_vec(), vec![30, 0]);
    let lags: Array2<i64> = npz.by_name("lags").unwrap();
    assert_eq!(lags.row(0).to_vec(), vec![0, 30]);
    // one correcting iteration and five with zero lags
    let iterations: Array1<i64> = npz.by_name("iterations").unwrap();
    assert_eq!(iterations[0], 6);
    assert!(lags.rows().into_iter().skip(1).all(|row| row.iter().all(|&l| l == 0)));
    assert!(bundle.root.join("cal_rawdata").join("iter00_chnl_0001.npz").is_file());
}

#[tokio::test]
async fn time_domain_sync() {
    let datadir = tempfile::tempdir().unwrap();
    let mut config = adcs(datadir.path(), vec![0, 12]);
    config.snap_trig_reg = Some("snap_trig".to_string());
    config.snap_samples = 1024;

    let archive = run(config, AdcSync::new(Domain::Time)).await.unwrap();
    let bundle = Unpacked::new(&archive).await;
    assert_eq!(bundle.testinfo().experiment, "adc_sync_time");
    let mut npz = bundle.npz("adcsync.npz");
    let delays: Array1<i64> = npz.by_name("delays").unwrap();
    assert_eq!(delays.to_vec(), vec![12, 0]);
    let lags: Array2<i64> = npz.by_name("lags").unwrap();
    assert_eq!(lags.row(0).to_vec(), vec![0, 12]);
}

#[tokio::test]
async fn reference_must_be_first_snapshot() {
    let datadir = tempfile::tempdir().unwrap();
    let mut config = adcs(datadir.path(), vec![0, 0]);
    config.rf_source = Some(source(100.0, Vec::new()));
    config.cal_pow_info = Some(power(list(&["adc0_pow", "adc1_pow"]), 6));
    config.crosspow_info = Some(cross(list(&["x01_re", "x01_im"]), 6));
    config.cal_adcs = vec![1, 0];
    let err = run(config, AdcSync::new(Domain::Frequency))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("reference"));
    // the configuration is rejected before any bundle is created
    assert!(common::archives(datadir.path()).is_empty());
}
