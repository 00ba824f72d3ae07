mod common;

use common::{base, cross, list, power, run, source, Unpacked};
use ndarray::Array2;
use roachcal::{config::Settings, error, experiment::stability::Stability};
use roachcal_json::{Config, SimModel, Status};
use std::{path::Path, time::Duration};
use tokio_util::sync::CancellationToken;

fn stability(datadir: &Path) -> Config {
    let mut config = base(datadir, SimModel::Sideband);
    config.rf_source = Some(source(5100.0, Vec::new()));
    config.cal_pow_info = Some(power(list(&["a2", "b2"]), 6));
    config.crosspow_info = Some(cross(list(&["ab_re", "ab_im"]), 6));
    config.stability_chnl = Some(10);
    config.stability_iters = 3;
    config
}

#[tokio::test]
async fn one_directory_per_lo_combination() {
    let datadir = tempfile::tempdir().unwrap();
    let mut config = stability(datadir.path());
    config.lo_sources = vec![
        source(5000.0, vec![5000.0, 5500.0, 6000.0]),
        source(1000.0, vec![1000.0, 1500.0]),
    ];
    config.rf_source = Some(source(6100.0, Vec::new()));
    let archive = run(config, Stability).await.unwrap();

    // only the archive is left in the data directory
    let entries: Vec<_> = std::fs::read_dir(datadir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(common::archives(datadir.path()), vec![archive.clone()]);

    let bundle = Unpacked::new(&archive).await;
    let info = bundle.testinfo();
    assert_eq!(info.status, Status::Complete);
    assert_eq!(info.error, None);
    assert_eq!(info.lo_combinations.len(), 6);
    let dirs = bundle.subdirs();
    assert_eq!(dirs.len(), 6);
    assert!(dirs.contains(&"LO1_5GHZ_LO2_1.5GHZ".to_string()));
    assert!(dirs.contains(&"LO1_6GHZ_LO2_1GHZ".to_string()));
    for dir in &dirs {
        let mut npz = bundle.npz(Path::new(dir).join("stability.npz"));
        let magnitude: Array2<f64> = npz.by_name("magnitude").unwrap();
        assert_eq!(magnitude.dim(), (3, 1));
    }
}

#[tokio::test]
async fn stability_of_sideband_leakage() {
    let datadir = tempfile::tempdir().unwrap();
    let mut config = stability(datadir.path());
    config.lo_sources = vec![source(5000.0, vec![5000.0])];
    let archive = run(config, Stability).await.unwrap();
    let bundle = Unpacked::new(&archive).await;
    let mut npz = bundle.npz(Path::new("LO1_5GHZ").join("stability.npz"));
    let magnitude: Array2<f64> = npz.by_name("magnitude").unwrap();
    let phase: Array2<f64> = npz.by_name("phase").unwrap();
    // b / a of an upper sideband tone is the conjugate of the leakage
    for (m, p) in magnitude.iter().zip(phase.iter()) {
        approx::assert_abs_diff_eq!(*m, -20.0, epsilon = 0.01);
        approx::assert_abs_diff_eq!(*p, -30.0, epsilon = 0.1);
    }
}

#[tokio::test(start_paused = true)]
async fn cancelled_run_is_archived_incomplete() {
    let datadir = tempfile::tempdir().unwrap();
    let mut config = stability(datadir.path());
    config.stability_iters = 1000;
    config.pause_time = 1.0;
    let settings = Settings::new(config).unwrap();
    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            cancel.cancel();
        })
    };
    let err = roachcal::experiment::run(settings, Stability, cancel)
        .await
        .unwrap_err();
    canceller.await.unwrap();
    assert!(error::is_cancelled(&err));

    let archives = common::archives(datadir.path());
    assert_eq!(archives.len(), 1);
    let bundle = Unpacked::new(&archives[0]).await;
    let info = bundle.testinfo();
    assert_eq!(info.status, Status::Incomplete);
    assert!(info.error.is_some());
    // the run was stopped before writing its results
    assert!(!bundle.root.join("stability.npz").exists());
}

#[tokio::test]
async fn failed_run_is_archived_incomplete() {
    let datadir = tempfile::tempdir().unwrap();
    let mut config = stability(datadir.path());
    // past the last channel
    config.stability_chnl = Some(64);
    let err = run(config, Stability).await.unwrap_err();
    assert!(!error::is_cancelled(&err));
    let archives = common::archives(datadir.path());
    assert_eq!(archives.len(), 1);
    let info = Unpacked::new(&archives[0]).await.testinfo();
    assert_eq!(info.status, Status::Incomplete);
    assert!(info.error.unwrap().contains("channel 64"));
}
