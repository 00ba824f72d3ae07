//! Helpers shared by the simulated experiment tests.

#![allow(dead_code)]

use async_compression::tokio::bufread::GzipDecoder;
use ndarray_npy::NpzReader;
use roachcal::{
    archive::TESTINFO,
    config::Settings,
    experiment::{self, Experiment},
};
use roachcal_json::{BramNames, Config, MemoryInfo, SimInfo, SimModel, SourceInfo, SourceKind, TestInfo};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub fn list(names: &[&str]) -> BramNames {
    BramNames::List(names.iter().map(|s| s.to_string()).collect())
}

pub fn rows(rows: &[[&str; 2]]) -> BramNames {
    BramNames::List2d(
        rows.iter()
            .map(|row| row.iter().map(|s| s.to_string()).collect())
            .collect(),
    )
}

/// Accumulated power memories: 64-bit unsigned words.
pub fn power(names: BramNames, addr_width: u32) -> MemoryInfo {
    MemoryInfo {
        addr_width,
        data_width: 64,
        data_type: ">u8".to_string(),
        acc_len_reg: Some("acc_len".to_string()),
        interleave: false,
        names,
    }
}

/// Accumulated cross-power memories: 64-bit signed words.
pub fn cross(names: BramNames, addr_width: u32) -> MemoryInfo {
    MemoryInfo {
        data_type: ">i8".to_string(),
        ..power(names, addr_width)
    }
}

/// Coefficient memories: 32-bit signed words.
pub fn consts(names: BramNames, addr_width: u32) -> MemoryInfo {
    MemoryInfo {
        addr_width,
        data_width: 32,
        data_type: ">i4".to_string(),
        acc_len_reg: None,
        interleave: false,
        names,
    }
}

pub fn source(def_freq: f64, lo_freqs: Vec<f64>) -> SourceInfo {
    SourceInfo {
        kind: SourceKind::Sim,
        connection: "sim".to_string(),
        def_freq,
        def_power: -10.0,
        freq_mult: 1.0,
        lo_freqs,
        settle_time: None,
    }
}

/// Simulated configuration writing its bundles into `datadir`.
pub fn base(datadir: &Path, model: SimModel) -> Config {
    Config {
        simulated: true,
        bw: 1000.0,
        pause_time: 0.0,
        plots: false,
        datadir: datadir.display().to_string(),
        sim: SimInfo {
            model,
            ..SimInfo::default()
        },
        ..Config::default()
    }
}

pub async fn run<E: Experiment>(config: Config, experiment: E) -> anyhow::Result<PathBuf> {
    let settings = Settings::new(config)?;
    experiment::run(settings, experiment, CancellationToken::new()).await
}

/// Archives found in a data directory.
pub fn archives(datadir: &Path) -> Vec<PathBuf> {
    let mut archives: Vec<PathBuf> = std::fs::read_dir(datadir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.to_string_lossy().ends_with(".tar.gz"))
        .collect();
    archives.sort();
    archives
}

/// Unpacked result bundle.
pub struct Unpacked {
    _dir: TempDir,
    pub root: PathBuf,
}

impl Unpacked {
    pub async fn new(archive: &Path) -> Unpacked {
        let dir = tempfile::tempdir().unwrap();
        let file = tokio::fs::File::open(archive).await.unwrap();
        let mut tar = tokio_tar::Archive::new(GzipDecoder::new(tokio::io::BufReader::new(file)));
        tar.unpack(dir.path()).await.unwrap();
        let name = archive.file_name().unwrap().to_string_lossy();
        let root = dir.path().join(name.trim_end_matches(".tar.gz"));
        assert!(root.is_dir(), "{} not in the archive", root.display());
        Unpacked { _dir: dir, root }
    }

    pub fn testinfo(&self) -> TestInfo {
        let json = std::fs::read_to_string(self.root.join(TESTINFO)).unwrap();
        serde_json::from_str(&json).unwrap()
    }

    /// Opens a `.npz` file, relative to the root of the bundle.
    pub fn npz(&self, path: impl AsRef<Path>) -> NpzReader<std::fs::File> {
        let path = self.root.join(path);
        NpzReader::new(std::fs::File::open(&path).unwrap()).unwrap()
    }

    /// Subdirectories of the bundle.
    pub fn subdirs(&self) -> Vec<String> {
        let mut dirs: Vec<String> = std::fs::read_dir(&self.root)
            .unwrap()
            .map(|entry| entry.unwrap())
            .filter(|entry| entry.file_type().unwrap().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        dirs.sort();
        dirs
    }
}
