//! Result bundles.
//!
//! A run stores its results in a staging directory named after the experiment
//! and the start time. The directory holds the `testinfo.json` manifest at its
//! root and one subdirectory per LO combination with the raw and summary
//! arrays of that combination, as `.npz` files. When the run ends, the staging
//! directory is packed into a gzipped tar archive next to it and removed.

use anyhow::{Context, Result};
use async_compression::tokio::write::GzipEncoder;
use ndarray::{Array1, Array2};
use ndarray_npy::NpzWriter;
use num_complex::Complex64;
use roachcal_json::{Status, TestInfo};
use std::{
    io::Cursor,
    path::{Path, PathBuf},
};
use tokio::io::AsyncWriteExt;

/// Name of the manifest file.
pub const TESTINFO: &str = "testinfo.json";

/// Name of the subdirectory of an LO combination.
///
/// The name is `LO1_<f>GHZ_LO2_<f>GHZ...`, with the frequencies in GHz. An
/// empty combination maps to the root of the bundle.
pub fn lo_dir_name(lo: &[f64]) -> String {
    lo.iter()
        .enumerate()
        .map(|(j, f)| format!("LO{}_{}GHZ", j + 1, f / 1e3))
        .collect::<Vec<_>>()
        .join("_")
}

macro_rules! impl_arrays {
    ($($name:ident: $ty:ty, $desc:expr);*) => {
        paste::paste! {
            $(
                #[doc = concat!("Adds a ", $desc, " array.")]
                pub fn $name(self, name: &str, values: &[$ty]) -> Arrays {
                    self.add(name, Array1::from(values.to_vec()))
                }

                #[doc = concat!("Adds a 2-D ", $desc,
                                " array. All the rows must have the same length.")]
                pub fn [<$name _2d>](self, name: &str, rows: &[Vec<$ty>]) -> Arrays {
                    self.add_rows(name, rows)
                }
            )*
        }
    };
}

/// Named arrays written into a `.npz` file.
pub struct Arrays {
    npz: Option<NpzWriter<Cursor<Vec<u8>>>>,
    error: Option<anyhow::Error>,
}

impl std::fmt::Debug for Arrays {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arrays").finish_non_exhaustive()
    }
}

impl Default for Arrays {
    fn default() -> Arrays {
        Arrays::new()
    }
}

impl Arrays {
    /// Creates an empty set of arrays.
    pub fn new() -> Arrays {
        Arrays {
            npz: Some(NpzWriter::new(Cursor::new(Vec::new()))),
            error: None,
        }
    }

    fn add<A: ndarray_npy::WritableElement, D: ndarray::Dimension>(
        mut self,
        name: &str,
        array: ndarray::Array<A, D>,
    ) -> Arrays {
        if self.error.is_none() {
            if let Some(npz) = self.npz.as_mut() {
                if let Err(e) = npz.add_array(name, &array) {
                    self.error = Some(anyhow::Error::from(e).context(format!("array {name}")));
                }
            }
        }
        self
    }

    fn add_rows<A: ndarray_npy::WritableElement + Copy>(self, name: &str, rows: &[Vec<A>]) -> Arrays {
        let ncols = rows.first().map(Vec::len).unwrap_or(0);
        let flat: Vec<A> = rows.iter().flatten().copied().collect();
        match Array2::from_shape_vec((rows.len(), ncols), flat) {
            Ok(array) => self.add(name, array),
            Err(e) => Arrays {
                error: Some(anyhow::Error::from(e).context(format!("array {name}"))),
                ..self
            },
        }
    }

    impl_arrays!(real: f64, "real"; int: i64, "integer"; complex: Complex64, "complex");

    /// Encodes the arrays as a `.npz` file.
    pub fn encode(self) -> Result<Vec<u8>> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let npz = self
            .npz
            .unwrap_or_else(|| NpzWriter::new(Cursor::new(Vec::new())));
        Ok(npz.finish()?.into_inner())
    }

    /// Writes the arrays into a `.npz` file.
    pub async fn write(self, path: &Path) -> Result<()> {
        let data = self.encode()?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(path, data)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

/// Result bundle.
#[derive(Debug)]
pub struct Bundle {
    staging: PathBuf,
    info: TestInfo,
}

impl Bundle {
    /// Creates the staging directory of a run and writes the manifest
    /// skeleton.
    ///
    /// The staging directory is `<datadir>/<experiment> YYYY-MM-DD HH:MM:SS`.
    #[tracing::instrument(name = "Bundle::create", level = "debug", skip(info))]
    pub async fn create(datadir: &Path, info: TestInfo) -> Result<Bundle> {
        let staging = datadir.join(format!("{} {}", info.experiment, info.date));
        tokio::fs::create_dir_all(&staging)
            .await
            .with_context(|| format!("failed to create {}", staging.display()))?;
        tracing::info!(staging = %staging.display(), "created result bundle");
        let bundle = Bundle { staging, info };
        bundle.write_testinfo().await?;
        Ok(bundle)
    }

    /// Staging directory.
    pub fn staging(&self) -> &Path {
        &self.staging
    }

    /// Manifest.
    pub fn info(&self) -> &TestInfo {
        &self.info
    }

    /// Manifest, for modification.
    pub fn info_mut(&mut self) -> &mut TestInfo {
        &mut self.info
    }

    /// Writes the manifest.
    pub async fn write_testinfo(&self) -> Result<()> {
        let path = self.staging.join(TESTINFO);
        let json = serde_json::to_string_pretty(&self.info)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }

    /// Creates the directory of an LO combination.
    pub async fn lo_dir(&self, lo: &[f64]) -> Result<PathBuf> {
        let dir = self.staging.join(lo_dir_name(lo));
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(dir)
    }

    /// Finishes the bundle.
    ///
    /// The final manifest is written with the given status and error, the
    /// staging directory is packed into `<staging>.tar.gz`, and the staging
    /// directory is removed. Returns the path of the archive.
    #[tracing::instrument(name = "Bundle::finish", level = "debug", skip_all)]
    pub async fn finish(mut self, status: Status, error: Option<String>) -> Result<PathBuf> {
        self.info.status = status;
        self.info.error = error;
        self.write_testinfo().await?;
        let archive = pack(&self.staging).await?;
        tokio::fs::remove_dir_all(&self.staging)
            .await
            .with_context(|| format!("failed to remove {}", self.staging.display()))?;
        tracing::info!(archive = %archive.display(), ?status, "result bundle archived");
        Ok(archive)
    }
}

/// Packs a directory into a gzipped tar archive `<dir>.tar.gz`.
///
/// The entries of the archive are stored under the name of the directory.
pub async fn pack(dir: &Path) -> Result<PathBuf> {
    let name = dir
        .file_name()
        .with_context(|| format!("{} has no name", dir.display()))?;
    let mut archive_name = name.to_os_string();
    archive_name.push(".tar.gz");
    let archive = dir.with_file_name(archive_name);
    let file = tokio::fs::File::create(&archive)
        .await
        .with_context(|| format!("failed to create {}", archive.display()))?;
    let mut tar = tokio_tar::Builder::new(GzipEncoder::new(file));
    tar.append_dir_all(name, dir).await?;
    let mut gzip = tar.into_inner().await?;
    gzip.shutdown().await?;
    Ok(archive)
}
