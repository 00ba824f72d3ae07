//! Experiment drivers.
//!
//! This module contains the state machine shared by all the calibration
//! programs and one driver per experiment. A run goes through the following
//! phases:
//!
//! 1. Configure. The configuration has been validated into [`Settings`] and
//!    the experiment checks that it has every key it needs. The result bundle
//!    is created, then the ROACH and the instruments are opened.
//! 2. Initialize the sources at their default frequency and power.
//! 3. For each LO combination, tune the LOs and run the experiment, which
//!    writes its results into the subdirectory of the combination.
//! 4. Shut down the sources. This happens on every exit path.
//! 5. Archive the result bundle.
//!
//! A failed or cancelled run still archives its bundle, with an `incomplete`
//! status and the error in the manifest, and returns the error.

use crate::{
    archive::{Arrays, Bundle},
    config::{self, Settings},
    error::{self, Error},
    fpga::Roach,
    instrument::{self, Instrument},
    memory::MemoryDesc,
    plot::SeriesPlot,
    sim::{Role, Scene, Sideband},
    spectra,
    sweep::{self, Measure, Step, SweepObserver, SweepPlan},
};
use anyhow::{Context, Result};
use num_complex::Complex64;
use roachcal_json::{Status, TestInfo};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

pub mod adcsync;
pub mod balanced;
pub mod dss;
pub mod mbf;
pub mod stability;

/// Software version recorded in the manifests.
pub fn version() -> String {
    format!(
        "{} ({})",
        env!("CARGO_PKG_VERSION"),
        git_version::git_version!(fallback = "unknown")
    )
}

/// Calibration experiment.
#[allow(async_fn_in_trait)]
pub trait Experiment {
    /// Name of the experiment. It names the result bundle.
    fn name(&self) -> &'static str;

    /// Checks that the configuration has every key the experiment needs.
    fn check(&self, settings: &Settings) -> Result<(), Error>;

    /// Runs the experiment with the LOs tuned to `lo`, writing the results
    /// into `dir`.
    async fn run_lo(&mut self, session: &mut Session, lo: &[f64], dir: &Path) -> Result<()>;
}

/// Devices and state of a running experiment.
#[derive(Debug)]
pub struct Session {
    settings: Settings,
    fpga: Roach,
    rf: Option<Instrument>,
    los: Vec<Instrument>,
    test: Option<Instrument>,
    cancel: CancellationToken,
    overflows: usize,
}

fn pick<'a>(
    rf: &'a mut Option<Instrument>,
    los: &'a mut [Instrument],
    test: &'a mut Option<Instrument>,
    role: Role,
) -> Result<&'a mut Instrument, Error> {
    let (instrument, key) = match role {
        Role::Rf => (rf.as_mut(), "rf_source"),
        Role::Lo(j) => (los.get_mut(j), "lo_sources"),
        Role::Test => (test.as_mut(), "test_source"),
    };
    instrument.ok_or_else(|| Error::Config(format!("missing key {key}")))
}

impl Session {
    #[tracing::instrument(name = "Session::open", level = "debug", skip_all)]
    async fn open(settings: Settings, scene: &Scene, cancel: CancellationToken) -> Result<Session> {
        let fpga = Roach::connect(&settings, scene).await?;
        let config = &settings.config;
        let rf = match &config.rf_source {
            Some(info) => Some(Instrument::open(info, Role::Rf, scene, config.simulated).await?),
            None => None,
        };
        let mut los = Vec::with_capacity(config.lo_sources.len());
        for (j, info) in config.lo_sources.iter().enumerate() {
            los.push(Instrument::open(info, Role::Lo(j), scene, config.simulated).await?);
        }
        let test = match &config.test_source {
            Some(info) => Some(Instrument::open(info, Role::Test, scene, config.simulated).await?),
            None => None,
        };
        Ok(Session {
            settings,
            fpga,
            rf,
            los,
            test,
            cancel,
            overflows: 0,
        })
    }

    fn instruments(&mut self) -> Vec<&mut Instrument> {
        self.rf
            .iter_mut()
            .chain(self.los.iter_mut())
            .chain(self.test.iter_mut())
            .collect()
    }

    async fn shutdown(&mut self) {
        tracing::info!("shutting down sources");
        instrument::shutdown_all(&mut self.instruments()).await;
    }

    // Accumulation length of the first descriptor that has an accumulation
    // register.
    async fn acc_len(&mut self) -> Result<Option<u32>> {
        let settings = &self.settings;
        let desc = [
            &settings.spec,
            &settings.cal_pow,
            &settings.synth,
            &settings.crosspow,
        ]
        .into_iter()
        .flatten()
        .find(|d| d.acc_len_reg().is_some());
        Ok(match desc {
            Some(desc) => Some(spectra::acc_len(&mut self.fpga, desc).await?),
            None => None,
        })
    }

    async fn run_all<E: Experiment>(&mut self, experiment: &mut E, bundle: &mut Bundle) -> Result<()> {
        self.fpga.initialize(&self.settings).await?;
        bundle.info_mut().acc_len = self.acc_len().await?;
        bundle.write_testinfo().await?;
        tracing::info!("initializing sources");
        instrument::init_all(&mut self.instruments()).await?;
        let combinations = self.settings.lo_combinations();
        for (j, lo) in combinations.iter().enumerate() {
            sweep::check_cancelled(&self.cancel)?;
            tracing::info!(
                combination = j + 1,
                total = combinations.len(),
                ?lo,
                "starting LO combination"
            );
            for (source, &freq) in self.los.iter_mut().zip(lo.iter()) {
                source.set_frequency(Some(freq)).await?;
            }
            let dir = bundle.lo_dir(lo).await?;
            experiment
                .run_lo(self, lo, &dir)
                .await
                .with_context(|| format!("LO combination {lo:?}"))?;
        }
        Ok(())
    }

    /// Validated configuration.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// ROACH.
    pub fn fpga(&mut self) -> &mut Roach {
        &mut self.fpga
    }

    /// Cancellation token of the run.
    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns the instrument with a role.
    pub fn source(&mut self, role: Role) -> Result<&mut Instrument, Error> {
        pick(&mut self.rf, &mut self.los, &mut self.test, role)
    }

    /// Returns `true` if an instrument with the role is configured.
    pub fn has_source(&self, role: Role) -> bool {
        match role {
            Role::Rf => self.rf.is_some(),
            Role::Lo(j) => j < self.los.len(),
            Role::Test => self.test.is_some(),
        }
    }

    /// Adds quantization overflows to the count reported in the manifest.
    pub fn add_overflows(&mut self, overflows: usize) {
        if overflows > 0 {
            tracing::warn!(overflows, "fixed-point overflows");
        }
        self.overflows += overflows;
    }

    /// Waits for the settle time.
    pub async fn settle(&self) -> Result<()> {
        sweep::settle(self.settings.pause_time(), &self.cancel).await
    }

    /// Creates a sweep plan over `channels` for the LO combination `lo`.
    pub fn plan(&self, channels: &[usize], lo: &[f64], sideband: Sideband) -> SweepPlan {
        SweepPlan::new(
            channels,
            self.settings.config.bw,
            self.settings.nchannels(),
            lo.iter().sum(),
            sideband,
            self.settings.pause_time(),
        )
    }

    /// Calibration channels.
    pub fn cal_channels(&self) -> Vec<usize> {
        let config = &self.settings.config;
        spectra::channel_grid(
            config.cal_chnl_start,
            config.cal_chnl_stop.unwrap_or(self.settings.nchannels()),
            config.cal_chnl_step,
        )
    }

    /// Verification channels.
    pub fn syn_channels(&self) -> Vec<usize> {
        let config = &self.settings.config;
        spectra::channel_grid(
            config.cal_chnl_start,
            config.cal_chnl_stop.unwrap_or(self.settings.nchannels()),
            config.syn_chnl_step,
        )
    }

    /// Runs a sweep of the source with the given role.
    pub async fn sweep<M: Measure>(
        &mut self,
        role: Role,
        plan: &SweepPlan,
        measure: &mut M,
        observer: &mut dyn SweepObserver,
    ) -> Result<Vec<M::Record>> {
        let source = pick(&mut self.rf, &mut self.los, &mut self.test, role)?;
        sweep::run(&mut self.fpga, source, plan, measure, observer, &self.cancel).await
    }

    /// Tunes the source with the given role to a channel in the upper
    /// sideband of the LO combination `lo`, and waits for the settle time.
    pub async fn tune(&mut self, role: Role, channel: usize, lo: &[f64]) -> Result<()> {
        let plan = self.plan(&[channel], lo, Sideband::Upper);
        let freq = plan.steps[0].rf_freq;
        self.source(role)?.set_frequency(Some(freq)).await?;
        self.settle().await
    }

    /// Quantizes and writes coefficient rows into the coefficient memories.
    pub async fn write_constants(&mut self, rows: &[Vec<Complex64>]) -> Result<()> {
        let desc = Settings::require(&self.settings.consts, "const_brams_info")?;
        let format = *Settings::require(&self.settings.const_format, "const_brams_info")?;
        let overflows = self.fpga.write_constants(desc, format, rows).await?;
        self.add_overflows(overflows);
        Ok(())
    }

    /// Number of coefficients in each coefficient row.
    pub fn const_len(&self) -> Result<usize, Error> {
        config::complex_len(Settings::require(&self.settings.consts, "const_brams_info")?)
    }

    /// Reads the coefficient rows of the coefficient memories.
    pub async fn read_constants(&mut self) -> Result<Vec<Vec<Complex64>>> {
        let desc = Settings::require(&self.settings.consts, "const_brams_info")?;
        let format = *Settings::require(&self.settings.const_format, "const_brams_info")?;
        self.fpga.read_constants(desc, format).await
    }

    /// Ideal coefficient.
    pub fn ideal_const(&self) -> Complex64 {
        let [re, im] = self.settings.config.ideal_consts.val;
        Complex64::new(re, im)
    }

    /// Loads the ideal coefficient into `rows` coefficient rows if the
    /// configuration asks for it.
    pub async fn load_ideal_constants(&mut self, rows: usize) -> Result<()> {
        if !self.settings.config.ideal_consts.load {
            return Ok(());
        }
        tracing::info!(value = %self.ideal_const(), "loading ideal constants");
        let row = vec![self.ideal_const(); self.const_len()?];
        self.write_constants(&vec![row; rows]).await
    }

    /// Reads the input spectra given by the `cal_pow_info` and
    /// `crosspow_info` descriptors.
    pub async fn read_inputs(&mut self) -> Result<InputSpectra> {
        let pow = Settings::require(&self.settings.cal_pow, "cal_pow_info")?;
        let cross = Settings::require(&self.settings.crosspow, "crosspow_info")?;
        InputSpectra::read(&mut self.fpga, pow, cross).await
    }

    /// Reads the synthesized output power spectra, divided by the
    /// accumulation length.
    pub async fn read_outputs(&mut self) -> Result<Vec<Vec<f64>>> {
        let desc = Settings::require(&self.settings.synth, "synth_info")?;
        read_scaled(&mut self.fpga, desc).await
    }
}

async fn read_scaled(fpga: &mut Roach, desc: &MemoryDesc) -> Result<Vec<Vec<f64>>> {
    let spectra = spectra::read_power_spectra(fpga, desc).await?;
    let acc_len = spectra::acc_len(fpga, desc).await?;
    Ok(spectra
        .iter()
        .map(|s| spectra::scale_linear(s, acc_len))
        .collect())
}

/// Power and cross-power spectra of the receiver inputs, divided by the
/// accumulation length.
#[derive(Debug, Clone, PartialEq)]
pub struct InputSpectra {
    /// Power spectrum of each input.
    pub powers: Vec<Vec<f64>>,
    /// Cross-power spectra.
    pub cross: Vec<Vec<Complex64>>,
}

/// Powers and cross-powers of the receiver inputs at a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct InputSample {
    /// Power of each input.
    pub powers: Vec<f64>,
    /// Cross-powers.
    pub cross: Vec<Complex64>,
}

impl InputSpectra {
    /// Reads the input spectra.
    pub async fn read(fpga: &mut Roach, pow: &MemoryDesc, cross: &MemoryDesc) -> Result<InputSpectra> {
        let powers = read_scaled(fpga, pow).await?;
        let acc_len = f64::from(spectra::acc_len(fpga, cross).await?);
        let cross = spectra::read_cross_spectra(fpga, cross)
            .await?
            .into_iter()
            .map(|row| row.into_iter().map(|z| z / acc_len).collect())
            .collect();
        Ok(InputSpectra { powers, cross })
    }

    /// Values at channel `k`.
    pub fn at(&self, k: usize) -> Result<InputSample> {
        let powers = self
            .powers
            .iter()
            .map(|s| s.get(k).copied())
            .collect::<Option<Vec<f64>>>();
        let cross = self
            .cross
            .iter()
            .map(|s| s.get(k).copied())
            .collect::<Option<Vec<Complex64>>>();
        match (powers, cross) {
            (Some(powers), Some(cross)) => Ok(InputSample { powers, cross }),
            _ => Err(Error::Config(format!("channel {k} out of range")).into()),
        }
    }

    /// Arrays holding the spectra.
    pub fn arrays(&self) -> Arrays {
        Arrays::new()
            .real_2d("powers", &self.powers)
            .complex_2d("cross", &self.cross)
    }
}

impl InputSample {
    /// Power of input `j`.
    pub fn power(&self, j: usize) -> Result<f64> {
        self.powers
            .get(j)
            .copied()
            .ok_or_else(|| Error::Config(format!("cal_pow_info: no input {j}")).into())
    }

    /// Cross-power row `j`.
    pub fn cross(&self, j: usize) -> Result<Complex64> {
        self.cross
            .get(j)
            .copied()
            .ok_or_else(|| Error::Config(format!("crosspow_info: no row {j}")).into())
    }
}

/// Power of input `j` in each sample.
pub fn power_column(samples: &[InputSample], j: usize) -> Result<Vec<f64>> {
    samples.iter().map(|s| s.power(j)).collect()
}

/// Cross-power row `j` in each sample.
pub fn cross_column(samples: &[InputSample], j: usize) -> Result<Vec<Complex64>> {
    samples.iter().map(|s| s.cross(j)).collect()
}

/// Power of output `j` in each record of an [`OutputMeasure`] sweep.
pub fn output_column(records: &[Vec<f64>], j: usize) -> Result<Vec<f64>> {
    records
        .iter()
        .map(|r| {
            r.get(j)
                .copied()
                .ok_or_else(|| Error::Config(format!("synth_info: no output {j}")).into())
        })
        .collect()
}

fn raw_path(dir: &Path, prefix: &str, channel: usize) -> PathBuf {
    dir.join(format!("{prefix}_chnl_{channel:04}.npz"))
}

/// Measurement of the input spectra at each sweep step.
///
/// The spectra of every step are stored in `<dir>/<prefix>_chnl_<k>.npz`.
#[derive(Debug, Clone)]
pub struct InputMeasure {
    pow: MemoryDesc,
    cross: MemoryDesc,
    dir: PathBuf,
    prefix: String,
    dbfs_const: f64,
}

impl InputMeasure {
    /// Creates a measurement of the inputs of a session.
    pub fn new(session: &Session, dir: PathBuf, prefix: &str) -> Result<InputMeasure> {
        let settings = session.settings();
        Ok(InputMeasure {
            pow: Settings::require(&settings.cal_pow, "cal_pow_info")?.clone(),
            cross: Settings::require(&settings.crosspow, "crosspow_info")?.clone(),
            dir,
            prefix: prefix.to_string(),
            dbfs_const: settings.config.dbfs_const,
        })
    }
}

impl Measure for InputMeasure {
    type Record = InputSample;

    async fn measure(&mut self, fpga: &mut Roach, step: &Step) -> Result<InputSample> {
        let spectra = InputSpectra::read(fpga, &self.pow, &self.cross).await?;
        spectra
            .arrays()
            .write(&raw_path(&self.dir, &self.prefix, step.channel))
            .await?;
        spectra.at(step.channel)
    }

    // records are already divided by the accumulation length
    fn plot_values(&self, record: &InputSample) -> Vec<f64> {
        spectra::to_dbfs(&record.powers, 1, self.dbfs_const)
    }
}

/// Measurement of the synthesized outputs at each sweep step.
///
/// Each record holds the power of every output at the channel of the step.
/// The spectra of every step are stored in `<dir>/<prefix>_chnl_<k>.npz`.
#[derive(Debug, Clone)]
pub struct OutputMeasure {
    synth: MemoryDesc,
    dir: PathBuf,
    prefix: String,
    dbfs_const: f64,
}

impl OutputMeasure {
    /// Creates a measurement of the outputs of a session.
    pub fn new(session: &Session, dir: PathBuf, prefix: &str) -> Result<OutputMeasure> {
        let settings = session.settings();
        Ok(OutputMeasure {
            synth: Settings::require(&settings.synth, "synth_info")?.clone(),
            dir,
            prefix: prefix.to_string(),
            dbfs_const: settings.config.dbfs_const,
        })
    }
}

impl Measure for OutputMeasure {
    type Record = Vec<f64>;

    async fn measure(&mut self, fpga: &mut Roach, step: &Step) -> Result<Vec<f64>> {
        let spectra = read_scaled(fpga, &self.synth).await?;
        Arrays::new()
            .real_2d("outputs", &spectra)
            .write(&raw_path(&self.dir, &self.prefix, step.channel))
            .await?;
        spectra
            .iter()
            .map(|s| s.get(step.channel).copied())
            .collect::<Option<Vec<f64>>>()
            .ok_or_else(|| Error::Config(format!("channel {} out of range", step.channel)).into())
    }

    fn plot_values(&self, record: &Vec<f64>) -> Vec<f64> {
        spectra::to_dbfs(record, 1, self.dbfs_const)
    }
}

/// Plot observer for a sweep, enabled by the `plots` setting.
pub fn sweep_plot(
    session: &Session,
    path: PathBuf,
    title: &str,
    y_label: &str,
    labels: &[&str],
) -> SeriesPlot {
    SeriesPlot::new(path, title, y_label, labels, session.settings().config.plots)
}

fn testinfo(name: &str, settings: &Settings) -> TestInfo {
    let config = &settings.config;
    TestInfo {
        experiment: name.to_string(),
        version: version(),
        date: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        status: Status::Incomplete,
        error: None,
        simulated: config.simulated,
        bw: config.bw,
        nchannels: settings.nchannels(),
        acc_len: None,
        lo_combinations: settings.lo_combinations(),
        cal_chnl_step: config.cal_chnl_step,
        syn_chnl_step: config.syn_chnl_step,
        cal_method: config.cal_method,
        kerr_correction: config.kerr_correction,
        ideal_consts: config.ideal_consts.clone(),
        const_bin_pt: config.const_bin_pt,
        overflow_warnings: 0,
        type_mismatch_warnings: 0,
    }
}

/// Runs an experiment.
///
/// Returns the path of the result archive. If the run fails or is cancelled
/// through `cancel`, the sources are shut down, the partial bundle is
/// archived with an `incomplete` status, and the error is returned.
#[tracing::instrument(name = "experiment::run", level = "debug", skip_all, fields(experiment = experiment.name()))]
pub async fn run<E: Experiment>(
    settings: Settings,
    mut experiment: E,
    cancel: CancellationToken,
) -> Result<PathBuf> {
    experiment.check(&settings)?;
    let datadir = PathBuf::from(&settings.config.datadir);
    let mut bundle = Bundle::create(&datadir, testinfo(experiment.name(), &settings)).await?;
    let scene = Scene::new(settings.config.lo_sources.len());

    let opened = tokio::select! {
        session = Session::open(settings, &scene, cancel.clone()) => session,
        _ = cancel.cancelled() => Err(Error::Cancelled.into()),
    };
    let result = match opened {
        Ok(mut session) => {
            let result = tokio::select! {
                result = session.run_all(&mut experiment, &mut bundle) => result,
                _ = cancel.cancelled() => Err(Error::Cancelled.into()),
            };
            session.shutdown().await;
            let info = bundle.info_mut();
            info.overflow_warnings = session.overflows;
            info.type_mismatch_warnings = session.fpga.type_mismatches();
            result
        }
        Err(err) => Err(err),
    };

    match result {
        Ok(()) => bundle.finish(Status::Complete, None).await,
        Err(err) => {
            if error::is_cancelled(&err) {
                tracing::warn!("experiment cancelled");
            } else {
                tracing::error!("experiment aborted: {err:#}");
            }
            match bundle
                .finish(Status::Incomplete, Some(format!("{err:#}")))
                .await
            {
                Ok(archive) => tracing::info!(archive = %archive.display(), "partial results archived"),
                Err(archive_err) => tracing::error!("failed to archive partial results: {archive_err:#}"),
            }
            Err(err)
        }
    }
}
