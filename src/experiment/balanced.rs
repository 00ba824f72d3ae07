//! Balanced mixer calibration.
//!
//! The output of a balanced mixer is synthesized as `a + c * b`. Two
//! calibrations are available. [`BmTone`] sweeps the RF tone, which reaches
//! the inputs in quadrature, and verifies the result with the rejection of
//! the RF tone with respect to a test tone that reaches the inputs in phase.
//! [`BmNoise`] uses the broadband LO noise present at both inputs and
//! verifies the result by comparing the synthesized power with the ideal and
//! with the calibrated coefficients.

use super::{
    cross_column, output_column, power_column, sweep_plot, Experiment, InputMeasure, OutputMeasure,
    Session,
};
use crate::{
    archive::Arrays,
    config::Settings,
    error::Error,
    plot,
    sim::{Role, Sideband},
    solve::{self, balance},
    spectra,
};
use anyhow::Result;
use std::path::Path;

fn channel_arrays(session: &Session, channels: &[usize]) -> Arrays {
    let settings = session.settings();
    let freqs: Vec<f64> = channels
        .iter()
        .map(|&k| spectra::channel_to_frequency(k, settings.config.bw, settings.nchannels()))
        .collect();
    Arrays::new()
        .int("channels", &channels.iter().map(|&k| k as i64).collect::<Vec<_>>())
        .real("freqs", &freqs)
}

fn check_common(settings: &Settings) -> Result<(), Error> {
    Settings::require(&settings.cal_pow, "cal_pow_info")?;
    Settings::require(&settings.crosspow, "crosspow_info")?;
    Settings::require(&settings.synth, "synth_info")?;
    Settings::require(&settings.consts, "const_brams_info")?;
    Ok(())
}

/// Balanced mixer calibration with an RF tone.
#[derive(Debug, Default, Clone)]
pub struct BmTone;

impl BmTone {
    async fn calibrate(&mut self, session: &mut Session, lo: &[f64], dir: &Path) -> Result<()> {
        let channels = session.cal_channels();
        tracing::info!(channels = channels.len(), "calibration sweep");
        let plan = session.plan(&channels, lo, Sideband::Upper);
        let mut measure = InputMeasure::new(session, dir.join("cal_rawdata"), "rf")?;
        let mut plot = sweep_plot(
            session,
            dir.join("cal.svg"),
            "Calibration",
            "Power [dBFS]",
            &["a", "b"],
        );
        let records = session
            .sweep(Role::Rf, &plan, &mut measure, &mut plot)
            .await?;
        let aa = power_column(&records, 0)?;
        let bb = power_column(&records, 1)?;
        let ab = cross_column(&records, 0)?;
        let coefficients = balance::coefficients(&bb, &ab);
        let consts = spectra::interpolate_complex(&channels, &coefficients, session.const_len()?);
        tracing::info!("writing balance constants");
        session.write_constants(&[consts.clone()]).await?;
        channel_arrays(session, &channels)
            .real("aa", &aa)
            .real("bb", &bb)
            .complex("ab", &ab)
            .complex("coefficients", &coefficients)
            .complex("consts", &consts)
            .write(&dir.join("ab_params.npz"))
            .await
    }

    async fn verify(&mut self, session: &mut Session, lo: &[f64], dir: &Path) -> Result<()> {
        let channels = session.syn_channels();
        let plan = session.plan(&channels, lo, Sideband::Upper);
        let raw = dir.join("srr_rawdata");

        tracing::info!(channels = channels.len(), "RF tone sweep");
        let mut measure = OutputMeasure::new(session, raw.clone(), "rf")?;
        let mut plot = sweep_plot(
            session,
            dir.join("srr_rf.svg"),
            "RF tone",
            "Power [dBFS]",
            &["output"],
        );
        let rf = output_column(
            &session.sweep(Role::Rf, &plan, &mut measure, &mut plot).await?,
            0,
        )?;

        session.source(Role::Rf)?.output_off().await?;
        session.source(Role::Test)?.output_on().await?;
        tracing::info!(channels = channels.len(), "test tone sweep");
        let mut measure = OutputMeasure::new(session, raw, "test")?;
        let mut plot = sweep_plot(
            session,
            dir.join("srr_test.svg"),
            "Test tone",
            "Power [dBFS]",
            &["output"],
        );
        let test = output_column(
            &session.sweep(Role::Test, &plan, &mut measure, &mut plot).await?,
            0,
        )?;
        session.source(Role::Test)?.output_off().await?;
        session.source(Role::Rf)?.output_on().await?;

        let ratio: Vec<f64> = test.iter().zip(rf.iter()).map(|(t, r)| t / r).collect();
        let rejection = solve::to_db(&ratio);
        let worst = rejection.iter().copied().fold(f64::INFINITY, f64::min);
        tracing::info!(worst_rejection_db = worst, "RF rejection measured");

        let arrays = channel_arrays(session, &channels);
        if session.settings().config.plots {
            let settings = session.settings();
            let freqs: Vec<f64> = channels
                .iter()
                .map(|&k| spectra::channel_to_frequency(k, settings.config.bw, settings.nchannels()))
                .collect();
            plot::plot_lines(
                &dir.join("srr.svg"),
                "RF rejection",
                "Frequency [MHz]",
                "Rejection [dB]",
                &freqs,
                &[("rejection", rejection.as_slice())],
            )?;
        }
        arrays
            .real("rf_power", &rf)
            .real("test_power", &test)
            .real("rejection", &rejection)
            .write(&dir.join("srr.npz"))
            .await
    }
}

impl Experiment for BmTone {
    fn name(&self) -> &'static str {
        "bm_calibrator"
    }

    fn check(&self, settings: &Settings) -> Result<(), Error> {
        Settings::require(&settings.config.rf_source, "rf_source")?;
        Settings::require(&settings.config.test_source, "test_source")?;
        check_common(settings)
    }

    async fn run_lo(&mut self, session: &mut Session, lo: &[f64], dir: &Path) -> Result<()> {
        session.source(Role::Test)?.output_off().await?;
        session.load_ideal_constants(1).await?;
        self.calibrate(session, lo, dir).await?;
        self.verify(session, lo, dir).await
    }
}

/// Balanced mixer calibration with broadband noise.
#[derive(Debug, Default, Clone)]
pub struct BmNoise;

impl Experiment for BmNoise {
    fn name(&self) -> &'static str {
        "bm_noise_calibrator"
    }

    fn check(&self, settings: &Settings) -> Result<(), Error> {
        check_common(settings)
    }

    async fn run_lo(&mut self, session: &mut Session, _lo: &[f64], dir: &Path) -> Result<()> {
        let len = session.const_len()?;
        let ideal = session.ideal_const();
        tracing::info!(value = %ideal, "loading ideal constants");
        session.write_constants(&[vec![ideal; len]]).await?;
        session.settle().await?;

        let inputs = session.read_inputs().await?;
        inputs
            .arrays()
            .write(&dir.join("cal_rawdata").join("noise.npz"))
            .await?;
        let (aa, bb) = match inputs.powers.as_slice() {
            [aa, bb, ..] => (aa.clone(), bb.clone()),
            _ => return Err(Error::Config("cal_pow_info: two inputs needed".to_string()).into()),
        };
        let ab = inputs
            .cross
            .first()
            .cloned()
            .ok_or_else(|| Error::Config("crosspow_info: no rows".to_string()))?;
        let ideal_power = first_output(session.read_outputs().await?)?;

        let coefficients = balance::coefficients(&bb, &ab);
        tracing::info!("writing balance constants");
        session.write_constants(&[coefficients.clone()]).await?;
        session.settle().await?;
        let calibrated_power = first_output(session.read_outputs().await?)?;

        let cancellation = balance::cancellation_db(&ideal_power, &calibrated_power);
        let predicted = balance::synthesized_power(&aa, &bb, &ab, &vec![ideal; aa.len()]);
        let worst = cancellation.iter().copied().fold(f64::INFINITY, f64::min);
        tracing::info!(worst_cancellation_db = worst, "cancellation measured");

        let settings = session.settings();
        let freqs = spectra::frequencies(settings.config.bw, settings.nchannels());
        if settings.config.plots {
            let dbfs_const = settings.config.dbfs_const;
            plot::plot_lines(
                &dir.join("cancellation.svg"),
                "Cancellation",
                "Frequency [MHz]",
                "Power [dBFS]",
                &freqs,
                &[
                    ("ideal", spectra::to_dbfs(&ideal_power, 1, dbfs_const).as_slice()),
                    ("calibrated", spectra::to_dbfs(&calibrated_power, 1, dbfs_const).as_slice()),
                ],
            )?;
        }
        Arrays::new()
            .real("freqs", &freqs)
            .real("aa", &aa)
            .real("bb", &bb)
            .complex("ab", &ab)
            .complex("consts", &coefficients)
            .write(&dir.join("ab_params.npz"))
            .await?;
        Arrays::new()
            .real("freqs", &freqs)
            .complex("ideal_const", &[ideal])
            .real("ideal", &ideal_power)
            .real("predicted_ideal", &predicted)
            .real("calibrated", &calibrated_power)
            .real("cancellation", &cancellation)
            .write(&dir.join("cancellation.npz"))
            .await
    }
}

fn first_output(outputs: Vec<Vec<f64>>) -> Result<Vec<f64>> {
    outputs
        .into_iter()
        .next()
        .ok_or_else(|| Error::Config("synth_info: no outputs".to_string()).into())
}
