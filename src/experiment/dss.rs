//! Sideband-separating receiver calibration.
//!
//! For each LO combination the RF tone is swept over the calibration channels
//! in the upper and then in the lower sideband. The input powers and
//! cross-power give the sideband ratios, from which the coefficients of the
//! USB and LSB outputs are computed, interpolated to every channel, and
//! written into the coefficient memories. The sideband-rejection ratio is
//! then measured by sweeping the tone again over the verification channels.

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
    solve::{self, sideband},
    spectra,
};
use anyhow::Result;
use std::path::Path;

/// Sideband-separating receiver calibration.
#[derive(Debug, Default, Clone)]
pub struct Dss;

impl Dss {
    async fn calibrate(&mut self, session: &mut Session, lo: &[f64], dir: &Path) -> Result<()> {
        let channels = session.cal_channels();
        let raw = dir.join("cal_rawdata");

        let mut records = Vec::new();
        for (sideband, prefix) in [(Sideband::Upper, "usb"), (Sideband::Lower, "lsb")] {
            tracing::info!(?sideband, channels = channels.len(), "calibration sweep");
            let plan = session.plan(&channels, lo, sideband);
            let mut measure = InputMeasure::new(session, raw.clone(), prefix)?;
            let mut plot = sweep_plot(
                session,
                dir.join(format!("cal_{prefix}.svg")),
                &format!("{} calibration", prefix.to_uppercase()),
                "Power [dBFS]",
                &["a", "b"],
            );
            records.push(session.sweep(Role::Rf, &plan, &mut measure, &mut plot).await?);
        }
        let (usb, lsb) = (&records[0], &records[1]);

        let r_usb = sideband::ratio_usb(&power_column(usb, 0)?, &cross_column(usb, 0)?);
        let r_lsb = sideband::ratio_lsb(&power_column(lsb, 1)?, &cross_column(lsb, 0)?);

        let config = &session.settings().config;
        let consts = sideband::constants(config.cal_method, config.optimal_weight, &r_usb, &r_lsb);
        let len = session.const_len()?;
        let usb_consts = spectra::interpolate_complex(&channels, &consts.usb, len);
        let lsb_consts = spectra::interpolate_complex(&channels, &consts.lsb, len);
        let mean = consts.usb.iter().map(|c| c.norm()).sum::<f64>() / consts.usb.len().max(1) as f64;
        tracing::info!(method = ?config.cal_method, mean_magnitude = mean, "writing sideband constants");
        session
            .write_constants(&[usb_consts.clone(), lsb_consts.clone()])
            .await?;

        let settings = session.settings();
        let freqs: Vec<f64> = channels
            .iter()
            .map(|&k| spectra::channel_to_frequency(k, settings.config.bw, settings.nchannels()))
            .collect();
        Arrays::new()
            .int("channels", &channels.iter().map(|&k| k as i64).collect::<Vec<_>>())
            .real("freqs", &freqs)
            .complex("r_usb", &r_usb)
            .complex("r_lsb", &r_lsb)
            .complex("const_usb", &usb_consts)
            .complex("const_lsb", &lsb_consts)
            .write(&dir.join("sb_ratios.npz"))
            .await
    }

    async fn verify(&mut self, session: &mut Session, lo: &[f64], dir: &Path) -> Result<()> {
        let channels = session.syn_channels();
        let raw = dir.join("srr_rawdata");

        let mut powers = Vec::new();
        for (sideband, prefix) in [(Sideband::Upper, "usb"), (Sideband::Lower, "lsb")] {
            tracing::info!(?sideband, channels = channels.len(), "SRR sweep");
            let plan = session.plan(&channels, lo, sideband);
            let mut measure = OutputMeasure::new(session, raw.clone(), prefix)?;
            let mut plot = sweep_plot(
                session,
                dir.join(format!("srr_{prefix}_tone.svg")),
                &format!("{} tone", prefix.to_uppercase()),
                "Power [dBFS]",
                &["USB output", "LSB output"],
            );
            let records = session.sweep(Role::Rf, &plan, &mut measure, &mut plot).await?;
            powers.push((output_column(&records, 0)?, output_column(&records, 1)?));
        }
        let ((usb_tone_a, usb_tone_b), (lsb_tone_a, lsb_tone_b)) = (&powers[0], &powers[1]);
        let mut srr_usb = sideband::srr(usb_tone_a, usb_tone_b);
        let mut srr_lsb = sideband::srr(lsb_tone_b, lsb_tone_a);
        let config = &session.settings().config;
        if config.kerr_correction {
            let m_dsb = *Settings::require(&config.m_dsb, "m_dsb")?;
            (srr_usb, srr_lsb) = sideband::kerr_correction(&srr_usb, &srr_lsb, m_dsb);
        }
        let srr_usb = solve::to_db(&srr_usb);
        let srr_lsb = solve::to_db(&srr_lsb);
        let worst = srr_usb
            .iter()
            .chain(srr_lsb.iter())
            .copied()
            .fold(f64::INFINITY, f64::min);
        tracing::info!(worst_srr_db = worst, "SRR measured");

        let settings = session.settings();
        let freqs: Vec<f64> = channels
            .iter()
            .map(|&k| spectra::channel_to_frequency(k, settings.config.bw, settings.nchannels()))
            .collect();
        if settings.config.plots {
            plot::plot_lines(
                &dir.join("srr.svg"),
                "Sideband rejection ratio",
                "Frequency [MHz]",
                "SRR [dB]",
                &freqs,
                &[("USB", srr_usb.as_slice()), ("LSB", srr_lsb.as_slice())],
            )?;
        }
        Arrays::new()
            .int("channels", &channels.iter().map(|&k| k as i64).collect::<Vec<_>>())
            .real("freqs", &freqs)
            .real("usb_tone_usb", usb_tone_a)
            .real("usb_tone_lsb", usb_tone_b)
            .real("lsb_tone_usb", lsb_tone_a)
            .real("lsb_tone_lsb", lsb_tone_b)
            .real("srr_usb", &srr_usb)
            .real("srr_lsb", &srr_lsb)
            .write(&dir.join("srr.npz"))
            .await
    }
}

impl Experiment for Dss {
    fn name(&self) -> &'static str {
        "dss_calibrator"
    }

    fn check(&self, settings: &Settings) -> Result<(), Error> {
        let config = &settings.config;
        Settings::require(&config.rf_source, "rf_source")?;
        if config.lo_sources.is_empty() {
            return Err(Error::Config("missing key lo_sources".to_string()));
        }
        Settings::require(&settings.cal_pow, "cal_pow_info")?;
        Settings::require(&settings.crosspow, "crosspow_info")?;
        Settings::require(&settings.synth, "synth_info")?;
        Settings::require(&settings.consts, "const_brams_info")?;
        if config.kerr_correction {
            Settings::require(&config.m_dsb, "m_dsb")?;
        }
        Ok(())
    }

    async fn run_lo(&mut self, session: &mut Session, lo: &[f64], dir: &Path) -> Result<()> {
        session.load_ideal_constants(2).await?;
        self.calibrate(session, lo, dir).await?;
        self.verify(session, lo, dir).await
    }
}
