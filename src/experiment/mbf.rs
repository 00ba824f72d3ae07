//! Multi-beam former calibration and scan.
//!
//! [`MbfCal`] equalizes the ports of the beamformer. With the RF tone at the
//! calibration channel, the cross-power of every port with the reference port
//! and the port powers give one coefficient per port, which multiplies the
//! constants currently loaded. The calibration is verified by reading the
//! ports again.
//!
//! [`MbfScan`] steers the beam over a grid of azimuths and elevations through
//! the phasor bank and records the beam power at the calibration channel.

use super::{Experiment, Session};
use crate::{
    archive::Arrays,
    config::Settings,
    error::Error,
    plot,
    sim::Role,
    solve::{beam, mbf},
    spectra,
};
use anyhow::Result;
use num_complex::Complex64;
use roachcal_json::ArrayInfo;
use std::path::Path;

fn array(settings: &Settings) -> Result<&ArrayInfo, Error> {
    Settings::require(&settings.config.array_info, "array_info")
}

/// Multi-beam former port calibration.
#[derive(Debug, Default, Clone)]
pub struct MbfCal;

impl MbfCal {
    async fn load_ideal_phasors(&mut self, session: &mut Session) -> Result<()> {
        let (array, bank) = {
            let settings = session.settings();
            (array(settings)?.clone(), settings.bank.clone())
        };
        let Some(bank) = bank else {
            return Ok(());
        };
        if !array.ideal_phase_consts {
            return Ok(());
        }
        tracing::info!("loading ideal phasors");
        let num_elements = beam::element_positions(&array).len();
        let mut overflows = 0;
        for j in 0..num_elements {
            let address = beam::element_address(&array, j, bank.addr_regs().len())
                .ok_or_else(|| Error::Config(format!("phasor_bank: no address for element {j}")))?;
            overflows += session
                .fpga()
                .write_phasor(&bank, Complex64::new(1.0, 0.0), &address)
                .await?;
        }
        session.add_overflows(overflows);
        Ok(())
    }
}

impl Experiment for MbfCal {
    fn name(&self) -> &'static str {
        "mbf_calibrator"
    }

    fn check(&self, settings: &Settings) -> Result<(), Error> {
        array(settings)?;
        Settings::require(&settings.config.rf_source, "rf_source")?;
        Settings::require(&settings.cal_pow, "cal_pow_info")?;
        Settings::require(&settings.crosspow, "crosspow_info")?;
        Settings::require(&settings.consts, "const_brams_info")?;
        Ok(())
    }

    async fn run_lo(&mut self, session: &mut Session, lo: &[f64], dir: &Path) -> Result<()> {
        let k0 = array(session.settings())?.freq_chnl;
        self.load_ideal_phasors(session).await?;
        let ports = session.read_constants().await?.len();
        session.load_ideal_constants(ports).await?;
        session.tune(Role::Rf, k0, lo).await?;

        let before = session.read_inputs().await?;
        before
            .arrays()
            .write(&dir.join("cal_rawdata").join("ports.npz"))
            .await?;
        let sample = before.at(k0)?;
        let coefficients = mbf::port_coefficients(&sample.cross, &sample.powers);
        let current: Vec<Complex64> = session
            .read_constants()
            .await?
            .iter()
            .map(|row| row.get(k0).copied().unwrap_or(Complex64::new(0.0, 0.0)))
            .collect();
        let updated = mbf::update_constants(&current, &coefficients);
        let len = session.const_len()?;
        tracing::info!(ports = updated.len(), channel = k0, "writing port constants");
        let rows: Vec<Vec<Complex64>> = updated.iter().map(|&c| vec![c; len]).collect();
        session.write_constants(&rows).await?;
        session.settle().await?;

        let after = session.read_inputs().await?.at(k0)?;
        let residuals = mbf::residuals(&after.cross, &after.powers);
        let (magnitude, phase) = mbf::max_deviation(&residuals);
        tracing::info!(
            max_magnitude_error = magnitude,
            max_phase_error_deg = phase,
            "port residuals"
        );

        Arrays::new()
            .int("channel", &[k0 as i64])
            .real("powers_before", &sample.powers)
            .complex("cross_before", &sample.cross)
            .complex("coefficients", &coefficients)
            .complex("previous_consts", &current)
            .complex("consts", &updated)
            .real("powers_after", &after.powers)
            .complex("cross_after", &after.cross)
            .real(
                "residual_magnitude",
                &residuals.iter().map(|r| r.magnitude).collect::<Vec<_>>(),
            )
            .real(
                "residual_phase",
                &residuals.iter().map(|r| r.phase_deg).collect::<Vec<_>>(),
            )
            .write(&dir.join("mbf_consts.npz"))
            .await
    }
}

/// Multi-beam former scan.
#[derive(Debug, Default, Clone)]
pub struct MbfScan;

impl Experiment for MbfScan {
    fn name(&self) -> &'static str {
        "mbf_scan"
    }

    fn check(&self, settings: &Settings) -> Result<(), Error> {
        array(settings)?;
        Settings::require(&settings.config.rf_source, "rf_source")?;
        Settings::require(&settings.bank, "phasor_bank")?;
        Settings::require(&settings.synth, "synth_info")?;
        Ok(())
    }

    async fn run_lo(&mut self, session: &mut Session, lo: &[f64], dir: &Path) -> Result<()> {
        let (array, bank) = {
            let settings = session.settings();
            (
                array(settings)?.clone(),
                Settings::require(&settings.bank, "phasor_bank")?.clone(),
            )
        };
        let k0 = array.freq_chnl;
        let positions = beam::element_positions(&array);
        let wavelength = beam::wavelength(array.speed, array.freq);
        let addresses = (0..positions.len())
            .map(|j| {
                beam::element_address(&array, j, bank.addr_regs().len()).ok_or_else(|| {
                    Error::Config(format!("phasor_bank: no address for element {j}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let azimuths = beam::scan_angles(array.az_ang_range);
        let elevations = beam::scan_angles(array.el_ang_range);
        tracing::info!(
            azimuths = azimuths.len(),
            elevations = elevations.len(),
            elements = positions.len(),
            "beam scan"
        );
        session.tune(Role::Rf, k0, lo).await?;

        let mut power = Vec::with_capacity(elevations.len());
        for &el in &elevations {
            let mut row = Vec::with_capacity(azimuths.len());
            for &az in &azimuths {
                crate::sweep::check_cancelled(session.cancel())?;
                let phasors = beam::steering_phasors(&positions, az, el, wavelength);
                let mut overflows = 0;
                for (phasor, address) in phasors.iter().zip(addresses.iter()) {
                    overflows += session
                        .fpga()
                        .write_phasor(&bank, phasor.conj(), address)
                        .await?;
                }
                session.add_overflows(overflows);
                session.settle().await?;
                let outputs = session.read_outputs().await?;
                let p = outputs
                    .first()
                    .and_then(|beam| beam.get(k0))
                    .copied()
                    .ok_or_else(|| Error::Config(format!("synth_info: no channel {k0}")))?;
                tracing::debug!(az, el, power = p, "beam power");
                row.push(p);
            }
            power.push(row);
        }

        let dbfs_const = session.settings().config.dbfs_const;
        let power_dbfs: Vec<Vec<f64>> = power
            .iter()
            .map(|row| spectra::to_dbfs(row, 1, dbfs_const))
            .collect();
        if session.settings().config.plots {
            let labels: Vec<String> = elevations.iter().map(|el| format!("el = {el}°")).collect();
            let series: Vec<(&str, &[f64])> = labels
                .iter()
                .map(String::as_str)
                .zip(power_dbfs.iter().map(Vec::as_slice))
                .collect();
            plot::plot_lines(
                &dir.join("beam_pattern.svg"),
                "Beam pattern",
                "Azimuth [deg]",
                "Power [dBFS]",
                &azimuths,
                &series,
            )?;
        }
        Arrays::new()
            .int("channel", &[k0 as i64])
            .real("az", &azimuths)
            .real("el", &elevations)
            .real_2d("power", &power)
            .real_2d("power_dbfs", &power_dbfs)
            .write(&dir.join("beam_pattern.npz"))
            .await
    }
}
