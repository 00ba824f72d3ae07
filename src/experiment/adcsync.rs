//! ADC synchronization.
//!
//! The ADCs selected by `cal_adcs` are aligned with the first of them by
//! programming their delay registers. Each iteration measures the lag of
//! every ADC with respect to the reference, and the delays are adjusted until
//! every lag has been zero for `sync_zero_iterations` consecutive iterations.
//!
//! In the frequency domain the lag is the slope of the phase of `b / a` as
//! the RF tone is swept over the calibration channels. In the time domain it
//! is the peak of the cross-correlation of snapshots captured on the same
//! clock.

use super::{cross_column, power_column, sweep_plot, Experiment, InputMeasure, Session};
use crate::{
    archive::Arrays,
    config::Settings,
    error::Error,
    memory,
    sim::{Role, Sideband},
    solve::{delay, sideband},
    sweep,
};
use anyhow::{Context, Result};
use roachcal_json::SnapshotInfo;
use std::path::Path;

/// Domain in which the lags are measured.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Domain {
    /// Phase slope of the cross-power across a tone sweep.
    Frequency,
    /// Cross-correlation of synchronized snapshots.
    Time,
}

/// ADC synchronization.
#[derive(Debug, Clone)]
pub struct AdcSync {
    domain: Domain,
}

// Index in `snapshots` of every ADC to synchronize, reference first.
fn selected(settings: &Settings) -> Result<Vec<usize>, Error> {
    let snapshots = &settings.config.snapshots;
    let indices: Vec<usize> = if settings.config.cal_adcs.is_empty() {
        (0..snapshots.len()).collect()
    } else {
        settings
            .config
            .cal_adcs
            .iter()
            .map(|zdok| {
                snapshots
                    .iter()
                    .position(|s| s.zdok == *zdok)
                    .ok_or_else(|| Error::Config(format!("cal_adcs: no snapshot for ZDOK {zdok}")))
            })
            .collect::<Result<_, _>>()?
    };
    if indices.len() < 2 {
        return Err(Error::Config(
            "at least two ADCs are needed for synchronization".to_string(),
        ));
    }
    for &j in &indices {
        if snapshots[j].delay_reg.is_none() {
            return Err(Error::Config(format!(
                "missing key snapshots[{j}].delay_reg"
            )));
        }
    }
    Ok(indices)
}

impl AdcSync {
    /// Creates an ADC synchronization in a domain.
    pub fn new(domain: Domain) -> AdcSync {
        AdcSync { domain }
    }

    async fn lags_frequency(
        &mut self,
        session: &mut Session,
        adcs: &[usize],
        lo: &[f64],
        dir: &Path,
        iteration: usize,
    ) -> Result<Vec<i64>> {
        let channels = session.cal_channels();
        let plan = session.plan(&channels, lo, Sideband::Upper);
        let mut measure =
            InputMeasure::new(session, dir.join("cal_rawdata"), &format!("iter{iteration:02}"))?;
        let labels: Vec<String> = (0..session.settings().config.snapshots.len())
            .map(|j| format!("ADC {j}"))
            .collect();
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
        let mut plot = sweep_plot(
            session,
            dir.join(format!("iter{iteration:02}.svg")),
            &format!("Iteration {iteration}"),
            "Power [dBFS]",
            &labels,
        );
        let records = session
            .sweep(Role::Rf, &plan, &mut measure, &mut plot)
            .await?;
        let freqs: Vec<f64> = plan.steps.iter().map(|s| s.freq).collect();
        let fs = 2.0 * session.settings().config.bw;
        let aa = power_column(&records, 0)?;
        adcs.iter()
            .map(|&j| {
                if j == 0 {
                    return Ok(0);
                }
                // row j - 1 is a * conj(x_j), so conj(row) / aa is x_j / a
                let ratios = sideband::ratio_usb(&aa, &cross_column(&records, j - 1)?);
                Ok(delay::estimate_delay(&freqs, &ratios, fs))
            })
            .collect()
    }

    async fn lags_time(&mut self, session: &mut Session, adcs: &[usize]) -> Result<Vec<i64>> {
        let (snapshots, trig, samples) = {
            let config = &session.settings().config;
            let snapshots: Vec<SnapshotInfo> =
                adcs.iter().map(|&j| config.snapshots[j].clone()).collect();
            let trig = Settings::require(&config.snap_trig_reg, "snap_trig_reg")?.clone();
            (snapshots, trig, config.snap_samples)
        };
        let names: Vec<String> = snapshots.iter().flat_map(|s| s.names.clone()).collect();
        let data = session
            .fpga()
            .snapshot_all_sync(&names, &trig, samples)
            .await?;
        let mut lanes = data.into_iter();
        let series: Vec<Vec<f64>> = snapshots
            .iter()
            .map(|s| {
                let lanes: Vec<Vec<f64>> = lanes
                    .by_ref()
                    .take(s.names.len())
                    .map(|x| x.into_iter().map(f64::from).collect())
                    .collect();
                memory::interleave(&lanes)
            })
            .collect();
        Ok(series
            .iter()
            .map(|x| delay::estimate_lag(&series[0], x))
            .collect())
    }
}

impl Experiment for AdcSync {
    fn name(&self) -> &'static str {
        match self.domain {
            Domain::Frequency => "adc_sync_freq",
            Domain::Time => "adc_sync_time",
        }
    }

    fn check(&self, settings: &Settings) -> Result<(), Error> {
        let adcs = selected(settings)?;
        match self.domain {
            Domain::Frequency => {
                Settings::require(&settings.config.rf_source, "rf_source")?;
                Settings::require(&settings.cal_pow, "cal_pow_info")?;
                Settings::require(&settings.crosspow, "crosspow_info")?;
                if adcs[0] != 0 {
                    return Err(Error::Config(
                        "cal_adcs: the reference must be the first snapshot".to_string(),
                    ));
                }
            }
            Domain::Time => {
                Settings::require(&settings.config.snap_trig_reg, "snap_trig_reg")?;
            }
        }
        Ok(())
    }

    async fn run_lo(&mut self, session: &mut Session, lo: &[f64], dir: &Path) -> Result<()> {
        let adcs = selected(session.settings())?;
        let regs: Vec<String> = adcs
            .iter()
            .filter_map(|&j| session.settings().config.snapshots[j].delay_reg.clone())
            .collect();
        let config = &session.settings().config;
        let (zero_needed, max_iterations) = (
            config.sync_zero_iterations.max(1),
            config.sync_max_iterations,
        );

        let mut delays = Vec::with_capacity(regs.len());
        for reg in &regs {
            delays.push(i64::from(session.fpga().read_reg(reg).await?));
        }
        let mut history = Vec::new();
        let mut zero_run = 0;
        while zero_run < zero_needed && history.len() < max_iterations {
            sweep::check_cancelled(session.cancel())?;
            let iteration = history.len();
            let lags = match self.domain {
                Domain::Frequency => {
                    self.lags_frequency(session, &adcs, lo, dir, iteration)
                        .await?
                }
                Domain::Time => self.lags_time(session, &adcs).await?,
            };
            tracing::info!(iteration, ?lags, ?delays, "ADC lags");
            if lags.iter().all(|&l| l == 0) {
                zero_run += 1;
            } else {
                zero_run = 0;
                delays = delay::align_delays(&delays, &lags);
                for (reg, &d) in regs.iter().zip(delays.iter()) {
                    let value = u32::try_from(d)
                        .with_context(|| format!("delay {d} out of range for {reg}"))?;
                    session.fpga().set_reg(reg, value).await?;
                }
                session.settle().await?;
            }
            history.push(lags);
        }

        Arrays::new()
            .int("adcs", &adcs.iter().map(|&j| j as i64).collect::<Vec<_>>())
            .int_2d("lags", &history)
            .int("delays", &delays)
            .int("iterations", &[history.len() as i64])
            .write(&dir.join("adcsync.npz"))
            .await?;
        anyhow::ensure!(
            zero_run >= zero_needed,
            "ADCs not synchronized after {} iterations",
            history.len()
        );
        tracing::info!(iterations = history.len(), ?delays, "ADCs synchronized");
        Ok(())
    }
}
