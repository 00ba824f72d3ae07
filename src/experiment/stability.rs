//! Stability measurement.
//!
//! With the RF tone at a fixed channel, the input powers and cross-powers are
//! read repeatedly. The ratio `x_j / a` of every cross-power row is recorded
//! as a magnitude in dB and a phase in degrees, which shows the drift of the
//! relative gain of the inputs over time.

use super::{Experiment, Session};
use crate::{
    archive::Arrays,
    config::Settings,
    error::Error,
    plot,
    sim::Role,
    solve::sideband,
    sweep,
};
use anyhow::Result;
use std::path::Path;

/// Stability measurement.
#[derive(Debug, Default, Clone)]
pub struct Stability;

impl Experiment for Stability {
    fn name(&self) -> &'static str {
        "stability"
    }

    fn check(&self, settings: &Settings) -> Result<(), Error> {
        Settings::require(&settings.config.stability_chnl, "stability_chnl")?;
        Settings::require(&settings.config.rf_source, "rf_source")?;
        Settings::require(&settings.cal_pow, "cal_pow_info")?;
        Settings::require(&settings.crosspow, "crosspow_info")?;
        Ok(())
    }

    async fn run_lo(&mut self, session: &mut Session, lo: &[f64], dir: &Path) -> Result<()> {
        let config = &session.settings().config;
        let k = *Settings::require(&config.stability_chnl, "stability_chnl")?;
        let iterations = config.stability_iters;
        session.tune(Role::Rf, k, lo).await?;

        let start = tokio::time::Instant::now();
        let mut times = Vec::with_capacity(iterations);
        let mut magnitude = Vec::with_capacity(iterations);
        let mut phase = Vec::with_capacity(iterations);
        for iteration in 0..iterations {
            sweep::check_cancelled(session.cancel())?;
            let sample = session.read_inputs().await?.at(k)?;
            let aa = sample.power(0)?;
            let ratios = sideband::ratio_usb(&vec![aa; sample.cross.len()], &sample.cross);
            tracing::debug!(iteration, ?ratios, "stability reading");
            times.push(start.elapsed().as_secs_f64());
            magnitude.push(
                ratios
                    .iter()
                    .map(|r| 20.0 * r.norm().log10())
                    .collect::<Vec<_>>(),
            );
            phase.push(
                ratios
                    .iter()
                    .map(|r| r.arg().to_degrees())
                    .collect::<Vec<_>>(),
            );
            session.settle().await?;
        }

        if session.settings().config.plots && !times.is_empty() {
            let rows = magnitude.first().map(Vec::len).unwrap_or(0);
            for (name, values, unit) in [
                ("stability_magnitude.svg", &magnitude, "Magnitude [dB]"),
                ("stability_phase.svg", &phase, "Phase [deg]"),
            ] {
                let labels: Vec<String> = (1..=rows).map(|j| format!("input {j}")).collect();
                let columns: Vec<Vec<f64>> = (0..rows)
                    .map(|j| values.iter().map(|v| v[j]).collect())
                    .collect();
                let series: Vec<(&str, &[f64])> = labels
                    .iter()
                    .map(String::as_str)
                    .zip(columns.iter().map(Vec::as_slice))
                    .collect();
                plot::plot_lines(&dir.join(name), "Stability", "Time [s]", unit, &times, &series)?;
            }
        }
        Arrays::new()
            .int("channel", &[k as i64])
            .real("time", &times)
            .real_2d("magnitude", &magnitude)
            .real_2d("phase", &phase)
            .write(&dir.join("stability.npz"))
            .await
    }
}
