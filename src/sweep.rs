//! Sweep engine.
//!
//! A sweep steps a source through the frequencies of a list of channels. At
//! each step the source is set, the settle time elapses, and a [`Measure`]
//! collects a record from the FPGA. A [`SweepObserver`] is notified after
//! every step, which is how plots are updated.
//!
//! A measurement that fails with a retryable error is retried once. Any
//! failure, including a cancellation by the operator, turns the source off
//! before it is propagated.

use crate::{
    error::{self, Error},
    fpga::Roach,
    instrument::Instrument,
    sim::Sideband,
    spectra,
};
use anyhow::{Context, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sweep step.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Step {
    /// Position of the step in the sweep.
    pub index: usize,
    /// Channel measured.
    pub channel: usize,
    /// Baseband frequency of the channel in MHz.
    pub freq: f64,
    /// Frequency of the source in MHz.
    pub rf_freq: f64,
}

/// Sweep plan.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    /// Steps of the sweep.
    pub steps: Vec<Step>,
    /// Time to wait after setting the source.
    pub settle: Duration,
    /// Sideband in which the tone is placed.
    pub sideband: Sideband,
    /// Sum of the LO frequencies in MHz.
    pub center_mhz: f64,
}

impl SweepPlan {
    /// Creates a sweep plan over the channels `channels` of a spectrum of `n`
    /// channels spanning `bw` MHz.
    ///
    /// The source frequency is `center_mhz + f` in the upper sideband and
    /// `center_mhz - f` in the lower sideband, where `f` is the baseband
    /// frequency of the channel.
    pub fn new(
        channels: &[usize],
        bw: f64,
        n: usize,
        center_mhz: f64,
        sideband: Sideband,
        settle: Duration,
    ) -> SweepPlan {
        let steps = channels
            .iter()
            .enumerate()
            .map(|(index, &channel)| {
                let freq = spectra::channel_to_frequency(channel, bw, n);
                let rf_freq = match sideband {
                    Sideband::Upper => center_mhz + freq,
                    Sideband::Lower => center_mhz - freq,
                };
                Step {
                    index,
                    channel,
                    freq,
                    rf_freq,
                }
            })
            .collect();
        SweepPlan {
            steps,
            settle,
            sideband,
            center_mhz,
        }
    }

    /// Channels of the sweep.
    pub fn channels(&self) -> Vec<usize> {
        self.steps.iter().map(|s| s.channel).collect()
    }
}

/// Per-step measurement.
#[allow(async_fn_in_trait)]
pub trait Measure {
    /// Record collected at each step.
    type Record;

    /// Collects the record of a step.
    async fn measure(&mut self, fpga: &mut Roach, step: &Step) -> Result<Self::Record>;

    /// Values of a record shown by the observer, one per plotted series.
    fn plot_values(&self, _record: &Self::Record) -> Vec<f64> {
        Vec::new()
    }
}

/// Sweep observer.
pub trait SweepObserver {
    /// Called after every step with the plotted values of its record.
    fn on_step(&mut self, step: &Step, values: &[f64]);

    /// Called once after the last step.
    fn on_finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Observer that only logs the steps.
#[derive(Debug, Default, Clone)]
pub struct TraceObserver;

impl SweepObserver for TraceObserver {
    fn on_step(&mut self, step: &Step, values: &[f64]) {
        tracing::debug!(
            index = step.index,
            channel = step.channel,
            freq = step.freq,
            ?values,
            "sweep step"
        );
    }
}

/// Waits for `duration` unless the run is cancelled first.
pub async fn settle(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(Error::Cancelled.into()),
    }
}

/// Fails with [`Error::Cancelled`] if the run has been cancelled.
pub fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled.into());
    }
    Ok(())
}

async fn run_step<M: Measure>(
    fpga: &mut Roach,
    source: &mut Instrument,
    plan: &SweepPlan,
    step: &Step,
    measure: &mut M,
    cancel: &CancellationToken,
) -> Result<M::Record> {
    check_cancelled(cancel)?;
    source.set_frequency(Some(step.rf_freq)).await?;
    settle(plan.settle, cancel).await?;
    match measure.measure(fpga, step).await {
        Ok(record) => Ok(record),
        Err(err) if error::is_retryable(&err) => {
            tracing::warn!(step = step.index, channel = step.channel, "measurement failed, retrying: {err:#}");
            settle(plan.settle, cancel).await?;
            measure.measure(fpga, step).await
        }
        Err(err) => Err(err),
    }
}

/// Runs a sweep.
///
/// Returns the records of all the steps, in order.
#[tracing::instrument(name = "sweep::run", level = "debug", skip_all, fields(steps = plan.steps.len()))]
pub async fn run<M: Measure>(
    fpga: &mut Roach,
    source: &mut Instrument,
    plan: &SweepPlan,
    measure: &mut M,
    observer: &mut dyn SweepObserver,
    cancel: &CancellationToken,
) -> Result<Vec<M::Record>> {
    let mut records = Vec::with_capacity(plan.steps.len());
    for step in &plan.steps {
        match run_step(fpga, source, plan, step, measure, cancel).await {
            Ok(record) => {
                observer.on_step(step, &measure.plot_values(&record));
                records.push(record);
            }
            Err(err) => {
                if let Err(off) = source.output_off().await {
                    tracing::error!(source = source.name(), "failed to turn off source: {off:#}");
                }
                return Err(err).with_context(|| {
                    format!("sweep step {} (channel {})", step.index, step.channel)
                });
            }
        }
    }
    observer.on_finish()?;
    Ok(records)
}
