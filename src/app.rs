//! roachcal application.
//!
//! This module contains the top-level structure [`App`] shared by the
//! roachcal programs. It loads the configuration, runs one experiment, and
//! cancels it when the operator interrupts the program.

use crate::{
    args::Args,
    config::{self, Settings},
    experiment::{self, Experiment},
};
use anyhow::Result;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// roachcal application.
///
/// This struct owns the validated configuration and the experiment to run.
#[derive(Debug)]
pub struct App<E> {
    settings: Settings,
    experiment: E,
}

impl<E: Experiment + std::fmt::Debug> App<E> {
    /// Creates a new application.
    ///
    /// The configuration file given in the arguments is loaded and validated.
    /// No device is touched.
    #[tracing::instrument(name = "App::new", level = "debug")]
    pub async fn new(args: &Args, experiment: E) -> Result<App<E>> {
        let settings = config::load(&args.config).await?;
        Ok(App {
            settings,
            experiment,
        })
    }

    /// Runs the application.
    ///
    /// A Ctrl-C cancels the experiment. The sources are turned off and the
    /// partial results are archived before the error is returned. On success
    /// the path of the result archive is returned.
    #[tracing::instrument(name = "App::run", level = "debug", skip_all)]
    pub async fn run(self) -> Result<PathBuf> {
        let cancel = CancellationToken::new();
        let interrupt = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        tracing::warn!("interrupted by the operator");
                        cancel.cancel();
                    }
                    Err(err) => tracing::error!("failed to listen for Ctrl-C: {err}"),
                }
            }
        });
        let result = experiment::run(self.settings, self.experiment, cancel).await;
        interrupt.abort();
        let archive = result?;
        tracing::info!(archive = %archive.display(), "experiment finished");
        Ok(archive)
    }
}
