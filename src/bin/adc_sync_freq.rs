use anyhow::Result;
use clap::Parser;
use roachcal::{app::App, args::Args, experiment::adcsync::{AdcSync, Domain}};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    App::new(&Args::parse(), AdcSync::new(Domain::Frequency)).await?.run().await?;
    Ok(())
}
