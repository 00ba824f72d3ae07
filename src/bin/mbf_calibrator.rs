use anyhow::Result;
use clap::Parser;
use roachcal::{app::App, args::Args, experiment::mbf::MbfCal};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    App::new(&Args::parse(), MbfCal).await?.run().await?;
    Ok(())
}
