use anyhow::Result;
use clap::Parser;
use roachcal::{app::App, args::Args, experiment::dss::Dss};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    App::new(&Args::parse(), Dss).await?.run().await?;
    Ok(())
}
