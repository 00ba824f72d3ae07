use anyhow::Result;
use clap::Parser;
use roachcal::{app::App, args::Args, experiment::stability::Stability};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    App::new(&Args::parse(), Stability).await?.run().await?;
    Ok(())
}
