mod configs;
mod launcher;
mod preflight;
mod process;
mod readiness;
mod reaper;
mod service;
mod signals;
mod supervisor;

use crate::process::unix::ShellSpawner;
use crate::readiness::HttpProbe;
use crate::reaper::LsofReaper;
use crate::signals::SignalCoordinator;
use crate::supervisor::Supervisor;
use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Service table, the built-in one is used when omitted
    #[arg(short, long, env = "STAGEHAND_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Launch services without running the preflight steps
    #[arg(long)]
    skip_preflight: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    let mut config = configs::load(args.config.as_deref())?;

    if std::env::var("STAGEHAND_LOG").is_err() {
        std::env::set_var("STAGEHAND_LOG", &config.log);
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("STAGEHAND_LOG"))
        .init();

    debug!("{:#?}", config);
    if args.skip_preflight {
        info!("Skipping preflight steps");
        config.preflight.clear();
    }

    let cancel = CancellationToken::new();
    let _signals = SignalCoordinator::install(cancel.clone())?;

    let spawner = ShellSpawner::new(config.environment.clone(), config.output_buffer_size);
    let mut supervisor = Supervisor::new(&config, spawner, HttpProbe::new()?, LsofReaper, cancel);
    supervisor.run().await?;

    Ok(())
}
