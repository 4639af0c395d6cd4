#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod worker;

use anyhow::Result;
use modhost::{ClapCommandSurface, Dispatched, LaunchOptions};
use modhost_bootstrap::{FileConfigProvider, LoggingConfig, init_logging, register_defaults};
use std::sync::Arc;

use crate::worker::Worker;

fn command_surface() -> ClapCommandSurface {
    ClapCommandSurface::new(
        clap::Command::new("modhost-demo")
            .about("ModHost demo - a worker module wired with config and logger defaults")
            .version(env!("CARGO_PKG_VERSION")),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    // Console logging at `info` until the logger module sees the configuration.
    let logging = init_logging(&LoggingConfig::default())?;

    let host = modhost::default_coordinator();
    let provider = Arc::new(FileConfigProvider::new());
    register_defaults(host, provider, Some(logging.level_handle()))?;
    host.register_with_name("worker", Arc::new(Worker::default()))?;

    tracing::info!("modhost-demo starting");
    let options = LaunchOptions::default().with_parser(Box::new(command_surface()));
    match host.run(options).await? {
        Dispatched::Root => tracing::info!("modhost-demo stopped"),
        Dispatched::SubCommand(name) => tracing::debug!(command = %name, "sub-command finished"),
        Dispatched::Exited => {}
    }
    Ok(())
}
