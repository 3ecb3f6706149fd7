//! `usocks-server`: load the configuration and run the tunnel server.

mod cli;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use usocks::{
    config::Config,
    logging::{self, LogTarget},
    panic,
    server::TunnelServer,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    let target = LogTarget::open(cli.logfile.as_deref()).context("cannot open log file")?;
    logging::init(cli.verbose, target).context("cannot install logger")?;
    panic::install_backtrace_hook();

    let (config, origin) = Config::load(cli.config.as_deref())?;
    info!(layer = "tunnel", client = "-", config = %origin.display(), "configuration loaded");

    if let Some(addr) = config.server.metrics {
        install_metrics(addr)?;
    }

    let server = TunnelServer::from_config(&config.server)?;
    server.run().await?;
    Ok(())
}

#[cfg(feature = "metrics")]
fn install_metrics(addr: std::net::SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("cannot start metrics exporter")?;
    info!(layer = "tunnel", client = "-", %addr, "metrics exporter listening");
    Ok(())
}

#[cfg(not(feature = "metrics"))]
fn install_metrics(addr: std::net::SocketAddr) -> anyhow::Result<()> {
    tracing::warn!(layer = "tunnel", client = "-", %addr, "built without metrics support; ignoring server.metrics");
    Ok(())
}
