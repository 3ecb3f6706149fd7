//! `usocks-client`: connect to a tunnel server and carry local connections
//! over it.

mod cli;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use usocks::{
    client::TunnelClient,
    config::ClientFile,
    logging::{self, LogTarget},
    panic,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    let target = LogTarget::open(cli.logfile.as_deref()).context("cannot open log file")?;
    logging::init(cli.verbose, target).context("cannot install logger")?;
    panic::install_backtrace_hook();

    let (ClientFile { mut client }, origin) = ClientFile::load(cli.config.as_deref())?;
    info!(layer = "tunnel", client = "-", config = %origin.display(), "configuration loaded");
    if let Some(listen) = cli.listen {
        client.listen = listen;
    }

    let tunnel = TunnelClient::connect(&client).await?;
    info!(layer = "tunnel", client = "-", backend = %client.backend.kind, "connected to server");
    tunnel.run().await?;
    Ok(())
}
