//! Command line interface for `usocks-client`.

use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

/// Command line arguments for the `usocks-client` binary.
#[derive(Debug, Parser)]
#[command(
    name = "usocks-client",
    version,
    about = "Carry local TCP connections to a usocks server over one encrypted link"
)]
pub struct Cli {
    /// Configuration file holding a `[client]` table; looked up like the
    /// server's.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Accept local connections here instead of `client.listen`.
    #[arg(short = 'L', long, value_name = "ADDR")]
    pub listen: Option<SocketAddr>,
    /// Log debug messages.
    #[arg(short, long)]
    pub verbose: bool,
    /// Append logs to this file instead of stdout; `-` means stdout.
    #[arg(short, long, value_name = "PATH")]
    pub logfile: Option<PathBuf>,
}
