//! Command line interface for `usocks-server`.

use std::path::PathBuf;

use clap::Parser;

/// Command line arguments for the `usocks-server` binary.
#[derive(Debug, Parser)]
#[command(
    name = "usocks-server",
    version,
    about = "Tunnel server multiplexing virtual connections over encrypted links"
)]
pub struct Cli {
    /// Configuration file; defaults to ./config.toml, ~/.usocks.toml or
    /// /etc/usocks.toml, whichever exists first.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Log debug messages.
    #[arg(short, long)]
    pub verbose: bool,
    /// Append logs to this file instead of stdout; `-` means stdout.
    #[arg(short, long, value_name = "PATH")]
    pub logfile: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Cli;

    #[test]
    fn parses_short_options() {
        let cli = Cli::parse_from(["usocks-server", "-c", "/tmp/u.toml", "-v", "-l", "-"]);
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("/tmp/u.toml")));
        assert!(cli.verbose);
        assert_eq!(cli.logfile.as_deref(), Some(std::path::Path::new("-")));
    }

    #[test]
    fn everything_is_optional() {
        let cli = Cli::parse_from(["usocks-server"]);
        assert!(cli.config.is_none());
        assert!(!cli.verbose);
    }
}
