//! Installation of the process-wide `tracing` subscriber.
//!
//! Events carry a `layer` field (`tunnel`, `record` or `frontend`) and a
//! `client` field holding the peer address, or `-` when there is none.

use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
    sync::Mutex,
};

use tracing::subscriber::{SetGlobalDefaultError, set_global_default};
use tracing_subscriber::{EnvFilter, fmt};

/// Where log output goes.
#[derive(Debug)]
pub enum LogTarget {
    /// Standard output.
    Stdout,
    /// A file opened for appending.
    File(File),
}

impl LogTarget {
    /// Resolve the `--logfile` argument; `None` and `-` mean stdout.
    ///
    /// # Errors
    ///
    /// Returns the error raised while opening the file.
    pub fn open(path: Option<&Path>) -> io::Result<Self> {
        match path {
            None => Ok(Self::Stdout),
            Some(path) if path == Path::new("-") => Ok(Self::Stdout),
            Some(path) => OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map(Self::File),
        }
    }
}

/// Default filter directive: `info`, or `debug` when `verbose`.
#[must_use]
pub fn default_directive(verbose: bool) -> &'static str { if verbose { "debug" } else { "info" } }

/// Install a formatting subscriber writing to `target`.
///
/// `RUST_LOG` overrides the level chosen by `verbose`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init(verbose: bool, target: LogTarget) -> Result<(), SetGlobalDefaultError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
    let builder = fmt().with_env_filter(filter).with_target(false);
    match target {
        LogTarget::Stdout => set_global_default(builder.finish()),
        LogTarget::File(file) => set_global_default(
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .finish(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(false, "info")]
    #[case(true, "debug")]
    fn verbosity_selects_level(#[case] verbose: bool, #[case] expected: &str) {
        assert_eq!(default_directive(verbose), expected);
    }

    #[test]
    fn dash_means_stdout() {
        assert!(matches!(
            LogTarget::open(Some(Path::new("-"))),
            Ok(LogTarget::Stdout)
        ));
        assert!(matches!(LogTarget::open(None), Ok(LogTarget::Stdout)));
    }

    #[test]
    fn logfile_is_created_for_append() {
        let path = std::env::temp_dir().join(format!("usocks-log-{}.log", std::process::id()));
        let target = LogTarget::open(Some(&path)).expect("open log file");
        assert!(matches!(target, LogTarget::File(_)));
        std::fs::remove_file(&path).expect("remove log file");
    }
}
