//! Configuration files for the server and the client.
//!
//! ```toml
//! [server]
//! key = "shared secret"
//! metrics = "127.0.0.1:9000"   # optional
//!
//! [server.backend]
//! type = "plain_tcp"
//! port = 4194
//!
//! [server.frontend]
//! type = "redirect"
//! server = "localhost"
//! port = 80
//! ```
//!
//! A client reads a `[client]` table instead; both may share one file.
//!
//! ```toml
//! [client]
//! key = "shared secret"
//! listen = "127.0.0.1:8080"    # default 0.0.0.0:8080
//!
//! [client.backend]
//! type = "plain_tcp"
//! server = "tunnel.example.org"
//! port = 4194
//! ```
//!
//! Apart from `type`, each plugin table is passed unchanged to the plugin
//! named by `type`.

use std::{
    env, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use serde::{Deserialize, de::DeserializeOwned};
use thiserror::Error;

use crate::record::PresharedKey;

/// Root of the configuration file.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Settings for the tunnel server.
    pub server: ServerConfig,
}

/// The `[server]` table.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Pre-shared key for the record layer.
    pub key: String,
    /// Address for the Prometheus exporter, if metrics are wanted.
    #[serde(default)]
    pub metrics: Option<SocketAddr>,
    /// Transport accepting record-layer connections.
    pub backend: PluginConfig,
    /// Endpoint type for virtual connections.
    pub frontend: PluginConfig,
}

impl ServerConfig {
    /// Record-layer key derived from [`key`](Self::key).
    #[must_use]
    pub fn preshared_key(&self) -> PresharedKey { PresharedKey::new(&self.key) }
}

/// Root of a client configuration file.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ClientFile {
    /// Settings for the tunnel client.
    pub client: ClientConfig,
}

/// The `[client]` table.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Pre-shared key for the record layer.
    pub key: String,
    /// Local address accepting connections to tunnel.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Transport to the server; options name the server to dial.
    pub backend: PluginConfig,
}

impl ClientConfig {
    /// Record-layer key derived from [`key`](Self::key).
    #[must_use]
    pub fn preshared_key(&self) -> PresharedKey { PresharedKey::new(&self.key) }
}

fn default_listen() -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 8080)) }

/// A plugin selected by type name plus its options.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct PluginConfig {
    /// Catalogue name of the plugin.
    #[serde(rename = "type")]
    pub kind: String,
    /// Remaining keys of the table.
    #[serde(flatten)]
    pub options: toml::Table,
}

/// Errors raised while locating or reading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No candidate file exists.
    #[error("cannot find a config file (searched {})", display_paths(.searched))]
    NotFound {
        /// Paths that were tried.
        searched: Vec<PathBuf>,
    },
    /// The file could not be read.
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid configuration.
    #[error("invalid config {}: {source}", .path.display())]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },
    /// The pre-shared key of the named table is empty.
    #[error("{0}.key must not be empty")]
    EmptyKey(&'static str),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Config {
    /// Parse configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed input, attributed to
    /// `origin`, or [`ConfigError::EmptyKey`].
    pub fn from_toml(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Self = parse(text, origin)?;
        if config.server.key.is_empty() {
            return Err(ConfigError::EmptyKey("server"));
        }
        Ok(config)
    }

    /// Load configuration from `path`, or from the first existing default
    /// location when `path` is `None`.
    ///
    /// Returns the configuration together with the file it came from.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if no file is found or it cannot be read
    /// or parsed.
    pub fn load(path: Option<&Path>) -> Result<(Self, PathBuf), ConfigError> {
        let (text, path) = read(path)?;
        Ok((Self::from_toml(&text, &path)?, path))
    }
}

impl ClientFile {
    /// Parse client configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed input, attributed to
    /// `origin`, or [`ConfigError::EmptyKey`].
    pub fn from_toml(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Self = parse(text, origin)?;
        if config.client.key.is_empty() {
            return Err(ConfigError::EmptyKey("client"));
        }
        Ok(config)
    }

    /// Load client configuration the same way as [`Config::load`].
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if no file is found or it cannot be read
    /// or parsed.
    pub fn load(path: Option<&Path>) -> Result<(Self, PathBuf), ConfigError> {
        let (text, path) = read(path)?;
        Ok((Self::from_toml(&text, &path)?, path))
    }
}

fn parse<T: DeserializeOwned>(text: &str, origin: &Path) -> Result<T, ConfigError> {
    toml::from_str(text).map_err(|source| ConfigError::Parse {
        path: origin.to_path_buf(),
        source,
    })
}

/// Read `path`, or the first existing default location.
fn read(path: Option<&Path>) -> Result<(String, PathBuf), ConfigError> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let searched = default_locations();
            let found = searched.iter().find(|candidate| candidate.is_file()).cloned();
            found.ok_or(ConfigError::NotFound { searched })?
        }
    };
    let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    Ok((text, path))
}

/// Candidate files in lookup order: `./config.toml`, `~/.usocks.toml`,
/// `/etc/usocks.toml`.
#[must_use]
pub fn default_locations() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("config.toml")];
    if let Some(home) = env::var_os("HOME") {
        paths.push(Path::new(&home).join(".usocks.toml"));
    }
    paths.push(PathBuf::from("/etc/usocks.toml"));
    paths
}
