use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

// =============================================================================
// Relay config (figment-deserialized from defaults / socket_relay.toml / env)
// =============================================================================
//
//   socket_relay.toml:   [upstream]
//                        port = 7000
//
//   env var:             SOCKET_RELAY_UPSTREAM__PORT=7000   (double underscore = nesting)

pub const DEFAULT_CONFIG_FILE: &str = "socket_relay.toml";
pub const ENV_PREFIX: &str = "SOCKET_RELAY_";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
}

/// The TCP service being relayed (lives under `[upstream]`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_host")]
    pub host: String,
    #[serde(default = "default_upstream_port")]
    pub port: u16,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: default_upstream_host(),
            port: default_upstream_port(),
        }
    }
}

/// The browser-facing HTTP listener (lives under `[browser]`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BrowserConfig {
    #[serde(default = "default_browser_host")]
    pub host: String,
    #[serde(default = "default_browser_port")]
    pub port: u16,
    /// Whether non-WebSocket requests are answered from `static_dir`.
    #[serde(default = "default_serve_static")]
    pub serve_static: bool,
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            host: default_browser_host(),
            port: default_browser_port(),
            serve_static: default_serve_static(),
            static_dir: default_static_dir(),
            ws_path: default_ws_path(),
        }
    }
}

fn default_upstream_host() -> String {
    "localhost".to_string()
}
fn default_upstream_port() -> u16 {
    6514
}
fn default_browser_host() -> String {
    "0.0.0.0".to_string()
}
fn default_browser_port() -> u16 {
    2000
}
fn default_serve_static() -> bool {
    true
}
fn default_static_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_ws_path() -> String {
    "/ws".to_string()
}

impl BrowserConfig {
    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid browser listen address {}:{}", self.host, self.port))
    }

    /// The directory to serve files from, if file serving is on.
    pub fn static_root(&self) -> Option<PathBuf> {
        self.serve_static.then(|| self.static_dir.clone())
    }
}

/// Command-line values layered on top of every other source. `None` leaves
/// the lower layers alone.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CliOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<BrowserOverrides>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct UpstreamOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct BrowserOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_dir: Option<PathBuf>,
}

/// Build a figment that layers: defaults → config file → SOCKET_RELAY_* env vars → CLI.
pub fn load_figment(config_file: &Path, overrides: &CliOverrides) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(RelayConfig::default()))
        .merge(Toml::file(config_file))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .merge(Serialized::defaults(overrides))
}

impl RelayConfig {
    pub fn load(config_file: Option<&Path>, overrides: &CliOverrides) -> Result<Self> {
        let path = config_file.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        if config_file.is_some() && !path.exists() {
            anyhow::bail!("config file {} does not exist", path.display());
        }
        load_figment(path, overrides)
            .extract()
            .context("failed to load relay configuration")
    }
}
