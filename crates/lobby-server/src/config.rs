//! Server configuration: TOML file + CLI overrides.

use lobby_core::{LobbyError, LobbyResult};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    #[serde(default = "default_admit_timeout")]
    pub admit_timeout: u64,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Seconds between server pings on an active session.
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    /// Seconds without any inbound frame before a session is dropped.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            http_port: default_http_port(),
            ws_path: default_ws_path(),
            admit_timeout: default_admit_timeout(),
            outbound_queue: default_outbound_queue(),
            ping_interval: default_ping_interval(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_jwks_ttl")]
    pub jwks_ttl: u64,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: u64,
    /// Minimum age of the cached key set before an unknown key id refetches.
    #[serde(default = "default_min_refetch")]
    pub min_refetch: u64,
    #[serde(default = "default_leeway")]
    pub leeway: u64,
    /// Serve signing keys from a local JWKS file instead of the issuer.
    #[serde(default)]
    pub jwks_file: Option<String>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            jwks_ttl: default_jwks_ttl(),
            fetch_timeout: default_fetch_timeout(),
            min_refetch: default_min_refetch(),
            leeway: default_leeway(),
            jwks_file: None,
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_port() -> u16 {
    3000
}
fn default_http_port() -> u16 {
    3001
}
fn default_ws_path() -> String {
    "/api/ws/".to_string()
}
fn default_admit_timeout() -> u64 {
    10
}
fn default_outbound_queue() -> usize {
    256
}
fn default_ping_interval() -> u64 {
    25
}
fn default_idle_timeout() -> u64 {
    45
}
fn default_issuer() -> String {
    "https://szymon-rozkocha.eu.auth0.com/".to_string()
}
fn default_jwks_ttl() -> u64 {
    600
}
fn default_fetch_timeout() -> u64 {
    5
}
fn default_min_refetch() -> u64 {
    30
}
fn default_leeway() -> u64 {
    60
}

/// CLI values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub http_port: Option<u16>,
    pub issuer: Option<String>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub http_port: u16,
    pub ws_path: String,
    pub admit_timeout: u64,
    pub outbound_queue: usize,
    pub ping_interval: u64,
    pub idle_timeout: u64,
    pub issuer: String,
    pub jwks_ttl: u64,
    pub fetch_timeout: u64,
    pub min_refetch: u64,
    pub leeway: u64,
    pub jwks_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), Overrides::default())
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> LobbyResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let config = Self::resolve(file_config, overrides);
        config.validate()?;
        Ok(config)
    }

    fn resolve(file: ConfigFile, overrides: Overrides) -> Self {
        Self {
            bind: file.server.bind,
            port: overrides.port.unwrap_or(file.server.port),
            http_port: overrides.http_port.unwrap_or(file.server.http_port),
            ws_path: file.server.ws_path,
            admit_timeout: file.server.admit_timeout,
            outbound_queue: file.server.outbound_queue,
            ping_interval: file.server.ping_interval,
            idle_timeout: file.server.idle_timeout,
            issuer: overrides.issuer.unwrap_or(file.auth.issuer),
            jwks_ttl: file.auth.jwks_ttl,
            fetch_timeout: file.auth.fetch_timeout,
            min_refetch: file.auth.min_refetch,
            leeway: file.auth.leeway,
            jwks_file: file.auth.jwks_file.as_deref().map(expand_tilde_str),
        }
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> LobbyResult<()> {
        if self.issuer.trim().is_empty() {
            return Err(LobbyError::Other("auth.issuer must not be empty".into()));
        }
        if !self.ws_path.starts_with('/') {
            return Err(LobbyError::Other(format!(
                "server.ws_path must start with '/': {}",
                self.ws_path
            )));
        }
        if self.outbound_queue == 0 {
            return Err(LobbyError::Other("server.outbound_queue must be > 0".into()));
        }
        if self.ping_interval == 0 || self.idle_timeout < self.ping_interval {
            return Err(LobbyError::Other(format!(
                "server.ping_interval must be > 0 and not exceed server.idle_timeout ({} > {})",
                self.ping_interval, self.idle_timeout
            )));
        }
        if self.port != 0 && self.port == self.http_port {
            return Err(LobbyError::Other(format!(
                "server.port and server.http_port must differ (both {})",
                self.port
            )));
        }
        Ok(())
    }

    pub fn ws_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.http_port)
    }
}

/// Parse a config file body.
pub fn parse(content: &str) -> LobbyResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| LobbyError::Other(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
