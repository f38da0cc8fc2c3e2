//! Load config from file and environment.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

const ENV_PREFIX: &str = "BLOCKSYNC_SERVER_";

/// Server configuration. File: ~/.config/blocksync/server.toml or /etc/blocksync/server.toml.
/// Env overrides: BLOCKSYNC_SERVER_BIND_ADDRESS, _PORT, _CERT_PATH, _KEY_PATH,
/// _HANDSHAKE_TIMEOUT_SECS, _FRAME_TIMEOUT_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen address (default 127.0.0.1).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Listen port (default 8888).
    #[serde(default = "default_port")]
    pub port: u16,
    /// PEM certificate chain, leaf first.
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,
    /// PEM private key.
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// 0 disables.
    #[serde(default = "default_frame_timeout_secs")]
    pub frame_timeout_secs: u64,
    /// Accounts registered at startup; there is no registration message on the wire.
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct UserEntry {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for UserEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserEntry")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8888
}
fn default_cert_path() -> PathBuf {
    PathBuf::from("certs/server.crt")
}
fn default_key_path() -> PathBuf {
    PathBuf::from("certs/server.key")
}
fn default_handshake_timeout_secs() -> u64 {
    10
}
fn default_frame_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            frame_timeout_secs: default_frame_timeout_secs(),
            users: Vec::new(),
        }
    }
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn frame_timeout(&self) -> Option<Duration> {
        (self.frame_timeout_secs > 0).then(|| Duration::from_secs(self.frame_timeout_secs))
    }

    /// Override fields from `lookup` (normally the process environment). Unparsable values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        if let Some(s) = var("BIND_ADDRESS") {
            self.bind_address = s;
        }
        override_parsed(var("PORT"), &mut self.port);
        if let Some(s) = var("CERT_PATH") {
            self.cert_path = PathBuf::from(s);
        }
        if let Some(s) = var("KEY_PATH") {
            self.key_path = PathBuf::from(s);
        }
        override_parsed(var("HANDSHAKE_TIMEOUT_SECS"), &mut self.handshake_timeout_secs);
        override_parsed(var("FRAME_TIMEOUT_SECS"), &mut self.frame_timeout_secs);
    }
}

fn override_parsed<T: FromStr>(value: Option<String>, field: &mut T) {
    if let Some(v) = value.and_then(|s| s.parse().ok()) {
        *field = v;
    }
}

/// Load config: merge default, then config file (if present), then env vars.
/// An explicit path must exist; the default locations are optional.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(p) => read_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => read_file(&p)?,
            None => Config::default(),
        },
    };
    c.apply_env(|name| std::env::var(name).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/blocksync/server.toml"));
    }
    out.push(PathBuf::from("/etc/blocksync/server.toml"));
    out
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}
