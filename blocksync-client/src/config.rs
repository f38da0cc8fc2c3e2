//! Load config from file and environment.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use blocksync_core::integrity::{parse_fingerprint, HASH_LEN};
use serde::Deserialize;

const ENV_PREFIX: &str = "BLOCKSYNC_CLIENT_";

/// Client configuration. File: ~/.config/blocksync/client.toml.
/// Env overrides: BLOCKSYNC_CLIENT_SERVER, _SERVER_NAME, _INPUT, _FINGERPRINT,
/// _USERNAME, _PASSWORD, _BLOCK_LENGTH_KIB, _STRONG_LENGTH, _POLL_INTERVAL_SECS,
/// _CONNECT_TIMEOUT_SECS, _FRAME_TIMEOUT_SECS.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Server address (default 127.0.0.1:8888).
    #[serde(default = "default_server")]
    pub server: String,
    /// Name sent as TLS SNI (default localhost).
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// File to keep synchronized.
    #[serde(default)]
    pub input: Option<PathBuf>,
    /// Hex SHA3-256 of the server certificate. Required.
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_block_length_kib")]
    pub block_length_kib: u32,
    /// Bytes of SHA-256 kept per block, 1..=32.
    #[serde(default = "default_strong_length")]
    pub strong_length: u32,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Max seconds from a frame header to the end of its body; 0 disables.
    #[serde(default = "default_frame_timeout_secs")]
    pub frame_timeout_secs: u64,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("server", &self.server)
            .field("server_name", &self.server_name)
            .field("input", &self.input)
            .field("fingerprint", &self.fingerprint)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("block_length_kib", &self.block_length_kib)
            .field("strong_length", &self.strong_length)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("frame_timeout_secs", &self.frame_timeout_secs)
            .finish()
    }
}

fn default_server() -> String {
    "127.0.0.1:8888".into()
}
fn default_server_name() -> String {
    "localhost".into()
}
fn default_block_length_kib() -> u32 {
    10
}
fn default_strong_length() -> u32 {
    16
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_frame_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: default_server(),
            server_name: default_server_name(),
            input: None,
            fingerprint: None,
            username: String::new(),
            password: String::new(),
            block_length_kib: default_block_length_kib(),
            strong_length: default_strong_length(),
            poll_interval_secs: default_poll_interval_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            frame_timeout_secs: default_frame_timeout_secs(),
        }
    }
}

impl Config {
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        if let Some(s) = var("SERVER") {
            self.server = s;
        }
        if let Some(s) = var("SERVER_NAME") {
            self.server_name = s;
        }
        if let Some(s) = var("INPUT") {
            self.input = Some(PathBuf::from(s));
        }
        if let Some(s) = var("FINGERPRINT") {
            self.fingerprint = Some(s);
        }
        if let Some(s) = var("USERNAME") {
            self.username = s;
        }
        if let Some(s) = var("PASSWORD") {
            self.password = s;
        }
        override_parsed(var("BLOCK_LENGTH_KIB"), &mut self.block_length_kib);
        override_parsed(var("STRONG_LENGTH"), &mut self.strong_length);
        override_parsed(var("POLL_INTERVAL_SECS"), &mut self.poll_interval_secs);
        override_parsed(var("CONNECT_TIMEOUT_SECS"), &mut self.connect_timeout_secs);
        override_parsed(var("FRAME_TIMEOUT_SECS"), &mut self.frame_timeout_secs);
    }

    /// The pinned server fingerprint. Missing or malformed is fatal: there is no unpinned mode.
    pub fn pinned_fingerprint(&self) -> anyhow::Result<[u8; HASH_LEN]> {
        let hex = self.fingerprint.as_deref().unwrap_or_default();
        parse_fingerprint(hex).context("server certificate fingerprint")
    }

    pub fn input_path(&self) -> anyhow::Result<&Path> {
        self.input
            .as_deref()
            .ok_or_else(|| anyhow!("no input file configured"))
    }

    pub fn block_length(&self) -> anyhow::Result<u32> {
        match self.block_length_kib.checked_mul(1024) {
            Some(0) | None => bail!("block length {} KiB is out of range", self.block_length_kib),
            Some(n) => Ok(n),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn frame_timeout(&self) -> Option<Duration> {
        match self.frame_timeout_secs {
            0 => None,
            n => Some(Duration::from_secs(n)),
        }
    }
}

fn override_parsed<T: FromStr>(value: Option<String>, field: &mut T) {
    if let Some(v) = value.and_then(|s| s.parse().ok()) {
        *field = v;
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(p) => read_file(p)?,
        None => match config_path().filter(|p| p.exists()) {
            Some(p) => read_file(&p)?,
            None => Config::default(),
        },
    };
    c.apply_env(|name| std::env::var(name).ok());
    Ok(c)
}

fn config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config/blocksync/client.toml"))
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.server, "127.0.0.1:8888");
        assert_eq!(c.server_name, "localhost");
        assert_eq!(c.block_length().unwrap(), 10 * 1024);
        assert_eq!(c.strong_length, 16);
        assert_eq!(c.poll_interval(), Duration::from_secs(5));
        assert_eq!(c.frame_timeout(), Some(Duration::from_secs(30)));
        assert!(c.input_path().is_err());
    }

    #[test]
    fn fingerprint_is_required() {
        let mut c = Config::default();
        assert!(c.pinned_fingerprint().is_err());
        c.fingerprint = Some("zz".into());
        assert!(c.pinned_fingerprint().is_err());
        c.fingerprint = Some("ab".repeat(32));
        assert_eq!(c.pinned_fingerprint().unwrap(), [0xab; 32]);
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<String, String> = [
            ("BLOCKSYNC_CLIENT_SERVER", "10.1.1.1:9000"),
            ("BLOCKSYNC_CLIENT_INPUT", "/tmp/notes.txt"),
            ("BLOCKSYNC_CLIENT_STRONG_LENGTH", "32"),
            ("BLOCKSYNC_CLIENT_POLL_INTERVAL_SECS", "soon"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let mut c = Config::default();
        c.apply_env(|name| env.get(name).cloned());
        assert_eq!(c.server, "10.1.1.1:9000");
        assert_eq!(c.input_path().unwrap(), Path::new("/tmp/notes.txt"));
        assert_eq!(c.strong_length, 32);
        assert_eq!(c.poll_interval_secs, 5);
    }

    #[test]
    fn password_not_in_debug_output() {
        let c: Config = toml::from_str("username = \"u\"\npassword = \"hunter2\"").unwrap();
        assert!(!format!("{:?}", c).contains("hunter2"));
    }

    #[test]
    fn frame_timeout_from_file_and_env() {
        let mut c: Config = toml::from_str("frame_timeout_secs = 0").unwrap();
        assert_eq!(c.frame_timeout(), None);
        c.apply_env(|name| (name == "BLOCKSYNC_CLIENT_FRAME_TIMEOUT_SECS").then(|| "7".to_string()));
        assert_eq!(c.frame_timeout(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn zero_block_length_rejected() {
        let c: Config = toml::from_str("block_length_kib = 0").unwrap();
        assert!(c.block_length().is_err());
    }
}
