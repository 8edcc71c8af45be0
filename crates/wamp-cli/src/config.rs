//! CLI configuration at `~/.config/wamp/config.toml`.
//!
//! `[transport]` tunes the probe transport; `[auth]` supplies default
//! derivation parameters and the generated secret length. CLI flags always
//! override config file values.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use wamp_client::TransportConfig;
use wamp_core::{DerivationParams, DEFAULT_SECRET_LEN};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

/// Credential defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// PBKDF2 iteration count used when `--iterations` is absent.
    #[serde(default = "default_iterations")]
    pub iterations: u32,

    /// Derived key length in bytes used when `--keylen` is absent.
    #[serde(default = "default_keylen")]
    pub keylen: usize,

    /// Length of secrets produced by `wamp keygen`.
    #[serde(default = "default_secret_length")]
    pub secret_length: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            keylen: default_keylen(),
            secret_length: default_secret_length(),
        }
    }
}

fn default_iterations() -> u32 {
    DerivationParams::default().iterations
}

fn default_keylen() -> usize {
    DerivationParams::default().keylen
}

fn default_secret_length() -> usize {
    DEFAULT_SECRET_LEN
}

impl AuthConfig {
    /// Derivation parameters with optional per-invocation overrides.
    pub fn params(&self, iterations: Option<u32>, keylen: Option<usize>) -> DerivationParams {
        DerivationParams::new(
            iterations.unwrap_or(self.iterations),
            keylen.unwrap_or(self.keylen),
        )
    }
}

/// `~/.config/wamp/config.toml`, or a relative path if no home directory is known.
pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".config")
        .join("wamp")
        .join("config.toml")
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        config
            .transport
            .validate()
            .with_context(|| format!("invalid [transport] section in {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.auth.iterations, 1000);
        assert_eq!(cfg.auth.keylen, 32);
        assert_eq!(cfg.auth.secret_length, 14);
        assert_eq!(cfg.transport, TransportConfig::default());
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[transport]
connect_timeout_ms = 500
high_watermark = 10
low_watermark = 2

[auth]
iterations = 4096
keylen = 16
secret_length = 20
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.transport.connect_timeout_ms, 500);
        assert_eq!(cfg.transport.high_watermark, 10);
        assert_eq!(cfg.transport.low_watermark, 2);
        assert_eq!(cfg.transport.inbound_buffer, 1024); // default
        assert_eq!(cfg.auth.iterations, 4096);
        assert_eq!(cfg.auth.keylen, 16);
        assert_eq!(cfg.auth.secret_length, 20);
    }

    #[test]
    fn flags_override_auth_defaults() {
        let auth = AuthConfig::default();
        assert_eq!(auth.params(None, None), DerivationParams::new(1000, 32));
        assert_eq!(auth.params(Some(5), None), DerivationParams::new(5, 32));
        assert_eq!(auth.params(None, Some(8)), DerivationParams::new(1000, 8));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.auth.secret_length, 14);
    }

    #[test]
    fn invalid_watermarks_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[transport]\nhigh_watermark = 4\nlow_watermark = 4\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[auth\niterations = ").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
