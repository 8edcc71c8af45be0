//! CLI subcommand implementations.

pub mod derive;
pub mod keygen;
pub mod probe;
pub mod respond;

use anyhow::{Context, Result};

/// Environment variable consulted when `--secret` is absent.
pub const SECRET_ENV: &str = "WAMP_SECRET";

/// Resolve the shared secret: flag, then environment, then a hidden prompt.
pub fn read_secret(flag: Option<String>) -> Result<String> {
    if let Some(secret) = flag {
        return Ok(secret);
    }
    if let Ok(secret) = std::env::var(SECRET_ENV) {
        return Ok(secret);
    }
    dialoguer::Password::new()
        .with_prompt("Secret")
        .interact()
        .context("failed to read secret from terminal")
}
