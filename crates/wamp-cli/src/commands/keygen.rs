//! `wamp keygen [--length N]`: generate a random shared secret.

use anyhow::{bail, Result};
use tracing::info;
use wamp_core::generate_secret;

use crate::config::AuthConfig;

/// Print a fresh secret drawn from `[A-Za-z0-9]`.
pub fn run(length: Option<usize>, auth: &AuthConfig) -> Result<()> {
    let length = length.unwrap_or(auth.secret_length);
    if length == 0 {
        bail!("secret length must be at least 1");
    }

    let secret = generate_secret(length);
    info!(length, "secret generated");
    println!("{secret}");
    Ok(())
}
