//! `wamp derive --salt S`: compute the salted key a router would store.

use anyhow::{Context, Result};
use tracing::debug;
use wamp_core::{derive_key, DerivationParams};

use super::read_secret;

pub fn run(salt: &str, params: &DerivationParams, secret: Option<String>) -> Result<()> {
    let secret = read_secret(secret)?;
    debug!(
        iterations = params.iterations,
        keylen = params.keylen,
        "deriving key"
    );
    let key = derive_key(secret.as_bytes(), salt.as_bytes(), params)
        .context("key derivation failed")?;
    println!("{key}");
    Ok(())
}
