//! `wamp respond --challenge C [--salt S]`: sign a wampcra challenge.
//!
//! With a salt, the secret is first stretched with the given derivation
//! parameters and the base-64 key text becomes the HMAC key.

use anyhow::{Context, Result};
use wamp_client::{ChallengeExtra, CraCredentials};
use wamp_core::DerivationParams;

use super::read_secret;

pub fn run(
    challenge: &str,
    salt: Option<&str>,
    params: &DerivationParams,
    secret: Option<String>,
) -> Result<()> {
    let secret = read_secret(secret)?;
    let extra = ChallengeExtra {
        challenge: challenge.to_string(),
        salt: salt.map(str::to_string),
        iterations: salt.map(|_| params.iterations),
        keylen: salt.map(|_| params.keylen),
    };
    let signature = CraCredentials::new("", secret)
        .respond(&extra)
        .context("could not answer challenge")?;
    println!("{signature}");
    Ok(())
}
