//! WAMP-CRA challenge answering for the session handshake.
//!
//! The router sends `CHALLENGE` with method `wampcra` and an extra dict
//! carrying the challenge string and, for salted secrets, the PBKDF2
//! parameters. The client replies with `AUTHENTICATE` whose signature is the
//! value returned by [`CraCredentials::respond`].

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;
use wamp_core::auth::{compute_response, derive_key, DerivationParams};
use wamp_core::{WampError, WampResult};

/// The `extra` dict of a `wampcra` challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeExtra {
    /// The challenge string to sign, passed through byte-for-byte.
    pub challenge: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keylen: Option<usize>,
}

impl ChallengeExtra {
    /// Parse the extra dict from its JSON form.
    pub fn from_json(text: &str) -> WampResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| WampError::ProtocolViolation(format!("invalid wampcra challenge: {e}")))
    }

    /// Derivation parameters, falling back to the WAMP-CRA defaults.
    pub fn params(&self) -> DerivationParams {
        let defaults = DerivationParams::default();
        DerivationParams {
            iterations: self.iterations.unwrap_or(defaults.iterations),
            keylen: self.keylen.unwrap_or(defaults.keylen),
        }
    }
}

/// A shared secret able to answer `wampcra` challenges.
#[derive(Clone)]
pub struct CraCredentials {
    authid: String,
    secret: Vec<u8>,
}

impl CraCredentials {
    pub fn new(authid: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            authid: authid.into(),
            secret: secret.into(),
        }
    }

    pub fn authid(&self) -> &str {
        &self.authid
    }

    /// The HMAC key for a challenge: the derived key when salted, else the secret.
    pub fn signing_key(&self, extra: &ChallengeExtra) -> WampResult<Vec<u8>> {
        match &extra.salt {
            Some(salt) => {
                let params = extra.params();
                debug!(
                    authid = %self.authid,
                    iterations = params.iterations,
                    keylen = params.keylen,
                    "deriving salted wampcra key"
                );
                Ok(derive_key(&self.secret, salt.as_bytes(), &params)?.into_bytes())
            }
            None => Ok(self.secret.clone()),
        }
    }

    /// Compute the `AUTHENTICATE` signature for a challenge.
    pub fn respond(&self, extra: &ChallengeExtra) -> WampResult<String> {
        let key = self.signing_key(extra)?;
        Ok(compute_response(&key, extra.challenge.as_bytes()))
    }
}

impl fmt::Debug for CraCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CraCredentials")
            .field("authid", &self.authid)
            .field("secret", &"<redacted>")
            .finish()
    }
}
