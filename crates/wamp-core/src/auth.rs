//! WAMP-CRA credential derivation.
//!
//! A client proves possession of a shared secret by answering a server
//! challenge with `base64(HMAC-SHA256(key, challenge))`. When the server
//! supplies a salt, the key is first stretched with PBKDF2-HMAC-SHA256 and
//! the base-64 text of the derived key becomes the HMAC key.
//!
//! Every function here is pure over its arguments except
//! [`generate_secret`], which draws from the operating system CSPRNG.

use std::num::NonZeroU32;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use ring::{hmac, pbkdf2};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{WampError, WampResult};

/// Length of an HMAC-SHA256 digest in bytes.
pub const RESPONSE_LEN: usize = 32;

/// Secret length used when provisioning credentials without an explicit length.
pub const DEFAULT_SECRET_LEN: usize = 14;

/// PBKDF2 can emit at most `(2^32 - 1)` blocks of one digest each.
const MAX_KEY_LEN: u64 = RESPONSE_LEN as u64 * u32::MAX as u64;

/// Parameters for [`derive_key`], normally taken from the challenge extras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivationParams {
    /// PBKDF2 iteration count. Must be at least 1.
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Length of the derived key in raw bytes. Must be at least 1.
    #[serde(default = "default_keylen")]
    pub keylen: usize,
}

impl Default for DerivationParams {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            keylen: default_keylen(),
        }
    }
}

fn default_iterations() -> u32 {
    1000
}

fn default_keylen() -> usize {
    32
}

impl DerivationParams {
    pub fn new(iterations: u32, keylen: usize) -> Self {
        Self { iterations, keylen }
    }

    fn validate(&self) -> WampResult<NonZeroU32> {
        let iterations = NonZeroU32::new(self.iterations)
            .ok_or_else(|| WampError::Derivation("iteration count must be at least 1".into()))?;
        if self.keylen == 0 {
            return Err(WampError::Derivation("key length must be at least 1".into()));
        }
        if self.keylen as u64 > MAX_KEY_LEN {
            return Err(WampError::Derivation(format!(
                "key length {} exceeds the PBKDF2 limit",
                self.keylen
            )));
        }
        Ok(iterations)
    }
}

/// Encode bytes as standard, padded base-64 without line breaks.
pub fn encode_base64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode standard, padded base-64.
pub fn decode_base64(text: &str) -> WampResult<Vec<u8>> {
    STANDARD
        .decode(text)
        .map_err(|e| WampError::Other(format!("invalid base64: {e}")))
}

/// Derive a key from `secret` and `salt` with PBKDF2-HMAC-SHA256.
///
/// Returns the base-64 text of exactly `params.keylen` raw bytes. The same
/// inputs always produce the same output.
pub fn derive_key(secret: &[u8], salt: &[u8], params: &DerivationParams) -> WampResult<String> {
    let iterations = params.validate()?;

    let mut out = vec![0u8; params.keylen];
    pbkdf2::derive(pbkdf2::PBKDF2_HMAC_SHA256, iterations, salt, secret, &mut out);
    trace!(iterations = params.iterations, keylen = params.keylen, "derived key");

    Ok(encode_base64(&out))
}

/// Compute the challenge response: `base64(HMAC-SHA256(key, challenge))`.
///
/// `key` is the key as the protocol sees it: the bytes of the base-64 text
/// returned by [`derive_key`] when the challenge was salted, otherwise the
/// raw secret.
pub fn compute_response(key: &[u8], challenge: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let tag = hmac::sign(&key, challenge);
    encode_base64(tag.as_ref())
}

/// Check a challenge response in constant time.
pub fn verify_response(key: &[u8], challenge: &[u8], response: &str) -> bool {
    let tag = match decode_base64(response) {
        Ok(tag) => tag,
        Err(_) => return false,
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::verify(&key, challenge, &tag).is_ok()
}

/// Generate a random secret of `length` characters from `[A-Za-z0-9]`.
///
/// Characters are drawn uniformly from the OS CSPRNG.
pub fn generate_secret(length: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn derive_is_deterministic() {
        let params = DerivationParams::new(4096, 32);
        let a = derive_key(b"correcthorse", b"a1b2c3", &params).unwrap();
        let b = derive_key(b"correcthorse", b"a1b2c3", &params).unwrap();
        assert_eq!(a, b);
        assert_eq!(decode_base64(&a).unwrap().len(), 32);
        assert!(!a.contains('\n'));
    }

    #[test]
    fn derive_known_answer() {
        // RFC 7914, section 11: PBKDF2-HMAC-SHA256("passwd", "salt", 1, 64)
        let expected = hex::decode(
            "55ac046e56e3089fec1691c22544b605f94185216dde0465e68b9d57c20dacbc\
             49ca9cccf179b645991664b39d77ef317c71b845b1e30bd509112041d3a19783",
        )
        .unwrap();
        let key = derive_key(b"passwd", b"salt", &DerivationParams::new(1, 64)).unwrap();
        assert_eq!(decode_base64(&key).unwrap(), expected);
    }

    #[test]
    fn derive_depends_on_every_input() {
        let params = DerivationParams::new(10, 16);
        let base = derive_key(b"secret", b"salt", &params).unwrap();
        assert_ne!(base, derive_key(b"secret2", b"salt", &params).unwrap());
        assert_ne!(base, derive_key(b"secret", b"salt2", &params).unwrap());
        assert_ne!(
            base,
            derive_key(b"secret", b"salt", &DerivationParams::new(11, 16)).unwrap()
        );
    }

    #[test]
    fn derive_rejects_zero_iterations() {
        let err = derive_key(b"secret", b"salt", &DerivationParams::new(0, 32)).unwrap_err();
        assert!(matches!(err, WampError::Derivation(_)));
    }

    #[test]
    fn derive_rejects_zero_length() {
        let err = derive_key(b"secret", b"salt", &DerivationParams::new(1, 0)).unwrap_err();
        assert!(matches!(err, WampError::Derivation(_)));
    }

    #[test]
    fn default_params_match_wamp_cra() {
        let params = DerivationParams::default();
        assert_eq!(params.iterations, 1000);
        assert_eq!(params.keylen, 32);
    }

    #[test]
    fn params_from_partial_json() {
        let params: DerivationParams = serde_json::from_str(r#"{"iterations": 100}"#).unwrap();
        assert_eq!(params, DerivationParams::new(100, 32));
    }

    #[test]
    fn response_known_answer() {
        // RFC 4231, test case 2
        let expected =
            hex::decode("5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843")
                .unwrap();
        let response = compute_response(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(decode_base64(&response).unwrap(), expected);
    }

    #[test]
    fn response_with_derived_key() {
        let key = derive_key(b"secret1", b"salt123", &DerivationParams::new(100, 16)).unwrap();
        let challenge = br#"{"authid": "peter", "nonce": "LHRTC9zeOIrt_9U3"}"#;
        let r1 = compute_response(key.as_bytes(), challenge);
        let r2 = compute_response(key.as_bytes(), challenge);
        assert_eq!(r1, r2);
        assert_eq!(decode_base64(&r1).unwrap().len(), RESPONSE_LEN);
        assert!(verify_response(key.as_bytes(), challenge, &r1));
        assert!(!verify_response(b"other", challenge, &r1));
        assert!(!verify_response(key.as_bytes(), b"other", &r1));
        assert!(!verify_response(key.as_bytes(), challenge, "not base64!"));
    }

    #[test]
    fn empty_secret_length() {
        assert_eq!(generate_secret(0), "");
    }

    #[test]
    fn secret_alphabet_and_length() {
        for len in [1, 14, 64, 200] {
            let secret = generate_secret(len);
            assert_eq!(secret.chars().count(), len);
            assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn secrets_differ() {
        assert_ne!(generate_secret(32), generate_secret(32));
    }

    #[test]
    fn secret_distribution_is_uniform() {
        const ALPHABET: &[u8] =
            b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
        const PER_SYMBOL: usize = 1000;

        let sample = generate_secret(ALPHABET.len() * PER_SYMBOL);
        let mut counts = [0usize; 62];
        for b in sample.bytes() {
            let idx = ALPHABET.iter().position(|&c| c == b).unwrap();
            counts[idx] += 1;
        }

        let expected = PER_SYMBOL as f64;
        let chi_square: f64 = counts
            .iter()
            .map(|&n| {
                let d = n as f64 - expected;
                d * d / expected
            })
            .sum();
        // 61 degrees of freedom; 120 is far beyond the 99.999th percentile.
        assert!(chi_square < 120.0, "chi-square {chi_square} too large");
    }

    #[test]
    fn base64_empty() {
        assert_eq!(encode_base64(b""), "");
        assert_eq!(decode_base64("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn base64_rejects_garbage() {
        assert!(decode_base64("%%%").is_err());
    }

    proptest! {
        #[test]
        fn base64_round_trip(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let text = encode_base64(&data);
            prop_assert!(!text.contains('\n'));
            prop_assert_eq!(decode_base64(&text).unwrap(), data);
        }

        #[test]
        fn derive_length_and_determinism(
            secret in proptest::collection::vec(any::<u8>(), 0..32),
            salt in proptest::collection::vec(any::<u8>(), 0..32),
            iterations in 1u32..8,
            keylen in 1usize..100,
        ) {
            let params = DerivationParams::new(iterations, keylen);
            let a = derive_key(&secret, &salt, &params).unwrap();
            let b = derive_key(&secret, &salt, &params).unwrap();
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(decode_base64(&a).unwrap().len(), keylen);
        }

        #[test]
        fn response_is_always_32_bytes(
            key in proptest::collection::vec(any::<u8>(), 0..128),
            challenge in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let response = compute_response(&key, &challenge);
            prop_assert_eq!(decode_base64(&response).unwrap().len(), RESPONSE_LEN);
            prop_assert_eq!(response, compute_response(&key, &challenge));
        }
    }
}
