//! PKCE challenge generation (RFC 7636, S256).
//!
//! The verifier travels back to the token endpoint inside the encrypted
//! `state` parameter, so no server-side session is needed between the
//! authorization request and the callback.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

/// Verifier length in characters. RFC 7636 allows 43-128.
const VERIFIER_LEN: usize = 64;

/// Unreserved URL-safe alphabet permitted for code verifiers.
const UNRESERVED: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// A PKCE verifier/challenge pair.
#[derive(Clone, Debug)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
    pub method: &'static str,
}

/// Generates a fresh PKCE pair: `challenge = base64url(sha256(verifier))`,
/// no padding, method `S256`.
///
/// # Errors
/// Fails only if the OS entropy source fails; never degrades to weak
/// randomness.
pub fn generate_challenge() -> Result<PkcePair> {
    let mut bytes = [0u8; VERIFIER_LEN];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| anyhow!("System entropy source failed: {}", e))?;

    let verifier: String = bytes
        .iter()
        .map(|b| UNRESERVED[(*b as usize) % UNRESERVED.len()] as char)
        .collect();

    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));

    Ok(PkcePair {
        verifier,
        challenge,
        method: "S256",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_matches_verifier() {
        let pair = generate_challenge().unwrap();
        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(pair.verifier.as_bytes()));
        assert_eq!(pair.challenge, expected);
        assert_eq!(pair.method, "S256");
    }

    #[test]
    fn test_verifier_length_in_rfc_range() {
        let pair = generate_challenge().unwrap();
        assert!(pair.verifier.len() >= 43 && pair.verifier.len() <= 128);
    }

    #[test]
    fn test_verifier_uses_unreserved_alphabet() {
        let pair = generate_challenge().unwrap();
        assert!(pair.verifier.bytes().all(|b| UNRESERVED.contains(&b)));
    }

    #[test]
    fn test_pairs_are_unique() {
        let a = generate_challenge().unwrap();
        let b = generate_challenge().unwrap();
        assert_ne!(a.verifier, b.verifier);
        assert_ne!(a.challenge, b.challenge);
    }

    #[test]
    fn test_challenge_is_unpadded_base64url() {
        let pair = generate_challenge().unwrap();
        assert!(!pair.challenge.contains('='));
        assert!(!pair.challenge.contains('+'));
        assert!(!pair.challenge.contains('/'));
        // SHA-256 digest is 32 bytes → 43 base64url chars without padding
        assert_eq!(pair.challenge.len(), 43);
    }
}
