//! Usage: PKCE verifier/challenge generation for the authorization-code flow (RFC 7636).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

const VERIFIER_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";
pub(crate) const VERIFIER_LEN: usize = 128;
pub(crate) const CHALLENGE_METHOD: &str = "S256";

/// One-time proof material for a single login attempt. Never reused across attempts.
#[derive(Clone)]
pub(crate) struct PkcePair {
    pub(crate) code_verifier: String,
    pub(crate) code_challenge: String,
}

impl std::fmt::Debug for PkcePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkcePair")
            .field("code_verifier", &"<redacted>")
            .field("code_challenge", &self.code_challenge)
            .finish()
    }
}

pub(crate) fn generate_pkce_pair() -> PkcePair {
    let code_verifier = generate_verifier();
    let code_challenge = derive_challenge(&code_verifier);
    PkcePair {
        code_verifier,
        code_challenge,
    }
}

/// 128 characters drawn uniformly from the unreserved set using the OS CSPRNG.
pub(crate) fn generate_verifier() -> String {
    (0..VERIFIER_LEN)
        .map(|_| {
            let idx = OsRng.gen_range(0..VERIFIER_CHARSET.len());
            char::from(VERIFIER_CHARSET[idx])
        })
        .collect()
}

/// BASE64URL-NOPAD(SHA256(verifier)).
pub(crate) fn derive_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Opaque CSRF token carried in the authorization request's `state`.
pub(crate) fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifier_has_fixed_length_and_unreserved_alphabet() {
        let verifier = generate_verifier();
        assert_eq!(verifier.len(), VERIFIER_LEN);
        assert!(verifier.bytes().all(|b| VERIFIER_CHARSET.contains(&b)));
    }

    #[test]
    fn verifiers_differ_between_calls() {
        assert_ne!(generate_verifier(), generate_verifier());
    }

    #[test]
    fn challenge_is_deterministic_and_unpadded_sha256() {
        let pair = generate_pkce_pair();
        assert_eq!(pair.code_challenge, derive_challenge(&pair.code_verifier));
        assert!(!pair.code_challenge.contains('='));
        assert!(!pair.code_challenge.contains('+'));
        assert!(!pair.code_challenge.contains('/'));

        let decoded = URL_SAFE_NO_PAD
            .decode(pair.code_challenge.as_bytes())
            .expect("valid base64url");
        assert_eq!(decoded.len(), 32);
    }

    #[test]
    fn challenge_matches_rfc7636_appendix_b_vector() {
        assert_eq!(
            derive_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGjSstw-cM"
        );
    }

    #[test]
    fn state_is_64_hex_chars() {
        let state = generate_state();
        assert_eq!(state.len(), 64);
        assert!(state.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(state, generate_state());
    }

    #[test]
    fn debug_output_redacts_verifier() {
        let pair = generate_pkce_pair();
        let rendered = format!("{pair:?}");
        assert!(!rendered.contains(&pair.code_verifier));
        assert!(rendered.contains("<redacted>"));
    }
}
