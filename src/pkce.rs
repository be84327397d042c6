use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use sha2::{Digest, Sha256};

/// PKCE verifier and its S256 challenge.
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    /// Fresh random verifier with its challenge.
    #[must_use]
    pub fn generate() -> Self {
        let verifier = generate_code_verifier();
        let challenge = generate_code_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }
}

/// Random code verifier: 64 URL-safe characters (RFC 7636 allows 43-128).
#[must_use]
pub fn generate_code_verifier() -> String {
    random_token::<48>()
}

/// `BASE64URL(SHA256(verifier))`
#[must_use]
pub fn generate_code_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Random identifier for the protocol `state` parameter (22 characters).
#[must_use]
pub fn generate_state_id() -> String {
    random_token::<16>()
}

/// Random OIDC `nonce`, bound into the identity token.
#[must_use]
pub fn generate_nonce() -> String {
    random_token::<16>()
}

fn random_token<const N: usize>() -> String {
    let random_bytes: [u8; N] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(random_bytes)
}
