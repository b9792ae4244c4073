//! PKCE (RFC 7636) verifier/challenge pair and the CSRF `state` nonce.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::TryRngCore;
use sha2::{Digest, Sha256};

use crate::error::{AuthError, AuthResult};

const VERIFIER_BYTES: usize = 32;
const STATE_BYTES: usize = 16;

/// 32 random bytes, base64url without padding (43 characters).
pub fn generate_code_verifier() -> AuthResult<String> {
    let bytes = random_bytes::<VERIFIER_BYTES>()?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

pub fn generate_code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// 16 random bytes, hex encoded (32 characters).
pub fn generate_state() -> AuthResult<String> {
    let bytes = random_bytes::<STATE_BYTES>()?;
    Ok(hex::encode(bytes))
}

fn random_bytes<const N: usize>() -> AuthResult<[u8; N]> {
    let mut bytes = [0u8; N];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| AuthError::Entropy(err.to_string()))?;
    Ok(bytes)
}
