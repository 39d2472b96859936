//! Edit-password hashing and verification.
//!
//! The share link is the only read credential, so the edit password is
//! the only thing standing between anyone holding that link and an
//! in-flight letter. Argon2id resists offline brute force; the compare
//! is constant-time.
//!
//! Stored form: `hex(salt) ":" hex(hash)`.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use subtle::ConstantTimeEq;

const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;
const SEPARATOR: char = ':';

/// Argon2id parameters: 64 MiB, 3 passes, 1 lane.
fn argon2() -> Argon2<'static> {
    let params =
        Params::new(64 * 1024, 3, 1, Some(HASH_LEN)).expect("static Argon2 params are valid");
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
}

fn derive(plaintext: &str, salt: &[u8]) -> Option<[u8; HASH_LEN]> {
    let mut out = [0u8; HASH_LEN];
    argon2()
        .hash_password_into(plaintext.as_bytes(), salt, &mut out)
        .ok()?;
    Some(out)
}

/// Hash a plaintext edit password with a fresh random salt.
pub fn hash_password(plaintext: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt);
    let hash = derive(plaintext, &salt).expect("derivation with a fixed-size salt cannot fail");
    format!("{}{}{}", hex::encode(salt), SEPARATOR, hex::encode(hash))
}

/// Verify a plaintext against a stored `hex(salt):hex(hash)` form.
///
/// Fails closed: any malformed stored form returns false, never panics.
/// A length mismatch short-circuits before the derived compare.
pub fn verify_password(plaintext: &str, stored: &str) -> bool {
    let Some((salt_hex, hash_hex)) = stored.split_once(SEPARATOR) else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    let Ok(expected) = hex::decode(hash_hex) else {
        return false;
    };
    if salt.len() != SALT_LEN || expected.len() != HASH_LEN {
        return false;
    }
    let Some(derived) = derive(plaintext, &salt) else {
        return false;
    };
    derived.as_slice().ct_eq(expected.as_slice()).unwrap_u8() == 1
}
