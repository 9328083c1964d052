//! Credential hashing for the webservice authentication arguments.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

/// `hashSenha` argument: base64 of the SHA-256 digest of the user password.
pub fn password_hash(password: &str) -> String {
    STANDARD.encode(Sha256::digest(password.as_bytes()))
}
