//! Signing key checks.
//!
//! avbtool only notices a key of the wrong size after the hash tree has
//! been computed, which takes minutes on a system image. The key is parsed
//! up front so that mismatch is reported before anything is modified.

use std::fs;
use std::path::Path;

use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use tracing::debug;

use crate::{AvbSignError, Result, SigningAlgorithm};

/// Parse an RSA private key in PKCS#8 (`BEGIN PRIVATE KEY`) or PKCS#1
/// (`BEGIN RSA PRIVATE KEY`) PEM form.
pub fn load_rsa_private_key(pem: &str) -> Result<RsaPrivateKey> {
    if pem.contains("BEGIN PRIVATE KEY") {
        use pkcs8::DecodePrivateKey;
        RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| AvbSignError::Signing(format!("failed to parse PKCS#8 RSA key: {e}")))
    } else {
        use pkcs1::DecodeRsaPrivateKey;
        RsaPrivateKey::from_pkcs1_pem(pem)
            .map_err(|e| AvbSignError::Signing(format!("failed to parse PKCS#1 RSA key: {e}")))
    }
}

/// Check that the key at `key_path` can sign with `algorithm`.
///
/// Unsigned images accept any key, and the file is not read at all.
pub fn check_signing_key(key_path: &Path, algorithm: SigningAlgorithm) -> Result<()> {
    let Some(expected_bits) = algorithm.rsa_bits() else {
        return Ok(());
    };

    let pem = fs::read_to_string(key_path).map_err(|e| {
        AvbSignError::Signing(format!("cannot read key file '{}': {e}", key_path.display()))
    })?;
    let key = load_rsa_private_key(&pem)?;

    let bits = key.size() * 8;
    debug!(key = %key_path.display(), bits, "loaded signing key");
    if bits != expected_bits {
        return Err(AvbSignError::Signing(format!(
            "{} is a {bits}-bit key, {} needs {expected_bits} bits",
            key_path.display(),
            algorithm.short_name()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
