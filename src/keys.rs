//! Key material helpers: fingerprints and PEM/OpenSSH decoding.

use anyhow::{anyhow, Result};
use md5::{Digest, Md5};
use russh::keys::{self, PublicKeyBase64};

/// Compute the MD5 fingerprint of a public key's wire encoding, rendered as
/// colon-separated hex pairs (the format used for host-key pinning).
pub fn md5_fingerprint(key: &keys::PublicKey) -> String {
    md5_fingerprint_bytes(&key.public_key_bytes())
}

/// MD5 colon-hex fingerprint over raw wire-format key bytes.
pub fn md5_fingerprint_bytes(wire: &[u8]) -> String {
    let digest = Md5::digest(wire);
    digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Decode a private key from OpenSSH or PEM text.
pub fn decode_private_key(data: &str) -> Result<keys::PrivateKey> {
    match keys::PrivateKey::from_openssh(data) {
        Ok(key) => Ok(key),
        Err(openssh_err) => match keys::decode_secret_key(data, None) {
            Ok(key) => Ok(key),
            Err(keys::Error::KeyIsEncrypted) => {
                Err(anyhow!("encrypted private keys are not supported"))
            }
            Err(err) => Err(anyhow!(
                "not a valid OpenSSH or PEM private key ({openssh_err}): {err}"
            )),
        },
    }
}
