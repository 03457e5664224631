//! Device private key parsing.
//!
//! Keys arrive as PEM text inside the invocation event. OpenSSL's
//! `ecparam -genkey` output prepends an `EC PARAMETERS` block, so the input is
//! scanned block by block and the first private-key block wins.

use std::fmt;

use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::DecodePrivateKey;
use p256::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

const BEGIN: &str = "-----BEGIN ";
const DASHES: &str = "-----";

const LABEL_SEC1: &str = "EC PRIVATE KEY";
const LABEL_PKCS8: &str = "PRIVATE KEY";
const LABEL_PARAMETERS: &str = "EC PARAMETERS";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyParseError {
    #[error("no EC private key block found in PEM input")]
    MissingPrivateKey,

    #[error("PEM block '{0}' is not terminated")]
    UnterminatedBlock(String),

    #[error("invalid {label} block: {reason}")]
    InvalidKey { label: String, reason: String },
}

/// A P-256 device signing key.
pub struct DeviceKey {
    secret: SecretKey,
}

impl DeviceKey {
    pub fn from_secret_key(secret: SecretKey) -> Self {
        Self { secret }
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    /// Short SHA-256 fingerprint of the compressed public key, safe to log.
    pub fn fingerprint(&self) -> String {
        let point = self.public_key().to_encoded_point(true);
        let digest = Sha256::digest(point.as_bytes());
        hex::encode(&digest[..8])
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PemBlock<'a> {
    label: &'a str,
    text: &'a str,
}

/// Parses the first SEC1 or PKCS#8 private key block in `pem_text`.
pub fn parse_private_key(pem_text: &str) -> Result<DeviceKey, KeyParseError> {
    for block in pem_blocks(pem_text)? {
        let secret = match block.label {
            LABEL_PARAMETERS => continue,
            LABEL_SEC1 => SecretKey::from_sec1_pem(block.text).map_err(|error| {
                KeyParseError::InvalidKey {
                    label: block.label.to_string(),
                    reason: error.to_string(),
                }
            })?,
            LABEL_PKCS8 => SecretKey::from_pkcs8_pem(block.text).map_err(|error| {
                KeyParseError::InvalidKey {
                    label: block.label.to_string(),
                    reason: error.to_string(),
                }
            })?,
            _ => continue,
        };

        return Ok(DeviceKey::from_secret_key(secret));
    }

    Err(KeyParseError::MissingPrivateKey)
}

fn pem_blocks(input: &str) -> Result<Vec<PemBlock<'_>>, KeyParseError> {
    let mut blocks = Vec::new();
    let mut rest = input;

    while let Some(start) = rest.find(BEGIN) {
        let header = &rest[start + BEGIN.len()..];
        let Some(label_len) = header.find(DASHES) else {
            return Err(KeyParseError::UnterminatedBlock(
                header.lines().next().unwrap_or_default().to_string(),
            ));
        };
        let label = &header[..label_len];

        let end_marker = format!("-----END {label}-----");
        let Some(end_offset) = rest[start..].find(&end_marker) else {
            return Err(KeyParseError::UnterminatedBlock(label.to_string()));
        };
        let block_end = start + end_offset + end_marker.len();

        blocks.push(PemBlock {
            label,
            text: &rest[start..block_end],
        });
        rest = &rest[block_end..];
    }

    Ok(blocks)
}
