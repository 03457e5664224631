//! Short-lived bearer credential issued with the device key (ES256 JWT).

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use p256::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use p256::PublicKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::key::DeviceKey;

pub const CREDENTIAL_TTL_SECS: i64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("credential subject must not be empty")]
    EmptySubject,

    #[error("failed to encode key for signing: {0}")]
    KeyEncoding(String),

    #[error("failed to sign credential: {0}")]
    Signing(String),

    #[error("credential rejected: {0}")]
    Verification(String),
}

/// Builds the claim set for `subject` issued at `now`.
pub fn claims_for(subject: &str, now: DateTime<Utc>) -> Claims {
    let exp = now + Duration::seconds(CREDENTIAL_TTL_SECS);
    Claims {
        sub: subject.to_string(),
        exp: exp.timestamp(),
    }
}

/// Signs a compact ES256 token with `sub = subject` and `exp = now + 10 min`.
pub fn issue(key: &DeviceKey, subject: &str, now: DateTime<Utc>) -> Result<String, CredentialError> {
    if subject.is_empty() {
        return Err(CredentialError::EmptySubject);
    }

    let pem = key
        .secret_key()
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|error| CredentialError::KeyEncoding(error.to_string()))?;
    let encoding_key = EncodingKey::from_ec_pem(pem.as_bytes())
        .map_err(|error| CredentialError::KeyEncoding(error.to_string()))?;

    encode(
        &Header::new(Algorithm::ES256),
        &claims_for(subject, now),
        &encoding_key,
    )
    .map_err(|error| CredentialError::Signing(error.to_string()))
}

/// Checks the signature against `public_key` and that the token is still
/// valid at `now`.
pub fn verify(
    token: &str,
    public_key: &PublicKey,
    now: DateTime<Utc>,
) -> Result<Claims, CredentialError> {
    let pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|error| CredentialError::KeyEncoding(error.to_string()))?;
    let decoding_key = DecodingKey::from_ec_pem(pem.as_bytes())
        .map_err(|error| CredentialError::KeyEncoding(error.to_string()))?;

    let mut validation = Validation::new(Algorithm::ES256);
    // Expiry is checked against the caller's clock below.
    validation.validate_exp = false;
    validation.set_required_spec_claims(&["exp", "sub"]);

    let data = decode::<Claims>(token, &decoding_key, &validation)
        .map_err(|error| CredentialError::Verification(error.to_string()))?;

    if data.claims.exp <= now.timestamp() {
        return Err(CredentialError::Verification(format!(
            "expired at {}",
            data.claims.exp
        )));
    }

    Ok(data.claims)
}
