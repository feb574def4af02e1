//! Tenant tokens and worker secrets.
//!
//! Tenant tokens are HS256 JWTs carrying a `tenant_id` claim, so any JWT
//! library sharing the secret can mint or read them.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Issues and verifies tenant tokens.
pub trait Authenticator: Send + Sync {
    /// Mint a token for `tenant_id`.
    fn issue(&self, tenant_id: &str) -> Result<String>;

    /// Resolve a token to its tenant id. Returns `None` for any token
    /// that is malformed, forged, or expired.
    fn verify(&self, token: &str) -> Option<String>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    tenant_id: String,
    iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
}

/// HS256 token authenticator.
#[derive(Clone)]
pub struct HmacAuthenticator {
    secret: Vec<u8>,
    ttl: Option<chrono::Duration>,
}

impl HmacAuthenticator {
    /// Tokens never expire.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            ttl: None,
        }
    }

    /// Stamp issued tokens with an `exp` claim `ttl` from now.
    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret).map_err(|e| Error::Auth(e.to_string()))
    }
}

impl std::fmt::Debug for HmacAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacAuthenticator")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl Authenticator for HmacAuthenticator {
    fn issue(&self, tenant_id: &str) -> Result<String> {
        let header = Header {
            alg: "HS256".into(),
            typ: "JWT".into(),
        };
        let now = chrono::Utc::now();
        let claims = Claims {
            tenant_id: tenant_id.to_string(),
            iat: now.timestamp(),
            exp: self.ttl.map(|ttl| (now + ttl).timestamp()),
        };

        let header = serde_json::to_vec(&header).map_err(|e| Error::Auth(e.to_string()))?;
        let claims = serde_json::to_vec(&claims).map_err(|e| Error::Auth(e.to_string()))?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(claims)
        );

        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{}.{}", signing_input, signature))
    }

    fn verify(&self, token: &str) -> Option<String> {
        let mut parts = token.split('.');
        let (header, claims, signature) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }

        let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;
        let mut mac = self.mac().ok()?;
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(claims.as_bytes());
        mac.verify_slice(&signature).ok()?;

        let header: Header = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header).ok()?).ok()?;
        if header.alg != "HS256" {
            return None;
        }
        let claims: Claims = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(claims).ok()?).ok()?;
        let now = chrono::Utc::now().timestamp();
        if claims.exp.is_some_and(|exp| now >= exp) {
            return None;
        }
        Some(claims.tenant_id)
    }
}

/// Compare a presented worker secret with the configured one. An empty
/// configured secret accepts nobody.
pub fn worker_secret_matches(expected: &str, presented: &str) -> bool {
    if expected.is_empty() || expected.len() != presented.len() {
        return false;
    }
    expected
        .bytes()
        .zip(presented.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
