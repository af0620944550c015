//! Signed time-bounded auth tokens.
//!
//! Tokens are HMAC-SHA256 signed claims in the standard three-segment
//! base64url format (`header.claims.signature`). [`TokenAuthenticator`]
//! issues and verifies them; verification failures are deliberately
//! indistinguishable to callers (`None` for every reason) and the concrete
//! cause is only logged at debug level.

use std::fmt;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use crate::error::RoomcastError;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_HEADER: &[u8] = br#"{"alg":"HS256","typ":"JWT"}"#;

/// Claims carried inside a signed token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// Authenticated principal.
    #[serde(rename = "sub")]
    pub subject: String,
    /// Granted permission strings.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Issue time, Unix seconds.
    #[serde(rename = "iat")]
    pub issued_at: i64,
    /// Expiry time, Unix seconds. Tokens are invalid from this instant on.
    #[serde(rename = "exp")]
    pub expires_at: i64,
}

impl Claims {
    /// True when the claims grant `permission`.
    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

/// Issues and verifies HMAC-SHA256 signed tokens.
#[derive(Clone)]
pub struct TokenAuthenticator {
    secret: Vec<u8>,
}

impl fmt::Debug for TokenAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthenticator")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl TokenAuthenticator {
    /// Creates an authenticator over a shared secret. The secret is never
    /// logged or serialized.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self) -> Result<HmacSha256, RoomcastError> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| RoomcastError::Internal("hmac key initialization".into()))
    }

    /// Issues a signed token for `subject` valid for `ttl` from now.
    ///
    /// # Errors
    ///
    /// Returns [`RoomcastError::Internal`] if key setup or claims
    /// serialization fails; neither happens for well-formed secrets.
    pub fn issue(
        &self,
        subject: &str,
        permissions: Vec<String>,
        ttl: Duration,
    ) -> Result<String, RoomcastError> {
        let now = Utc::now().timestamp();
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = Claims {
            subject: subject.to_owned(),
            permissions,
            issued_at: now,
            expires_at: now.saturating_add(ttl_secs),
        };
        let body = serde_json::to_vec(&claims)
            .map_err(|err| RoomcastError::Internal(format!("claims serialization: {err}")))?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(TOKEN_HEADER),
            URL_SAFE_NO_PAD.encode(body)
        );
        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{signing_input}.{signature}"))
    }

    /// Verifies a token and returns its claims.
    ///
    /// `None` covers every failure: wrong segment count, undecodable
    /// segments, non-HS256 header, signature mismatch (constant-time
    /// comparison), and expiry.
    #[must_use]
    pub fn verify(&self, token: &str) -> Option<Claims> {
        let mut segments = token.split('.');
        let (Some(header), Some(body), Some(signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            debug!("token rejected: wrong segment count");
            return None;
        };

        let header_json: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header).ok()?).ok()?;
        if header_json.get("alg").and_then(serde_json::Value::as_str) != Some("HS256") {
            debug!("token rejected: unsupported algorithm");
            return None;
        }

        let signature_bytes = URL_SAFE_NO_PAD.decode(signature).ok()?;
        let mut mac = self.mac().ok()?;
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(body.as_bytes());
        if mac.verify_slice(&signature_bytes).is_err() {
            debug!("token rejected: signature mismatch");
            return None;
        }

        let claims: Claims =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(body).ok()?).ok()?;
        if claims.expires_at <= Utc::now().timestamp() {
            debug!(subject = %claims.subject, "token rejected: expired");
            return None;
        }
        Some(claims)
    }

    /// Verifies a token and additionally requires every permission in
    /// `required_permissions` to be present in the claims.
    #[must_use]
    pub fn authenticate_connection(
        &self,
        token: &str,
        required_permissions: &[String],
    ) -> Option<Claims> {
        let claims = self.verify(token)?;
        if required_permissions.iter().all(|p| claims.has_permission(p)) {
            Some(claims)
        } else {
            debug!(subject = %claims.subject, "token rejected: missing required permissions");
            None
        }
    }
}

/// Issues a short-lived token signed with `secret`. Development and test
/// helper; production callers hold a [`TokenAuthenticator`].
///
/// # Errors
///
/// Same failure modes as [`TokenAuthenticator::issue`].
pub fn generate_test_token(
    subject: &str,
    permissions: Vec<String>,
    secret: &str,
) -> Result<String, RoomcastError> {
    TokenAuthenticator::new(secret).issue(subject, permissions, Duration::from_secs(3600))
}
