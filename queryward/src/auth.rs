//! Bearer validation against a refreshing JWKS.
//!
//! The key set is fetched from the identity provider and cached by key
//! id. A token signed with an unknown key triggers one rate-limited
//! refresh before the request is rejected, which covers key rotation
//! without letting a flood of bad tokens hammer the provider.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Claims extracted from a validated bearer. Lives for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub preferred_username: String,
    pub email: String,
    pub groups: Vec<String>,
}

impl Identity {
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,
    #[error("invalid signature")]
    SignatureInvalid,
    #[error("token expired")]
    Expired,
    #[error("unknown signing key")]
    UnknownKey,
    #[error("issuer mismatch")]
    IssuerMismatch,
    #[error("key set fetch failed: {0}")]
    Jwks(String),
}

#[derive(Deserialize)]
struct Claims {
    #[serde(default)]
    preferred_username: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    groups: Vec<String>,
}

#[derive(Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: String,
    kty: String,
    #[serde(default)]
    n: String,
    #[serde(default)]
    e: String,
}

pub struct TokenVerifier {
    jwks_url: String,
    issuer: Option<String>,
    client: reqwest::Client,
    keys: RwLock<HashMap<String, DecodingKey>>,
    last_refresh: Mutex<Option<Instant>>,
}

impl TokenVerifier {
    pub fn new(jwks_url: impl Into<String>, issuer: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .expect("default reqwest client");
        TokenVerifier {
            jwks_url: jwks_url.into(),
            issuer,
            client,
            keys: RwLock::new(HashMap::new()),
            last_refresh: Mutex::new(None),
        }
    }

    /// Initial fetch; an unreachable JWKS endpoint is a startup failure.
    pub async fn prefetch(&self) -> Result<(), AuthError> {
        self.refresh().await
    }

    pub async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let header = decode_header(token).map_err(|_| AuthError::Malformed)?;
        let kid = header.kid.ok_or(AuthError::UnknownKey)?;

        let key = match self.key(&kid).await {
            Some(key) => key,
            None => {
                self.refresh_rate_limited().await?;
                self.key(&kid).await.ok_or(AuthError::UnknownKey)?
            }
        };

        let mut validation = Validation::new(Algorithm::RS256);
        validation.algorithms = vec![Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];
        validation.validate_aud = false;
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(std::slice::from_ref(issuer));
        }

        let data = decode::<Claims>(token, &key, &validation).map_err(classify)?;
        Ok(Identity {
            preferred_username: data.claims.preferred_username,
            email: data.claims.email,
            groups: data.claims.groups,
        })
    }

    async fn key(&self, kid: &str) -> Option<DecodingKey> {
        self.keys.read().await.get(kid).cloned()
    }

    /// One refresh at a time, and at most one per rate-limit window.
    /// Concurrent callers wait on the lock and then see the fresh keys.
    async fn refresh_rate_limited(&self) -> Result<(), AuthError> {
        let mut last = self.last_refresh.lock().await;
        if let Some(at) = *last
            && at.elapsed() < MIN_REFRESH_INTERVAL
        {
            return Ok(());
        }
        self.fetch_keys().await?;
        *last = Some(Instant::now());
        Ok(())
    }

    async fn refresh(&self) -> Result<(), AuthError> {
        let mut last = self.last_refresh.lock().await;
        self.fetch_keys().await?;
        *last = Some(Instant::now());
        Ok(())
    }

    async fn fetch_keys(&self) -> Result<(), AuthError> {
        let document: JwksDocument = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| AuthError::Jwks(e.to_string()))?
            .error_for_status()
            .map_err(|e| AuthError::Jwks(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::Jwks(e.to_string()))?;

        let mut keys = HashMap::with_capacity(document.keys.len());
        for jwk in &document.keys {
            if jwk.kty != "RSA" || jwk.kid.is_empty() {
                continue;
            }
            match DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
                Ok(key) => {
                    keys.insert(jwk.kid.clone(), key);
                }
                Err(err) => {
                    tracing::warn!(kid = %jwk.kid, error = %err, "skipping unusable JWKS key");
                }
            }
        }
        tracing::debug!(count = keys.len(), "JWKS refreshed");
        *self.keys.write().await = keys;
        Ok(())
    }
}

fn classify(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidIssuer => AuthError::IssuerMismatch,
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => AuthError::Malformed,
        _ => AuthError::SignatureInvalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn garbage_bearer_is_malformed() {
        let verifier = TokenVerifier::new("http://127.0.0.1:1/certs", None);
        let err = verifier.verify("not-a-jwt").await.unwrap_err();
        assert!(matches!(err, AuthError::Malformed));
    }

    #[tokio::test]
    async fn unknown_kid_with_unreachable_jwks_fails_closed() {
        // Structurally valid JWT (header/payload/signature are base64url
        // JSON) signed by nothing we know; the refresh attempt cannot
        // reach the provider, so the request must fail.
        let token = concat!(
            "eyJhbGciOiJSUzI1NiIsImtpZCI6InJvdGF0ZWQifQ.",
            "eyJwcmVmZXJyZWRfdXNlcm5hbWUiOiJhbGljZSJ9.",
            "c2ln"
        );
        let verifier = TokenVerifier::new("http://127.0.0.1:1/certs", None);
        let err = verifier.verify(token).await.unwrap_err();
        assert!(matches!(err, AuthError::Jwks(_)));
    }

    #[tokio::test]
    async fn rate_limited_refresh_swallows_repeat_attempts() {
        let verifier = TokenVerifier::new("http://127.0.0.1:1/certs", None);
        assert!(verifier.refresh_rate_limited().await.is_err());
        // Pretend a refresh just happened; the next attempt is a no-op
        // instead of another fetch.
        *verifier.last_refresh.lock().await = Some(Instant::now());
        assert!(verifier.refresh_rate_limited().await.is_ok());
    }

    #[test]
    fn group_membership_is_exact() {
        let identity = Identity {
            preferred_username: "alice".into(),
            email: String::new(),
            groups: vec!["dev".into(), "ops-admin".into()],
        };
        assert!(identity.in_group("ops-admin"));
        assert!(!identity.in_group("ops"));
    }
}
