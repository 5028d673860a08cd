//! Short-lived bus credentials.
//!
//! The bus accepts an OpenID Connect access token as the connection secret.
//! A [`CredentialSource`] acquires the first token and refreshes it;
//! [`TokenEndpoint`] is the HTTP implementation against an identity
//! provider's token endpoint.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;

use crate::config::TokenEndpointConfig;
use crate::error::AuthError;

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// An access token and what is needed to renew it.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Duration,
    issued_at: Instant,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, expires_in: Duration) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_in,
            issued_at: Instant::now(),
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// The secret presented to the bus.
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    /// Validity period granted at issuance.
    pub fn expires_in(&self) -> Duration {
        self.expires_in
    }

    pub fn expires_at(&self) -> Instant {
        self.issued_at + self.expires_in
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// CredentialSource
// ---------------------------------------------------------------------------

/// Issues and renews credentials.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Obtain a fresh credential from the configured grant.
    async fn acquire(&self) -> Result<Credential, AuthError>;

    /// Renew `current`, using its refresh token when it has one.
    async fn refresh(&self, current: &Credential) -> Result<Credential, AuthError>;
}

// ---------------------------------------------------------------------------
// TokenEndpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// OpenID Connect token endpoint client.
pub struct TokenEndpoint {
    client: reqwest::Client,
    config: TokenEndpointConfig,
}

impl TokenEndpoint {
    pub fn new(config: TokenEndpointConfig) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AuthError::Unreachable {
                details: e.to_string(),
            })?;
        Ok(Self { client, config })
    }

    fn base_form(&self, grant: &'static str) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("grant_type", grant.to_owned()),
            ("client_id", self.config.client_id.clone()),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.clone()));
        }
        form
    }

    async fn request(
        &self,
        grant: &'static str,
        form: Vec<(&'static str, String)>,
    ) -> Result<Credential, AuthError> {
        let response = self
            .client
            .post(self.config.url())
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::Unreachable {
                details: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                grant,
                status: status.as_u16(),
                details,
            });
        }

        let token: TokenResponse = response.json().await.map_err(|e| AuthError::InvalidResponse {
            details: e.to_string(),
        })?;
        if token.access_token.is_empty() {
            return Err(AuthError::InvalidResponse {
                details: "empty access_token".to_owned(),
            });
        }

        tracing::debug!(grant, expires_in = token.expires_in, "access token issued");
        let credential = Credential::new(token.access_token, Duration::from_secs(token.expires_in));
        Ok(match token.refresh_token {
            Some(refresh) => credential.with_refresh_token(refresh),
            None => credential,
        })
    }
}

#[async_trait]
impl CredentialSource for TokenEndpoint {
    async fn acquire(&self) -> Result<Credential, AuthError> {
        match (&self.config.username, &self.config.password) {
            (Some(username), Some(password)) => {
                let mut form = self.base_form("password");
                form.push(("username", username.clone()));
                form.push(("password", password.clone()));
                self.request("password", form).await
            }
            _ if self.config.client_secret.is_some() => {
                let form = self.base_form("client_credentials");
                self.request("client_credentials", form).await
            }
            _ => Err(AuthError::MissingCredentials),
        }
    }

    async fn refresh(&self, current: &Credential) -> Result<Credential, AuthError> {
        match current.refresh_token() {
            Some(token) => {
                let mut form = self.base_form("refresh_token");
                form.push(("refresh_token", token.to_owned()));
                self.request("refresh_token", form).await
            }
            None => self.acquire().await,
        }
    }
}

// ---------------------------------------------------------------------------
// StaticIssuer
// ---------------------------------------------------------------------------

/// Issues numbered tokens (`<prefix>-1`, `<prefix>-2`, ...) without any
/// network round trip. For tests and local runs against a bus that does not
/// check secrets.
#[derive(Debug)]
pub struct StaticIssuer {
    prefix: String,
    expires_in: Duration,
    issued: AtomicU64,
    failures: AtomicU32,
}

impl StaticIssuer {
    pub fn new(prefix: impl Into<String>, expires_in: Duration) -> Self {
        Self {
            prefix: prefix.into(),
            expires_in,
            issued: AtomicU64::new(0),
            failures: AtomicU32::new(0),
        }
    }

    /// Reject the next `count` requests.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Tokens issued so far.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }

    fn issue(&self, grant: &'static str) -> Result<Credential, AuthError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AuthError::Rejected {
                grant,
                status: 401,
                details: "injected failure".to_owned(),
            });
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Credential::new(format!("{}-{n}", self.prefix), self.expires_in)
            .with_refresh_token(format!("{}-refresh-{n}", self.prefix)))
    }
}

#[async_trait]
impl CredentialSource for StaticIssuer {
    async fn acquire(&self) -> Result<Credential, AuthError> {
        self.issue("static")
    }

    async fn refresh(&self, _current: &Credential) -> Result<Credential, AuthError> {
        self.issue("refresh_token")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_prints_tokens() {
        let cred = Credential::new("eyJhbGciOi.secret", Duration::from_secs(300))
            .with_refresh_token("refresh-secret");
        let rendered = format!("{cred:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("300"));
    }

    #[tokio::test]
    async fn missing_credentials_are_reported_before_any_request() {
        let endpoint = TokenEndpoint::new(TokenEndpointConfig::default()).unwrap();
        let err = endpoint.acquire().await.unwrap_err();
        assert!(matches!(err, AuthError::MissingCredentials));
    }

    #[tokio::test]
    async fn static_issuer_numbers_tokens_and_injects_failures() {
        let issuer = StaticIssuer::new("token", Duration::from_secs(60));
        let first = issuer.acquire().await.unwrap();
        assert_eq!(first.access_token(), "token-1");
        assert_eq!(first.refresh_token(), Some("token-refresh-1"));

        issuer.fail_next(1);
        assert!(matches!(
            issuer.refresh(&first).await,
            Err(AuthError::Rejected { status: 401, .. })
        ));
        assert_eq!(issuer.refresh(&first).await.unwrap().access_token(), "token-2");
        assert_eq!(issuer.issued(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_is_measured_from_issuance() {
        let cred = Credential::new("t", Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cred.expires_at() - Instant::now(), Duration::from_secs(50));
    }
}
