//! Observer configuration.
//!
//! [`ObserverConfig`] is plain serde data with defaults for everything but
//! the namespace. Reading it from a file or the environment is left to the
//! embedding application.
//!
//! ```
//! use orrery_client::config::{ObserverConfig, RefreshPolicy};
//!
//! let config: ObserverConfig = serde_json::from_str(r#"{
//!     "namespace": "greenfield",
//!     "refresh": { "fixed": { "interval_secs": 180 } }
//! }"#).unwrap();
//! assert_eq!(config.namespace.as_str(), "greenfield");
//! assert_eq!(config.refresh, RefreshPolicy::Fixed { interval_secs: 180 });
//! assert_eq!(config.target_app, "fire");
//! ```

use std::time::Duration;

use orrery_state::category::CategoryTable;
use orrery_state::journal::DEFAULT_JOURNAL_CAPACITY;
use orrery_state::trail::TrailConfig;
use orrery_wire::topic::Namespace;
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;

// ---------------------------------------------------------------------------
// ObserverConfig
// ---------------------------------------------------------------------------

/// Everything an observer needs to join a testbed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverConfig {
    /// Namespace prefix shared by every topic of the run.
    pub namespace: Namespace,

    /// Message bus endpoint.
    #[serde(default)]
    pub bus: BusEndpoint,

    /// Identity provider token endpoint.
    #[serde(default)]
    pub token: TokenEndpointConfig,

    /// When to refresh the access credential.
    #[serde(default)]
    pub refresh: RefreshPolicy,

    /// Reconnect delays.
    #[serde(default)]
    pub backoff: BackoffPolicy,

    /// Per-entity trail history.
    #[serde(default)]
    pub trail: TrailConfig,

    /// Store changes kept for the presentation layer between drains.
    #[serde(default = "default_journal_capacity")]
    pub journal_capacity: usize,

    /// Display category lookup.
    #[serde(default)]
    pub categories: CategoryTable,

    /// What to do with entity updates that arrive before the run starts.
    #[serde(default)]
    pub pre_run: PreRunPolicy,

    /// App publishing observation targets (`<app>.location`).
    #[serde(default = "default_target_app")]
    pub target_app: String,

    /// Capacity of the observer event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Logging setup used by [`init_tracing`](crate::telemetry::init_tracing).
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_target_app() -> String {
    "fire".to_owned()
}

fn default_event_capacity() -> usize {
    256
}

fn default_journal_capacity() -> usize {
    DEFAULT_JOURNAL_CAPACITY
}

impl ObserverConfig {
    /// Configuration with defaults for everything but the namespace.
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            bus: BusEndpoint::default(),
            token: TokenEndpointConfig::default(),
            refresh: RefreshPolicy::default(),
            backoff: BackoffPolicy::default(),
            trail: TrailConfig::default(),
            journal_capacity: default_journal_capacity(),
            categories: CategoryTable::default(),
            pre_run: PreRunPolicy::default(),
            target_app: default_target_app(),
            event_capacity: default_event_capacity(),
            logging: LoggingConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// BusEndpoint
// ---------------------------------------------------------------------------

/// Message broker address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusEndpoint {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub tls: bool,
    /// Login name presented with the access token. The testbed broker
    /// authenticates on the token alone, so this is usually empty.
    pub username: String,
    /// Suffix of the observer's queue name, `<pattern>.<client_name>`.
    pub client_name: String,
}

impl Default for BusEndpoint {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 5672,
            virtual_host: "/".to_owned(),
            tls: false,
            username: String::new(),
            client_name: "orrery-observer".to_owned(),
        }
    }
}

impl std::fmt::Display for BusEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.tls { "amqps" } else { "amqp" };
        write!(f, "{scheme}://{}:{}{}", self.host, self.port, self.virtual_host)
    }
}

// ---------------------------------------------------------------------------
// TokenEndpointConfig
// ---------------------------------------------------------------------------

/// OpenID Connect token endpoint and client credentials.
///
/// With `username` and `password` set the password grant is used, otherwise
/// the client-credentials grant. Refreshes use the refresh-token grant when
/// the identity provider issued a refresh token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenEndpointConfig {
    pub host: String,
    pub port: u16,
    pub realm: String,
    /// Force `https`/`http`. By default loopback hosts use `http` and
    /// everything else `https`.
    pub tls: Option<bool>,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
}

impl Default for TokenEndpointConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 8080,
            realm: "test".to_owned(),
            tls: None,
            client_id: String::new(),
            client_secret: None,
            username: None,
            password: None,
            timeout_secs: 30,
        }
    }
}

impl TokenEndpointConfig {
    /// Full URL of the realm's token endpoint.
    pub fn url(&self) -> String {
        let loopback = self.host.contains("localhost") || self.host.contains("127.0.0.1");
        let scheme = if self.tls.unwrap_or(!loopback) { "https" } else { "http" };
        format!(
            "{scheme}://{}:{}/realms/{}/protocol/openid-connect/token",
            self.host, self.port, self.realm
        )
    }
}

impl std::fmt::Debug for TokenEndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEndpointConfig")
            .field("url", &self.url())
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// RefreshPolicy
// ---------------------------------------------------------------------------

/// When the access credential is refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicy {
    /// Refresh on a fixed cadence regardless of expiry.
    Fixed { interval_secs: u64 },
    /// Refresh `margin_secs` before the credential expires, but never more
    /// often than every `min_interval_secs`.
    BeforeExpiry {
        margin_secs: u64,
        min_interval_secs: u64,
    },
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        RefreshPolicy::BeforeExpiry {
            margin_secs: 30,
            min_interval_secs: 10,
        }
    }
}

impl RefreshPolicy {
    /// Delay until the next refresh of a credential valid for `expires_in`.
    pub fn delay(&self, expires_in: Duration) -> Duration {
        match *self {
            RefreshPolicy::Fixed { interval_secs } => Duration::from_secs(interval_secs),
            RefreshPolicy::BeforeExpiry {
                margin_secs,
                min_interval_secs,
            } => expires_in
                .saturating_sub(Duration::from_secs(margin_secs))
                .max(Duration::from_secs(min_interval_secs)),
        }
    }

    /// Delay before retrying after a failed refresh.
    pub fn retry_delay(&self) -> Duration {
        match *self {
            RefreshPolicy::Fixed { interval_secs } => Duration::from_secs(interval_secs),
            RefreshPolicy::BeforeExpiry {
                min_interval_secs, ..
            } => Duration::from_secs(min_interval_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// PreRunPolicy
// ---------------------------------------------------------------------------

/// Handling of entity updates received before the run is started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreRunPolicy {
    /// Apply immediately.
    #[default]
    Apply,
    /// Hold up to `capacity` updates and apply them on `Start`. The oldest
    /// update is dropped when full.
    Buffer { capacity: usize },
    /// Discard (acknowledged).
    Drop,
}

// ---------------------------------------------------------------------------
// LoggingConfig
// ---------------------------------------------------------------------------

/// Log output setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_token_endpoint_uses_http() {
        let cfg = TokenEndpointConfig::default();
        assert_eq!(
            cfg.url(),
            "http://localhost:8080/realms/test/protocol/openid-connect/token"
        );

        let remote = TokenEndpointConfig {
            host: "auth.example.org".to_owned(),
            port: 443,
            realm: "nost".to_owned(),
            ..Default::default()
        };
        assert!(remote.url().starts_with("https://auth.example.org:443/realms/nost/"));
    }

    #[test]
    fn debug_redacts_secrets() {
        let cfg = TokenEndpointConfig {
            client_secret: Some("s3cret".to_owned()),
            password: Some("hunter2".to_owned()),
            ..Default::default()
        };
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn fixed_refresh_ignores_expiry() {
        let policy = RefreshPolicy::Fixed { interval_secs: 180 };
        assert_eq!(policy.delay(Duration::from_secs(60)), Duration::from_secs(180));
        assert_eq!(policy.retry_delay(), Duration::from_secs(180));
    }

    #[test]
    fn before_expiry_honours_margin_and_floor() {
        let policy = RefreshPolicy::BeforeExpiry {
            margin_secs: 30,
            min_interval_secs: 10,
        };
        assert_eq!(policy.delay(Duration::from_secs(300)), Duration::from_secs(270));
        assert_eq!(policy.delay(Duration::from_secs(35)), Duration::from_secs(10));
        assert_eq!(policy.delay(Duration::ZERO), Duration::from_secs(10));
    }

    #[test]
    fn minimal_document_gets_defaults() {
        let cfg: ObserverConfig = serde_json::from_str(r#"{"namespace": "sos"}"#).unwrap();
        assert_eq!(cfg.pre_run, PreRunPolicy::Apply);
        assert_eq!(cfg.trail.capacity, 1024);
        assert_eq!(cfg.journal_capacity, 4096);
        assert_eq!(cfg.bus.port, 5672);
        assert_eq!(cfg.bus.username, "");
        assert_eq!(cfg.bus.client_name, "orrery-observer");
        assert!(serde_json::from_str::<ObserverConfig>(r#"{"namespace": ""}"#).is_err());
    }

    #[test]
    fn pre_run_buffer_parses() {
        let policy: PreRunPolicy = serde_json::from_str(r#"{"buffer": {"capacity": 8}}"#).unwrap();
        assert_eq!(policy, PreRunPolicy::Buffer { capacity: 8 });
        let drop: PreRunPolicy = serde_json::from_str(r#""drop""#).unwrap();
        assert_eq!(drop, PreRunPolicy::Drop);
    }
}
