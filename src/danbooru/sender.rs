//! Transport capability used by the fetch engine.
//!
//! The engine only ever needs "perform one authenticated GET and hand back the status and bytes", so
//! everything above this module talks to the [`Transport`] trait. [`HttpTransport`] is the production
//! implementation over a pooled `reqwest` client; tests swap in scripted transports.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Url};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, trace};

use crate::danbooru::classifier::{ClassifiedOutcome, classify};

/// Failure to obtain any response at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Status, body and the few headers the classifier cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub retry_after: Option<Duration>,
    pub content_type: Option<String>,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
            retry_after: None,
            content_type: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Body as lossy UTF-8, for diagnostics.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Who the requests are made as.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Public-only access. Gated fields come back withheld.
    Anonymous,
    ApiKey { username: String, api_key: String },
}

impl Credential {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Credential::Anonymous)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Anonymous => write!(f, "Anonymous"),
            Credential::ApiKey { username, api_key } => {
                write!(f, "ApiKey({}, {})", username, "*".repeat(api_key.len()))
            }
        }
    }
}

/// One authenticated GET against the upstream API or its media host.
#[async_trait]
pub trait Transport: Send + Sync {
    /// `path` is relative to the API base (`posts/1.json`) or an absolute media URL.
    async fn get(&self, path: &str, credential: &Credential) -> Result<RawResponse, TransportError>;
}

/// Settings for the production HTTP transport.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_idle_per_host: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://danbooru.donmai.us/".to_string(),
            user_agent: format!("danbooru_fetcher/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 30,
            connect_timeout_secs: 10,
            max_idle_per_host: 10,
        }
    }
}

/// `reqwest` backed transport with connection pooling.
pub struct HttpTransport {
    client: Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(config: &SenderConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(config.max_idle_per_host)
            .gzip(true)
            .build()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        // Url::join drops the last segment unless the base ends with a slash.
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url =
            Url::parse(&base).map_err(|e| TransportError::InvalidRequest(format!("{}: {}", base, e)))?;

        debug!(base_url = %base_url, timeout_secs = config.timeout_secs, "HTTP transport initialized");
        Ok(Self { client, base_url })
    }

    fn resolve(&self, path: &str) -> Result<Url, TransportError> {
        let resolved = if path.starts_with("http://") || path.starts_with("https://") {
            Url::parse(path)
        } else {
            self.base_url.join(path.trim_start_matches('/'))
        };
        resolved.map_err(|e| TransportError::InvalidRequest(format!("{}: {}", path, e)))
    }
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_builder() {
        TransportError::InvalidRequest(error.to_string())
    } else {
        TransportError::Connection(error.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, path: &str, credential: &Credential) -> Result<RawResponse, TransportError> {
        let url = self.resolve(path)?;
        trace!(url = %url, "GET");

        let mut request = self.client.get(url);
        if let Credential::ApiKey { username, api_key } = credential {
            request = request.basic_auth(username, Some(api_key));
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response.headers();
        let retry_after = headers
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();

        let mut raw = RawResponse::new(status, body);
        if let Some(retry_after) = retry_after {
            raw = raw.with_retry_after(retry_after);
        }
        raw.content_type = content_type;
        Ok(raw)
    }
}

/// Account tier, as far as content visibility goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PermissionTier {
    Anonymous,
    Member,
    Gold,
}

impl PermissionTier {
    pub fn from_level(level: u32) -> Self {
        match level {
            0..=19 => PermissionTier::Anonymous,
            20..=29 => PermissionTier::Member,
            _ => PermissionTier::Gold,
        }
    }

    /// Gold-exclusive posts are only fully visible from Gold upwards.
    pub fn can_view_gold_exclusive(&self) -> bool {
        *self >= PermissionTier::Gold
    }
}

/// The account the credential belongs to.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: Option<u64>,
    #[serde(default = "default_profile_name")]
    pub name: String,
    #[serde(default)]
    pub level: u32,
    #[serde(default = "default_profile_name")]
    pub level_string: String,
}

fn default_profile_name() -> String {
    "Anonymous".to_string()
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            id: None,
            name: default_profile_name(),
            level: 0,
            level_string: default_profile_name(),
        }
    }
}

impl UserProfile {
    pub fn tier(&self) -> PermissionTier {
        PermissionTier::from_level(self.level)
    }
}

impl fmt::Display for UserProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id.is_none() {
            write!(f, "Danbooru: Guest (Not logged in)")
        } else {
            write!(f, "Danbooru: {} ({})", self.name, self.level_string)
        }
    }
}

/// Why the profile lookup failed.
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Invalid API key or username")]
    AuthenticationFailure,

    #[error("Profile lookup failed: {0}")]
    Unexpected(String),
}

/// Looks up the account behind `credential`. Anonymous access never touches the network.
pub async fn fetch_profile(
    transport: &dyn Transport,
    credential: &Credential,
) -> Result<UserProfile, ProfileError> {
    if credential.is_anonymous() {
        return Ok(UserProfile::default());
    }

    let classified = match transport.get("profile.json", credential).await {
        Ok(response) => classify(&response),
        Err(error) => return Err(ProfileError::Unexpected(error.to_string())),
    };

    match classified {
        ClassifiedOutcome::Success(body) => serde_json::from_value(body)
            .map_err(|e| ProfileError::Unexpected(format!("unreadable profile: {}", e))),
        ClassifiedOutcome::AuthenticationFailure => Err(ProfileError::AuthenticationFailure),
        other => Err(ProfileError::Unexpected(other.kind().to_string())),
    }
}
