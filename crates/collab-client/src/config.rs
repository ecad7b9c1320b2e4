//! Client configuration.
//!
//! Values come from the environment first and can be overridden on the command
//! line. Session timing defaults match what the relay and store expect.

use collab_core::outbox::OfflinePolicy;
use collab_core::{Cadence, DocumentId, DocumentKind, ReconnectConfig, SessionIdentity};
use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_WS_URL: &str = "ws://localhost:8000";
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Per-session timing and buffering knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Broadcast/save windows. `None` uses the document kind's default.
    pub cadence: Option<Cadence>,
    pub reconnect: ReconnectConfig,
    /// Local backup interval. Zero disables periodic backups.
    pub backup_interval: Duration,
    pub backup_capacity: usize,
    pub offline: OfflinePolicy,
    /// How long a peer counts as typing after their last content change.
    pub typing_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cadence: None,
            reconnect: ReconnectConfig::default(),
            backup_interval: Duration::from_secs(30),
            backup_capacity: collab_core::backup::DEFAULT_CAPACITY,
            offline: OfflinePolicy::Drop,
            typing_timeout: Duration::from_secs(2),
        }
    }
}

impl SessionConfig {
    pub fn cadence_for(&self, kind: DocumentKind) -> Cadence {
        self.cadence.unwrap_or_else(|| kind.cadence())
    }
}

/// Where the relay and store live, plus session settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base URL, e.g. `ws://localhost:8000`
    pub ws_url: String,
    /// REST base URL, e.g. `http://localhost:8000`
    pub api_url: String,
    /// Bearer token sent to the REST store
    pub token: Option<String>,
    /// Directory for local backups. `None` keeps them in memory.
    pub backup_dir: Option<PathBuf>,
    pub session: SessionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            token: None,
            backup_dir: None,
            session: SessionConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `COLLAB_WS_URL`: relay base URL
    /// - `COLLAB_API_URL`: REST base URL
    /// - `COLLAB_TOKEN`: bearer token for the REST store
    /// - `COLLAB_BACKUP_DIR`: directory for local backups
    /// - `COLLAB_OFFLINE_QUEUE`: queue up to N operations while disconnected
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = lookup("COLLAB_WS_URL") {
            config.ws_url = url;
        }
        if let Some(url) = lookup("COLLAB_API_URL") {
            config.api_url = url;
        }
        config.token = lookup("COLLAB_TOKEN").filter(|t| !t.is_empty());
        config.backup_dir = lookup("COLLAB_BACKUP_DIR").map(PathBuf::from);
        if let Some(capacity) = lookup("COLLAB_OFFLINE_QUEUE") {
            let capacity: usize = capacity
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidNumber {
                    name: "COLLAB_OFFLINE_QUEUE",
                    value: capacity.clone(),
                })?;
            config.session.offline = offline_policy(capacity);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_url(&self.ws_url, &["ws", "wss"])?;
        parse_url(&self.api_url, &["http", "https"])?;
        Ok(())
    }
}

/// `0` means "don't queue".
pub fn offline_policy(capacity: usize) -> OfflinePolicy {
    if capacity == 0 {
        OfflinePolicy::Drop
    } else {
        OfflinePolicy::Queue { capacity }
    }
}

/// Relay URL for one document socket:
/// `{base}/ws/notes/{id}?user_id=..&username=..` (or `/ws/canvas/{id}`).
pub fn socket_url(
    base: &str,
    kind: DocumentKind,
    id: &DocumentId,
    identity: &SessionIdentity,
) -> Result<Url, ConfigError> {
    let mut url = join(parse_url(base, &["ws", "wss"])?, &kind.socket_path(id))?;
    url.query_pairs_mut()
        .append_pair("user_id", identity.user_id.as_str())
        .append_pair("username", &identity.username);
    Ok(url)
}

/// REST URL of a document's full state.
pub fn rest_url(base: &str, kind: DocumentKind, id: &DocumentId) -> Result<Url, ConfigError> {
    join(parse_url(base, &["http", "https"])?, &kind.rest_path(id))
}

fn parse_url(raw: &str, schemes: &[&str]) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("expected scheme {}", schemes.join(" or ")),
        });
    }
    Ok(url)
}

/// Append `path` to whatever path the base URL already has.
fn join(base: Url, path: &str) -> Result<Url, ConfigError> {
    let joined = format!("{}{}", base.as_str().trim_end_matches('/'), path);
    Url::parse(&joined).map_err(|e| ConfigError::InvalidUrl {
        url: joined,
        reason: e.to_string(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("{name} must be a non-negative integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
}
