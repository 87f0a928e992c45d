//! Inbound webhook events.
//!
//! [`WebhookEvent`] classifies a delivery by its `X-Event-Key` and host
//! variant; [`normalize::EventNormalizer`] turns it into head updates or a
//! rescan request.

pub mod normalize;
pub mod payload;

pub use normalize::{EventNormalizer, NormalizerSettings};

use crate::errors::ErrorCode;
use crate::head::HeadUpdate;
use crate::strategy::TrustSnapshot;
use crate::types::{HostVariant, RepoRef};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("missing X-Event-Key header")]
    MissingEventKey,

    #[error("unrecognized event key '{0}'")]
    UnknownEventKey(String),

    #[error("malformed {event} payload: {source}")]
    Malformed {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} payload does not identify a repository")]
    MissingRepository(String),
}

impl PayloadError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MissingEventKey => ErrorCode::WebhookMissingEventKey,
            Self::UnknownEventKey(_) => ErrorCode::WebhookUnknownEventKey,
            Self::Malformed { .. } | Self::MissingRepository(_) => {
                ErrorCode::WebhookMalformedPayload
            }
        }
    }
}

// ── Event catalog ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestAction {
    Created,
    Updated,
    Merged,
    Declined,
    /// Server-only; handled like a decline.
    Deleted,
}

impl PullRequestAction {
    /// Closed pull requests produce tombstones.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Merged | Self::Declined | Self::Deleted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "action")]
pub enum EventType {
    Push,
    RefsChanged,
    MirrorSynchronized,
    PullRequest(PullRequestAction),
    Ping,
}

/// Whether a key belongs to the cloud-style catalog or the native server one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyFamily {
    Cloud,
    Native,
}

const EVENT_KEYS: &[(&str, EventType, KeyFamily)] = &[
    ("repo:push", EventType::Push, KeyFamily::Cloud),
    (
        "pullrequest:created",
        EventType::PullRequest(PullRequestAction::Created),
        KeyFamily::Cloud,
    ),
    (
        "pullrequest:updated",
        EventType::PullRequest(PullRequestAction::Updated),
        KeyFamily::Cloud,
    ),
    (
        "pullrequest:fulfilled",
        EventType::PullRequest(PullRequestAction::Merged),
        KeyFamily::Cloud,
    ),
    (
        "pullrequest:rejected",
        EventType::PullRequest(PullRequestAction::Declined),
        KeyFamily::Cloud,
    ),
    ("repo:refs_changed", EventType::RefsChanged, KeyFamily::Native),
    (
        "pr:opened",
        EventType::PullRequest(PullRequestAction::Created),
        KeyFamily::Native,
    ),
    (
        "pr:from_ref_updated",
        EventType::PullRequest(PullRequestAction::Updated),
        KeyFamily::Native,
    ),
    (
        "pr:modified",
        EventType::PullRequest(PullRequestAction::Updated),
        KeyFamily::Native,
    ),
    (
        "pr:merged",
        EventType::PullRequest(PullRequestAction::Merged),
        KeyFamily::Native,
    ),
    (
        "pr:declined",
        EventType::PullRequest(PullRequestAction::Declined),
        KeyFamily::Native,
    ),
    (
        "pr:deleted",
        EventType::PullRequest(PullRequestAction::Deleted),
        KeyFamily::Native,
    ),
    (
        "mirror:repo_synchronized",
        EventType::MirrorSynchronized,
        KeyFamily::Native,
    ),
    ("diagnostics:ping", EventType::Ping, KeyFamily::Native),
];

impl EventType {
    fn lookup(key: &str) -> Option<(EventType, KeyFamily)> {
        EVENT_KEYS
            .iter()
            .find(|(k, _, _)| *k == key.trim())
            .map(|(_, event, family)| (*event, *family))
    }

    pub fn from_key(key: &str) -> Option<EventType> {
        Self::lookup(key).map(|(event, _)| event)
    }

    /// All recognized `X-Event-Key` values.
    pub fn known_keys() -> impl Iterator<Item = &'static str> {
        EVENT_KEYS.iter().map(|(k, _, _)| *k)
    }
}

/// Payload dialect of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    Cloud,
    /// Plugin-managed hooks on a server: cloud-style keys and shapes.
    ServerPlugin,
    ServerNative,
}

impl PayloadFormat {
    fn detect(family: KeyFamily, variant: HostVariant) -> Self {
        match (family, variant) {
            (KeyFamily::Native, _) => Self::ServerNative,
            (KeyFamily::Cloud, HostVariant::Cloud) => Self::Cloud,
            (KeyFamily::Cloud, HostVariant::Server) => Self::ServerPlugin,
        }
    }

    pub fn is_cloud(&self) -> bool {
        matches!(self, Self::Cloud)
    }
}

impl std::fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cloud => write!(f, "cloud"),
            Self::ServerPlugin => write!(f, "server-plugin"),
            Self::ServerNative => write!(f, "server-native"),
        }
    }
}

/// One authenticated webhook delivery.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub key: String,
    pub event_type: EventType,
    pub format: PayloadFormat,
    pub variant: HostVariant,
    /// Normalized server URL the delivery belongs to.
    pub server_url: String,
    /// Where the delivery came from (remote address or "cli").
    pub origin: String,
    pub payload: Vec<u8>,
}

impl WebhookEvent {
    pub fn new(
        key: Option<&str>,
        variant: HostVariant,
        server_url: impl Into<String>,
        origin: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Self, PayloadError> {
        let key = key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(PayloadError::MissingEventKey)?;
        let (event_type, family) =
            EventType::lookup(key).ok_or_else(|| PayloadError::UnknownEventKey(key.to_string()))?;
        Ok(Self {
            key: key.to_string(),
            event_type,
            format: PayloadFormat::detect(family, variant),
            variant,
            server_url: server_url.into(),
            origin: origin.into(),
            payload: payload.into(),
        })
    }

    pub(crate) fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, PayloadError> {
        serde_json::from_slice(&self.payload).map_err(|source| PayloadError::Malformed {
            event: self.key.clone(),
            source,
        })
    }
}

// ── Normalized output ──────────────────────────────────────────────────────

/// Request for a full scan of one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RescanRequest {
    pub server_url: String,
    pub repository: RepoRef,
    pub mirror_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub enum NormalizedEvent {
    Updates {
        updates: Vec<HeadUpdate>,
        trust: TrustSnapshot,
    },
    Rescan(RescanRequest),
    /// Accepted and discarded (ping).
    Acknowledge,
    /// Nothing to dispatch.
    Skip(String),
}

impl NormalizedEvent {
    pub fn updates(&self) -> &[HeadUpdate] {
        match self {
            Self::Updates { updates, .. } => updates,
            Self::Rescan(_) | Self::Acknowledge | Self::Skip(_) => &[],
        }
    }

    pub fn rescan(&self) -> Option<&RescanRequest> {
        match self {
            Self::Rescan(request) => Some(request),
            _ => None,
        }
    }
}
