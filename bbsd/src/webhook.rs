//! Webhook ingestion: classification, endpoint lookup and authentication.

use crate::signature::{self, SignatureError};
use bbs_common::types::normalize_server_url;
use bbs_common::{
    BbsConfig, BranchSource, CLOUD_SERVER_URL, ErrorCode, EventNormalizer, HostApi, HostVariant,
    NormalizedEvent, NormalizerSettings, PayloadError, WebhookEvent,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub const EVENT_KEY_HEADER: &str = "x-event-key";
pub const VARIANT_HEADER: &str = "x-bitbucket-type";

/// A delivery as received, before any validation.
#[derive(Debug, Clone, Default)]
pub struct Delivery<'a> {
    pub event_key: Option<&'a str>,
    pub variant_hint: Option<&'a str>,
    pub signature: Option<&'a str>,
    pub server_url: Option<&'a str>,
    pub origin: &'a str,
    pub body: &'a [u8],
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("no endpoint configured for server '{0}'")]
    UnknownServer(String),
}

impl IngestError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Payload(err) => err.code(),
            Self::Signature(err) => err.code(),
            Self::UnknownServer(_) => ErrorCode::WebhookUnknownServer,
        }
    }

    /// Authentication failures get 403; everything else is a bad request.
    pub fn is_forbidden(&self) -> bool {
        match self {
            Self::Signature(err) => err.is_authentication_failure(),
            Self::UnknownServer(_) => true,
            Self::Payload(_) => false,
        }
    }
}

/// Resolve the host variant from the vendor header, then the `server_url` parameter.
pub fn resolve_variant(hint: Option<&str>, server_url: Option<&str>) -> HostVariant {
    match hint.map(|h| h.trim().to_ascii_lowercase()) {
        Some(h) if h == "server" => HostVariant::Server,
        Some(h) if h == "cloud" => HostVariant::Cloud,
        _ if server_url.is_some_and(|u| !u.trim().is_empty()) => HostVariant::Server,
        _ => HostVariant::Cloud,
    }
}

/// Validate a delivery and turn it into a [`WebhookEvent`].
///
/// The event key is checked first, then the endpoint, then the signature.
pub fn authenticate(
    config: &BbsConfig,
    delivery: &Delivery<'_>,
) -> Result<WebhookEvent, IngestError> {
    let server_param = delivery.server_url.filter(|u| !u.trim().is_empty());
    let variant = resolve_variant(delivery.variant_hint, server_param);
    let raw_url = server_param.unwrap_or(CLOUD_SERVER_URL);
    let server_url = normalize_server_url(raw_url).unwrap_or_else(|| raw_url.to_string());

    let event = WebhookEvent::new(
        delivery.event_key,
        variant,
        server_url.as_str(),
        delivery.origin,
        delivery.body,
    )?;

    let endpoint = config.endpoint(&server_url).ok_or_else(|| {
        warn!(server_url = %server_url, "Webhook for unconfigured server rejected");
        IngestError::UnknownServer(server_url.clone())
    })?;

    if endpoint.signature_verification {
        match signature::verify(delivery.signature, endpoint.verification_secret(), delivery.body) {
            Ok(algorithm) => debug!(server_url = %server_url, %algorithm, "Signature verified"),
            Err(err) => {
                warn!(server_url = %server_url, "Webhook signature rejected: {}", err);
                return Err(err.into());
            }
        }
    }

    Ok(event)
}

/// Everything normalization needs, shareable with a blocking worker.
#[derive(Clone)]
pub struct NormalizeContext {
    pub host: Arc<dyn HostApi>,
    pub sources: Arc<Vec<BranchSource>>,
    pub config: Arc<BbsConfig>,
}

impl NormalizeContext {
    pub fn settings_for(&self, server_url: &str) -> NormalizerSettings {
        NormalizerSettings {
            scan_on_empty_changes: self.config.general.scan_on_empty_changes,
            credential_id: self
                .config
                .endpoint(server_url)
                .and_then(|e| e.credential_id.clone()),
        }
    }

    /// Blocking: may call the host.
    pub fn normalize(&self, event: &WebhookEvent) -> Result<NormalizedEvent, PayloadError> {
        let settings = self.settings_for(&event.server_url);
        EventNormalizer::new(self.host.as_ref(), &self.sources, settings).normalize(event)
    }
}
