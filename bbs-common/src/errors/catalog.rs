//! Error Catalog for the branch source
//!
//! Each error has:
//! - A unique code (BBS-E001 through BBS-E599)
//! - A human-readable message
//! - Remediation steps
//!
//! # Example
//!
//! ```rust
//! use bbs_common::errors::catalog::ErrorCode;
//!
//! let entry = ErrorCode::WebhookSignatureMismatch.entry();
//! println!("Error {}: {}", entry.code, entry.message);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code enumeration covering all branch source failure scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // =========================================================================
    // Config Errors (E001-E099)
    // =========================================================================
    /// Configuration file not found
    ConfigNotFound,
    /// Configuration file could not be read
    ConfigReadError,
    /// Configuration file contains invalid TOML syntax
    ConfigParseError,
    /// Configuration contains invalid values
    ConfigValidationError,
    /// Environment variable has invalid value
    ConfigEnvError,

    // =========================================================================
    // Webhook Errors (E100-E199)
    // =========================================================================
    /// Event key header missing
    WebhookMissingEventKey,
    /// Event key header not recognized
    WebhookUnknownEventKey,
    /// Signature required but not supplied
    WebhookMissingSignature,
    /// Signature does not match the payload
    WebhookSignatureMismatch,
    /// Signature algorithm not supported
    WebhookUnsupportedAlgorithm,
    /// Signature header or hex digest malformed
    WebhookMalformedSignature,
    /// Verification enabled but no shared secret configured
    WebhookNoSecret,
    /// Payload body could not be parsed
    WebhookMalformedPayload,
    /// No endpoint configured for the server URL
    WebhookUnknownServer,

    // =========================================================================
    // Host Errors (E200-E299)
    // =========================================================================
    /// Requested object does not exist on the host
    HostNotFound,
    /// Credential lacks permission
    HostForbidden,
    /// Credential rejected
    HostUnauthorized,
    /// Host unreachable or returned a transient failure
    HostUnavailable,
    /// Host response could not be interpreted
    HostMalformedResponse,

    // =========================================================================
    // Discovery Errors (E300-E399)
    // =========================================================================
    /// A whole ref class could not be enumerated
    DiscoveryFetchFailed,
    /// Scanned repository does not exist
    DiscoveryRepositoryNotFound,

    // =========================================================================
    // Remote Errors (E400-E499)
    // =========================================================================
    /// No clone link for the selected protocol
    RemoteNoCloneLink,
    /// Configured mirror id not found
    RemoteMirrorNotFound,
    /// Configured mirror is disabled
    RemoteMirrorDisabled,
    /// Repository not available on the mirror
    RemoteMirrorUnavailable,

    // =========================================================================
    // Internal Errors (E500-E599)
    // =========================================================================
    /// Delayed dispatch failed
    InternalDispatchError,
    /// Webhook maintenance queue is closed
    InternalQueueClosed,
}

impl ErrorCode {
    /// Returns the numeric error code (without prefix).
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            Self::ConfigNotFound => 1,
            Self::ConfigReadError => 2,
            Self::ConfigParseError => 3,
            Self::ConfigValidationError => 4,
            Self::ConfigEnvError => 5,

            Self::WebhookMissingEventKey => 100,
            Self::WebhookUnknownEventKey => 101,
            Self::WebhookMissingSignature => 102,
            Self::WebhookSignatureMismatch => 103,
            Self::WebhookUnsupportedAlgorithm => 104,
            Self::WebhookMalformedSignature => 105,
            Self::WebhookNoSecret => 106,
            Self::WebhookMalformedPayload => 107,
            Self::WebhookUnknownServer => 108,

            Self::HostNotFound => 200,
            Self::HostForbidden => 201,
            Self::HostUnauthorized => 202,
            Self::HostUnavailable => 203,
            Self::HostMalformedResponse => 204,

            Self::DiscoveryFetchFailed => 300,
            Self::DiscoveryRepositoryNotFound => 301,

            Self::RemoteNoCloneLink => 400,
            Self::RemoteMirrorNotFound => 401,
            Self::RemoteMirrorDisabled => 402,
            Self::RemoteMirrorUnavailable => 403,

            Self::InternalDispatchError => 500,
            Self::InternalQueueClosed => 501,
        }
    }

    /// Returns the formatted error code string (e.g., "BBS-E001").
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("BBS-E{:03}", self.code_number())
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() {
            1..=99 => ErrorCategory::Config,
            100..=199 => ErrorCategory::Webhook,
            200..=299 => ErrorCategory::Host,
            300..=399 => ErrorCategory::Discovery,
            400..=499 => ErrorCategory::Remote,
            _ => ErrorCategory::Internal,
        }
    }

    /// Returns the full error entry with all metadata.
    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    /// Returns the error message template.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::ConfigNotFound => "Configuration file not found",
            Self::ConfigReadError => "Failed to read configuration file",
            Self::ConfigParseError => "Configuration file contains invalid TOML syntax",
            Self::ConfigValidationError => "Configuration contains invalid values",
            Self::ConfigEnvError => "Environment variable has invalid value",

            Self::WebhookMissingEventKey => "Webhook request has no X-Event-Key header",
            Self::WebhookUnknownEventKey => "Webhook event key is not recognized",
            Self::WebhookMissingSignature => "Webhook signature required but X-Hub-Signature is missing",
            Self::WebhookSignatureMismatch => "Webhook signature does not match the payload",
            Self::WebhookUnsupportedAlgorithm => "Webhook signature algorithm is not supported",
            Self::WebhookMalformedSignature => "Webhook signature header is malformed",
            Self::WebhookNoSecret => "Signature verification enabled but no secret configured",
            Self::WebhookMalformedPayload => "Webhook payload could not be parsed",
            Self::WebhookUnknownServer => "No endpoint is configured for the webhook server URL",

            Self::HostNotFound => "Object not found on the repository host",
            Self::HostForbidden => "Repository host denied access",
            Self::HostUnauthorized => "Repository host rejected the credential",
            Self::HostUnavailable => "Repository host is unavailable",
            Self::HostMalformedResponse => "Repository host returned an unexpected response",

            Self::DiscoveryFetchFailed => "Failed to enumerate refs during discovery",
            Self::DiscoveryRepositoryNotFound => "Scanned repository does not exist",

            Self::RemoteNoCloneLink => "No clone link for the selected protocol",
            Self::RemoteMirrorNotFound => "Configured mirror was not found",
            Self::RemoteMirrorDisabled => "Configured mirror is disabled",
            Self::RemoteMirrorUnavailable => "Repository is not available on the mirror",

            Self::InternalDispatchError => "Failed to dispatch head update",
            Self::InternalQueueClosed => "Webhook maintenance queue is closed",
        }
    }

    /// Returns remediation steps for the error.
    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::ConfigNotFound => &[
                "Create bbs.toml in the configuration directory",
                "Pass --config to point at a custom path",
            ],
            Self::ConfigReadError => &["Check file permissions on the configuration file"],
            Self::ConfigParseError => &["Check TOML syntax at the indicated line"],
            Self::ConfigValidationError => &[
                "Check hook_delay_secs is between 0 and 300",
                "Ensure every endpoint URL appears once",
                "Ensure endpoints with signature verification have a secret",
            ],
            Self::ConfigEnvError => &["Check BBS_* environment variables for typos"],

            Self::WebhookMissingEventKey | Self::WebhookUnknownEventKey => &[
                "Ensure the webhook is configured on a supported host",
                "Check the webhook events selected on the repository",
            ],
            Self::WebhookMissingSignature | Self::WebhookSignatureMismatch => &[
                "Configure the same secret on the host webhook and the endpoint",
            ],
            Self::WebhookUnsupportedAlgorithm => &["Use sha1, sha256, sha384 or sha512"],
            Self::WebhookMalformedSignature => &[
                "The X-Hub-Signature header must look like 'sha256=<hex>'",
            ],
            Self::WebhookNoSecret => &["Set 'secret' for the endpoint in bbs.toml"],
            Self::WebhookMalformedPayload => &["Check the webhook payload format on the host"],
            Self::WebhookUnknownServer => &[
                "Add an [[endpoints]] entry whose server_url matches the webhook",
            ],

            Self::HostNotFound => &["Verify the repository and ref names"],
            Self::HostForbidden | Self::HostUnauthorized => &[
                "Check the credential configured for the endpoint",
                "Ensure the credential can read the repository",
            ],
            Self::HostUnavailable => &["Retry later; the next scan will pick up the change"],
            Self::HostMalformedResponse => &["Check the host version is supported"],

            Self::DiscoveryFetchFailed => &["Retry the scan once the host is reachable"],
            Self::DiscoveryRepositoryNotFound => &["Verify owner and repository names"],

            Self::RemoteNoCloneLink => &[
                "Enable the protocol on the host, or configure a matching credential",
            ],
            Self::RemoteMirrorNotFound
            | Self::RemoteMirrorDisabled
            | Self::RemoteMirrorUnavailable => &[
                "Check mirror_id for the endpoint",
                "Ensure the mirror is enabled and synchronizes this repository",
            ],

            Self::InternalDispatchError | Self::InternalQueueClosed => {
                &["Restart the daemon and report the issue"]
            }
        }
    }

    /// Returns all error codes.
    #[must_use]
    pub const fn all() -> &'static [ErrorCode] {
        &[
            Self::ConfigNotFound,
            Self::ConfigReadError,
            Self::ConfigParseError,
            Self::ConfigValidationError,
            Self::ConfigEnvError,
            Self::WebhookMissingEventKey,
            Self::WebhookUnknownEventKey,
            Self::WebhookMissingSignature,
            Self::WebhookSignatureMismatch,
            Self::WebhookUnsupportedAlgorithm,
            Self::WebhookMalformedSignature,
            Self::WebhookNoSecret,
            Self::WebhookMalformedPayload,
            Self::WebhookUnknownServer,
            Self::HostNotFound,
            Self::HostForbidden,
            Self::HostUnauthorized,
            Self::HostUnavailable,
            Self::HostMalformedResponse,
            Self::DiscoveryFetchFailed,
            Self::DiscoveryRepositoryNotFound,
            Self::RemoteNoCloneLink,
            Self::RemoteMirrorNotFound,
            Self::RemoteMirrorDisabled,
            Self::RemoteMirrorUnavailable,
            Self::InternalDispatchError,
            Self::InternalQueueClosed,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_string(), self.message())
    }
}

/// Error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Config,
    Webhook,
    Host,
    Discovery,
    Remote,
    Internal,
}

impl ErrorCategory {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Config => "Configuration",
            Self::Webhook => "Webhook",
            Self::Host => "Host",
            Self::Discovery => "Discovery",
            Self::Remote => "Remote",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Complete error entry with all metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Error code string (e.g., "BBS-E001")
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    pub remediation: Vec<String>,
}

impl ErrorEntry {
    /// Formats the error for display with full remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n", self.code, self.message);
        if !self.remediation.is_empty() {
            output.push_str("\nRemediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }
        output
    }

    #[must_use]
    pub fn format_brief(&self) -> String {
        format!("[{}] {}", self.code, self.message)
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_brief())
    }
}
