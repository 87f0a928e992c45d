//! Shared library for the Bitbucket branch source daemon.
//!
//! Holds the head/revision model, the repository host boundary, discovery,
//! webhook normalization and remote resolution. The `bbsd` binary wires
//! these together behind an HTTP endpoint.

pub mod config;
pub mod discovery;
pub mod errors;
pub mod event;
pub mod head;
pub mod host;
pub mod remote;
pub mod resolver;
pub mod source;
pub mod strategy;
pub mod types;

pub use config::{BbsConfig, ConfigError, EndpointConfig};
pub use discovery::{
    CollectingObserver, DiscoveryEngine, DiscoveryError, DiscoveryOutcome, DiscoveryRequest,
    DiscoveryTraits, HeadCriteria, HeadObserver, Probe, RequestScope,
};
pub use errors::{ErrorCategory, ErrorCode, ErrorEntry};
pub use event::{
    EventNormalizer, EventType, NormalizedEvent, NormalizerSettings, PayloadError, PayloadFormat,
    RescanRequest, WebhookEvent,
};
pub use head::{CommitRevision, Head, HeadKey, HeadUpdate, PullRequestHead, Revision, UpdateKind};
pub use host::{HostApi, HostError, HostResult, SnapshotHost};
pub use remote::{BuildRemote, RemoteDescriptor, RemoteError};
pub use resolver::HeadResolver;
pub use source::{BranchSource, PullRequestMetadata, PullRequestMetadataCache};
pub use strategy::{CheckoutStrategy, ForkTrust, ForkTrustPolicy, StrategyConfig, TrustSnapshot};
pub use types::{CLOUD_SERVER_URL, HostVariant, Protocol, RepoRef};
