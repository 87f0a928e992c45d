//! Webhook registration maintenance.
//!
//! Registration and removal run on a single worker fed by a bounded queue,
//! so tasks execute strictly in submission order.

use bbs_common::host::WebhookRegistration;
use bbs_common::{ErrorCode, HostApi, HostError, HostVariant, RepoRef};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

const DEFAULT_CAPACITY: usize = 64;

pub const HOOK_DESCRIPTION: &str = "bbsd branch source";

/// Events subscribed on cloud and plugin-managed hooks.
const CLOUD_EVENTS: &[&str] = &[
    "repo:push",
    "pullrequest:created",
    "pullrequest:updated",
    "pullrequest:fulfilled",
    "pullrequest:rejected",
];

/// Events subscribed on native server hooks.
const SERVER_EVENTS: &[&str] = &[
    "repo:refs_changed",
    "pr:opened",
    "pr:from_ref_updated",
    "pr:modified",
    "pr:merged",
    "pr:declined",
    "pr:deleted",
    "mirror:repo_synchronized",
];

pub fn events_for(variant: HostVariant) -> Vec<String> {
    let events = match variant {
        HostVariant::Cloud => CLOUD_EVENTS,
        HostVariant::Server => SERVER_EVENTS,
    };
    events.iter().map(|e| (*e).to_string()).collect()
}

#[derive(Debug, Error)]
pub enum HookQueueError {
    #[error("webhook maintenance queue is closed")]
    Closed,

    #[error("invalid root URL '{url}': {source}")]
    InvalidRootUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("webhook maintenance failed for {repository}: {source}")]
    Host {
        repository: RepoRef,
        #[source]
        source: HostError,
    },
}

impl HookQueueError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Closed => ErrorCode::InternalQueueClosed,
            Self::InvalidRootUrl { .. } => ErrorCode::ConfigValidationError,
            Self::Host { source, .. } => source.code(),
        }
    }
}

/// Callback URL the host should deliver to: `<root>/webhook-notify?server_url=<url>`.
pub fn hook_url(root_url: &str, server_url: &str) -> Result<String, HookQueueError> {
    let invalid = |source| HookQueueError::InvalidRootUrl {
        url: root_url.to_string(),
        source,
    };
    let mut root = root_url.trim().to_string();
    if !root.ends_with('/') {
        root.push('/');
    }
    let mut url = Url::parse(&root)
        .and_then(|base| base.join("webhook-notify"))
        .map_err(invalid)?;
    url.query_pairs_mut().append_pair("server_url", server_url);
    Ok(url.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookTask {
    Register {
        server_url: String,
        repository: RepoRef,
    },
    Remove {
        server_url: String,
        repository: RepoRef,
    },
}

impl HookTask {
    fn server_url(&self) -> &str {
        match self {
            Self::Register { server_url, .. } | Self::Remove { server_url, .. } => server_url,
        }
    }

    fn repository(&self) -> &RepoRef {
        match self {
            Self::Register { repository, .. } | Self::Remove { repository, .. } => repository,
        }
    }
}

/// Handle for submitting hook maintenance tasks.
#[derive(Clone)]
pub struct HookMaintenanceQueue {
    sender: mpsc::Sender<HookTask>,
}

impl HookMaintenanceQueue {
    /// Start the worker. It stops once every queue handle is dropped.
    pub fn start(
        host: Arc<dyn HostApi>,
        root_url: impl Into<String>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let capacity = if capacity == 0 { DEFAULT_CAPACITY } else { capacity };
        let (sender, receiver) = mpsc::channel(capacity);
        let worker = HookWorker {
            host,
            root_url: root_url.into(),
        };
        let handle = tokio::spawn(worker.run(receiver));
        (Self { sender }, handle)
    }

    /// Enqueue a task, waiting for room when the queue is full.
    pub async fn submit(&self, task: HookTask) -> Result<(), HookQueueError> {
        self.sender
            .send(task)
            .await
            .map_err(|_| HookQueueError::Closed)
    }
}

struct HookWorker {
    host: Arc<dyn HostApi>,
    root_url: String,
}

impl HookWorker {
    async fn run(self, mut receiver: mpsc::Receiver<HookTask>) {
        let worker = Arc::new(self);
        while let Some(task) = receiver.recv().await {
            let job = Arc::clone(&worker);
            let repository = task.repository().clone();
            // Host calls block; the await keeps tasks strictly sequential.
            let result = tokio::task::spawn_blocking(move || job.execute(&task)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    repo = %repository,
                    code = %err.code().code_string(),
                    "Webhook maintenance failed: {}",
                    err
                ),
                Err(err) => warn!(repo = %repository, "Webhook maintenance task panicked: {}", err),
            }
        }
        debug!("Webhook maintenance queue drained");
    }

    fn execute(&self, task: &HookTask) -> Result<(), HookQueueError> {
        let url = hook_url(&self.root_url, task.server_url())?;
        let repository = task.repository();
        let host_err = |source| HookQueueError::Host {
            repository: repository.clone(),
            source,
        };
        let existing = self.host.list_webhooks(repository).map_err(host_err)?;

        match task {
            HookTask::Register { .. } => {
                let events = events_for(self.host.variant());
                match existing.iter().find(|h| h.url == url) {
                    Some(hook) if same_events(&hook.events, &events) && hook.active => {
                        debug!(repo = %repository, "Webhook already registered");
                    }
                    Some(hook) => {
                        let updated = WebhookRegistration {
                            events,
                            active: true,
                            ..hook.clone()
                        };
                        self.host
                            .update_webhook(repository, &updated)
                            .map_err(host_err)?;
                        info!(repo = %repository, "Updated webhook event set");
                    }
                    None => {
                        let hook = WebhookRegistration {
                            id: None,
                            url,
                            description: HOOK_DESCRIPTION.to_string(),
                            events,
                            active: true,
                        };
                        let registered = self
                            .host
                            .register_webhook(repository, &hook)
                            .map_err(host_err)?;
                        info!(repo = %repository, id = ?registered.id, "Registered webhook");
                    }
                }
            }
            HookTask::Remove { .. } => {
                for hook in existing.iter().filter(|h| h.url == url) {
                    let Some(id) = hook.id.as_deref() else {
                        continue;
                    };
                    self.host.remove_webhook(repository, id).map_err(host_err)?;
                    info!(repo = %repository, id, "Removed webhook");
                }
            }
        }
        Ok(())
    }
}

fn same_events(current: &[String], wanted: &[String]) -> bool {
    let mut current: Vec<&str> = current.iter().map(String::as_str).collect();
    let mut wanted: Vec<&str> = wanted.iter().map(String::as_str).collect();
    current.sort_unstable();
    wanted.sort_unstable();
    current == wanted
}

#[cfg(test)]
mod tests {
    use super::*;
    use bbs_common::SnapshotHost;
    use bbs_common::host::{Repository, RepositorySnapshot};

    const ROOT: &str = "https://ci.example.com/jenkins";

    fn repo(slug: &str) -> RepoRef {
        RepoRef::new("acme", slug)
    }

    fn host() -> Arc<SnapshotHost> {
        let snapshot = |slug: &str| {
            RepositorySnapshot::new(Repository {
                owner: "acme".into(),
                slug: slug.into(),
                private: true,
                clone_links: vec![],
                project_key: None,
                main_branch: None,
                roles: vec![],
            })
        };
        Arc::new(
            SnapshotHost::new(HostVariant::Cloud, "https://bitbucket.org")
                .with_repository(snapshot("widgets"))
                .with_repository(snapshot("gadgets")),
        )
    }

    fn register(slug: &str) -> HookTask {
        HookTask::Register {
            server_url: "https://bitbucket.org".into(),
            repository: repo(slug),
        }
    }

    async fn drain(queue: HookMaintenanceQueue, handle: JoinHandle<()>) {
        drop(queue);
        handle.await.unwrap();
    }

    #[test]
    fn test_hook_url_encodes_server_url() {
        let url = hook_url(ROOT, "https://scm.example.com:8443/bb").unwrap();
        assert_eq!(
            url,
            "https://ci.example.com/jenkins/webhook-notify?server_url=https%3A%2F%2Fscm.example.com%3A8443%2Fbb"
        );
        assert!(hook_url("not a url", "x").is_err());
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let host = host();
        let (queue, handle) = HookMaintenanceQueue::start(host.clone(), ROOT, 4);

        queue.submit(register("widgets")).await.unwrap();
        queue.submit(register("widgets")).await.unwrap();
        drain(queue, handle).await;

        let hooks = host.webhooks(&repo("widgets"));
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].events, events_for(HostVariant::Cloud));
        assert_eq!(host.webhook_log(), vec!["register:acme/widgets"]);
    }

    #[tokio::test]
    async fn test_tasks_run_in_submission_order() {
        let host = host();
        let (queue, handle) = HookMaintenanceQueue::start(host.clone(), ROOT, 1);

        queue.submit(register("widgets")).await.unwrap();
        queue.submit(register("gadgets")).await.unwrap();
        queue
            .submit(HookTask::Remove {
                server_url: "https://bitbucket.org".into(),
                repository: repo("widgets"),
            })
            .await
            .unwrap();
        drain(queue, handle).await;

        assert_eq!(
            host.webhook_log(),
            vec!["register:acme/widgets", "register:acme/gadgets", "remove:acme/widgets:1"]
        );
        assert!(host.webhooks(&repo("widgets")).is_empty());
        assert_eq!(host.webhooks(&repo("gadgets")).len(), 1);
    }

    #[tokio::test]
    async fn test_stale_event_set_is_updated() {
        let host = host();
        let url = hook_url(ROOT, "https://bitbucket.org").unwrap();
        host.register_webhook(
            &repo("widgets"),
            &WebhookRegistration {
                id: None,
                url,
                description: HOOK_DESCRIPTION.into(),
                events: vec!["repo:push".into()],
                active: true,
            },
        )
        .unwrap();

        let (queue, handle) = HookMaintenanceQueue::start(host.clone(), ROOT, 4);
        queue.submit(register("widgets")).await.unwrap();
        drain(queue, handle).await;

        let hooks = host.webhooks(&repo("widgets"));
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].events.len(), CLOUD_EVENTS.len());
        assert_eq!(
            host.webhook_log(),
            vec!["register:acme/widgets", "update:acme/widgets"]
        );
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_worker() {
        let host = host();
        let (queue, handle) = HookMaintenanceQueue::start(host.clone(), ROOT, 4);

        queue
            .submit(register("missing"))
            .await
            .unwrap();
        queue.submit(register("gadgets")).await.unwrap();
        drain(queue, handle).await;

        assert_eq!(host.webhook_log(), vec!["register:acme/gadgets"]);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(HookQueueError::Closed.code(), ErrorCode::InternalQueueClosed);
        let err = HookQueueError::Host {
            repository: repo("widgets"),
            source: HostError::Forbidden("admin required".into()),
        };
        assert_eq!(err.code(), ErrorCode::HostForbidden);
    }
}
