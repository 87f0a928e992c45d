//! Bitbucket Branch Source - Daemon
//!
//! Receives host webhooks, authenticates and normalizes them into head
//! updates, and dispatches those after a quiet period. Also runs one-off
//! discovery scans from the command line.

#![forbid(unsafe_code)]

mod dispatch;
mod events;
mod hook_queue;
mod http_api;
mod signature;
mod webhook;

use anyhow::{Context, Result, bail};
use bbs_common::config::SourceConfig;
use bbs_common::host::RepositoryRole;
use bbs_common::{
    BbsConfig, BranchSource, CLOUD_SERVER_URL, CollectingObserver, HostApi, HostVariant,
    RepoRef, RequestScope, SnapshotHost,
};
use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use dispatch::Dispatcher;
use events::EventBus;
use hook_queue::{HookMaintenanceQueue, HookTask};
use webhook::NormalizeContext;

#[derive(Parser)]
#[command(name = "bbsd")]
#[command(author, version, about = "Bitbucket branch source daemon")]
struct Cli {
    /// Path to bbs.toml (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// JSON snapshot standing in for the repository host
    #[arg(long, global = true)]
    host_snapshot: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the webhook daemon
    Serve {
        /// HTTP port (overrides general.http_port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one discovery pass and print heads as JSON lines
    ///
    /// Without --repository, every repository of the owner is scanned.
    Scan {
        #[arg(long)]
        owner: String,

        #[arg(long)]
        repository: Option<String>,

        /// Only list repositories where the credential holds this role
        #[arg(long, value_enum)]
        role: Option<RoleArg>,
    },
    /// Print the clone remote for one head as JSON
    #[command(group(ArgGroup::new("head").required(true).args(["branch", "tag", "pull_request"])))]
    Remote {
        #[arg(long)]
        owner: String,

        #[arg(long)]
        repository: String,

        #[arg(long)]
        branch: Option<String>,

        #[arg(long)]
        tag: Option<String>,

        #[arg(long)]
        pull_request: Option<u64>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum RoleArg {
    Owner,
    Admin,
    Contributor,
    Member,
}

impl From<RoleArg> for RepositoryRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Owner => Self::Owner,
            RoleArg::Admin => Self::Admin,
            RoleArg::Contributor => Self::Contributor,
            RoleArg::Member => Self::Member,
        }
    }
}

fn init_logging(verbose: bool, level: &str) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<BbsConfig> {
    let mut config = BbsConfig::load_or_default(path).context("Failed to load configuration")?;
    config
        .apply_env()
        .context("Invalid BBS_* environment override")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn load_host(path: Option<&Path>) -> Result<Arc<dyn HostApi>> {
    match path {
        Some(path) => {
            let host = SnapshotHost::load(path)
                .with_context(|| format!("Failed to load host snapshot {}", path.display()))?;
            info!(
                "Loaded {} host snapshot for {}",
                host.variant(),
                host.server_url()
            );
            Ok(Arc::new(host))
        }
        None => {
            warn!("No host snapshot given; serving against an empty cloud host");
            Ok(Arc::new(SnapshotHost::new(HostVariant::Cloud, CLOUD_SERVER_URL)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_logging(cli.verbose, &config.general.log_level);

    match cli.command {
        Command::Serve { port } => serve(config, cli.host_snapshot.as_deref(), port).await,
        Command::Scan {
            owner,
            repository,
            role,
        } => {
            let Some(snapshot) = cli.host_snapshot.as_deref() else {
                bail!("scan requires --host-snapshot");
            };
            let host = load_host(Some(snapshot))?;
            tokio::task::spawn_blocking(move || {
                let lines = scan(
                    config,
                    host.as_ref(),
                    &owner,
                    repository.as_deref(),
                    role.map(RepositoryRole::from),
                )?;
                print_lines(&lines)
            })
            .await
            .context("Scan worker failed")?
        }
        Command::Remote {
            owner,
            repository,
            branch,
            tag,
            pull_request,
        } => {
            let Some(snapshot) = cli.host_snapshot.as_deref() else {
                bail!("remote requires --host-snapshot");
            };
            let host = load_host(Some(snapshot))?;
            let scope = RequestScope {
                branches: branch.into_iter().collect(),
                tags: tag.into_iter().collect(),
                pull_requests: pull_request.into_iter().collect(),
            };
            let repo = RepoRef::new(owner, repository);
            tokio::task::spawn_blocking(move || {
                let lines = remote(config, host.as_ref(), &repo, scope)?;
                if lines.is_empty() {
                    bail!("No matching head in {repo}");
                }
                print_lines(&lines)
            })
            .await
            .context("Remote worker failed")?
        }
    }
}

async fn serve(config: BbsConfig, snapshot: Option<&Path>, port: Option<u16>) -> Result<()> {
    info!("Starting bbsd...");

    let host = load_host(snapshot)?;
    let sources = config
        .branch_sources()
        .context("Failed to build branch sources")?;
    info!("Serving {} branch sources", sources.len());
    for source in &sources {
        info!("Source: {} on {}", source.repository(), source.server_url());
    }

    let bus = EventBus::new(1024);
    let dispatcher = Dispatcher::new(Arc::new(bus.clone()), config.hook_delay());
    info!("Hook delay: {}s", dispatcher.delay().as_secs());

    let config = Arc::new(config);
    let sources = Arc::new(sources);

    let _hook_worker = match config.general.root_url.clone() {
        Some(root_url) => {
            let (queue, handle) = HookMaintenanceQueue::start(Arc::clone(&host), root_url, 64);
            for source in sources.iter() {
                let manages = config
                    .endpoint(source.server_url())
                    .is_some_and(|e| e.manage_hooks);
                let server_url = source.server_url().to_string();
                let repository = source.repository().clone();
                let task = if manages {
                    HookTask::Register {
                        server_url,
                        repository,
                    }
                } else {
                    HookTask::Remove {
                        server_url,
                        repository,
                    }
                };
                queue
                    .submit(task)
                    .await
                    .context("Failed to queue webhook maintenance")?;
            }
            Some((queue, handle))
        }
        None => {
            info!("general.root_url not set; webhook registration disabled");
            None
        }
    };

    // Log dispatched events so a bare daemon still shows what it would build.
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(line) = rx.recv().await {
            info!(target: "bbsd::events", "{}", line);
        }
    });

    let state = http_api::HttpState {
        context: NormalizeContext {
            host,
            sources,
            config: Arc::clone(&config),
        },
        dispatcher,
        version: env!("CARGO_PKG_VERSION"),
        started_at: Instant::now(),
        pid: std::process::id(),
    };

    let port = port.unwrap_or(config.general.http_port);
    let server = http_api::start_server(port, state).await;
    server
        .await
        .context("HTTP server task failed")?
        .context("HTTP server error")?;
    Ok(())
}

fn print_lines(lines: &[Value]) -> Result<()> {
    for line in lines {
        println!("{}", serde_json::to_string(line)?);
    }
    Ok(())
}

/// Build the branch source for `repo`, adding a default source when the
/// configuration does not name it.
fn branch_source(config: &mut BbsConfig, host: &dyn HostApi, repo: &RepoRef) -> Result<BranchSource> {
    let matches = |owner: &str, repository: &str| {
        owner.eq_ignore_ascii_case(&repo.owner) && repository.eq_ignore_ascii_case(&repo.repository)
    };
    if !config.sources.iter().any(|s| matches(&s.owner, &s.repository)) {
        config.sources.push(SourceConfig {
            server_url: host.server_url().to_string(),
            owner: repo.owner.clone(),
            repository: repo.repository.clone(),
            branches: None,
            tags: None,
            origin_pull_requests: None,
            fork_pull_requests: None,
            skip_public_pull_requests: None,
            origin_strategies: None,
            fork_strategies: None,
            fork_trust: None,
            team_members: None,
        });
    }

    config
        .branch_sources()
        .context("Failed to build branch sources")?
        .into_iter()
        .find(|s| matches(&s.repository().owner, &s.repository().repository))
        .context("Requested repository is not a configured source")
}

fn scan(
    mut config: BbsConfig,
    host: &dyn HostApi,
    owner: &str,
    repository: Option<&str>,
    role: Option<RepositoryRole>,
) -> Result<Vec<Value>> {
    let repositories = match repository {
        Some(repository) => vec![RepoRef::new(owner, repository)],
        None => {
            let owner = match host
                .get_team(owner)
                .with_context(|| format!("Failed to look up owner {owner}"))?
            {
                Some(team) => {
                    info!(
                        "Listing repositories of team {}",
                        team.display_name.as_deref().unwrap_or(&team.name)
                    );
                    team.name
                }
                None => owner.to_string(),
            };
            host.get_repositories(&owner, role)
                .with_context(|| format!("Failed to list repositories of {owner}"))?
                .iter()
                .map(|r| r.repo_ref())
                .collect()
        }
    };
    if repositories.is_empty() {
        warn!("No repositories to scan for {}", owner);
    }

    let mut lines = Vec::new();
    for repo in &repositories {
        let source = branch_source(&mut config, host, repo)?;
        let mut observer = CollectingObserver::new();
        let outcome = source
            .discover(host, None, &mut observer)
            .with_context(|| format!("Discovery of {repo} failed"))?;

        for (head, revision) in &observer.observed {
            lines.push(json!({
                "repository": repo.to_string(),
                "head": head,
                "revision": revision,
                "trusted_revision": source.trusted_revision(head, revision),
            }));
        }
        info!(
            "Scan of {} complete: {} considered, {} processed, {} unresolved, {} pull requests skipped",
            repo, outcome.considered, outcome.processed, outcome.unresolved, outcome.skipped_pull_requests
        );
    }
    Ok(lines)
}

/// Discover the heads named by `scope` and describe how to fetch each one.
fn remote(
    mut config: BbsConfig,
    host: &dyn HostApi,
    repo: &RepoRef,
    scope: RequestScope,
) -> Result<Vec<Value>> {
    let source = branch_source(&mut config, host, repo)?;
    let protocol = config
        .endpoint(source.server_url())
        .map(|e| e.protocol())
        .unwrap_or_default();

    let mut request = source.request().with_scope(scope);
    let mut observer = CollectingObserver::new();
    source
        .discover_with(host, &mut request, None, &mut observer)
        .with_context(|| format!("Discovery of {repo} failed"))?;

    let mut lines = Vec::new();
    for (head, revision) in &observer.observed {
        let remote = source
            .build_remote(host, protocol, head, Some(revision))
            .with_context(|| format!("No {protocol} remote for {head}"))?;
        lines.push(json!({
            "head": head,
            "revision": revision,
            "trusted": source.is_trusted(head),
            "remote": remote,
        }));
    }
    Ok(lines)
}
