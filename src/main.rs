use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hookci::config::DaemonConfig;
use hookci::notify::{Notifier, WebhookTransport};
use hookci::queue::BuildQueue;
use hookci::resolver::Resolver;
use hookci::server::{self, AppState, ServerConfig};
use hookci::sync::{ProjectSync, Synchronizer};
use hookci::verify::AcceptAll;
use hookci::{keys, logging};

#[derive(Parser)]
#[command(name = "hookci")]
#[command(version, about = "Webhook-driven build daemon for git repositories")]
pub struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "conf/config.json")]
    pub config: PathBuf,

    /// Directory holding the SSH keypair and project working copies
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,

    /// Directory for daemon.log
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,

    /// Script deciding whether a working copy is behind its upstream
    #[arg(long, default_value = "scripts/checkUpdate.sh")]
    pub check_script: PathBuf,

    /// Seconds a build may run before its process group is killed
    #[arg(long, default_value = "1800")]
    pub build_timeout_secs: u64,

    /// Address the webhook listener binds to
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    #[arg(short, long)]
    pub verbose: bool,
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    Ok(cwd.join(path))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Validate before touching the filesystem so a bad config leaves no trace.
    let config = DaemonConfig::load(&cli.config)
        .with_context(|| format!("Invalid configuration in {}", cli.config.display()))?;

    let _log_guard = logging::init(&cli.log_dir, cli.verbose)?;
    tracing::info!(
        projects = config.projects.len(),
        port = config.port,
        "configuration loaded from {}",
        cli.config.display()
    );

    std::fs::create_dir_all(&cli.data_dir)
        .with_context(|| format!("Failed to create data directory {}", cli.data_dir.display()))?;
    let data_dir = cli
        .data_dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", cli.data_dir.display()))?;
    // The check script runs inside each working copy.
    let check_script = absolute(&cli.check_script)?;

    let ssh_key = keys::ensure_keypair(&data_dir).await;

    let queue = BuildQueue::start(Duration::from_secs(cli.build_timeout_secs));
    let notifier = Notifier::new(config.slack.clone(), Arc::new(WebhookTransport::new()));
    let sync: Arc<dyn ProjectSync> = Arc::new(Synchronizer::new(
        data_dir,
        &ssh_key,
        check_script,
        queue,
        notifier,
    ));

    let resolver = Resolver::new(config.projects.clone());
    for project in resolver.projects().cloned() {
        let sync = sync.clone();
        tokio::spawn(async move {
            sync.sync(project).await;
        });
    }

    let state = Arc::new(AppState {
        resolver,
        sync,
        verifier: Arc::new(AcceptAll),
    });
    let app = server::build_router(&config.webhook, state)?;

    tracing::info!(
        path = %config.webhook.path,
        method = %config.webhook.method,
        "webhook route mounted"
    );
    server::start_server(
        ServerConfig {
            bind: cli.bind,
            port: config.port,
        },
        app,
    )
    .await
}
