//! SiteSync CLI
//!
//! `sitesync watch` runs a sync session against a server and reports what
//! arrives. `sitesync poll-once` performs a single polling request.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use sitesync::polling::PollingClient;
use sitesync::{
    paths, CollectionChange, FileToken, StaticToken, SyncConfig, SyncSession, TokenSource,
    VERSION,
};

#[derive(Parser, Debug)]
#[command(name = "sitesync", version = VERSION)]
#[command(about = "Realtime sync client for SiteSync tenants")]
struct Cli {
    /// Data directory (logs, auth-token)
    #[arg(long, env = "SITESYNC_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Auth {
    /// Bearer token. Falls back to <data-dir>/auth-token, re-read on every connect.
    #[arg(long, env = "SITESYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

impl Auth {
    fn source(&self) -> Arc<dyn TokenSource> {
        match &self.token {
            Some(token) => Arc::new(StaticToken::new(token.clone())),
            None => Arc::new(FileToken::new(paths::token_file_path())),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a sync session and print status and collection changes until Ctrl-C
    Watch {
        /// Realtime WebSocket URL
        #[arg(long, env = "SITESYNC_WS_URL")]
        ws_url: String,

        /// Polling endpoint used after the socket is given up on
        #[arg(long, env = "SITESYNC_UPDATES_URL")]
        updates_url: String,

        /// Project room to join once connected
        #[arg(long)]
        project: Option<String>,

        #[arg(long, default_value_t = 25)]
        heartbeat_secs: u64,

        #[arg(long, default_value_t = 10)]
        poll_secs: u64,

        #[arg(long, default_value_t = 10)]
        connect_timeout_secs: u64,

        #[arg(long, default_value_t = 10)]
        max_reconnect_attempts: u32,

        #[command(flatten)]
        auth: Auth,
    },

    /// Fetch one batch from the polling endpoint and print it as JSON lines
    PollOnce {
        #[arg(long, env = "SITESYNC_UPDATES_URL")]
        updates_url: String,

        #[command(flatten)]
        auth: Auth,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    paths::init_data_dir(cli.data_dir.as_deref());
    paths::ensure_dirs()?;
    let logging = sitesync::logging::init_logging(&paths::log_dir())?;

    info!(
        component = "cli",
        event = "cli.started",
        version = VERSION,
        run_id = %logging.run_id,
        data_dir = %paths::data_dir().display(),
    );

    match cli.command {
        Command::Watch {
            ws_url,
            updates_url,
            project,
            heartbeat_secs,
            poll_secs,
            connect_timeout_secs,
            max_reconnect_attempts,
            auth,
        } => {
            let config = SyncConfig {
                heartbeat_interval: Duration::from_secs(heartbeat_secs),
                poll_interval: Duration::from_secs(poll_secs),
                connect_timeout: Duration::from_secs(connect_timeout_secs),
                max_reconnect_attempts,
                ..SyncConfig::new(ws_url, updates_url)
            };
            watch(config, project, auth.source()).await
        }
        Command::PollOnce { updates_url, auth } => poll_once(updates_url, auth.source()).await,
    }
}

async fn watch(
    config: SyncConfig,
    project: Option<String>,
    tokens: Arc<dyn TokenSource>,
) -> anyhow::Result<()> {
    let session = SyncSession::websocket(&config, tokens)?;
    let mut status = session.subscribe_status();
    let mut changes = session.collections().subscribe();

    session.start().await;
    if let Some(project) = project {
        session.join_scope(project).await;
    }

    println!();
    println!("  SiteSync v{}", VERSION);
    println!("  Socket:  {}", config.ws_url);
    println!("  Polling: {}", config.updates_url);
    println!("  Ctrl-C to stop");
    println!();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = status.recv() => match next {
                Ok(snapshot) => {
                    let degraded = if snapshot.degraded { " (degraded)" } else { "" };
                    println!(
                        "  status: {}{} attempt={} scope={}",
                        snapshot.phase.as_str(),
                        degraded,
                        snapshot.attempt,
                        snapshot.scope.as_deref().unwrap_or("-"),
                    );
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            next = changes.recv() => match next {
                Ok(CollectionChange::Entity { entity_type, id, applied, .. }) => {
                    println!(
                        "  {entity_type}/{} {} ({} total)",
                        id.as_ref().map(|id| id.as_str()).unwrap_or("?"),
                        applied.as_str(),
                        session.collections().len(&entity_type),
                    );
                }
                Ok(CollectionChange::Reloaded { entity_type, count }) => {
                    println!("  {entity_type} reloaded ({count} total)");
                }
                Ok(CollectionChange::Cleared) => println!("  collections cleared"),
                Err(RecvError::Lagged(n)) => println!("  ({n} changes skipped)"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.teardown().await;
    println!("  stopped");
    Ok(())
}

async fn poll_once(updates_url: String, tokens: Arc<dyn TokenSource>) -> anyhow::Result<()> {
    let client = PollingClient::new(updates_url);
    let token = tokens.bearer_token();
    let updates = client.fetch(token.as_deref()).await?;

    for update in &updates {
        println!("{}", serde_json::to_string(update)?);
    }
    info!(
        component = "cli",
        event = "cli.poll_once.done",
        updates = updates.len(),
    );
    Ok(())
}
