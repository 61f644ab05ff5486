use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use bantam::app::App;
use bantam::config::ServerConfig;
use bantam::coordination::{CoordinationClient, MemStore};
use bantam::scm::DefaultScmFactory;
use bantam::shutdown::install_shutdown_handler;
use bantam::store::{MemDatabase, Provider};
use bantam::ws::{self, HttpState};

#[derive(Parser, Debug)]
#[command(name = "bantam")]
#[command(about = "CI control plane: schedules build jobs across a worker fleet")]
struct Args {
    /// Port for the websocket/status listener
    #[arg(long, default_value = "8090")]
    http_port: u16,

    /// Seconds to wait for a worker to acknowledge a cancel
    #[arg(long, default_value = "10")]
    cancel_timeout: u64,

    /// Name of the CI config file fetched from repositories
    #[arg(long, default_value = ".bantam.yml")]
    config_file: String,

    /// Seed repository to build, format "provider:full/name:token"
    /// Example: "github:octocat/hello-world:ghp_token"
    #[arg(long)]
    repo: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let http_addr: SocketAddr = format!("0.0.0.0:{}", args.http_port).parse()?;
    let mut config = ServerConfig::new(http_addr)
        .with_cancel_timeout(Duration::from_secs(args.cancel_timeout));
    config.config_file = args.config_file.clone();

    let shutdown = install_shutdown_handler();

    let database = MemDatabase::new();
    if let Some(spec) = &args.repo {
        let mut parts = spec.splitn(3, ':');
        let (provider, full_name, token) = (
            parts.next().unwrap_or_default(),
            parts.next().unwrap_or_default(),
            parts.next().unwrap_or_default(),
        );
        let repo = database
            .insert_repo(
                1,
                full_name,
                &format!("https://github.com/{full_name}"),
                "main",
                Provider {
                    name: provider.to_string(),
                    url: String::new(),
                    access_token: token.to_string(),
                },
            )
            .await;
        tracing::info!(repo_id = repo.id, repo = %repo.full_name, "Repository seeded");
    }

    let client: Arc<dyn CoordinationClient> = Arc::new(MemStore::new());
    let app = App::new(
        config,
        client,
        database.repos(),
        database.builds(),
        database.jobs(),
        Arc::new(DefaultScmFactory),
        shutdown.clone(),
    );

    let http_state = HttpState {
        broadcaster: app.broadcaster.clone(),
        workers: app.workers.clone(),
    };
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = ws::serve(http_addr, http_state, shutdown).await {
                tracing::error!(error = %e, "UI listener failed");
            }
        });
    }

    tracing::info!(http_addr = %http_addr, "Starting bantam control plane");
    app.start().await?;

    Ok(())
}
