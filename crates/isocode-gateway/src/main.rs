//! isocode — local agent runtime server

use clap::Parser;
use isocode_core::RuntimeConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "isocode", about = "Local agentic coding assistant runtime")]
struct Args {
    /// Port to listen on (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Workspace root (defaults to the current directory)
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Path to user-config.json (defaults to <workspace>/.isocode/user-config.json)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let workspace = match args.workspace {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let config_path = args
        .config
        .unwrap_or_else(|| workspace.join(".isocode").join("user-config.json"));

    let mut config = RuntimeConfig::load(&config_path);
    if let Some(port) = args.port {
        config.port = port;
    }

    let state = isocode_gateway::build_state(config, config_path, workspace).await;
    isocode_gateway::serve(state).await
}
