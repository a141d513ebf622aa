use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use bosun_operator::{metrics, Operator, OperatorConfig};

#[derive(Parser, Debug)]
#[command(name = "bosun", version, about = "Bosun cluster add-on operator")]
struct Cli {
    /// Directory with NNN-<name> module bundles
    #[arg(long = "modules-dir")]
    modules_dir: Option<PathBuf>,

    /// Directory with global hooks
    #[arg(long = "global-hooks-dir")]
    global_hooks_dir: Option<PathBuf>,

    /// Scratch directory for hook and release files
    #[arg(long = "tmp-dir")]
    tmp_dir: Option<PathBuf>,

    /// Namespace for releases and the values configmap
    #[arg(long = "namespace")]
    namespace: Option<String>,

    /// Name of the values configmap
    #[arg(long = "configmap")]
    config_map_name: Option<String>,

    /// HTTP listen address (health, metrics, debug)
    #[arg(long = "listen")]
    listen_addr: Option<std::net::SocketAddr>,
}

fn init_tracing() {
    let env = std::env::var("BOSUN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    metrics::init_recorder();
    let cli = Cli::parse();

    let mut cfg = OperatorConfig::from_env()?;
    if let Some(v) = cli.modules_dir {
        cfg.modules_dir = v;
    }
    if let Some(v) = cli.global_hooks_dir {
        cfg.global_hooks_dir = v;
    }
    if let Some(v) = cli.tmp_dir {
        cfg.tmp_dir = v;
    }
    if let Some(v) = cli.namespace {
        cfg.namespace = v;
    }
    if let Some(v) = cli.config_map_name {
        cfg.config_map_name = v;
    }
    if let Some(v) = cli.listen_addr {
        cfg.listen_addr = v;
    }

    info!(modules_dir = %cfg.modules_dir.display(), global_hooks_dir = %cfg.global_hooks_dir.display(), "bosun starting");

    let stop = CancellationToken::new();
    let operator = Operator::new(cfg, stop.clone());
    if let Err(e) = operator.init().await {
        error!(error = %format!("{:#}", e), "operator init failed");
        return Err(e);
    }
    operator.start().await?;

    signal::ctrl_c().await?;
    info!("shutdown signal received; stopping workers and watchers");
    stop.cancel();
    // Queue workers finish their current task before exiting.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}
