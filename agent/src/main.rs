use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;

use board_agent_core::config::AgentConfig;
use board_agent_core::context::AgentContext;
use board_agent_core::{gateway, monitor};
use clap::Parser;
use tracing::{error, info};

/// Board agent daemon: watches for a supported USB-serial board, manages
/// its Lua RTOS session, and exposes both to the browser IDE over a local
/// WebSocket.
#[derive(Parser, Debug)]
#[command(name = "board-agent", version)]
struct Cli {
    /// Path to the TOML config file. Defaults to the platform config dir.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.or_else(AgentConfig::default_path);

    let config = match config_path {
        Some(path) => match AgentConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, path = %path.display(), "failed to load config");
                std::process::exit(1);
            }
        },
        None => AgentConfig::default(),
    };

    info!(bind_address = %config.bind_address, "starting board agent");

    let ctx = Arc::new(AgentContext::new(config));
    let stop = Arc::new(AtomicBool::new(false));

    let monitor_ctx = ctx.clone();
    let monitor_stop = stop.clone();
    let monitor_handle = thread::spawn(move || monitor::run(monitor_ctx, monitor_stop));

    if let Err(e) = gateway::serve(ctx, stop) {
        error!(error = %e, "control gateway exited with an error");
        std::process::exit(1);
    }

    let _ = monitor_handle.join();
}
