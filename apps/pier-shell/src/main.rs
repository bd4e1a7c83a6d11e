use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pier_shell::{rpc_host, telemetry, ws, ShellConfig};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "pier-shell", version, about = "Serve local terminals to pier clients")]
struct Cli {
    /// Address for the standalone PTY WebSocket.
    #[arg(long)]
    ws_addr: Option<SocketAddr>,

    /// Address for the NDJSON JSON-RPC terminal host.
    #[arg(long)]
    rpc_addr: Option<SocketAddr>,

    /// Shell to launch for new terminals. Defaults to $SHELL.
    #[arg(long)]
    shell: Option<String>,

    #[arg(long)]
    cols: Option<u16>,

    #[arg(long)]
    rows: Option<u16>,
}

impl Cli {
    fn apply(self, config: &mut ShellConfig) {
        if let Some(addr) = self.ws_addr {
            config.ws_addr = addr;
        }
        if let Some(addr) = self.rpc_addr {
            config.rpc_addr = addr;
        }
        if let Some(shell) = self.shell {
            config.shell = shell;
        }
        if let Some(cols) = self.cols {
            config.cols = cols;
        }
        if let Some(rows) = self.rows {
            config.rows = rows;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing("info");

    let cli = Cli::parse();
    let mut config = ShellConfig::from_env()?;
    cli.apply(&mut config);
    let config = Arc::new(config);

    let ws_listener = TcpListener::bind(config.ws_addr)
        .await
        .with_context(|| format!("bind websocket listener on {}", config.ws_addr))?;
    let rpc_listener = TcpListener::bind(config.rpc_addr)
        .await
        .with_context(|| format!("bind rpc listener on {}", config.rpc_addr))?;
    info!(
        ws_addr = %config.ws_addr,
        rpc_addr = %config.rpc_addr,
        shell = %config.shell,
        "pier-shell listening"
    );

    let router = ws::router(config.clone());
    tokio::select! {
        served = async { axum::serve(ws_listener, router).await } => {
            served.context("websocket server stopped")?;
        }
        served = rpc_host::serve(rpc_listener, config.clone()) => {
            served.context("rpc host stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }
    Ok(())
}
