//! Operator entry point: start the server, drive it from stdin, stop it
//! gracefully on `exit` or CTRL+C.

use std::path::PathBuf;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use wakehub::protocol::event::EventType;
use wakehub::{ProtocolError, Result, Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "wakehub", about = "Session server for Wake-on-LAN agent fleets")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stream (TCP) listen address, e.g. 0.0.0.0:8080
    #[arg(long)]
    tcp_addr: Option<String>,

    /// Datagram (UDP) listen address, e.g. 0.0.0.0:8081
    #[arg(long)]
    udp_addr: Option<String>,

    /// Heartbeat interval in seconds
    #[arg(long)]
    heartbeat_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    config.apply_env();
    if let Some(addr) = cli.tcp_addr {
        config.tcp_addr = addr;
    }
    if let Some(addr) = cli.udp_addr {
        config.udp_addr = addr;
    }
    if let Some(secs) = cli.heartbeat_secs {
        config.heartbeat_interval = std::time::Duration::from_secs(secs);
    }

    for event_type in EventType::ALL {
        debug!(value = event_type.wire_value(), name = event_type.name(), "event type");
    }

    let server = Server::bind(config).await?;
    let handle = server.handle();

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received CTRL+C, shutting down");
            let _ = ctrl_c_tx.send(()).await;
        }
    });

    let mut server_task = tokio::spawn(server.run(shutdown_rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            result = &mut server_task => {
                return flatten(result);
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    // stdin closed (e.g. running under a supervisor):
                    // keep serving until a signal arrives
                    return flatten(server_task.await);
                };
                match line.trim() {
                    "exit" => {
                        let _ = shutdown_tx.send(()).await;
                        let result = flatten(server_task.await);
                        info!("exit");
                        return result;
                    }
                    "dump" => println!("{}", handle.dump_agent_table()?),
                    "" => {}
                    _ => println!("unknown command (try: dump, exit)"),
                }
            }
        }
    }
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|e| ProtocolError::Internal(format!("server task failed: {e}")))?
}
