//! `dana-sim` binary: loads persisted pump state, exposes it over a line-oriented
//! stand-in transport (hex-encoded write fragments on stdin, hex-encoded notify
//! chunks on stdout/log), and keeps `state.json` up to date as commands arrive.
//!
//! A production deployment would back [`dana_sim::Transport`] with a real BlueZ GATT
//! peripheral; this binary's [`StdioTransport`] exists so the protocol core can be
//! exercised without one, the same way the reference's Go binary could be driven over
//! a debug socket.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dana_sim::{Result, Simulator};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dana-sim", about = "RS-v1/RS-v3/Dana-I insulin pump BLE simulator")]
struct Args {
    /// Path to the persisted state file.
    #[arg(long, default_value = "state.json")]
    state_file: PathBuf,

    /// Overrides the persisted device name for this run.
    #[arg(long)]
    name: Option<String>,
}

struct StdioTransport;

impl dana_sim::Transport for StdioTransport {
    fn notify(&self, chunk: &[u8]) -> Result<()> {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "NOTIFY {}", hex::encode(chunk)).map_err(|e| dana_sim::Error::Transport(e.to_string()))?;
        stdout.flush().map_err(|e| dana_sim::Error::Transport(e.to_string()))
    }
}

fn set_device_name(name: &str) {
    info!(name, "advertised device name updated");
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    if let Some(parent) = args.state_file.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            error!(path = %parent.display(), "state file directory does not exist, cannot configure BLE stack");
            std::process::exit(1);
        }
    }

    let store = Arc::new(dana_sim::Store::load(&args.state_file));
    if let Some(name) = args.name {
        store.mutate(|s| s.name = name).await?;
    }

    let transport = Arc::new(StdioTransport);
    let simulator = Simulator::new(store, transport, Box::new(set_device_name)).await;

    // This is the one connection the process serves; a rejected initial connect
    // leaves nothing useful to do, so treat it as fatal rather than looping.
    simulator.on_connect().await?;

    info!("dana-sim ready, reading hex-encoded write fragments from stdin");
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(err) => {
                error!(error = %err, "stdin read failure");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fragment = match hex::decode(line) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(error = %err, "invalid hex on stdin, ignoring line");
                continue;
            }
        };
        if let Err(err) = simulator.on_write(&fragment).await {
            error!(error = %err, "dropping connection after write error");
            break;
        }
    }

    simulator.on_disconnect().await;
    Ok(())
}
