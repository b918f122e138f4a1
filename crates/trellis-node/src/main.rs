#![forbid(unsafe_code)]

//! Trellis node - interactive overlay peer.
//!
//! Reads commands from stdin:
//! - `/connect <peer> <host> <port>`
//! - `/msg <peer> <text>`
//! - `/broadcast <text>`
//! - `/sendfile <peer> <path>`
//! - `/peers`
//! - `/exit`

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use trellis_common::{init_tracing_with_default, NodeConfig};
use trellis_core::MessageType;
use trellis_node::{Node, NodeEvent};

#[derive(Parser, Debug)]
#[command(name = "trellis-node")]
#[command(about = "Trellis overlay node - encrypted peer-to-peer messaging and file transfer")]
struct Args {
    /// JSON config file; flags override its values
    #[arg(long, env = "TRELLIS_CONFIG")]
    config: Option<PathBuf>,

    /// This node's peer id
    #[arg(long, env = "TRELLIS_PEER_ID")]
    peer_id: Option<String>,

    /// Listen host
    #[arg(long, env = "TRELLIS_LISTEN_HOST")]
    host: Option<String>,

    /// Listen port
    #[arg(long, env = "TRELLIS_PORT")]
    port: Option<u16>,

    /// Host other peers should dial
    #[arg(long, env = "TRELLIS_ADVERTISE_HOST")]
    advertise_host: Option<String>,

    /// Where received files are written
    #[arg(long, env = "TRELLIS_DOWNLOAD_DIR")]
    download_dir: Option<PathBuf>,

    /// Static directory entry, `id=host:port`; repeatable
    #[arg(long = "peer", value_name = "ID=HOST:PORT")]
    peers: Vec<String>,

    /// Log level
    #[arg(long, env = "TRELLIS_LOG", default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };
        if let Some(peer_id) = self.peer_id {
            config.peer_id = peer_id;
        }
        if let Some(host) = self.host {
            config.listen_host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = self.advertise_host {
            config.advertise_host = Some(host);
        }
        if let Some(dir) = self.download_dir {
            config.download_dir = dir;
        }
        for entry in self.peers {
            let (id, addr) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("--peer expects id=host:port, got {entry:?}"))?;
            config.peers.insert(id.to_string(), addr.to_string());
        }
        config.validate()?;
        Ok(config)
    }
}

fn print_event(event: NodeEvent) {
    match event {
        NodeEvent::Message { from, kind, text } => match kind {
            MessageType::Group => println!("[all] {from}: {text}"),
            _ => println!("[{from}] {text}"),
        },
        NodeEvent::FileReceived { from, path } => {
            println!("* file from {from} saved to {}", path.display())
        }
        NodeEvent::FileAck { from, status } => println!("* {from} acknowledged file: {status}"),
        NodeEvent::FileFailed { from, reason } => println!("* file to {from} failed: {reason}"),
        NodeEvent::PeersChanged(peers) => println!("* peers: {}", peers.join(", ")),
    }
}

async fn run_command(node: &Node, line: &str) -> Result<bool> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(true);
    }
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    match command {
        "/connect" => {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            let [peer, host, port] = parts.as_slice() else {
                bail!("usage: /connect <peer> <host> <port>");
            };
            let port: u16 = port.parse().context("invalid port")?;
            node.connect(peer, host, port).await?;
            println!("* connected to {peer}");
        }
        "/msg" => {
            let Some((peer, text)) = rest.split_once(' ') else {
                bail!("usage: /msg <peer> <text>");
            };
            node.send_message(peer, MessageType::Private, text.trim())
                .await?;
        }
        "/broadcast" => {
            if rest.is_empty() {
                bail!("usage: /broadcast <text>");
            }
            node.send_message("all", MessageType::Group, rest).await?;
        }
        "/sendfile" => {
            let Some((peer, path)) = rest.split_once(' ') else {
                bail!("usage: /sendfile <peer> <path>");
            };
            let path = path.trim();
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read {path}"))?;
            let chunks = node.send_file(peer, Bytes::from(data)).await?;
            println!("* sent {path} to {peer} in {chunks} chunks");
        }
        "/peers" => {
            let peers = node.list_peers().await;
            if peers.is_empty() {
                println!("* no peers online");
            } else {
                println!("* online: {}", peers.join(", "));
            }
        }
        "/exit" | "/quit" => return Ok(false),
        other => bail!("unknown command {other}"),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing_with_default(&args.log_level);

    let config = args.into_config()?;
    let port = config.port;
    let node = Node::new(config)?;
    node.on_message(print_event);

    let addr = node.start(port).await?;
    info!(
        "trellis-node v{} started as {} on {} ({})",
        env!("CARGO_PKG_VERSION"),
        node.peer_id(),
        addr,
        node.fingerprint()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => match run_command(&node, &line).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => warn!("{:#}", e),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
