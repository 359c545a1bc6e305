// Hop node daemon: mesh transport, relay, and gateway sync.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hop_core::PeerAddress;
use hop_node::config::{self, Backend, Config};
use hop_node::transport::{GroupTransport, SocketTransport, Transport};
use hop_node::{DirectoryService, HttpDirectory, NodeConfig, NodeHandle, ReachabilityMonitor};
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hop-node", version, about = "Hop mesh relay node")]
struct Args {
    /// Config file (default: ~/.config/hop/config.toml, then /etc/hop/config.toml).
    #[arg(long, env = "HOP_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long)]
    username: Option<String>,
    /// Local hop identifier.
    #[arg(long)]
    address: Option<String>,
    #[arg(long, value_enum)]
    backend: Option<Backend>,
    #[arg(long)]
    transport_port: Option<u16>,
    #[arg(long)]
    discovery_port: Option<u16>,
    /// Group owner endpoint host:port (group backend, member role).
    #[arg(long)]
    group_owner: Option<String>,
    #[arg(long)]
    directory_url: Option<String>,
    #[arg(long)]
    probe_url: Option<String>,
    /// Known peer as ADDRESS@HOST:PORT (socket backend); dialed at startup.
    #[arg(long = "peer")]
    peers: Vec<String>,
    /// Do not start discovery at startup.
    #[arg(long)]
    no_discovery: bool,
}

impl Args {
    fn apply(&self, c: &mut Config) {
        if let Some(v) = &self.username {
            c.username = v.clone();
        }
        if let Some(v) = &self.address {
            c.address = Some(v.clone());
        }
        if let Some(v) = self.backend {
            c.backend = v;
        }
        if let Some(v) = self.transport_port {
            c.transport_port = v;
        }
        if let Some(v) = self.discovery_port {
            c.discovery_port = v;
        }
        if let Some(v) = &self.group_owner {
            c.group_owner = Some(v.clone());
        }
        if let Some(v) = &self.directory_url {
            c.directory_url = Some(v.clone());
        }
        if let Some(v) = &self.probe_url {
            c.probe_url = Some(v.clone());
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut cfg = match &args.config {
        Some(path) => config::load_from(path)?,
        None => config::load(),
    };
    args.apply(&mut cfg);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(args, cfg))
}

async fn run(args: Args, cfg: Config) -> anyhow::Result<()> {
    let address = cfg
        .address
        .clone()
        .map(PeerAddress::new)
        .unwrap_or_else(PeerAddress::generate);
    let listen = SocketAddr::from(([0, 0, 0, 0], cfg.transport_port));

    let mut dial = Vec::new();
    let transport: Arc<dyn Transport> = match cfg.backend {
        Backend::Socket => {
            let t = SocketTransport::bind(address.clone(), listen, cfg.discovery_port)
                .await
                .with_context(|| format!("bind transport port {}", cfg.transport_port))?;
            for entry in &args.peers {
                let (peer, endpoint) = entry
                    .split_once('@')
                    .with_context(|| format!("peer {entry}: expected ADDRESS@HOST:PORT"))?;
                let endpoint: SocketAddr = endpoint.parse().with_context(|| format!("peer {entry}"))?;
                let peer = PeerAddress::new(peer);
                t.add_peer_addr(peer.clone(), endpoint).await;
                dial.push(peer);
            }
            Arc::new(t)
        }
        Backend::Group => match &cfg.group_owner {
            Some(owner) => {
                let owner: SocketAddr = owner.parse().with_context(|| format!("group owner {owner}"))?;
                Arc::new(GroupTransport::member(address.clone(), owner))
            }
            None => Arc::new(
                GroupTransport::owner(address.clone(), listen)
                    .await
                    .with_context(|| format!("bind group port {}", cfg.transport_port))?,
            ),
        },
    };

    let directory: Option<Arc<dyn DirectoryService>> = cfg
        .directory_url
        .as_ref()
        .map(|url| Arc::new(HttpDirectory::new(url.clone(), cfg.directory_poll())) as Arc<dyn DirectoryService>);
    let has_directory = directory.is_some();

    let node = hop_node::spawn(transport, NodeConfig::from(&cfg), directory);
    tracing::info!("hop-node {} as {} ({:?} backend)", address, cfg.username, cfg.backend);

    tokio::spawn(print_messages(node.clone()));
    tokio::spawn(read_stdin(node.clone()));
    match &cfg.probe_url {
        Some(url) => {
            tokio::spawn(ReachabilityMonitor::new(url.clone(), cfg.probe_interval()).run(node.clone()));
        }
        None if has_directory => node.set_internet_reachable(true).await?,
        None => {}
    }
    for peer in dial {
        node.connect(peer).await?;
    }
    if !args.no_discovery {
        if let Err(e) = node.start_discovery().await {
            tracing::warn!("discovery not started: {e}");
        }
    }

    shutdown_signal().await?;
    node.shutdown().await?;
    Ok(())
}

async fn print_messages(node: NodeHandle) {
    let mut rx = node.subscribe_messages();
    loop {
        match rx.recv().await {
            Ok(m) => println!("{} -> {}: {}", m.sender, m.receiver, m.content),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("display skipped {n} message(s)");
            }
            Err(_) => return,
        }
    }
}

/// Each stdin line is `receiver message text`.
async fn read_stdin(node: NodeHandle) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Some((receiver, text)) = line.trim().split_once(' ') else {
            eprintln!("usage: <receiver> <message>");
            continue;
        };
        if let Err(e) = node.send(receiver, text.trim()).await {
            tracing::warn!("send failed: {e}");
            if matches!(e, hop_node::NodeError::Closed) {
                return;
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix). The node is shut down cleanly afterwards.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
