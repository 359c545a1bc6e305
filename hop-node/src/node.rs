//! Node runtime: one coordinator task owns the relay engine, the connection state machine
//! and every peer link. Reader tasks decode frames and enqueue events; per-peer writer tasks
//! drain bounded queues.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hop_core::{
    encode_frame, Action, CloseReason, ConnectionState, ConnectionStateMachine, DiscoveredPeer,
    Frame, FrameEncodeError, Message, PeerAddress, RelayConfig, RelayEngine,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::directory::DirectoryService;
use crate::error::NodeError;
use crate::gateway::{GatewayEvent, GatewaySync};
use crate::transport::{ConnectError, FrameReader, FrameSocket, FrameWriter, ReadError, Transport};

const COMMAND_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 1024;
const MESSAGE_BROADCAST: usize = 256;

/// Runtime knobs for one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub username: String,
    pub relay: RelayConfig,
    pub sweep_interval: Duration,
    pub write_timeout: Duration,
    pub peer_queue_depth: usize,
    pub discovery_window: Duration,
    /// Connect to every peer discovery reports.
    pub auto_connect: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig::from(&Config::default())
    }
}

impl From<&Config> for NodeConfig {
    fn from(c: &Config) -> Self {
        Self {
            username: c.username.clone(),
            relay: c.relay(),
            sweep_interval: c.sweep_interval(),
            write_timeout: c.write_timeout(),
            peer_queue_depth: c.peer_queue_depth.max(1),
            discovery_window: c.discovery_window(),
            auto_connect: c.auto_connect,
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

enum NodeCommand {
    Send {
        receiver: String,
        content: String,
        reply: oneshot::Sender<Result<Message, NodeError>>,
    },
    SendDirect {
        peer: PeerAddress,
        message: Message,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    StartDiscovery {
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    StopDiscovery,
    Connect(PeerAddress),
    SetInternetReachable(bool),
    Messages(oneshot::Sender<Vec<Message>>),
    DiscoveredPeers(oneshot::Sender<Vec<DiscoveredPeer>>),
    OpenPeers(oneshot::Sender<Vec<PeerAddress>>),
    Shutdown(oneshot::Sender<()>),
}

enum NodeEvent {
    Frame {
        peer: PeerAddress,
        link: u64,
        frame: Frame,
    },
    LinkClosed {
        peer: PeerAddress,
        link: u64,
        reason: CloseReason,
    },
    Accepted(FrameSocket),
    Connected {
        dialed: PeerAddress,
        result: Result<FrameSocket, ConnectError>,
    },
    AcceptDenied,
    Discovered(PeerAddress),
    DiscoveryFinished,
    DiscoveryFailed(ConnectError),
}

/// Handle to a running node. Cheap to clone; every clone talks to the same coordinator.
#[derive(Clone)]
pub struct NodeHandle {
    local: PeerAddress,
    commands: mpsc::Sender<NodeCommand>,
    state: watch::Receiver<ConnectionState>,
    messages: broadcast::Sender<Message>,
}

/// Start a node over `transport`. With a directory, gateway sync runs while the internet is reachable.
pub fn spawn(
    transport: Arc<dyn Transport>,
    config: NodeConfig,
    directory: Option<Arc<dyn DirectoryService>>,
) -> NodeHandle {
    let local = transport.local_address().clone();
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    let (gateway_tx, gateway_rx) = mpsc::channel(EVENT_QUEUE);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (messages_tx, _) = broadcast::channel(MESSAGE_BROADCAST);

    let accept = tokio::spawn(accept_loop(transport.clone(), events_tx.clone()));
    let gateway = directory.map(|d| GatewaySync::new(d, config.username.clone(), gateway_tx));
    let coordinator = Coordinator {
        engine: RelayEngine::with_config(local.clone(), config.username.clone(), config.relay.clone()),
        state: ConnectionStateMachine::new(),
        links: HashMap::new(),
        next_link: 0,
        transport,
        config,
        events: events_tx,
        state_tx,
        messages: messages_tx.clone(),
        discovery: None,
        accept: Some(accept),
        dials: Vec::new(),
        gateway,
    };
    tokio::spawn(coordinator.run(commands_rx, events_rx, gateway_rx));

    NodeHandle {
        local,
        commands: commands_tx,
        state: state_rx,
        messages: messages_tx,
    }
}

impl NodeHandle {
    pub fn local_address(&self) -> &PeerAddress {
        &self.local
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> NodeCommand) -> Result<T, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.map_err(|_| NodeError::Closed)?;
        rx.await.map_err(|_| NodeError::Closed)
    }

    async fn command(&self, cmd: NodeCommand) -> Result<(), NodeError> {
        self.commands.send(cmd).await.map_err(|_| NodeError::Closed)
    }

    /// Originate a message from the local user and flood it to every open peer.
    pub async fn send(&self, receiver: &str, content: &str) -> Result<Message, NodeError> {
        let receiver = receiver.to_string();
        let content = content.to_string();
        self.request(|reply| NodeCommand::Send {
            receiver,
            content,
            reply,
        })
        .await?
    }

    /// Write a bare local-delivery frame to one connected peer.
    pub async fn send_direct(&self, peer: &PeerAddress, message: Message) -> Result<(), NodeError> {
        let peer = peer.clone();
        self.request(|reply| NodeCommand::SendDirect { peer, message, reply })
            .await?
    }

    pub async fn start_discovery(&self) -> Result<(), NodeError> {
        self.request(|reply| NodeCommand::StartDiscovery { reply }).await?
    }

    pub async fn stop_discovery(&self) -> Result<(), NodeError> {
        self.command(NodeCommand::StopDiscovery).await
    }

    /// Dial `peer`. The outcome shows up in the connection state.
    pub async fn connect(&self, peer: PeerAddress) -> Result<(), NodeError> {
        self.command(NodeCommand::Connect(peer)).await
    }

    pub async fn set_internet_reachable(&self, reachable: bool) -> Result<(), NodeError> {
        self.command(NodeCommand::SetInternetReachable(reachable)).await
    }

    /// Message store contents in arrival order.
    pub async fn messages(&self) -> Result<Vec<Message>, NodeError> {
        self.request(NodeCommand::Messages).await
    }

    pub async fn discovered_peers(&self) -> Result<Vec<DiscoveredPeer>, NodeError> {
        self.request(NodeCommand::DiscoveredPeers).await
    }

    pub async fn open_peers(&self) -> Result<Vec<PeerAddress>, NodeError> {
        self.request(NodeCommand::OpenPeers).await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Every message newly written to the store, including the local user's own.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.messages.subscribe()
    }

    /// Stop discovery, close every peer link, cancel gateway sync, and wait for the coordinator.
    /// Calling it on a stopped node is a no-op.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        match self.request(NodeCommand::Shutdown).await {
            Ok(()) | Err(NodeError::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

struct PeerLink {
    id: u64,
    outbound: bool,
    queue: mpsc::Sender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl PeerLink {
    fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }

    async fn close(self) {
        self.abort();
        let _ = self.reader.await;
        let _ = self.writer.await;
    }
}

struct Coordinator {
    transport: Arc<dyn Transport>,
    config: NodeConfig,
    engine: RelayEngine,
    state: ConnectionStateMachine,
    links: HashMap<PeerAddress, PeerLink>,
    next_link: u64,
    events: mpsc::Sender<NodeEvent>,
    state_tx: watch::Sender<ConnectionState>,
    messages: broadcast::Sender<Message>,
    discovery: Option<JoinHandle<()>>,
    accept: Option<JoinHandle<()>>,
    dials: Vec<JoinHandle<()>>,
    gateway: Option<GatewaySync>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<NodeCommand>,
        mut events: mpsc::Receiver<NodeEvent>,
        mut gateway: mpsc::Receiver<GatewayEvent>,
    ) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.tick().await;
        tracing::info!("node {} started as {}", self.engine.local_address().short(), self.config.username);
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(NodeCommand::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(cmd) => self.on_command(cmd),
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(event) = events.recv() => self.on_event(event),
                Some(event) = gateway.recv() => self.on_gateway(event),
                _ = sweep.tick() => {
                    let evicted = self.engine.sweep(now_ms());
                    if evicted > 0 {
                        tracing::debug!("sweep evicted {evicted} cache entr(ies), {} left", self.engine.cache_len());
                    }
                }
            }
        }
    }

    fn on_command(&mut self, cmd: NodeCommand) {
        match cmd {
            NodeCommand::Send { receiver, content, reply } => {
                let _ = reply.send(self.send(receiver, content));
            }
            NodeCommand::SendDirect { peer, message, reply } => {
                let _ = reply.send(self.send_direct(peer, message));
            }
            NodeCommand::StartDiscovery { reply } => {
                let _ = reply.send(self.start_discovery());
            }
            NodeCommand::StopDiscovery => {
                if let Some(task) = self.discovery.take() {
                    task.abort();
                }
                let next = self.state.stop_discovery();
                self.publish(next);
            }
            NodeCommand::Connect(peer) => self.dial(peer),
            NodeCommand::SetInternetReachable(reachable) => {
                let cached = self.engine.cached_messages();
                if let Some(gw) = self.gateway.as_mut() {
                    gw.set_reachable(reachable, cached);
                }
            }
            NodeCommand::Messages(reply) => {
                let _ = reply.send(self.engine.store().messages().to_vec());
            }
            NodeCommand::DiscoveredPeers(reply) => {
                let _ = reply.send(self.state.discovered_peers());
            }
            NodeCommand::OpenPeers(reply) => {
                let _ = reply.send(self.engine.open_peers().to_vec());
            }
            NodeCommand::Shutdown(_) => {}
        }
    }

    fn send(&mut self, receiver: String, content: String) -> Result<Message, NodeError> {
        let now = now_ms();
        let message = Message::new(self.config.username.clone(), receiver, content, now);
        let action = self.engine.send(message.clone(), now);
        if matches!(action, Action::DropDuplicate) {
            return Ok(message);
        }
        if self.engine.config().record_outbound {
            let _ = self.messages.send(message.clone());
        }
        if let Action::Forward { to_peers, .. } = &action {
            tracing::debug!("send {} to {} peer(s)", message.id, to_peers.len());
        }
        self.dispatch(&action)?;
        Ok(message)
    }

    fn send_direct(&mut self, peer: PeerAddress, message: Message) -> Result<(), NodeError> {
        let bytes = encode_frame(&Frame::LocalMessage(message))?;
        let Some(link) = self.links.get(&peer) else {
            return Err(NodeError::NotConnected(peer));
        };
        if let Err(e) = link.queue.try_send(bytes) {
            self.teardown(&peer, CloseReason::Io(e.to_string()));
            return Err(NodeError::PeerQueueFull(peer));
        }
        Ok(())
    }

    fn start_discovery(&mut self) -> Result<(), NodeError> {
        let next = self.state.start_discovery()?;
        self.publish(next);
        let transport = self.transport.clone();
        let window = self.config.discovery_window;
        let events = self.events.clone();
        self.discovery = Some(tokio::spawn(async move {
            match transport.discover(window).await {
                Ok(mut found) => {
                    while let Some(peer) = found.recv().await {
                        if events.send(NodeEvent::Discovered(peer)).await.is_err() {
                            return;
                        }
                    }
                    let _ = events.send(NodeEvent::DiscoveryFinished).await;
                }
                Err(e) => {
                    let _ = events.send(NodeEvent::DiscoveryFailed(e)).await;
                }
            }
        }));
        Ok(())
    }

    fn dial(&mut self, peer: PeerAddress) {
        if &peer == self.engine.local_address() || self.links.contains_key(self.state.resolve(&peer)) {
            return;
        }
        if !self.state.on_connect_started(peer.clone()) {
            return;
        }
        tracing::debug!("dialing {}", peer.short());
        self.dials.retain(|h| !h.is_finished());
        let transport = self.transport.clone();
        let events = self.events.clone();
        self.dials.push(tokio::spawn(async move {
            let result = transport.connect(&peer).await;
            let _ = events.send(NodeEvent::Connected { dialed: peer, result }).await;
        }));
    }

    fn on_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Frame { peer, link, frame } => {
                if !self.is_current(&peer, link) {
                    return;
                }
                let action = self.engine.handle_frame(frame, Some(&peer), now_ms());
                self.apply(action);
            }
            NodeEvent::LinkClosed { peer, link, reason } => {
                if self.is_current(&peer, link) {
                    self.teardown(&peer, reason);
                }
            }
            NodeEvent::Accepted(socket) => self.attach(socket, false),
            NodeEvent::Connected { dialed, result } => match result {
                Ok(socket) => {
                    if socket.peer() != &dialed {
                        self.state.on_endpoint_resolved(&dialed, socket.peer().clone());
                    }
                    self.attach(socket, true);
                }
                Err(e) => {
                    tracing::warn!("connect {} failed: {e}", dialed.short());
                    let next = self
                        .state
                        .on_connect_failed(&dialed, e.is_permission_denied(), &e.to_string());
                    self.publish(next);
                }
            },
            NodeEvent::AcceptDenied => {
                let next = self.state.on_permission_denied();
                self.publish(next);
            }
            NodeEvent::Discovered(peer) => {
                if self.state.on_peer_discovered(peer.clone()) {
                    tracing::info!("discovered {}", peer.short());
                    if self.config.auto_connect {
                        self.dial(peer);
                    }
                }
            }
            NodeEvent::DiscoveryFinished => {
                self.discovery = None;
                let next = self.state.on_discovery_finished();
                self.publish(next);
            }
            NodeEvent::DiscoveryFailed(e) => {
                self.discovery = None;
                tracing::warn!("discovery failed: {e}");
                let next = if e.is_permission_denied() {
                    self.state.on_permission_denied()
                } else {
                    self.state.on_discovery_failed(&e.to_string())
                };
                self.publish(next);
            }
        }
    }

    fn on_gateway(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::Pending(batch) => {
                for message in batch {
                    self.on_pulled(message);
                }
            }
            GatewayEvent::Delivered(id) => {
                if self.engine.mark_delivered(&id) {
                    tracing::debug!("directory confirmed delivery of {id}");
                }
            }
        }
    }

    /// A message from the directory: run it through the relay rules, then confirm delivery when
    /// the store holds it (delivered now or earlier over the mesh).
    fn on_pulled(&mut self, message: Message) {
        let id = message.id.clone();
        if let Some(action) = self.engine.inject_from_directory(message, now_ms()) {
            self.apply(action);
        }
        let stored = self.engine.store().get(&id).map(|m| m.delivered);
        if stored == Some(false) {
            if let Some(gw) = self.gateway.as_mut() {
                gw.mark_delivered(id);
            }
        }
    }

    fn apply(&mut self, action: Action) {
        match &action {
            Action::Deliver { message, hops } => {
                tracing::info!("delivered {} from {} ({hops} hop(s))", message.id, message.sender);
                let _ = self.messages.send(message.clone());
            }
            Action::Forward { to_peers, envelope } => {
                tracing::debug!(
                    "forward {} to {} peer(s), route length {}",
                    envelope.envelope_id(),
                    to_peers.len(),
                    envelope.route.len()
                );
            }
            other => tracing::debug!("{}", other.label()),
        }
        if let Err(e) = self.dispatch(&action) {
            tracing::warn!("forward encode failed: {e}");
        }
    }

    /// Enqueue forwarded frames. A peer whose queue rejects the frame is torn down alone.
    fn dispatch(&mut self, action: &Action) -> Result<(), FrameEncodeError> {
        let frames = RelayEngine::outbound_frames(action)?;
        let mut failed = Vec::new();
        for (peer, bytes) in frames {
            let Some(link) = self.links.get(&peer) else {
                continue;
            };
            if let Err(e) = link.queue.try_send(bytes) {
                tracing::warn!("peer {}: write queue rejected frame: {e}", peer.short());
                failed.push((peer, e.to_string()));
            }
        }
        for (peer, reason) in failed {
            self.teardown(&peer, CloseReason::Io(reason));
        }
        Ok(())
    }

    fn attach(&mut self, socket: FrameSocket, outbound: bool) {
        let peer = socket.peer().clone();
        if &peer == self.engine.local_address() {
            tracing::debug!("dropping stream to self");
            return;
        }
        if let Some(existing) = self.links.get(&peer) {
            if !self.prefer_new_link(&peer, existing.outbound, outbound) {
                tracing::debug!("duplicate link to {}, keeping existing", peer.short());
                return;
            }
            if let Some(old) = self.links.remove(&peer) {
                old.abort();
            }
        }

        self.next_link += 1;
        let id = self.next_link;
        let (reader, writer) = socket.into_split();
        let (queue, rx) = mpsc::channel(self.config.peer_queue_depth);
        let link = PeerLink {
            id,
            outbound,
            queue,
            reader: tokio::spawn(read_loop(reader, peer.clone(), id, self.events.clone())),
            writer: tokio::spawn(write_loop(
                writer,
                rx,
                self.config.write_timeout,
                peer.clone(),
                id,
                self.events.clone(),
            )),
        };
        self.links.insert(peer.clone(), link);
        self.engine.on_peer_opened(peer.clone());
        tracing::info!(
            "peer {} connected ({})",
            peer.short(),
            if outbound { "outbound" } else { "inbound" }
        );
        let next = self.state.on_peer_connected(peer);
        self.publish(next);
    }

    /// Simultaneous dials leave two streams per pair; both ends keep the one the lower address opened.
    /// A second stream in the same direction never replaces the live one.
    fn prefer_new_link(&self, peer: &PeerAddress, existing_outbound: bool, new_outbound: bool) -> bool {
        if existing_outbound == new_outbound {
            return false;
        }
        let local = self.engine.local_address();
        let lower = if local < peer { local } else { peer };
        let new_initiator = if new_outbound { local } else { peer };
        new_initiator == lower
    }

    fn is_current(&self, peer: &PeerAddress, link: u64) -> bool {
        self.links.get(peer).map(|l| l.id) == Some(link)
    }

    fn teardown(&mut self, peer: &PeerAddress, reason: CloseReason) {
        let Some(link) = self.links.remove(peer) else {
            return;
        };
        link.abort();
        self.engine.on_peer_closed(peer);
        tracing::info!("peer {} closed: {reason:?}", peer.short());
        let next = self.state.on_peer_closed(peer, reason);
        self.publish(next);
    }

    fn publish(&self, next: Option<ConnectionState>) {
        if let Some(state) = next {
            tracing::info!("connection state: {state}");
            self.state_tx.send_replace(state);
        }
    }

    async fn shutdown(&mut self) {
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        tasks.extend(self.discovery.take());
        tasks.extend(self.accept.take());
        tasks.append(&mut self.dials);
        for h in tasks {
            h.abort();
            let _ = h.await;
        }
        if let Some(gw) = self.gateway.as_mut() {
            gw.shutdown().await;
        }
        let peers: Vec<PeerAddress> = self.links.keys().cloned().collect();
        for peer in peers {
            if let Some(link) = self.links.remove(&peer) {
                link.close().await;
            }
            self.engine.on_peer_closed(&peer);
            let next = self.state.on_peer_closed(&peer, CloseReason::Shutdown);
            self.publish(next);
        }
        let next = self.state.stop_discovery();
        self.publish(next);
        tracing::info!("node {} stopped", self.engine.local_address().short());
    }
}

async fn accept_loop(transport: Arc<dyn Transport>, events: mpsc::Sender<NodeEvent>) {
    loop {
        match transport.accept().await {
            Ok(socket) => {
                if events.send(NodeEvent::Accepted(socket)).await.is_err() {
                    return;
                }
            }
            Err(ConnectError::Closed) => return,
            Err(ConnectError::PermissionDenied) => {
                let _ = events.send(NodeEvent::AcceptDenied).await;
                return;
            }
            Err(e @ ConnectError::Io(_)) => {
                tracing::warn!("accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => tracing::warn!("inbound handshake failed: {e}"),
        }
    }
}

async fn read_loop(mut reader: FrameReader, peer: PeerAddress, link: u64, events: mpsc::Sender<NodeEvent>) {
    let reason = loop {
        match reader.read_frame().await {
            Ok(frame) => {
                let event = NodeEvent::Frame {
                    peer: peer.clone(),
                    link,
                    frame,
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Err(ReadError::Framing(e)) => {
                tracing::warn!("peer {}: dropped undecodable frame: {e}", peer.short());
            }
            Err(ReadError::Closed) => break CloseReason::Eof,
            Err(ReadError::Io(e)) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                break CloseReason::PermissionDenied
            }
            Err(e) => break CloseReason::Io(e.to_string()),
        }
    };
    let _ = events.send(NodeEvent::LinkClosed { peer, link, reason }).await;
}

async fn write_loop(
    mut writer: FrameWriter,
    mut queue: mpsc::Receiver<Vec<u8>>,
    timeout: Duration,
    peer: PeerAddress,
    link: u64,
    events: mpsc::Sender<NodeEvent>,
) {
    while let Some(bytes) = queue.recv().await {
        let reason = match tokio::time::timeout(timeout, writer.write_frame(&bytes)).await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => CloseReason::Io(e.to_string()),
            Err(_) => CloseReason::Io(format!("write timed out after {timeout:?}")),
        };
        let _ = events.send(NodeEvent::LinkClosed { peer, link, reason }).await;
        return;
    }
    let _ = writer.shutdown().await;
}
