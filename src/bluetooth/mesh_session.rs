//! Mesh Session
//!
//! Lifecycle of one node on the mesh: advertise, scan, connect, exchange
//! frames. A single task owns the peer registry and session state; the
//! [`MeshSession`] handle talks to it over a command channel, and radio
//! callbacks reach it over an event channel, so every mutation is
//! serialized without locks.

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};

use super::peer_registry::{ConnectionState, PeerAddress, PeerRecord, PeerRegistry, RegistryStatistics};
use super::protocol::{advertised_name, parse_advertised_name, service_uuid};
use super::transport::{AdvertiseHandle, ConnectionHandle, EventSink, ScanHandle, Transport, TransportEvent};
use crate::config::{Role, SessionConfig, DEFAULT_TRANSPORT_TIMEOUT};
use crate::error::{MeshError, Result, TransportError};
use crate::message::{
    EventReceiver, EventSender, GeoPoint, MeshCodec, MeshEvent, MeshMessage, MessageKind, RoleDispatcher,
};

/// Pending commands from session handles
const COMMAND_QUEUE_SIZE: usize = 1000;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
}

/// Counters kept for observability; per-message failures end up here
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub malformed_frames: u64,
    pub undeliverable: u64,
    pub discoveries: u64,
    pub connection_failures: u64,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub node_id: String,
    pub role: Option<Role>,
    pub visible_name: Option<String>,
    pub advertising: bool,
    pub scanning: bool,
    pub links: usize,
    pub peers: RegistryStatistics,
    pub stats: SessionStats,
}

enum Command {
    Start {
        config: SessionConfig,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop(oneshot::Sender<Result<()>>),
    Send {
        message: MeshMessage,
        target: Option<PeerAddress>,
        reply: oneshot::Sender<Result<usize>>,
    },
    State(oneshot::Sender<SessionState>),
    Peers(oneshot::Sender<Vec<PeerRecord>>),
    Locations(oneshot::Sender<Vec<(PeerAddress, GeoPoint)>>),
    Status(oneshot::Sender<SessionStatus>),
}

/// Result of a connection attempt made off the session task
struct ConnectOutcome {
    epoch: u64,
    address: PeerAddress,
    result: Result<ConnectionHandle>,
}

/// A live link to a peer
#[derive(Debug, Clone)]
struct Link {
    address: PeerAddress,
    connection: ConnectionHandle,
}

/// Stable identifier of a node, used as sender id on everything it sends
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity(String);

impl NodeIdentity {
    /// 16 hex chars from 8 random bytes
    pub fn generate() -> Self {
        Self(hex::encode(rand::random::<[u8; 8]>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for NodeIdentity {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle to a running mesh session
///
/// Cheap to clone. When the last handle is dropped the session stops and
/// its task exits.
#[derive(Clone)]
pub struct MeshSession {
    commands: mpsc::Sender<Command>,
    identity: NodeIdentity,
}

impl MeshSession {
    /// Create an idle session over `transport` with a random node id.
    /// Must be called from within a Tokio runtime.
    pub fn new(transport: Arc<dyn Transport>) -> (Self, EventReceiver) {
        Self::with_identity(transport, NodeIdentity::generate())
    }

    /// Create an idle session with a caller-chosen identity
    pub fn with_identity(transport: Arc<dyn Transport>, identity: NodeIdentity) -> (Self, EventReceiver) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let actor = SessionActor::new(identity.to_string(), transport, event_tx);
        tokio::spawn(actor.run(command_rx));

        info!("Mesh session created with node id {}", identity);
        (
            Self {
                commands: command_tx,
                identity,
            },
            event_rx,
        )
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Stable identifier of this node, used as sender id on outbound messages
    pub fn node_id(&self) -> &str {
        self.identity.as_str()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| MeshError::SessionClosed)?;
        reply_rx.await.map_err(|_| MeshError::SessionClosed)
    }

    /// Start advertising/scanning with `config`; resolves once the radio confirms
    pub async fn start(&self, config: SessionConfig) -> Result<()> {
        self.request(|reply| Command::Start { config, reply }).await?
    }

    /// Stop everything and forget all peers. Safe to call in any state.
    pub async fn stop(&self) -> Result<()> {
        self.request(Command::Stop).await?
    }

    /// Send a message along the route its kind implies.
    /// Returns the number of peers the frame was handed to.
    pub async fn send(&self, message: MeshMessage) -> Result<usize> {
        self.request(|reply| Command::Send {
            message,
            target: None,
            reply,
        })
        .await?
    }

    /// Unicast a message to one connected peer
    pub async fn send_to(&self, address: impl Into<PeerAddress>, message: MeshMessage) -> Result<usize> {
        let target = Some(address.into());
        self.request(|reply| Command::Send { message, target, reply }).await?
    }

    /// Send SOS with location to the admin
    pub async fn send_sos(&self, latitude: f64, longitude: f64) -> Result<usize> {
        self.send(MeshMessage::sos(self.node_id(), latitude, longitude)).await
    }

    /// Send location update to the admin
    pub async fn send_location(&self, latitude: f64, longitude: f64) -> Result<usize> {
        self.send(MeshMessage::location(self.node_id(), latitude, longitude)).await
    }

    /// Broadcast emergency alert to every connected user
    pub async fn broadcast_alert(&self, text: impl Into<String>) -> Result<usize> {
        self.send(MeshMessage::alert(self.node_id(), text)).await
    }

    /// Broadcast general message to every connected peer
    pub async fn broadcast_message(&self, text: impl Into<String>) -> Result<usize> {
        self.send(MeshMessage::broadcast(self.node_id(), text)).await
    }

    pub async fn state(&self) -> Result<SessionState> {
        self.request(Command::State).await
    }

    /// Copy of every known peer, in discovery order
    pub async fn peers(&self) -> Result<Vec<PeerRecord>> {
        self.request(Command::Peers).await
    }

    /// Last positions of peers heard from within the staleness window
    pub async fn locations(&self) -> Result<Vec<(PeerAddress, GeoPoint)>> {
        self.request(Command::Locations).await
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        self.request(Command::Status).await
    }
}

/// The task that owns all session state
struct SessionActor {
    node_id: String,
    transport: Arc<dyn Transport>,
    state: SessionState,
    config: Option<SessionConfig>,
    local_address: Option<PeerAddress>,
    registry: PeerRegistry,
    links: Vec<Link>,
    advertise_handle: Option<AdvertiseHandle>,
    scan_handle: Option<ScanHandle>,
    // Bumped on every start/stop so late connect results can be recognized
    epoch: u64,
    stats: SessionStats,
    events: EventSender,
    transport_tx: EventSink,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    connect_tx: mpsc::UnboundedSender<ConnectOutcome>,
    connect_rx: mpsc::UnboundedReceiver<ConnectOutcome>,
}

impl SessionActor {
    fn new(node_id: String, transport: Arc<dyn Transport>, events: EventSender) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();

        Self {
            node_id,
            transport,
            state: SessionState::Idle,
            config: None,
            local_address: None,
            registry: PeerRegistry::new(),
            links: Vec::new(),
            advertise_handle: None,
            scan_handle: None,
            epoch: 0,
            stats: SessionStats::default(),
            events,
            transport_tx,
            transport_rx,
            connect_tx,
            connect_rx,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            // Radio events first, so a command always observes every event queued before it
            tokio::select! {
                biased;

                Some(event) = self.transport_rx.recv() => self.handle_transport_event(event).await,
                Some(outcome) = self.connect_rx.recv() => self.handle_connect_outcome(outcome).await,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
            }
        }

        if self.state != SessionState::Idle {
            if let Err(e) = self.stop().await {
                warn!("Error stopping abandoned mesh session: {}", e);
            }
        }
        debug!("Mesh session task for {} exited", self.node_id);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { config, reply } => {
                let _ = reply.send(self.start(config).await);
            }
            Command::Stop(reply) => {
                let _ = reply.send(self.stop().await);
            }
            Command::Send { message, target, reply } => {
                let _ = reply.send(self.send(message, target).await);
            }
            Command::State(reply) => {
                let _ = reply.send(self.state);
            }
            Command::Peers(reply) => {
                let _ = reply.send(self.registry.snapshot());
            }
            Command::Locations(reply) => {
                let window = self
                    .config
                    .as_ref()
                    .map(|config| config.staleness_window)
                    .unwrap_or_default();
                let _ = reply.send(self.registry.fresh_locations(Utc::now(), window));
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            node_id: self.node_id.clone(),
            role: self.config.as_ref().map(|config| config.role),
            visible_name: self.config.as_ref().map(|config| config.visible_name.clone()),
            advertising: self.advertise_handle.is_some(),
            scanning: self.scan_handle.is_some(),
            links: self.links.len(),
            peers: self.registry.statistics(),
            stats: self.stats,
        }
    }

    async fn start(&mut self, mut config: SessionConfig) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(MeshError::AlreadyStarted(self.state));
        }

        info!("Starting mesh session as {} (node {})", config.role, self.node_id);
        self.state = SessionState::Starting;

        if !self.transport.is_available().await {
            error!("Bluetooth not available or disabled");
            self.state = SessionState::Idle;
            return Err(MeshError::TransportUnavailable(
                "radio absent or disabled".to_string(),
            ));
        }

        // Clean slate: nothing from an earlier session may leak in
        self.local_address = self.transport.local_address();
        self.registry.clear();
        self.links.clear();
        self.epoch += 1;
        self.drain_pending().await;

        if config.visible_name.trim().is_empty() {
            let short: String = self.node_id.chars().take(4).collect();
            config.visible_name = format!("Mesh-{}", short.to_uppercase());
        }

        let deadline = Instant::now() + config.transport_timeout;
        let timeout_ms = millis(config.transport_timeout);

        if config.advertise {
            let on_air = advertised_name(config.role, &config.visible_name);
            let advertise = self
                .transport
                .advertise(service_uuid(), &on_air, self.transport_tx.clone());
            match time::timeout_at(deadline, advertise).await {
                Ok(Ok(handle)) => {
                    debug!("Advertising as {}", config.visible_name);
                    self.advertise_handle = Some(handle);
                }
                Ok(Err(e)) => return Err(self.abort_start(start_failure(e))),
                Err(_) => {
                    return Err(self.abort_start(MeshError::TransportTimeout {
                        operation: "advertise",
                        timeout_ms,
                    }))
                }
            }
        }

        if config.scan {
            let scan = self.transport.scan(service_uuid(), self.transport_tx.clone());
            match time::timeout_at(deadline, scan).await {
                Ok(Ok(handle)) => {
                    debug!("Scanning for mesh service");
                    self.scan_handle = Some(handle);
                }
                Ok(Err(e)) => return Err(self.abort_start(start_failure(e))),
                Err(_) => {
                    return Err(self.abort_start(MeshError::TransportTimeout {
                        operation: "scan",
                        timeout_ms,
                    }))
                }
            }
        }

        info!(
            "Mesh session active: role={} name={} advertise={} scan={}",
            config.role, config.visible_name, config.advertise, config.scan
        );
        self.config = Some(config);
        self.state = SessionState::Active;
        Ok(())
    }

    /// Undo a partial start and return to idle
    fn abort_start(&mut self, err: MeshError) -> MeshError {
        warn!("Mesh session failed to start: {}", err);

        // The radio may be unresponsive; release handles without waiting on it
        let transport = Arc::clone(&self.transport);
        let advertise = self.advertise_handle.take();
        let scan = self.scan_handle.take();
        if advertise.is_some() || scan.is_some() {
            tokio::spawn(async move {
                if let Some(handle) = advertise {
                    let _ = transport.stop_advertise(handle).await;
                }
                if let Some(handle) = scan {
                    let _ = transport.stop_scan(handle).await;
                }
            });
        }

        self.epoch += 1;
        self.state = SessionState::Idle;
        err
    }

    async fn stop(&mut self) -> Result<()> {
        if self.state == SessionState::Idle {
            debug!("Mesh session already idle");
            return Ok(());
        }

        info!("Stopping mesh session");
        self.state = SessionState::Stopping;
        self.epoch += 1;
        self.drain_pending().await;

        let limit = self
            .config
            .as_ref()
            .map(|config| config.transport_timeout)
            .unwrap_or(DEFAULT_TRANSPORT_TIMEOUT);
        let transport = Arc::clone(&self.transport);
        let advertise = self.advertise_handle.take();
        let scan = self.scan_handle.take();
        let links: Vec<Link> = self.links.drain(..).collect();

        let teardown = async move {
            if let Some(handle) = advertise {
                if let Err(e) = transport.stop_advertise(handle).await {
                    warn!("Failed to stop advertising: {}", e);
                }
            }
            if let Some(handle) = scan {
                if let Err(e) = transport.stop_scan(handle).await {
                    warn!("Failed to stop scanning: {}", e);
                }
            }
            for link in links {
                if let Err(e) = transport.close(link.connection).await {
                    warn!("Failed to disconnect from {}: {}", link.address, e);
                }
            }
        };

        let result = match time::timeout(limit, teardown).await {
            Ok(()) => Ok(()),
            Err(_) => Err(MeshError::TransportTimeout {
                operation: "stop",
                timeout_ms: millis(limit),
            }),
        };

        self.registry.clear();
        self.config = None;
        self.state = SessionState::Idle;

        info!("Mesh session stopped");
        result
    }

    /// Discard queued radio events and release links from late connect attempts
    async fn drain_pending(&mut self) {
        let mut discarded = 0usize;
        while self.transport_rx.try_recv().is_ok() {
            discarded += 1;
        }
        while let Ok(outcome) = self.connect_rx.try_recv() {
            if let Ok(connection) = outcome.result {
                let _ = self.transport.close(connection).await;
            }
        }
        if discarded > 0 {
            debug!("Discarded {} queued transport events", discarded);
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.state != SessionState::Active {
            debug!("Dropping transport event while {:?}: {:?}", self.state, event);
            if let TransportEvent::IncomingConnection { connection, .. } = event {
                let _ = self.transport.close(connection).await;
            }
            return;
        }

        match event {
            TransportEvent::Discovered { address, name } => {
                self.handle_discovery(address, name);
            }
            TransportEvent::IncomingConnection { address, connection } => {
                self.handle_incoming_connection(address, connection).await;
            }
            TransportEvent::Received { connection, bytes } => {
                self.handle_frame(connection, &bytes);
            }
            TransportEvent::Disconnected { connection } => {
                self.handle_disconnection(connection);
            }
        }
    }

    fn handle_discovery(&mut self, address: PeerAddress, name: Option<String>) {
        // Never track or dial our own advertisement
        if self.local_address.as_deref() == Some(address.as_str()) {
            debug!("Ignoring own advertisement");
            return;
        }

        let (peer_role, display_name) = match name.as_deref() {
            Some(name) => {
                let (role, visible) = parse_advertised_name(name);
                (role, Some(visible))
            }
            None => (None, None),
        };

        let is_new = !self.registry.contains(&address);
        self.registry.upsert(&address, display_name);
        if is_new {
            self.stats.discoveries += 1;
        }
        if let Some(role) = peer_role {
            self.registry.set_role(&address, role);
        }

        let Some(config) = self.config.as_ref() else {
            return;
        };
        // Users only ever pull themselves in towards an admin
        let wanted = match config.role {
            Role::Admin => true,
            Role::User => self.registry.role_of(&address) == Some(Role::Admin),
        };
        let dialable = matches!(
            self.registry.state_of(&address),
            Some(ConnectionState::Discovered | ConnectionState::Disconnected)
        );

        if config.connect_on_discovery && wanted && dialable && !self.has_link(&address) {
            self.begin_connect(address);
        }
    }

    /// Dial a peer off the session task; the outcome comes back as a [`ConnectOutcome`]
    fn begin_connect(&mut self, address: PeerAddress) {
        let limit = self
            .config
            .as_ref()
            .map(|config| config.connect_timeout)
            .unwrap_or(DEFAULT_TRANSPORT_TIMEOUT);

        self.registry.set_connection_state(&address, ConnectionState::Connecting);
        debug!("Attempting connection to: {}", address);

        let transport = Arc::clone(&self.transport);
        let outcomes = self.connect_tx.clone();
        let epoch = self.epoch;

        tokio::spawn(async move {
            let result = match time::timeout(limit, transport.connect(&address)).await {
                Ok(result) => result.map_err(MeshError::from),
                Err(_) => Err(MeshError::TransportTimeout {
                    operation: "connect",
                    timeout_ms: millis(limit),
                }),
            };
            let _ = outcomes.send(ConnectOutcome { epoch, address, result });
        });
    }

    async fn handle_connect_outcome(&mut self, outcome: ConnectOutcome) {
        let ConnectOutcome { epoch, address, result } = outcome;

        if epoch != self.epoch || self.state != SessionState::Active {
            debug!("Discarding stale connection result for {}", address);
            if let Ok(connection) = result {
                let _ = self.transport.close(connection).await;
            }
            return;
        }

        match result {
            Ok(connection) => {
                info!("Connected to device: {}", address);
                self.attach_link(address, connection).await;
            }
            Err(e) => {
                warn!("Failed to connect to device {}: {}", address, e);
                self.stats.connection_failures += 1;
                if !self.has_link(&address) {
                    self.registry.set_connection_state(&address, ConnectionState::Disconnected);
                }
            }
        }
    }

    async fn handle_incoming_connection(&mut self, address: PeerAddress, connection: ConnectionHandle) {
        info!("Incoming connection from {}", address);
        if !self.registry.contains(&address) {
            self.stats.discoveries += 1;
        }
        self.registry.upsert(&address, None);
        self.attach_link(address, connection).await;
    }

    /// Start receiving on a fresh connection and mark the peer connected.
    /// Two nodes dialing each other end up with two links; both are kept.
    async fn attach_link(&mut self, address: PeerAddress, connection: ConnectionHandle) {
        let already_linked = self.has_link(&address);

        if let Err(e) = self.transport.on_receive(connection, self.transport_tx.clone()).await {
            warn!("Failed to subscribe to {}: {}", address, e);
            self.stats.connection_failures += 1;
            if !already_linked {
                self.registry.set_connection_state(&address, ConnectionState::Disconnected);
            }
            let _ = self.transport.close(connection).await;
            return;
        }

        self.links.push(Link {
            address: address.clone(),
            connection,
        });
        if already_linked {
            debug!("Additional link {:?} to {}", connection, address);
            return;
        }

        self.registry.set_connection_state(&address, ConnectionState::Connected);
        let _ = self.events.send(MeshEvent::PeerConnected { address });
    }

    fn handle_frame(&mut self, connection: ConnectionHandle, bytes: &[u8]) {
        let Some(address) = self.link_address(connection) else {
            debug!("Frame on unknown connection {:?} dropped", connection);
            return;
        };

        self.stats.frames_received += 1;
        debug!("Received {} bytes from {}", bytes.len(), address);

        let message = match MeshCodec::decode(bytes, &address) {
            Ok(message) => message,
            Err(e) => {
                self.stats.malformed_frames += 1;
                warn!("Dropping frame from {}: {}", address, e);
                return;
            }
        };

        self.registry.record_message(&address);

        let Some(role) = self.config.as_ref().map(|config| config.role) else {
            return;
        };
        if role == Role::Admin {
            if let Some(point) = message.payload.position() {
                self.registry.record_location(&address, point);
            }
        }
        RoleDispatcher::dispatch(role, &message, &self.events);
    }

    fn handle_disconnection(&mut self, connection: ConnectionHandle) {
        let Some(index) = self.links.iter().position(|link| link.connection == connection) else {
            return;
        };
        let link = self.links.remove(index);
        if self.has_link(&link.address) {
            debug!("Link {:?} to {} closed, another remains", connection, link.address);
            return;
        }
        info!("Handling disconnection: {}", link.address);

        self.registry.set_connection_state(&link.address, ConnectionState::Disconnected);
        let _ = self.events.send(MeshEvent::PeerDisconnected { address: link.address });
    }

    async fn send(&mut self, message: MeshMessage, target: Option<PeerAddress>) -> Result<usize> {
        if self.state != SessionState::Active {
            return Err(MeshError::NotActive(self.state));
        }

        let kind = message.kind();
        let frame = MeshCodec::encode(&message)?;

        let recipients: Vec<Link> = match target {
            Some(_) if kind.is_broadcast_only() => return Err(MeshError::BroadcastOnly(kind)),
            Some(address) => self
                .peer_links()
                .into_iter()
                .filter(|link| link.address == address)
                .collect(),
            None if matches!(kind, MessageKind::Sos | MessageKind::Location) => {
                self.hub().into_iter().collect()
            }
            None => self.peer_links(),
        };

        if recipients.is_empty() {
            self.stats.undeliverable += 1;
            warn!("No connected peer for {:?}, message dropped", kind);
            return Err(MeshError::NotConnected);
        }

        let mut delivered = 0;
        for link in recipients {
            match self.transport.send(link.connection, &frame).await {
                Ok(()) => {
                    delivered += 1;
                    self.stats.frames_sent += 1;
                    debug!("Sent {} bytes to {}", frame.len(), link.address);
                }
                Err(e) => {
                    warn!("Failed to send message to {}: {}", link.address, e);
                    self.drop_link(link.connection).await;
                }
            }
        }

        if delivered == 0 {
            self.stats.undeliverable += 1;
            return Err(MeshError::NotConnected);
        }

        Ok(delivered)
    }

    /// Give up on a link whose writes fail
    async fn drop_link(&mut self, connection: ConnectionHandle) {
        self.handle_disconnection(connection);
        let _ = self.transport.close(connection).await;
    }

    /// Oldest link of every linked peer, in link order
    fn peer_links(&self) -> Vec<Link> {
        let mut seen: Vec<&str> = Vec::new();
        let mut links = Vec::new();
        for link in &self.links {
            if !seen.contains(&link.address.as_str()) {
                seen.push(&link.address);
                links.push(link.clone());
            }
        }
        links
    }

    /// Where reports go: the longest-linked advertised admin, else the
    /// longest-linked peer of unknown role. Never a peer known to be a user.
    fn hub(&self) -> Option<Link> {
        let links = self.peer_links();
        let admin = links
            .iter()
            .find(|link| self.registry.role_of(&link.address) == Some(Role::Admin));
        let unknown = || {
            links
                .iter()
                .find(|link| self.registry.role_of(&link.address).is_none())
        };
        admin.or_else(unknown).cloned()
    }

    fn has_link(&self, address: &str) -> bool {
        self.links.iter().any(|link| link.address == address)
    }

    fn link_address(&self, connection: ConnectionHandle) -> Option<PeerAddress> {
        self.links
            .iter()
            .find(|link| link.connection == connection)
            .map(|link| link.address.clone())
    }
}

/// Any backend failure while starting means the radio cannot be used
fn start_failure(err: TransportError) -> MeshError {
    match err {
        TransportError::Unavailable(reason) => MeshError::TransportUnavailable(reason),
        other => MeshError::TransportUnavailable(other.to_string()),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::memory_transport::{MemoryMedium, MemoryRadio};
    use crate::message::MeshEvent;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    async fn eventually<F>(session: &MeshSession, mut check: F)
    where
        F: FnMut(&[PeerRecord]) -> bool,
    {
        for _ in 0..200 {
            let peers = session.peers().await.unwrap();
            if check(&peers) {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached; peers: {:?}", session.peers().await.unwrap());
    }

    fn connected_to(address: &'static str) -> impl FnMut(&[PeerRecord]) -> bool {
        move |peers| {
            peers
                .iter()
                .any(|p| p.address == address && p.connection_state == ConnectionState::Connected)
        }
    }

    async fn admin_and_user(medium: &Arc<MemoryMedium>) -> (MeshSession, EventReceiver, MeshSession, EventReceiver) {
        let admin_radio = medium.radio("A");
        let user_radio = medium.radio("B");
        let (admin, admin_events) = MeshSession::new(admin_radio);
        let (user, user_events) = MeshSession::new(user_radio);

        admin.start(SessionConfig::admin("Base")).await.unwrap();
        user.start(SessionConfig::user("Field")).await.unwrap();
        eventually(&user, connected_to("A")).await;
        eventually(&admin, connected_to("B")).await;

        (admin, admin_events, user, user_events)
    }

    #[tokio::test]
    async fn start_and_stop_walk_the_lifecycle() {
        init_logging();
        let medium = MemoryMedium::new();
        let radio = medium.radio("A");
        let (session, _events) = MeshSession::new(radio.clone());

        assert_eq!(session.state().await.unwrap(), SessionState::Idle);
        session.start(SessionConfig::admin("Base")).await.unwrap();
        assert_eq!(session.state().await.unwrap(), SessionState::Active);
        assert!(radio.is_advertising() && radio.is_scanning());

        let err = session.start(SessionConfig::admin("Base")).await.unwrap_err();
        assert!(matches!(err, MeshError::AlreadyStarted(SessionState::Active)));

        session.stop().await.unwrap();
        assert_eq!(session.state().await.unwrap(), SessionState::Idle);
        assert!(!radio.is_advertising() && !radio.is_scanning());

        // Stopping twice is harmless
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn disabled_radio_fails_start() {
        init_logging();
        let medium = MemoryMedium::new();
        let radio = medium.radio("A");
        radio.set_enabled(false);
        let (session, _events) = MeshSession::new(radio);

        let err = session.start(SessionConfig::user("Field")).await.unwrap_err();
        assert!(matches!(err, MeshError::TransportUnavailable(_)));
        assert_eq!(session.state().await.unwrap(), SessionState::Idle);
    }

    #[tokio::test]
    async fn stalled_radio_times_out_and_can_retry() {
        init_logging();
        let medium = MemoryMedium::new();
        let radio = medium.radio("A");
        radio.set_stalled(true);
        let (session, _events) = MeshSession::new(radio.clone());

        let config = SessionConfig::user("Field").with_transport_timeout(Duration::from_millis(50));
        let err = session.start(config.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            MeshError::TransportTimeout { operation: "scan", .. }
        ));
        assert_eq!(session.state().await.unwrap(), SessionState::Idle);

        radio.set_stalled(false);
        session.start(config).await.unwrap();
        assert_eq!(session.state().await.unwrap(), SessionState::Active);
    }

    #[tokio::test]
    async fn own_advertisement_is_filtered() {
        init_logging();
        let medium = MemoryMedium::new();
        let radio = medium.radio("A");
        let (session, _events) = MeshSession::new(radio.clone());

        // Advertises first, then its scan reports its own advert
        session.start(SessionConfig::admin("Base")).await.unwrap();

        assert!(session.peers().await.unwrap().is_empty());
        assert_eq!(radio.connect_attempts(), 0);
        assert_eq!(session.status().await.unwrap().stats.discoveries, 0);
    }

    #[tokio::test]
    async fn broadcast_without_peers_is_not_connected() {
        init_logging();
        let medium = MemoryMedium::new();
        let radio = medium.radio("A");
        let (session, _events) = MeshSession::new(radio.clone());
        session.start(SessionConfig::admin("Base")).await.unwrap();

        let err = session.broadcast_message("hi").await.unwrap_err();
        assert!(matches!(err, MeshError::NotConnected));
        assert_eq!(radio.frames_sent(), 0);
        assert_eq!(session.status().await.unwrap().stats.undeliverable, 1);
    }

    #[tokio::test]
    async fn send_requires_active_session() {
        let medium = MemoryMedium::new();
        let (session, _events) = MeshSession::new(medium.radio("A"));

        let err = session.send_sos(1.0, 2.0).await.unwrap_err();
        assert!(matches!(err, MeshError::NotActive(SessionState::Idle)));
    }

    #[tokio::test]
    async fn user_connects_on_discovery_and_admin_sees_incoming() {
        init_logging();
        let medium = MemoryMedium::new();
        let (admin, mut admin_events, user, mut user_events) = admin_and_user(&medium).await;

        assert_eq!(
            user_events.recv().await.unwrap(),
            MeshEvent::PeerConnected { address: "A".to_string() }
        );
        assert_eq!(
            admin_events.recv().await.unwrap(),
            MeshEvent::PeerConnected { address: "B".to_string() }
        );

        let user_peers = user.peers().await.unwrap();
        assert_eq!(user_peers.len(), 1);
        assert_eq!(user_peers[0].display_name.as_deref(), Some("Base"));
        assert_eq!(admin.status().await.unwrap().links, 1);
    }

    #[tokio::test]
    async fn alert_reaches_user_and_admin_records_location() {
        init_logging();
        let medium = MemoryMedium::new();
        let (admin, mut admin_events, user, mut user_events) = admin_and_user(&medium).await;
        let _ = admin_events.recv().await;
        let _ = user_events.recv().await;

        assert_eq!(admin.broadcast_alert("Evacuate").await.unwrap(), 1);
        assert_eq!(
            user_events.recv().await.unwrap(),
            MeshEvent::Alert { text: "Evacuate".to_string() }
        );

        assert_eq!(user.send_location(40.7128, -74.0060).await.unwrap(), 1);
        assert_eq!(
            admin_events.recv().await.unwrap(),
            MeshEvent::Location {
                sender_id: "B".to_string(),
                latitude: 40.7128,
                longitude: -74.0060,
            }
        );
        assert_eq!(
            admin.locations().await.unwrap(),
            vec![("B".to_string(), GeoPoint::new(40.7128, -74.0060))]
        );
    }

    #[tokio::test]
    async fn unicast_rules() {
        init_logging();
        let medium = MemoryMedium::new();
        let (admin, _admin_events, _user, _user_events) = admin_and_user(&medium).await;

        let alert = MeshMessage::alert(admin.node_id(), "x");
        assert!(matches!(
            admin.send_to("B", alert).await,
            Err(MeshError::BroadcastOnly(MessageKind::Alert))
        ));

        let text = MeshMessage::plain_text(admin.node_id(), "direct");
        assert_eq!(admin.send_to("B", text.clone()).await.unwrap(), 1);
        assert!(matches!(admin.send_to("C", text).await, Err(MeshError::NotConnected)));
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped_without_side_effects() {
        init_logging();
        let medium = MemoryMedium::new();
        let (admin, mut admin_events) = MeshSession::new(medium.radio("A"));
        admin.start(SessionConfig::admin("Base")).await.unwrap();

        // A raw radio talking to the admin without a session
        let raw: Arc<MemoryRadio> = medium.radio("R");
        let link = raw.connect("A").await.unwrap();
        eventually(&admin, connected_to("R")).await;
        assert_eq!(
            admin_events.recv().await.unwrap(),
            MeshEvent::PeerConnected { address: "R".to_string() }
        );

        raw.send(link, b"SOS|notanumber|40.0").await.unwrap();
        let status = admin.status().await.unwrap();
        assert_eq!(status.stats.malformed_frames, 1);
        assert_eq!(status.state, SessionState::Active);
        let record = admin.peers().await.unwrap().remove(0);
        assert_eq!(record.last_location, None);
        assert_eq!(record.message_count, 0);

        // The link survives the bad frame
        raw.send(link, b"SOS|1.5|2.5").await.unwrap();
        assert_eq!(
            admin_events.recv().await.unwrap(),
            MeshEvent::Sos {
                sender_id: "R".to_string(),
                latitude: 1.5,
                longitude: 2.5,
            }
        );
        assert!(admin_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn link_loss_marks_peer_disconnected() {
        init_logging();
        let medium = MemoryMedium::new();
        let admin_radio = medium.radio("A");
        let (admin, _admin_events) = MeshSession::new(admin_radio.clone());
        let (user, mut user_events) = MeshSession::new(medium.radio("B"));
        admin.start(SessionConfig::admin("Base")).await.unwrap();
        user.start(SessionConfig::user("Field")).await.unwrap();
        eventually(&user, connected_to("A")).await;
        let _ = user_events.recv().await;

        for link in admin_radio.links() {
            admin_radio.close(link).await.unwrap();
        }

        assert_eq!(
            user_events.recv().await.unwrap(),
            MeshEvent::PeerDisconnected { address: "A".to_string() }
        );
        eventually(&user, |peers| {
            peers.iter().all(|p| p.connection_state == ConnectionState::Disconnected)
        })
        .await;
        assert!(matches!(user.send_sos(1.0, 2.0).await, Err(MeshError::NotConnected)));
    }

    #[tokio::test]
    async fn stop_clears_registry_and_restart_starts_empty() {
        init_logging();
        let medium = MemoryMedium::new();
        let (admin, _admin_events, user, _user_events) = admin_and_user(&medium).await;
        let node_id = user.node_id().to_string();

        user.stop().await.unwrap();
        assert!(user.peers().await.unwrap().is_empty());
        assert_eq!(user.status().await.unwrap().links, 0);

        // Admin keeps running; with discovery disabled the restarted user stays empty
        user.start(SessionConfig::user("Field").with_scan(false)).await.unwrap();
        assert!(user.peers().await.unwrap().is_empty());
        assert_eq!(user.node_id(), node_id);
        assert_eq!(user.status().await.unwrap().node_id, node_id);

        admin.stop().await.unwrap();
    }

    #[tokio::test]
    async fn dropping_handles_releases_the_radio() {
        init_logging();
        let medium = MemoryMedium::new();
        let radio = medium.radio("A");
        let (session, _events) = MeshSession::new(radio.clone());
        session.start(SessionConfig::admin("Base")).await.unwrap();
        assert!(radio.is_advertising());

        drop(session);
        for _ in 0..100 {
            if !radio.is_advertising() {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("radio still advertising after session handles were dropped");
    }

    #[test]
    fn node_ids_are_hex_and_distinct() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        assert_eq!(a.as_str().len(), 16);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn chosen_identity_is_used_as_sender() {
        let medium = MemoryMedium::new();
        let identity = NodeIdentity::from("0123456789abcdef".to_string());
        let (session, _events) = MeshSession::with_identity(medium.radio("A"), identity.clone());

        assert_eq!(session.identity(), &identity);
        assert_eq!(session.clone().node_id(), "0123456789abcdef");
    }

    #[tokio::test]
    async fn admin_without_peripheral_role_fails_to_start() {
        init_logging();
        let medium = MemoryMedium::new();
        let radio = medium.radio("A");
        radio.set_central_only(true);
        let (session, _events) = MeshSession::new(radio.clone());

        let err = session.start(SessionConfig::admin("Base")).await.unwrap_err();
        assert!(matches!(err, MeshError::TransportUnavailable(_)));
        let status = session.status().await.unwrap();
        assert_eq!(status.state, SessionState::Idle);
        assert!(!status.advertising);
        assert!(!radio.is_scanning());

        // A scanning-only user is fine on the same radio
        session.start(SessionConfig::user("Field")).await.unwrap();
    }

    #[tokio::test]
    async fn stop_on_stalled_radio_times_out_but_ends_idle() {
        init_logging();
        let medium = MemoryMedium::new();
        let admin_radio = medium.radio("A");
        let (admin, _admin_events) = MeshSession::new(admin_radio.clone());
        let (user, _user_events) = MeshSession::new(medium.radio("B"));

        let config = SessionConfig::admin("Base").with_transport_timeout(Duration::from_millis(50));
        admin.start(config).await.unwrap();
        user.start(SessionConfig::user("Field")).await.unwrap();
        eventually(&admin, connected_to("B")).await;

        admin_radio.set_stalled(true);
        let err = admin.stop().await.unwrap_err();
        assert!(matches!(err, MeshError::TransportTimeout { operation: "stop", .. }));
        assert_eq!(admin.state().await.unwrap(), SessionState::Idle);
        assert!(admin.peers().await.unwrap().is_empty());
        assert_eq!(admin.status().await.unwrap().links, 0);
    }

    #[tokio::test]
    async fn connect_timeout_leaves_peer_disconnected() {
        init_logging();
        let medium = MemoryMedium::new();
        let (admin, _admin_events) = MeshSession::new(medium.radio("A"));
        let user_radio = medium.radio("B");
        user_radio.set_connect_held(true);
        let (user, _user_events) = MeshSession::new(user_radio.clone());

        admin.start(SessionConfig::admin("Base")).await.unwrap();
        let config = SessionConfig::user("Field").with_connect_timeout(Duration::from_millis(50));
        user.start(config).await.unwrap();

        let peers = user.peers().await.unwrap();
        assert_eq!(peers[0].connection_state, ConnectionState::Connecting);

        eventually(&user, |peers| {
            peers.iter().any(|p| p.address == "A" && p.connection_state == ConnectionState::Disconnected)
        })
        .await;
        assert_eq!(user.status().await.unwrap().stats.connection_failures, 1);
        assert_eq!(user_radio.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn refused_connect_counts_a_failure() {
        init_logging();
        let medium = MemoryMedium::new();
        let admin_radio = medium.radio("A");
        let (admin, _admin_events) = MeshSession::new(admin_radio.clone());
        let (user, _user_events) = MeshSession::new(medium.radio("B"));

        admin.start(SessionConfig::admin("Base")).await.unwrap();
        admin_radio.set_refusing(true);
        user.start(SessionConfig::user("Field")).await.unwrap();

        eventually(&user, |peers| {
            peers.iter().any(|p| p.connection_state == ConnectionState::Disconnected)
        })
        .await;
        let status = user.status().await.unwrap();
        assert_eq!(status.stats.connection_failures, 1);
        assert_eq!(status.links, 0);
        assert!(matches!(user.send_sos(1.0, 2.0).await, Err(MeshError::NotConnected)));
    }

    #[tokio::test]
    async fn connect_finishing_after_stop_is_closed() {
        init_logging();
        let medium = MemoryMedium::new();
        let admin_radio = medium.radio("A");
        let (admin, _admin_events) = MeshSession::new(admin_radio.clone());
        let user_radio = medium.radio("B");
        user_radio.set_connect_held(true);
        let (user, _user_events) = MeshSession::new(user_radio.clone());

        admin.start(SessionConfig::admin("Base")).await.unwrap();
        user.start(SessionConfig::user("Field")).await.unwrap();
        assert_eq!(user.peers().await.unwrap()[0].connection_state, ConnectionState::Connecting);

        user.stop().await.unwrap();
        user_radio.set_connect_held(false);

        // The link reaches the admin, then the stopped user tears it down
        eventually(&admin, |peers| peers.iter().any(|p| p.address == "B")).await;
        eventually(&admin, |peers| {
            peers.iter().all(|p| p.connection_state == ConnectionState::Disconnected)
        })
        .await;
        assert_eq!(user_radio.link_count(), 0);
        assert_eq!(admin_radio.link_count(), 0);
        assert_eq!(user.state().await.unwrap(), SessionState::Idle);
        assert!(user.peers().await.unwrap().is_empty());
        assert_eq!(user.status().await.unwrap().links, 0);
    }

    #[tokio::test]
    async fn rediscovered_admin_is_redialled() {
        init_logging();
        let medium = MemoryMedium::new();
        let (admin, _admin_events, user, mut user_events) = admin_and_user(&medium).await;
        let user_radio = medium.radio("B");
        assert_eq!(
            user_events.recv().await.unwrap(),
            MeshEvent::PeerConnected { address: "A".to_string() }
        );

        admin.stop().await.unwrap();
        assert_eq!(
            user_events.recv().await.unwrap(),
            MeshEvent::PeerDisconnected { address: "A".to_string() }
        );

        admin.start(SessionConfig::admin("Base")).await.unwrap();
        assert_eq!(
            user_events.recv().await.unwrap(),
            MeshEvent::PeerConnected { address: "A".to_string() }
        );
        eventually(&user, connected_to("A")).await;
        assert_eq!(user_radio.connect_attempts(), 2);
        assert_eq!(user.send_sos(1.0, 2.0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn user_does_not_dial_other_users() {
        init_logging();
        let medium = MemoryMedium::new();
        let (server, _server_events) = MeshSession::new(medium.radio("U1"));
        let user_radio = medium.radio("U2");
        let (user, _user_events) = MeshSession::new(user_radio.clone());

        server.start(SessionConfig::user("Shelter").with_advertise(true)).await.unwrap();
        user.start(SessionConfig::user("Field")).await.unwrap();

        let peers = user.peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].role, Some(Role::User));
        assert_eq!(peers[0].display_name.as_deref(), Some("Shelter"));
        assert_eq!(peers[0].connection_state, ConnectionState::Discovered);
        assert_eq!(user_radio.connect_attempts(), 0);
    }
}
