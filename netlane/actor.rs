//! Tick actors: one tokio task owns a link and drives it at the configured
//! tickrate, talking to handles over channels. A spawned receive task pushes
//! datagrams into the link's bounded queue, so the state machines never see
//! the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use netlane_core::{EndpointTelemetry, QosType};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::client::ClientState;
use crate::config::{ClientConfig, ServerConfig};
use crate::datagram::DatagramQueue;
use crate::error::{ConnectionError, NetError, Result};
use crate::link::{ClientLink, ClientLinkEvent, ServerLink, ServerLinkEvent};
use crate::metrics::{LinkMetrics, MetricsSnapshot};
use crate::packet::constants::MAX_PACKET_BYTES;
use crate::transport::{Transport, TransportFactory};

const COMMAND_QUEUE_CAPACITY: usize = 64;
/// Larger than any valid packet so oversized datagrams are seen and dropped
const RECV_BUFFER_BYTES: usize = 2048;

const _: () = assert!(RECV_BUFFER_BYTES > MAX_PACKET_BYTES);

/// Wall clock in seconds since the Unix epoch
pub fn clock() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

fn closed() -> NetError {
    NetError::connection(ConnectionError::Closed)
}

// ---------------------------------------------------------------------------
// Socket plumbing shared by both actors
// ---------------------------------------------------------------------------

/// A bound transport plus the task feeding its datagrams into a queue.
struct BoundSocket<T: Transport> {
    transport: Arc<T>,
    recv_task: JoinHandle<()>,
}

impl<T: Transport> BoundSocket<T> {
    fn new(transport: T, queue: Arc<DatagramQueue>, metrics: Arc<LinkMetrics>) -> Self {
        let transport = Arc::new(transport);
        let recv_task = tokio::spawn(run_receiver(transport.clone(), queue, metrics));
        Self { transport, recv_task }
    }
}

impl<T: Transport> Drop for BoundSocket<T> {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

async fn run_receiver<T: Transport>(transport: Arc<T>, queue: Arc<DatagramQueue>, metrics: Arc<LinkMetrics>) {
    let mut buf = vec![0u8; RECV_BUFFER_BYTES];
    loop {
        match transport.recv_from(&mut buf).await {
            Ok((len, from)) => {
                metrics.record_received(len);
                if !queue.push(from, Bytes::copy_from_slice(&buf[..len])) {
                    metrics.record_datagram_dropped();
                }
            }
            Err(e) if is_transient(&e) => {
                trace!(error = %e, "transient receive error");
            }
            Err(e) => {
                warn!(error = %e, "receive failed, stopping receiver");
                break;
            }
        }
    }
}

/// ICMP port-unreachable surfaces as ConnectionReset on some platforms
fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
    )
}

/// Send all buffered output packets over the transport.
async fn flush_output<T: Transport>(output: Vec<(SocketAddr, Bytes)>, transport: Option<&T>, metrics: &LinkMetrics) {
    let Some(transport) = transport else {
        if !output.is_empty() {
            trace!(count = output.len(), "no socket bound, dropping output");
        }
        for _ in &output {
            metrics.record_send_error();
        }
        return;
    };
    for (target, packet) in output {
        match transport.send_to(&packet, target).await {
            Ok(_) => metrics.record_sent(packet.len()),
            Err(e) => {
                metrics.record_send_error();
                trace!(target = %target, error = %e, "transport send_to failed");
            }
        }
    }
}

fn interval_for(tick_seconds: f64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_secs_f64(tick_seconds));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

// ---------------------------------------------------------------------------
// Client actor
// ---------------------------------------------------------------------------

pub(crate) enum ClientCmd {
    Connect {
        token: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        qos: QosType,
        data: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    State {
        reply: oneshot::Sender<ClientState>,
    },
    Telemetry {
        reply: oneshot::Sender<EndpointTelemetry>,
    },
    Close,
}

/// Clonable handle to a client actor.
#[derive(Clone)]
pub struct ClientHandle {
    cmd_tx: mpsc::Sender<ClientCmd>,
    metrics: Arc<LinkMetrics>,
}

impl ClientHandle {
    async fn request<T>(&self, cmd: impl FnOnce(oneshot::Sender<T>) -> ClientCmd) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(cmd(reply)).await.map_err(|_| closed())?;
        rx.await.map_err(|_| closed())
    }

    /// Start connecting with a public connect token. A token the client
    /// cannot use is reported as a state change, not an error.
    pub async fn connect(&self, token: impl Into<Bytes>) -> Result<()> {
        let token = token.into();
        self.request(|reply| ClientCmd::Connect { token, reply }).await?
    }

    pub async fn send(&self, qos: QosType, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        self.request(|reply| ClientCmd::Send { qos, data, reply }).await?
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| ClientCmd::Disconnect { reply }).await
    }

    pub async fn state(&self) -> Result<ClientState> {
        self.request(|reply| ClientCmd::State { reply }).await
    }

    pub async fn telemetry(&self) -> Result<EndpointTelemetry> {
        self.request(|reply| ClientCmd::Telemetry { reply }).await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    /// Disconnect and stop the actor
    pub fn close(&self) {
        let _ = self.cmd_tx.try_send(ClientCmd::Close);
    }
}

/// Spawn a client actor on the current runtime.
///
/// A fresh transport is bound at `config.bind_address` for every server
/// endpoint the client tries.
pub fn spawn_client<F: TransportFactory>(
    config: ClientConfig,
    factory: F,
) -> Result<(ClientHandle, mpsc::Receiver<ClientLinkEvent>)> {
    let link = ClientLink::new(config.clone())?;
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(config.event_queue_capacity);
    let metrics = Arc::new(LinkMetrics::default());

    tokio::spawn(run_client_actor(ClientActor {
        link,
        factory,
        bind_address: config.bind_address,
        tick_seconds: config.tick_interval(),
        socket: None,
        generation: 0,
        event_tx,
        metrics: metrics.clone(),
    }, cmd_rx));

    Ok((ClientHandle { cmd_tx, metrics }, event_rx))
}

struct ClientActor<F: TransportFactory> {
    link: ClientLink,
    factory: F,
    bind_address: SocketAddr,
    tick_seconds: f64,
    socket: Option<BoundSocket<F::Transport>>,
    generation: u64,
    event_tx: mpsc::Sender<ClientLinkEvent>,
    metrics: Arc<LinkMetrics>,
}

impl<F: TransportFactory> ClientActor<F> {
    /// Rebind when the client moved to another server endpoint
    async fn sync_socket(&mut self) {
        let current = self.link.client().endpoint_generation();
        if current == self.generation {
            return;
        }
        self.generation = current;
        self.socket = None;

        match self.factory.bind(self.bind_address).await {
            Ok(transport) => {
                if let Ok(local) = transport.local_addr() {
                    debug!(local = %local, server = ?self.link.client().server_addr(), "client socket bound");
                }
                let queue = self.link.client().inbound_queue();
                self.socket = Some(BoundSocket::new(transport, queue, self.metrics.clone()));
            }
            Err(e) => error!(addr = %self.bind_address, error = %e, "client bind failed"),
        }
    }

    async fn flush(&mut self) {
        self.sync_socket().await;
        let output = self.link.drain_output();
        let transport = self.socket.as_ref().map(|socket| socket.transport.as_ref());
        flush_output(output, transport, &self.metrics).await;
        self.forward_events();
    }

    fn forward_events(&mut self) {
        for event in self.link.drain_events() {
            match &event {
                ClientLinkEvent::Connected { client_index } => {
                    info!(client_index, "client connected");
                    self.metrics.connection_opened();
                }
                ClientLinkEvent::Disconnected(state) => {
                    info!(state = %state, "client disconnected");
                    self.metrics.connection_closed();
                }
                ClientLinkEvent::Message(_) => self.metrics.record_message_received(),
                ClientLinkEvent::StateChanged(_) => {}
            }
            if self.event_tx.try_send(event).is_err() {
                self.metrics.record_event_dropped();
            }
        }
    }
}

async fn run_client_actor<F: TransportFactory>(mut actor: ClientActor<F>, mut cmd_rx: mpsc::Receiver<ClientCmd>) {
    let mut interval = interval_for(actor.tick_seconds);

    loop {
        tokio::select! {
            biased;

            _ = interval.tick() => {
                actor.link.tick(clock());
                actor.flush().await;
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ClientCmd::Connect { token, reply }) => {
                        let r = actor.link.connect(&token, clock());
                        actor.flush().await;
                        let _ = reply.send(r);
                    }
                    Some(ClientCmd::Send { qos, data, reply }) => {
                        let r = actor.link.send(qos, &data);
                        if r.is_ok() {
                            actor.metrics.record_message_sent();
                        }
                        let _ = reply.send(r);
                    }
                    Some(ClientCmd::Disconnect { reply }) => {
                        actor.link.disconnect();
                        actor.flush().await;
                        let _ = reply.send(());
                    }
                    Some(ClientCmd::State { reply }) => {
                        let _ = reply.send(actor.link.state());
                    }
                    Some(ClientCmd::Telemetry { reply }) => {
                        let _ = reply.send(actor.link.telemetry());
                    }
                    Some(ClientCmd::Close) | None => {
                        actor.link.disconnect();
                        actor.flush().await;
                        break;
                    }
                }
            }
        }
    }
    trace!("client actor stopped");
}

// ---------------------------------------------------------------------------
// Server actor
// ---------------------------------------------------------------------------

pub(crate) enum ServerCmd {
    Send {
        client_index: usize,
        qos: QosType,
        data: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    Broadcast {
        qos: QosType,
        data: Bytes,
        reply: oneshot::Sender<usize>,
    },
    Kick {
        client_index: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    ConnectedClients {
        reply: oneshot::Sender<Vec<usize>>,
    },
    Telemetry {
        client_index: usize,
        reply: oneshot::Sender<Option<EndpointTelemetry>>,
    },
    Close,
}

/// Clonable handle to a server actor.
#[derive(Clone)]
pub struct ServerHandle {
    cmd_tx: mpsc::Sender<ServerCmd>,
    local_addr: SocketAddr,
    metrics: Arc<LinkMetrics>,
}

impl ServerHandle {
    async fn request<T>(&self, cmd: impl FnOnce(oneshot::Sender<T>) -> ServerCmd) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(cmd(reply)).await.map_err(|_| closed())?;
        rx.await.map_err(|_| closed())
    }

    /// Address the server socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn send(&self, client_index: usize, qos: QosType, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        self.request(|reply| ServerCmd::Send {
            client_index,
            qos,
            data,
            reply,
        })
        .await?
    }

    /// Queue `data` for every connected client; returns how many accepted it
    pub async fn broadcast(&self, qos: QosType, data: impl Into<Bytes>) -> Result<usize> {
        let data = data.into();
        self.request(|reply| ServerCmd::Broadcast { qos, data, reply }).await
    }

    pub async fn disconnect_client(&self, client_index: usize) -> Result<()> {
        self.request(|reply| ServerCmd::Kick { client_index, reply }).await?
    }

    pub async fn connected_clients(&self) -> Result<Vec<usize>> {
        self.request(|reply| ServerCmd::ConnectedClients { reply }).await
    }

    pub async fn telemetry(&self, client_index: usize) -> Result<Option<EndpointTelemetry>> {
        self.request(|reply| ServerCmd::Telemetry { client_index, reply }).await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    /// Disconnect every client and stop the actor
    pub fn close(&self) {
        let _ = self.cmd_tx.try_send(ServerCmd::Close);
    }
}

/// Bind `config.bind_address`, start the server and spawn its actor.
pub async fn spawn_server<F: TransportFactory>(
    config: ServerConfig,
    factory: F,
) -> Result<(ServerHandle, mpsc::Receiver<ServerLinkEvent>)> {
    let mut link = ServerLink::new(config.clone())?;
    let transport = factory.bind(config.bind_address).await?;
    let local_addr = transport.local_addr()?;

    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(config.event_queue_capacity);
    let metrics = Arc::new(LinkMetrics::default());
    let socket = BoundSocket::new(transport, link.server().inbound_queue(), metrics.clone());

    link.start(clock());
    info!(addr = %local_addr, max_slots = config.max_slots, "server started");

    tokio::spawn(run_server_actor(ServerActor {
        link,
        socket,
        tick_seconds: config.tick_interval(),
        event_tx,
        metrics: metrics.clone(),
    }, cmd_rx));

    Ok((ServerHandle {
        cmd_tx,
        local_addr,
        metrics,
    }, event_rx))
}

struct ServerActor<T: Transport> {
    link: ServerLink,
    socket: BoundSocket<T>,
    tick_seconds: f64,
    event_tx: mpsc::Sender<ServerLinkEvent>,
    metrics: Arc<LinkMetrics>,
}

impl<T: Transport> ServerActor<T> {
    async fn flush(&mut self) {
        let output = self.link.drain_output();
        flush_output(output, Some(self.socket.transport.as_ref()), &self.metrics).await;

        for event in self.link.drain_events() {
            match &event {
                ServerLinkEvent::ClientConnected { .. } => self.metrics.connection_opened(),
                ServerLinkEvent::ClientDisconnected { .. } => self.metrics.connection_closed(),
                ServerLinkEvent::Message { .. } => self.metrics.record_message_received(),
            }
            if self.event_tx.try_send(event).is_err() {
                self.metrics.record_event_dropped();
            }
        }
    }
}

async fn run_server_actor<T: Transport>(mut actor: ServerActor<T>, mut cmd_rx: mpsc::Receiver<ServerCmd>) {
    let mut interval = interval_for(actor.tick_seconds);

    loop {
        tokio::select! {
            biased;

            _ = interval.tick() => {
                actor.link.tick(clock());
                actor.flush().await;
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ServerCmd::Send { client_index, qos, data, reply }) => {
                        let r = actor.link.send(client_index, qos, &data);
                        if r.is_ok() {
                            actor.metrics.record_message_sent();
                        }
                        let _ = reply.send(r);
                    }
                    Some(ServerCmd::Broadcast { qos, data, reply }) => {
                        let accepted = actor.link.broadcast(qos, &data);
                        for _ in 0..accepted {
                            actor.metrics.record_message_sent();
                        }
                        let _ = reply.send(accepted);
                    }
                    Some(ServerCmd::Kick { client_index, reply }) => {
                        let r = actor.link.disconnect_client(client_index);
                        actor.flush().await;
                        let _ = reply.send(r);
                    }
                    Some(ServerCmd::ConnectedClients { reply }) => {
                        let _ = reply.send(actor.link.connected_clients());
                    }
                    Some(ServerCmd::Telemetry { client_index, reply }) => {
                        let _ = reply.send(actor.link.telemetry(client_index));
                    }
                    Some(ServerCmd::Close) | None => {
                        actor.link.stop();
                        actor.flush().await;
                        break;
                    }
                }
            }
        }
    }
    info!("server actor stopped");
}
