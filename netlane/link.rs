//! Links: the handshake layer carrying reliable endpoints
//!
//! [`ClientLink`] pairs a [`Client`] with one [`ReliableEndpoint`];
//! [`ServerLink`] pairs a [`Server`] with one endpoint per slot. Every
//! reliable-layer packet travels as one encrypted payload. Endpoints are
//! reset whenever the underlying connection comes up or goes away, so
//! unacked reliable messages never cross connections.

use std::net::SocketAddr;

use bytes::Bytes;
use netlane_core::{EndpointTelemetry, QosType, ReceivedMessage, ReliableEndpoint};
use tracing::{debug, trace, warn};

use crate::client::{Client, ClientEvent, ClientState};
use crate::config::{ClientConfig, ServerConfig};
use crate::error::{ConnectionError, NetError, Result};
use crate::server::{DisconnectReason, Server, ServerEvent};

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientLinkEvent {
    StateChanged(ClientState),
    Connected { client_index: u32 },
    /// Left the connected state; carries the state it moved to
    Disconnected(ClientState),
    Message(ReceivedMessage),
}

pub struct ClientLink {
    client: Client,
    endpoint: ReliableEndpoint,
    link_up: bool,
    events: Vec<ClientLinkEvent>,
}

impl ClientLink {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let endpoint = ReliableEndpoint::new(config.reliable.clone(), config.channel.clone(), 0.0)?;
        Ok(Self {
            client: Client::new(config)?,
            endpoint,
            link_up: false,
            events: Vec::new(),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn endpoint(&self) -> &ReliableEndpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ClientState {
        self.client.state()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn connect(&mut self, token: &[u8], now: f64) -> Result<()> {
        self.client.connect(token, now)?;
        self.handle_client_events();
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.client.disconnect();
        self.handle_client_events();
    }

    pub fn receive(&self, from: SocketAddr, data: Bytes) -> bool {
        self.client.receive(from, data)
    }

    /// Queue an application message; fails with backpressure when the
    /// reliable queue is full.
    pub fn send(&mut self, qos: QosType, data: &[u8]) -> Result<()> {
        if !self.link_up {
            return Err(NetError::connection(ConnectionError::NotConnected));
        }
        self.endpoint.send_message(qos, data)?;
        Ok(())
    }

    pub fn tick(&mut self, now: f64) {
        self.client.tick(now);
        self.handle_client_events();
        if !self.link_up {
            return;
        }

        self.endpoint.update(now);
        if let Err(e) = self.endpoint.process_send_buffer() {
            warn!(error = %e, "reliable flush failed");
        }
        for packet in self.endpoint.drain_output() {
            if let Err(e) = self.client.send_payload(packet) {
                warn!(error = %e, "dropping reliable packet");
            }
        }
    }

    pub fn drain_output(&mut self) -> Vec<(SocketAddr, Bytes)> {
        self.client.drain_output()
    }

    pub fn drain_events(&mut self) -> Vec<ClientLinkEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn telemetry(&self) -> EndpointTelemetry {
        self.endpoint.telemetry()
    }

    fn handle_client_events(&mut self) {
        for event in self.client.drain_events() {
            match event {
                ClientEvent::StateChanged(state) => {
                    self.events.push(ClientLinkEvent::StateChanged(state));
                    if state == ClientState::Connected {
                        self.endpoint.reset();
                        self.link_up = true;
                        let client_index = self.client.client_index().unwrap_or_default();
                        self.events.push(ClientLinkEvent::Connected { client_index });
                    } else if self.link_up {
                        self.endpoint.reset();
                        self.link_up = false;
                        self.events.push(ClientLinkEvent::Disconnected(state));
                    }
                }
                ClientEvent::Payload(payload) => {
                    if let Err(e) = self.endpoint.receive_packet(payload) {
                        trace!(error = %e, "dropping reliable packet");
                    }
                }
            }
        }
        for message in self.endpoint.drain_received() {
            self.events.push(ClientLinkEvent::Message(message));
        }
    }
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLinkEvent {
    ClientConnected {
        client_index: usize,
        client_id: u64,
        address: SocketAddr,
    },
    ClientDisconnected {
        client_index: usize,
        client_id: u64,
        reason: DisconnectReason,
    },
    Message {
        client_index: usize,
        message: ReceivedMessage,
    },
}

pub struct ServerLink {
    server: Server,
    endpoints: Vec<Option<ReliableEndpoint>>,
    events: Vec<ServerLinkEvent>,
}

impl ServerLink {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let server = Server::new(config)?;
        let endpoints = (0..server.max_slots()).map(|_| None).collect();
        Ok(Self {
            server,
            endpoints,
            events: Vec::new(),
        })
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn start(&mut self, now: f64) {
        self.server.start(now);
    }

    pub fn stop(&mut self) {
        self.server.stop();
        self.handle_server_events(self.server.time());
    }

    pub fn receive(&self, from: SocketAddr, data: Bytes) -> bool {
        self.server.receive(from, data)
    }

    /// Confirmed clients with a live endpoint
    pub fn connected_clients(&self) -> Vec<usize> {
        self.endpoints
            .iter()
            .enumerate()
            .filter_map(|(index, endpoint)| endpoint.as_ref().map(|_| index))
            .collect()
    }

    pub fn send(&mut self, client_index: usize, qos: QosType, data: &[u8]) -> Result<()> {
        let endpoint = self
            .endpoints
            .get_mut(client_index)
            .and_then(Option::as_mut)
            .ok_or_else(|| NetError::connection(ConnectionError::InvalidClient))?;
        endpoint.send_message(qos, data)?;
        Ok(())
    }

    /// Queue `data` for every connected client; returns how many accepted it
    pub fn broadcast(&mut self, qos: QosType, data: &[u8]) -> usize {
        let mut accepted = 0;
        for (index, endpoint) in self.endpoints.iter_mut().enumerate() {
            let Some(endpoint) = endpoint else {
                continue;
            };
            match endpoint.send_message(qos, data) {
                Ok(()) => accepted += 1,
                Err(e) => debug!(client_index = index, error = %e, "broadcast skipped client"),
            }
        }
        accepted
    }

    pub fn disconnect_client(&mut self, client_index: usize) -> Result<()> {
        self.server.disconnect_client(client_index)?;
        self.handle_server_events(self.server.time());
        Ok(())
    }

    pub fn tick(&mut self, now: f64) {
        self.server.tick(now);
        self.handle_server_events(now);

        for (index, slot) in self.endpoints.iter_mut().enumerate() {
            let Some(endpoint) = slot else {
                continue;
            };
            endpoint.update(now);
            if let Err(e) = endpoint.process_send_buffer() {
                warn!(client_index = index, error = %e, "reliable flush failed");
            }
            for packet in endpoint.drain_output() {
                if let Err(e) = self.server.send_payload(index, packet) {
                    warn!(client_index = index, error = %e, "dropping reliable packet");
                }
            }
        }
    }

    pub fn drain_output(&mut self) -> Vec<(SocketAddr, Bytes)> {
        self.server.drain_output()
    }

    pub fn drain_events(&mut self) -> Vec<ServerLinkEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn telemetry(&self, client_index: usize) -> Option<EndpointTelemetry> {
        self.endpoints
            .get(client_index)
            .and_then(Option::as_ref)
            .map(ReliableEndpoint::telemetry)
    }

    fn handle_server_events(&mut self, now: f64) {
        for event in self.server.drain_events() {
            match event {
                ServerEvent::ClientConnected {
                    client_index,
                    client_id,
                    address,
                } => {
                    let config = self.server.config();
                    let reliable = config.reliable.clone().name(format!("{}/{client_index}", config.reliable.name));
                    match ReliableEndpoint::new(reliable, config.channel.clone(), now) {
                        Ok(endpoint) => self.endpoints[client_index] = Some(endpoint),
                        Err(e) => warn!(client_index, error = %e, "failed to create endpoint"),
                    }
                    self.events.push(ServerLinkEvent::ClientConnected {
                        client_index,
                        client_id,
                        address,
                    });
                }
                ServerEvent::ClientDisconnected {
                    client_index,
                    client_id,
                    reason,
                } => {
                    self.endpoints[client_index] = None;
                    self.events.push(ServerLinkEvent::ClientDisconnected {
                        client_index,
                        client_id,
                        reason,
                    });
                }
                ServerEvent::Payload { client_index, payload } => {
                    let Some(endpoint) = self.endpoints[client_index].as_mut() else {
                        trace!(client_index, "payload for a slot without an endpoint");
                        continue;
                    };
                    if let Err(e) = endpoint.receive_packet(payload) {
                        trace!(client_index, error = %e, "dropping reliable packet");
                    }
                }
            }
        }

        for (client_index, slot) in self.endpoints.iter_mut().enumerate() {
            if let Some(endpoint) = slot {
                for message in endpoint.drain_received() {
                    self.events.push(ServerLinkEvent::Message { client_index, message });
                }
            }
        }
    }
}
