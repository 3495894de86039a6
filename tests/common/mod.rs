//! Shared test helpers: one server and any number of clients wired through
//! the network simulator, driven with synthetic time.

#![allow(dead_code)]

use std::net::SocketAddr;

use bytes::Bytes;
use netlane::crypto::Key;
use netlane::{
    ClientConfig, ClientLink, ClientLinkEvent, ClientState, NetworkSimulator, ServerConfig, ServerLink,
    ServerLinkEvent, SimulatorConfig, TokenFactory, TokenRequest,
};

pub const PROTOCOL_ID: u64 = 0x1122_3344_5566_7788;
pub const PRIVATE_KEY: Key = [7u8; 32];
/// Unix time the world starts at; tokens are created at this instant
pub const START: f64 = 1_700_000_000.0;
pub const TICK: f64 = 1.0 / 60.0;

pub fn server_addr() -> SocketAddr {
    "10.0.0.1:40000".parse().unwrap()
}

/// Nothing listens here
pub fn unreachable_addr() -> SocketAddr {
    "10.0.0.99:40000".parse().unwrap()
}

pub fn client_addr(n: usize) -> SocketAddr {
    SocketAddr::from(([10, 0, 1, n as u8 + 1], 50000))
}

pub fn token_factory() -> TokenFactory {
    TokenFactory::new(PROTOCOL_ID, PRIVATE_KEY)
}

/// A 60 second token for `servers`
pub fn token(client_id: u64, servers: &[SocketAddr], timeout_seconds: i32) -> Bytes {
    token_factory()
        .generate_at(
            START as u64,
            &TokenRequest {
                client_id,
                server_addresses: servers,
                expire_seconds: 60,
                timeout_seconds,
                sequence: client_id,
                user_data: &[],
            },
        )
        .unwrap()
}

pub struct Peer {
    pub addr: SocketAddr,
    pub link: ClientLink,
    pub events: Vec<ClientLinkEvent>,
    /// A paused peer neither ticks nor receives
    pub paused: bool,
}

pub struct World {
    pub now: f64,
    pub network: NetworkSimulator,
    pub server: ServerLink,
    pub server_events: Vec<ServerLinkEvent>,
    pub server_paused: bool,
    pub clients: Vec<Peer>,
}

impl World {
    pub fn new(max_slots: usize, network: SimulatorConfig) -> Self {
        let config = ServerConfig::new(PROTOCOL_ID, PRIVATE_KEY, server_addr()).max_slots(max_slots);
        Self::with_server_config(config, network)
    }

    pub fn with_server_config(config: ServerConfig, network: SimulatorConfig) -> Self {
        let mut server = ServerLink::new(config).unwrap();
        server.start(START);
        Self {
            now: START,
            network: NetworkSimulator::with_seed(network, 0x5eed),
            server,
            server_events: Vec::new(),
            server_paused: false,
            clients: Vec::new(),
        }
    }

    pub fn add_client(&mut self) -> usize {
        let index = self.clients.len();
        self.clients.push(Peer {
            addr: client_addr(index),
            link: ClientLink::new(ClientConfig::new(PROTOCOL_ID)).unwrap(),
            events: Vec::new(),
            paused: false,
        });
        index
    }

    pub fn connect(&mut self, client: usize, token: &[u8]) {
        let now = self.now;
        let peer = &mut self.clients[client];
        peer.link.connect(token, now).unwrap();
        peer.events.extend(peer.link.drain_events());
    }

    /// Add `count` clients and connect them all; true once every one is
    /// confirmed by the server.
    pub fn connect_clients(&mut self, count: usize) -> bool {
        for _ in 0..count {
            let client = self.add_client();
            let token = token(client as u64 + 1, &[server_addr()], 5);
            self.connect(client, &token);
        }
        self.run_until(10.0, |world| (0..world.clients.len()).all(|c| world.fully_connected(c)))
    }

    /// Advance one tick: deliver due datagrams, tick everyone, ship output.
    pub fn step(&mut self) {
        self.now += TICK;
        let now = self.now;

        for (from, to, data) in self.network.drain_ready(now) {
            if to == server_addr() {
                if !self.server_paused {
                    self.server.receive(from, data);
                }
            } else if let Some(peer) = self.clients.iter().find(|peer| peer.addr == to && !peer.paused) {
                peer.link.receive(from, data);
            }
        }

        if !self.server_paused {
            self.server.tick(now);
            for (to, data) in self.server.drain_output() {
                self.network.send(server_addr(), to, data, now);
            }
            self.server_events.extend(self.server.drain_events());
        }

        for peer in self.clients.iter_mut().filter(|peer| !peer.paused) {
            peer.link.tick(now);
            for (to, data) in peer.link.drain_output() {
                self.network.send(peer.addr, to, data, now);
            }
            peer.events.extend(peer.link.drain_events());
        }
    }

    pub fn run_for(&mut self, seconds: f64) {
        let end = self.now + seconds;
        while self.now < end {
            self.step();
        }
    }

    /// Step until `done` holds or `seconds` pass; returns whether it held.
    pub fn run_until(&mut self, seconds: f64, mut done: impl FnMut(&World) -> bool) -> bool {
        let end = self.now + seconds;
        while self.now < end {
            self.step();
            if done(self) {
                return true;
            }
        }
        false
    }

    pub fn client_state(&self, client: usize) -> ClientState {
        self.clients[client].link.state()
    }

    /// Confirmed server slot of a client, looked up by its address
    pub fn server_slot(&self, client: usize) -> Option<usize> {
        let addr = self.clients[client].addr;
        self.server
            .server()
            .find_client_by_address(addr)
            .filter(|slot| self.server.connected_clients().contains(slot))
    }

    /// Client connected and confirmed by the server
    pub fn fully_connected(&self, client: usize) -> bool {
        self.clients[client].link.is_connected() && self.server_slot(client).is_some()
    }

    /// Remove and return the messages a client received so far
    pub fn take_client_messages(&mut self, client: usize) -> Vec<Bytes> {
        let mut messages = Vec::new();
        self.clients[client].events.retain(|event| match event {
            ClientLinkEvent::Message(message) => {
                messages.push(message.payload.clone());
                false
            }
            _ => true,
        });
        messages
    }

    /// Remove and return `(client_index, payload)` for messages the server
    /// received so far
    pub fn take_server_messages(&mut self) -> Vec<(usize, Bytes)> {
        let mut messages = Vec::new();
        self.server_events.retain(|event| match event {
            ServerLinkEvent::Message { client_index, message } => {
                messages.push((*client_index, message.payload.clone()));
                false
            }
            _ => true,
        });
        messages
    }
}
