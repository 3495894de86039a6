//! Server acceptance state machine
//!
//! Owns the client slots, the per-endpoint encryption mappings and the token
//! history. Like [`Client`](crate::client::Client) it is synchronous: feed
//! it with [`Server::receive`], advance with [`Server::tick`], drain
//! [`Server::drain_output`] and [`Server::drain_events`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::config::{AddressCheck, ServerConfig};
use crate::crypto::{self, Key};
use crate::datagram::DatagramQueue;
use crate::encryption::EncryptionManager;
use crate::error::{ConnectionError, NetError, Result};
use crate::history::TokenHistory;
use crate::packet::constants::{
    GLOBAL_SEQUENCE_BIT, MAX_PAYLOAD_BYTES, NUM_DISCONNECT_PACKETS, PACKET_SEND_INTERVAL,
};
use crate::packet::{classify, ConnectionRequest, EncryptedHeader, Inbound, Packet, PacketType};
use crate::replay::ReplayProtection;
use crate::token::{private_mac, ChallengeToken, PrivateConnectToken, UserData};

/// Lifetime of a mapping installed by a request until the client answers
const PENDING_MAPPING_SECONDS: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// The client sent disconnect packets
    ClientDisconnected,
    TimedOut,
    /// `disconnect_client` was called
    Kicked,
    ServerStopped,
}

/// Output of [`Server::drain_events`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
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
    Payload {
        client_index: usize,
        payload: Bytes,
    },
}

/// A client occupying a slot
#[derive(Clone)]
pub struct RemoteClient {
    pub client_id: u64,
    pub client_index: usize,
    pub address: SocketAddr,
    /// Set by the first authenticated keep-alive or payload
    pub confirmed: bool,
    pub connect_time: f64,
    pub last_receive: f64,
    pub last_send: f64,
    pub timeout_seconds: i32,
    pub user_data: UserData,
    send_key: Key,
    receive_key: Key,
    send_sequence: u64,
    replay: ReplayProtection,
}

impl RemoteClient {
    fn seal(&mut self, packet: &Packet, protocol_id: u64, now: f64) -> Result<Bytes> {
        let sequence = self.send_sequence;
        self.send_sequence += 1;
        self.last_send = now;
        packet.encrypt(sequence, protocol_id, &self.send_key)
    }

    fn timed_out(&self, now: f64) -> bool {
        self.timeout_seconds >= 0 && now - self.last_receive >= self.timeout_seconds as f64
    }
}

impl fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteClient")
            .field("client_id", &self.client_id)
            .field("client_index", &self.client_index)
            .field("address", &self.address)
            .field("confirmed", &self.confirmed)
            .field("last_receive", &self.last_receive)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish_non_exhaustive()
    }
}

/// Handshake server
pub struct Server {
    config: ServerConfig,
    running: bool,
    time: f64,
    clients: Vec<Option<RemoteClient>>,
    encryption: EncryptionManager,
    history: TokenHistory,
    challenge_key: Key,
    challenge_sequence: u64,
    global_sequence: u64,
    last_keep_alive: f64,
    inbound: Arc<DatagramQueue>,
    output: Vec<(SocketAddr, Bytes)>,
    events: Vec<ServerEvent>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let slots = config.max_slots;
        Ok(Self {
            clients: vec![None; slots],
            encryption: EncryptionManager::new(slots * 4),
            history: TokenHistory::new(slots * 8),
            challenge_key: crypto::generate_key(),
            challenge_sequence: 0,
            global_sequence: 0,
            last_keep_alive: 0.0,
            inbound: Arc::new(DatagramQueue::new(config.datagram_queue_capacity)),
            output: Vec::new(),
            events: Vec::new(),
            running: false,
            time: 0.0,
            config,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn max_slots(&self) -> usize {
        self.clients.len()
    }

    /// Occupied slots, confirmed or not
    pub fn num_connected_clients(&self) -> usize {
        self.clients.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn client(&self, client_index: usize) -> Option<&RemoteClient> {
        self.clients.get(client_index).and_then(Option::as_ref)
    }

    pub fn clients(&self) -> impl Iterator<Item = &RemoteClient> {
        self.clients.iter().flatten()
    }

    pub fn find_client_by_id(&self, client_id: u64) -> Option<usize> {
        self.clients().find(|c| c.client_id == client_id).map(|c| c.client_index)
    }

    pub fn find_client_by_address(&self, address: SocketAddr) -> Option<usize> {
        self.clients().find(|c| c.address == address).map(|c| c.client_index)
    }

    pub fn inbound_queue(&self) -> Arc<DatagramQueue> {
        self.inbound.clone()
    }

    /// Queue a datagram for the next tick
    pub fn receive(&self, from: SocketAddr, data: Bytes) -> bool {
        self.inbound.push(from, data)
    }

    pub fn start(&mut self, now: f64) {
        if self.running {
            debug!("server already running");
            return;
        }
        info!(
            address = %self.config.public_address,
            max_slots = self.max_slots(),
            protocol_id = self.config.protocol_id,
            "server started"
        );
        self.running = true;
        self.time = now;
        self.last_keep_alive = now;
        self.challenge_key = crypto::generate_key();
        self.history.reset();
        self.encryption.clear();
        self.inbound.clear();
    }

    /// Disconnect every client and stop processing
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        for index in 0..self.clients.len() {
            self.disconnect_slot(index, DisconnectReason::ServerStopped, true);
        }
        self.encryption.clear();
        self.history.reset();
        self.inbound.clear();
        self.running = false;
        info!("server stopped");
    }

    /// Keep-alives, timeouts, then the datagrams queued before this call
    pub fn tick(&mut self, now: f64) {
        if !self.running {
            return;
        }
        let available = self.inbound.len();
        self.time = now;

        let elapsed = now - self.last_keep_alive;
        if elapsed >= PACKET_SEND_INTERVAL {
            self.last_keep_alive += (elapsed / PACKET_SEND_INTERVAL).floor() * PACKET_SEND_INTERVAL;
            self.broadcast_keep_alives(now);
        }

        for index in 0..self.clients.len() {
            if self.clients[index].as_ref().is_some_and(|c| c.timed_out(now)) {
                self.disconnect_slot(index, DisconnectReason::TimedOut, true);
            }
        }

        for _ in 0..available {
            let Some(datagram) = self.inbound.pop() else {
                break;
            };
            self.process_datagram(datagram.from, datagram.payload, now);
        }
    }

    /// Send an application payload to a client. An unconfirmed client gets a
    /// keep-alive first so it can finish its handshake.
    pub fn send_payload(&mut self, client_index: usize, payload: Bytes) -> Result<()> {
        if !self.running {
            return Err(NetError::connection(ConnectionError::NotRunning));
        }
        if payload.is_empty() || payload.len() > MAX_PAYLOAD_BYTES {
            return Err(NetError::protocol(format!(
                "payload must be 1..={MAX_PAYLOAD_BYTES} bytes, got {}",
                payload.len()
            )));
        }
        let max_slots = self.max_slots() as u32;
        let protocol_id = self.config.protocol_id;
        let now = self.time;
        let client = self
            .clients
            .get_mut(client_index)
            .and_then(Option::as_mut)
            .ok_or_else(|| NetError::connection(ConnectionError::InvalidClient))?;

        if !client.confirmed {
            let keep_alive = Packet::KeepAlive {
                client_index: client_index as u32,
                max_slots,
            };
            let packet = client.seal(&keep_alive, protocol_id, now)?;
            self.output.push((client.address, packet));
        }
        let packet = client.seal(&Packet::Payload(payload), protocol_id, now)?;
        self.output.push((client.address, packet));
        Ok(())
    }

    /// Kick a client: redundant disconnect packets, then free the slot
    pub fn disconnect_client(&mut self, client_index: usize) -> Result<()> {
        if self.client(client_index).is_none() {
            return Err(NetError::connection(ConnectionError::InvalidClient));
        }
        self.disconnect_slot(client_index, DisconnectReason::Kicked, true);
        Ok(())
    }

    pub fn drain_output(&mut self) -> Vec<(SocketAddr, Bytes)> {
        std::mem::take(&mut self.output)
    }

    pub fn drain_events(&mut self) -> Vec<ServerEvent> {
        std::mem::take(&mut self.events)
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    fn process_datagram(&mut self, from: SocketAddr, data: Bytes, now: f64) {
        match classify(data) {
            Ok(Inbound::Request(request)) => self.process_request(from, request, now),
            Ok(Inbound::Encrypted { header, ciphertext }) => match header.packet_type {
                PacketType::ConnectionResponse => self.process_response(from, &header, &ciphertext, now),
                PacketType::ConnectionKeepAlive | PacketType::ConnectionPayload | PacketType::ConnectionDisconnect => {
                    self.process_connected(from, &header, &ciphertext, now)
                }
                other => trace!(from = %from, kind = ?other, "server ignores packet type"),
            },
            Err(e) => trace!(from = %from, error = %e, "dropping malformed packet"),
        }
    }

    fn process_request(&mut self, from: SocketAddr, request: ConnectionRequest, now: f64) {
        if request.protocol_id != self.config.protocol_id {
            trace!(from = %from, protocol_id = request.protocol_id, "request for another protocol");
            return;
        }
        if request.expire_timestamp <= now.max(0.0) as u64 {
            trace!(from = %from, expire = request.expire_timestamp, "connect token expired");
            return;
        }
        let token = match PrivateConnectToken::open(
            &request.private_data,
            self.config.protocol_id,
            request.expire_timestamp,
            request.token_sequence,
            &self.config.private_key,
        ) {
            Ok(token) => token,
            Err(e) => {
                trace!(from = %from, error = %e, "private token failed to open");
                return;
            }
        };
        if !token.server_addresses.contains(&self.config.public_address) {
            match self.config.address_check {
                AddressCheck::Strict => {
                    debug!(from = %from, server = %self.config.public_address, "server not listed in token, dropping");
                    return;
                }
                AddressCheck::Lenient => {
                    debug!(from = %from, server = %self.config.public_address, "server not listed in token, accepting")
                }
            }
        }
        if self.find_client_by_address(from).is_some() {
            trace!(from = %from, "address already connected");
            return;
        }
        if self.find_client_by_id(token.client_id).is_some() {
            trace!(from = %from, client_id = token.client_id, "client id already connected");
            return;
        }
        if !self.history.find_or_add(&private_mac(&request.private_data), from, now) {
            debug!(from = %from, client_id = token.client_id, "connect token reused from another address");
            return;
        }
        if self.num_connected_clients() >= self.max_slots() {
            debug!(from = %from, client_id = token.client_id, "server full, denying");
            self.send_global(from, &Packet::Denied, &token.server_to_client_key);
            return;
        }
        if !self.encryption.add(
            from,
            token.server_to_client_key,
            token.client_to_server_key,
            now,
            now + PENDING_MAPPING_SECONDS,
            token.timeout_seconds,
        ) {
            warn!(from = %from, "encryption table full, dropping request");
            return;
        }

        let challenge_sequence = self.challenge_sequence;
        self.challenge_sequence += 1;
        let challenge = ChallengeToken {
            client_id: token.client_id,
            user_data: token.user_data,
        };
        match challenge.seal(challenge_sequence, &self.challenge_key) {
            Ok(sealed) => {
                trace!(from = %from, client_id = token.client_id, challenge_sequence, "sending challenge");
                let packet = Packet::Challenge {
                    challenge_sequence,
                    token: sealed,
                };
                self.send_global(from, &packet, &token.server_to_client_key);
            }
            Err(e) => warn!(error = %e, "failed to seal challenge token"),
        }
    }

    fn process_response(&mut self, from: SocketAddr, header: &EncryptedHeader, ciphertext: &[u8], now: f64) {
        let Some(mapping) = self.encryption.find(from, now) else {
            trace!(from = %from, "response without a valid mapping");
            return;
        };
        let (send_key, receive_key, timeout_seconds) = (mapping.send_key, mapping.receive_key, mapping.timeout_seconds);

        let (challenge_sequence, sealed) =
            match Packet::decrypt(header, ciphertext, self.config.protocol_id, &receive_key) {
                Ok(Packet::Response {
                    challenge_sequence,
                    token,
                }) => (challenge_sequence, token),
                Ok(_) => return,
                Err(e) => {
                    trace!(from = %from, error = %e, "response failed authentication");
                    return;
                }
            };
        let challenge = match ChallengeToken::open(&sealed, challenge_sequence, &self.challenge_key) {
            Ok(challenge) => challenge,
            Err(e) => {
                trace!(from = %from, error = %e, "challenge token failed to open");
                return;
            }
        };

        if self.find_client_by_address(from).is_some() {
            trace!(from = %from, "address already connected");
            return;
        }
        if self.find_client_by_id(challenge.client_id).is_some() {
            trace!(from = %from, client_id = challenge.client_id, "client id already connected");
            return;
        }
        let Some(client_index) = self.clients.iter().position(Option::is_none) else {
            debug!(from = %from, client_id = challenge.client_id, "server full, denying");
            self.send_global(from, &Packet::Denied, &send_key);
            return;
        };

        self.encryption.touch(from, now);
        self.encryption.set_client_index(from, Some(client_index));
        let mut client = RemoteClient {
            client_id: challenge.client_id,
            client_index,
            address: from,
            confirmed: false,
            connect_time: now,
            last_receive: now,
            last_send: now,
            timeout_seconds,
            user_data: challenge.user_data,
            send_key,
            receive_key,
            send_sequence: 0,
            replay: ReplayProtection::new(),
        };
        info!(from = %from, client_id = client.client_id, client_index, "client slot allocated");

        let keep_alive = Packet::KeepAlive {
            client_index: client_index as u32,
            max_slots: self.max_slots() as u32,
        };
        match client.seal(&keep_alive, self.config.protocol_id, now) {
            Ok(packet) => self.output.push((from, packet)),
            Err(e) => warn!(error = %e, "failed to seal keep-alive"),
        }
        self.clients[client_index] = Some(client);
    }

    fn process_connected(&mut self, from: SocketAddr, header: &EncryptedHeader, ciphertext: &[u8], now: f64) {
        let Some(client_index) = self.find_client_by_address(from) else {
            trace!(from = %from, "packet from unknown address");
            return;
        };
        let protocol_id = self.config.protocol_id;
        let Some(client) = self.clients[client_index].as_mut() else {
            return;
        };
        if client.replay.already_received(header.sequence) {
            trace!(from = %from, sequence = header.sequence, "replayed packet dropped");
            return;
        }
        let packet = match Packet::decrypt(header, ciphertext, protocol_id, &client.receive_key) {
            Ok(packet) => packet,
            Err(e) => {
                trace!(from = %from, error = %e, "packet failed authentication");
                return;
            }
        };
        client.replay.advance(header.sequence);
        client.last_receive = now;
        self.encryption.touch(from, now);

        let confirms = matches!(packet, Packet::KeepAlive { .. } | Packet::Payload(_));
        if confirms && !client.confirmed {
            client.confirmed = true;
            info!(from = %from, client_id = client.client_id, client_index, "client connected");
            self.events.push(ServerEvent::ClientConnected {
                client_index,
                client_id: client.client_id,
                address: from,
            });
        }

        match packet {
            Packet::Payload(payload) => self.events.push(ServerEvent::Payload { client_index, payload }),
            Packet::Disconnect => {
                self.disconnect_slot(client_index, DisconnectReason::ClientDisconnected, false);
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Packets to endpoints without a slot use the global sequence space
    fn send_global(&mut self, to: SocketAddr, packet: &Packet, key: &Key) {
        let sequence = GLOBAL_SEQUENCE_BIT | self.global_sequence;
        self.global_sequence += 1;
        match packet.encrypt(sequence, self.config.protocol_id, key) {
            Ok(data) => self.output.push((to, data)),
            Err(e) => warn!(error = %e, "failed to seal packet"),
        }
    }

    fn broadcast_keep_alives(&mut self, now: f64) {
        let max_slots = self.max_slots() as u32;
        let protocol_id = self.config.protocol_id;
        for client in self.clients.iter_mut().flatten() {
            let keep_alive = Packet::KeepAlive {
                client_index: client.client_index as u32,
                max_slots,
            };
            match client.seal(&keep_alive, protocol_id, now) {
                Ok(packet) => self.output.push((client.address, packet)),
                Err(e) => warn!(error = %e, "failed to seal keep-alive"),
            }
        }
    }

    fn disconnect_slot(&mut self, client_index: usize, reason: DisconnectReason, send_packets: bool) {
        let Some(mut client) = self.clients.get_mut(client_index).and_then(Option::take) else {
            return;
        };
        if send_packets {
            for _ in 0..NUM_DISCONNECT_PACKETS {
                match client.seal(&Packet::Disconnect, self.config.protocol_id, self.time) {
                    Ok(packet) => self.output.push((client.address, packet)),
                    Err(e) => warn!(error = %e, "failed to seal disconnect packet"),
                }
            }
        }
        self.encryption.remove(client.address);
        info!(
            address = %client.address,
            client_id = client.client_id,
            client_index,
            reason = ?reason,
            "client disconnected"
        );
        if client.confirmed {
            self.events.push(ServerEvent::ClientDisconnected {
                client_index,
                client_id: client.client_id,
                reason,
            });
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.config.public_address)
            .field("running", &self.running)
            .field("clients", &self.num_connected_clients())
            .field("max_slots", &self.max_slots())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{ConnectToken, TokenFactory, TokenRequest};

    const PROTOCOL_ID: u64 = 0x99;
    const NOW: f64 = 1_700_000_000.0;
    const KEY: Key = [42u8; 32];

    fn server_addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn server(slots: usize) -> Server {
        let mut server = Server::new(ServerConfig::new(PROTOCOL_ID, KEY, server_addr()).max_slots(slots)).unwrap();
        server.start(NOW);
        server
    }

    fn token_for(client_id: u64, servers: &[SocketAddr], expire_seconds: u64) -> ConnectToken {
        let data = TokenFactory::new(PROTOCOL_ID, KEY)
            .generate_at(
                NOW as u64,
                &TokenRequest {
                    client_id,
                    server_addresses: servers,
                    expire_seconds,
                    timeout_seconds: 5,
                    sequence: client_id,
                    user_data: b"user",
                },
            )
            .unwrap();
        ConnectToken::read(&data).unwrap()
    }

    fn request(token: &ConnectToken) -> Bytes {
        ConnectionRequest {
            protocol_id: token.protocol_id,
            expire_timestamp: token.expire_timestamp,
            token_sequence: token.sequence,
            private_data: token.private_data.clone(),
        }
        .encode()
    }

    /// Decrypt whatever the server sent to `to` with the token's key
    fn replies(server: &mut Server, to: SocketAddr, token: &ConnectToken) -> Vec<Packet> {
        server
            .drain_output()
            .into_iter()
            .filter(|(addr, _)| *addr == to)
            .filter_map(|(_, data)| match classify(data).ok()? {
                Inbound::Encrypted { header, ciphertext } => {
                    Packet::decrypt(&header, &ciphertext, PROTOCOL_ID, &token.server_to_client_key).ok()
                }
                Inbound::Request(_) => None,
            })
            .collect()
    }

    fn respond(server: &mut Server, from: SocketAddr, token: &ConnectToken, challenge: Packet, now: f64) {
        let Packet::Challenge {
            challenge_sequence,
            token: sealed,
        } = challenge
        else {
            panic!("expected a challenge");
        };
        let response = Packet::Response {
            challenge_sequence,
            token: sealed,
        }
        .encrypt(0, PROTOCOL_ID, &token.client_to_server_key)
        .unwrap();
        server.receive(from, response);
        server.tick(now);
    }

    #[test]
    fn test_keep_alive_timer_catches_up_in_one_step() {
        let mut server = Server::new(ServerConfig::new(PROTOCOL_ID, KEY, server_addr())).unwrap();
        server.start(0.0);
        server.tick(NOW);
        assert!(NOW - server.last_keep_alive < PACKET_SEND_INTERVAL);
        assert!(server.last_keep_alive <= NOW);

        let previous = server.last_keep_alive;
        server.tick(previous + PACKET_SEND_INTERVAL / 2.0);
        assert_eq!(server.last_keep_alive, previous);
        server.tick(previous + PACKET_SEND_INTERVAL * 2.5);
        assert!((server.last_keep_alive - (previous + PACKET_SEND_INTERVAL * 2.0)).abs() < 1e-6);
    }

    #[test]
    fn test_request_gets_challenge() {
        let mut server = server(4);
        let token = token_for(1, &[server_addr()], 30);
        server.receive(peer(1), request(&token));
        server.tick(NOW);

        let packets = replies(&mut server, peer(1), &token);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].packet_type(), PacketType::ConnectionChallenge);
    }

    #[test]
    fn test_full_handshake_confirms_on_keep_alive() {
        let mut server = server(4);
        let token = token_for(1, &[server_addr()], 30);
        server.receive(peer(1), request(&token));
        server.tick(NOW);
        let challenge = replies(&mut server, peer(1), &token).remove(0);

        respond(&mut server, peer(1), &token, challenge, NOW + 0.01);
        let packets = replies(&mut server, peer(1), &token);
        assert_eq!(
            packets,
            vec![Packet::KeepAlive {
                client_index: 0,
                max_slots: 4
            }]
        );
        assert_eq!(server.num_connected_clients(), 1);
        assert!(!server.client(0).unwrap().confirmed);
        assert_eq!(&server.client(0).unwrap().user_data[..4], b"user");
        assert!(server.drain_events().is_empty());

        let keep_alive = Packet::KeepAlive {
            client_index: 0,
            max_slots: 4,
        }
        .encrypt(1, PROTOCOL_ID, &token.client_to_server_key)
        .unwrap();
        server.receive(peer(1), keep_alive);
        server.tick(NOW + 0.02);
        assert!(server.client(0).unwrap().confirmed);
        assert_eq!(
            server.drain_events(),
            vec![ServerEvent::ClientConnected {
                client_index: 0,
                client_id: 1,
                address: peer(1)
            }]
        );
    }

    #[test]
    fn test_expired_and_foreign_requests_dropped() {
        let mut server = server(4);
        let expired = token_for(1, &[server_addr()], 0);
        server.receive(peer(1), request(&expired));

        let mut foreign = token_for(2, &[server_addr()], 30);
        foreign.protocol_id += 1;
        server.receive(peer(2), request(&foreign));

        let mut tampered = token_for(3, &[server_addr()], 30);
        tampered.expire_timestamp += 10;
        server.receive(peer(3), request(&tampered));

        server.tick(NOW);
        assert!(server.drain_output().is_empty());
    }

    #[test]
    fn test_token_reuse_from_other_address_dropped() {
        let mut server = server(4);
        let token = token_for(1, &[server_addr()], 30);
        server.receive(peer(1), request(&token));
        server.receive(peer(2), request(&token));
        server.tick(NOW);
        assert_eq!(replies(&mut server, peer(1), &token).len(), 1);

        // same address may retry
        server.receive(peer(1), request(&token));
        server.tick(NOW + 0.1);
        let packets = replies(&mut server, peer(1), &token);
        assert!(packets.iter().any(|p| p.packet_type() == PacketType::ConnectionChallenge));
        assert!(replies(&mut server, peer(2), &token).is_empty());
    }

    #[test]
    fn test_full_server_denies() {
        let mut server = server(1);
        let first = token_for(1, &[server_addr()], 30);
        server.receive(peer(1), request(&first));
        server.tick(NOW);
        let challenge = replies(&mut server, peer(1), &first).remove(0);
        respond(&mut server, peer(1), &first, challenge, NOW + 0.01);
        server.drain_output();

        let second = token_for(2, &[server_addr()], 30);
        server.receive(peer(2), request(&second));
        server.tick(NOW + 0.02);
        assert_eq!(replies(&mut server, peer(2), &second), vec![Packet::Denied]);
    }

    #[test]
    fn test_strict_address_check() {
        let other: SocketAddr = "10.1.1.1:5000".parse().unwrap();
        let token = token_for(1, &[other], 30);

        let mut lenient = server(2);
        lenient.receive(peer(1), request(&token));
        lenient.tick(NOW);
        assert_eq!(replies(&mut lenient, peer(1), &token).len(), 1);

        let config = ServerConfig::new(PROTOCOL_ID, KEY, server_addr()).address_check(AddressCheck::Strict);
        let mut strict = Server::new(config).unwrap();
        strict.start(NOW);
        strict.receive(peer(1), request(&token));
        strict.tick(NOW);
        assert!(strict.drain_output().is_empty());
    }

    #[test]
    fn test_kick_and_invalid_index() {
        let mut server = server(2);
        assert!(server.disconnect_client(0).is_err());
        assert!(server.send_payload(5, Bytes::from_static(b"x")).is_err());

        let token = token_for(1, &[server_addr()], 30);
        server.receive(peer(1), request(&token));
        server.tick(NOW);
        let challenge = replies(&mut server, peer(1), &token).remove(0);
        respond(&mut server, peer(1), &token, challenge, NOW + 0.01);
        server.drain_output();

        // unconfirmed client gets a keep-alive ahead of the payload
        server.send_payload(0, Bytes::from_static(b"hello")).unwrap();
        let kinds: Vec<_> = replies(&mut server, peer(1), &token).iter().map(Packet::packet_type).collect();
        assert_eq!(kinds, vec![PacketType::ConnectionKeepAlive, PacketType::ConnectionPayload]);

        server.disconnect_client(0).unwrap();
        let packets = replies(&mut server, peer(1), &token);
        assert_eq!(packets.len(), NUM_DISCONNECT_PACKETS);
        assert!(packets.iter().all(|p| *p == Packet::Disconnect));
        assert_eq!(server.num_connected_clients(), 0);
    }

    #[test]
    fn test_stopped_server_ignores_ticks() {
        let mut server = server(2);
        server.stop();
        assert!(!server.is_running());
        let token = token_for(1, &[server_addr()], 30);
        server.receive(peer(1), request(&token));
        server.tick(NOW);
        assert!(server.drain_output().is_empty());
        assert!(server.send_payload(0, Bytes::from_static(b"x")).is_err());
    }
}
