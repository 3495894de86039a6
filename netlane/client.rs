//! Client handshake state machine
//!
//! Synchronous and clock-free: the caller feeds datagrams with
//! [`Client::receive`], advances it with [`Client::tick`] and ships whatever
//! [`Client::drain_output`] returns. `now` is in seconds; token expiry is
//! measured relative to the `connect` call so client and server clocks may
//! differ.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::datagram::DatagramQueue;
use crate::error::{ConnectionError, NetError, Result};
use crate::packet::constants::{MAX_PAYLOAD_BYTES, NETCODE_TIMEOUT_SECONDS, NUM_DISCONNECT_PACKETS, PACKET_SEND_INTERVAL};
use crate::packet::{classify, ConnectionRequest, Inbound, Packet, PacketType};
use crate::replay::ReplayProtection;
use crate::token::ConnectToken;

/// Client connection state. Negative values are terminal failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum ClientState {
    ConnectTokenExpired = -6,
    InvalidConnectToken = -5,
    ConnectionTimedOut = -4,
    ChallengeResponseTimedOut = -3,
    ConnectionRequestTimedOut = -2,
    ConnectionDenied = -1,
    Disconnected = 0,
    SendingConnectionRequest = 1,
    SendingChallengeResponse = 2,
    Connected = 3,
}

impl ClientState {
    pub fn code(self) -> i8 {
        self as i8
    }

    pub fn is_error(self) -> bool {
        self.code() < 0
    }

    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            ClientState::SendingConnectionRequest | ClientState::SendingChallengeResponse
        )
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Output of [`Client::drain_events`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    StateChanged(ClientState),
    Payload(Bytes),
}

/// Per-state data of an active attempt
#[derive(Debug, Clone)]
enum Phase {
    SendingRequest,
    SendingResponse { challenge_sequence: u64, challenge_token: Bytes },
    Connected { client_index: u32, max_slots: u32 },
}

impl Phase {
    fn state(&self) -> ClientState {
        match self {
            Phase::SendingRequest => ClientState::SendingConnectionRequest,
            Phase::SendingResponse { .. } => ClientState::SendingChallengeResponse,
            Phase::Connected { .. } => ClientState::Connected,
        }
    }
}

/// One connect attempt, alive from `connect` until teardown
struct Session {
    token: ConnectToken,
    request: Bytes,
    server: SocketAddr,
    remaining: VecDeque<SocketAddr>,
    phase: Phase,
    connect_start: f64,
    last_send: f64,
    last_receive: f64,
    send_sequence: u64,
    replay: ReplayProtection,
    pending: ClientState,
}

impl Session {
    fn next_sequence(&mut self) -> u64 {
        let sequence = self.send_sequence;
        self.send_sequence += 1;
        sequence
    }

    fn seal(&mut self, packet: &Packet) -> Result<Bytes> {
        let sequence = self.next_sequence();
        packet.encrypt(sequence, self.token.protocol_id, &self.token.client_to_server_key)
    }

    fn token_expired(&self, now: f64) -> bool {
        now - self.connect_start >= self.token.lifetime_seconds() as f64
    }

    fn timed_out(&self, now: f64) -> bool {
        self.token.timeout_seconds >= 0 && now - self.last_receive >= self.token.timeout_seconds as f64
    }

    /// Record a failure, keeping a denial over a later timeout
    fn fail_with(&mut self, state: ClientState) {
        if self.pending != ClientState::ConnectionDenied {
            self.pending = state;
        }
    }
}

enum Followup {
    None,
    NextEndpoint,
    Teardown(ClientState),
}

/// Handshake client
pub struct Client {
    config: ClientConfig,
    idle_state: ClientState,
    reported: ClientState,
    session: Option<Session>,
    inbound: Arc<DatagramQueue>,
    output: Vec<(SocketAddr, Bytes)>,
    events: Vec<ClientEvent>,
    endpoint_generation: u64,
    time: f64,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let inbound = Arc::new(DatagramQueue::new(config.datagram_queue_capacity));
        Ok(Self {
            config,
            idle_state: ClientState::Disconnected,
            reported: ClientState::Disconnected,
            session: None,
            inbound,
            output: Vec::new(),
            events: Vec::new(),
            endpoint_generation: 0,
            time: 0.0,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ClientState {
        match &self.session {
            Some(session) => session.phase.state(),
            None => self.idle_state,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    pub fn client_index(&self) -> Option<u32> {
        match self.session.as_ref().map(|s| &s.phase) {
            Some(Phase::Connected { client_index, .. }) => Some(*client_index),
            _ => None,
        }
    }

    pub fn max_slots(&self) -> Option<u32> {
        match self.session.as_ref().map(|s| &s.phase) {
            Some(Phase::Connected { max_slots, .. }) => Some(*max_slots),
            _ => None,
        }
    }

    /// Server endpoint currently being tried or connected to
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.session.as_ref().map(|s| s.server)
    }

    /// Bumped whenever the client moves to a new server endpoint; a driver
    /// re-creates its socket when this changes.
    pub fn endpoint_generation(&self) -> u64 {
        self.endpoint_generation
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    /// Queue shared with a receive task
    pub fn inbound_queue(&self) -> Arc<DatagramQueue> {
        self.inbound.clone()
    }

    /// Queue a datagram for the next tick
    pub fn receive(&self, from: SocketAddr, data: Bytes) -> bool {
        self.inbound.push(from, data)
    }

    /// Begin connecting with a serialized public token.
    ///
    /// A malformed or expired token is reported as
    /// [`ClientState::InvalidConnectToken`], not as an error.
    pub fn connect(&mut self, token_bytes: &[u8], now: f64) -> Result<()> {
        let state = self.state();
        if state != ClientState::Disconnected && !state.is_error() {
            return Err(NetError::connection(ConnectionError::AlreadyConnected));
        }
        self.time = now;
        self.inbound.clear();

        let token = match ConnectToken::read(token_bytes) {
            Ok(token) if token.create_timestamp >= token.expire_timestamp => {
                debug!(create = token.create_timestamp, expire = token.expire_timestamp, "token already expired");
                None
            }
            Ok(token) if token.protocol_id != self.config.protocol_id => {
                debug!(token = token.protocol_id, expected = self.config.protocol_id, "token protocol id mismatch");
                None
            }
            Ok(token) => Some(token),
            Err(e) => {
                debug!(error = %e, "invalid connect token");
                None
            }
        };
        let Some(token) = token else {
            self.idle_state = ClientState::InvalidConnectToken;
            self.report_state();
            return Ok(());
        };

        let mut remaining: VecDeque<SocketAddr> = token.server_addresses.iter().copied().collect();
        let Some(server) = remaining.pop_front() else {
            self.idle_state = ClientState::InvalidConnectToken;
            self.report_state();
            return Ok(());
        };
        let request = ConnectionRequest {
            protocol_id: token.protocol_id,
            expire_timestamp: token.expire_timestamp,
            token_sequence: token.sequence,
            private_data: token.private_data.clone(),
        }
        .encode();

        info!(server = %server, candidates = remaining.len() + 1, "connecting");
        self.endpoint_generation += 1;
        self.session = Some(Session {
            token,
            request,
            server,
            remaining,
            phase: Phase::SendingRequest,
            connect_start: now,
            last_send: f64::NEG_INFINITY,
            last_receive: now,
            send_sequence: 0,
            replay: ReplayProtection::new(),
            pending: ClientState::ConnectionRequestTimedOut,
        });
        self.report_state();
        Ok(())
    }

    /// Process the datagrams queued before this call, then run the state
    /// handler.
    pub fn tick(&mut self, now: f64) {
        self.time = now;
        for datagram in self.inbound.drain_available() {
            if self.server_addr() != Some(datagram.from) {
                trace!(from = %datagram.from, "ignoring datagram from unexpected address");
                continue;
            }
            let followup = self.process_datagram(datagram.payload, now);
            self.apply(followup, now);
            self.report_state();
        }

        let followup = self.update_phase(now);
        self.apply(followup, now);
        self.report_state();
    }

    /// Send an application payload to the server
    pub fn send_payload(&mut self, payload: Bytes) -> Result<()> {
        if payload.is_empty() || payload.len() > MAX_PAYLOAD_BYTES {
            return Err(NetError::protocol(format!(
                "payload must be 1..={MAX_PAYLOAD_BYTES} bytes, got {}",
                payload.len()
            )));
        }
        let session = self
            .session
            .as_mut()
            .filter(|s| matches!(s.phase, Phase::Connected { .. }))
            .ok_or_else(|| NetError::connection(ConnectionError::NotConnected))?;
        let packet = session.seal(&Packet::Payload(payload))?;
        self.output.push((session.server, packet));
        Ok(())
    }

    /// Tear down now; a connected client first sends redundant disconnect
    /// packets.
    pub fn disconnect(&mut self) {
        if let Some(session) = self.session.as_mut() {
            if matches!(session.phase, Phase::Connected { .. }) {
                for _ in 0..NUM_DISCONNECT_PACKETS {
                    match session.seal(&Packet::Disconnect) {
                        Ok(packet) => self.output.push((session.server, packet)),
                        Err(e) => warn!(error = %e, "failed to seal disconnect packet"),
                    }
                }
            }
            self.teardown(ClientState::Disconnected);
        }
        self.report_state();
    }

    pub fn drain_output(&mut self) -> Vec<(SocketAddr, Bytes)> {
        std::mem::take(&mut self.output)
    }

    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.events)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn process_datagram(&mut self, data: Bytes, now: f64) -> Followup {
        let Some(session) = self.session.as_mut() else {
            return Followup::None;
        };
        let (header, ciphertext) = match classify(data) {
            Ok(Inbound::Encrypted { header, ciphertext }) => (header, ciphertext),
            Ok(Inbound::Request(_)) => {
                trace!("client ignores connection requests");
                return Followup::None;
            }
            Err(e) => {
                trace!(error = %e, "dropping malformed packet");
                return Followup::None;
            }
        };
        if header.packet_type == PacketType::ConnectionResponse {
            trace!("client ignores challenge responses");
            return Followup::None;
        }
        let protected = header.packet_type.is_replay_protected();
        if protected && session.replay.already_received(header.sequence) {
            trace!(sequence = header.sequence, "replayed packet dropped");
            return Followup::None;
        }
        let packet = match Packet::decrypt(
            &header,
            &ciphertext,
            session.token.protocol_id,
            &session.token.server_to_client_key,
        ) {
            Ok(packet) => packet,
            Err(e) => {
                trace!(error = %e, "packet failed authentication");
                return Followup::None;
            }
        };
        if protected {
            session.replay.advance(header.sequence);
        }

        match (packet, session.phase.state()) {
            (
                Packet::Denied,
                ClientState::SendingConnectionRequest | ClientState::SendingChallengeResponse,
            ) => {
                debug!(server = %session.server, "connection denied");
                session.pending = ClientState::ConnectionDenied;
                Followup::NextEndpoint
            }
            (
                Packet::Challenge {
                    challenge_sequence,
                    token,
                },
                ClientState::SendingConnectionRequest,
            ) => {
                debug!(server = %session.server, challenge_sequence, "received challenge");
                session.phase = Phase::SendingResponse {
                    challenge_sequence,
                    challenge_token: token,
                };
                session.last_send = f64::NEG_INFINITY;
                session.last_receive = now;
                Followup::None
            }
            (
                Packet::KeepAlive {
                    client_index,
                    max_slots,
                },
                ClientState::SendingChallengeResponse,
            ) => {
                info!(server = %session.server, client_index, max_slots, "connected");
                session.phase = Phase::Connected {
                    client_index,
                    max_slots,
                };
                session.last_receive = now;
                Followup::None
            }
            (Packet::KeepAlive { .. }, ClientState::Connected) => {
                session.last_receive = now;
                Followup::None
            }
            (Packet::Payload(payload), ClientState::Connected) => {
                session.last_receive = now;
                self.events.push(ClientEvent::Payload(payload));
                Followup::None
            }
            (Packet::Disconnect, ClientState::Connected) => {
                info!(server = %session.server, "server closed the connection");
                Followup::Teardown(ClientState::Disconnected)
            }
            (packet, state) => {
                trace!(kind = ?packet.packet_type(), state = %state, "packet ignored in this state");
                Followup::None
            }
        }
    }

    fn update_phase(&mut self, now: f64) -> Followup {
        let Some(session) = self.session.as_mut() else {
            return Followup::None;
        };

        let packet = match &session.phase {
            Phase::SendingRequest => {
                if session.token_expired(now) {
                    debug!("connect token expired");
                    return Followup::Teardown(ClientState::ConnectTokenExpired);
                }
                if session.timed_out(now) {
                    debug!(server = %session.server, "connection request timed out");
                    session.fail_with(ClientState::ConnectionRequestTimedOut);
                    return Followup::NextEndpoint;
                }
                if now - session.last_send < PACKET_SEND_INTERVAL {
                    return Followup::None;
                }
                trace!(server = %session.server, "sending connection request");
                Ok(session.request.clone())
            }
            Phase::SendingResponse {
                challenge_sequence,
                challenge_token,
            } => {
                if session.timed_out(now) {
                    debug!(server = %session.server, "challenge response timed out");
                    session.fail_with(ClientState::ChallengeResponseTimedOut);
                    return Followup::NextEndpoint;
                }
                if now - session.last_send < PACKET_SEND_INTERVAL {
                    return Followup::None;
                }
                let response = Packet::Response {
                    challenge_sequence: *challenge_sequence,
                    token: challenge_token.clone(),
                };
                trace!(server = %session.server, "sending challenge response");
                session.seal(&response)
            }
            Phase::Connected {
                client_index,
                max_slots,
            } => {
                if session.token.timeout_seconds >= 0 && now - session.last_receive >= NETCODE_TIMEOUT_SECONDS {
                    info!(server = %session.server, "connection timed out");
                    return Followup::Teardown(ClientState::ConnectionTimedOut);
                }
                if now - session.last_send < PACKET_SEND_INTERVAL {
                    return Followup::None;
                }
                let keep_alive = Packet::KeepAlive {
                    client_index: *client_index,
                    max_slots: *max_slots,
                };
                session.seal(&keep_alive)
            }
        };

        match packet {
            Ok(packet) => {
                session.last_send = now;
                self.output.push((session.server, packet));
            }
            Err(e) => warn!(error = %e, "failed to build handshake packet"),
        }
        Followup::None
    }

    fn apply(&mut self, followup: Followup, now: f64) {
        match followup {
            Followup::None => {}
            Followup::NextEndpoint => self.next_endpoint(now),
            Followup::Teardown(state) => self.teardown(state),
        }
    }

    fn next_endpoint(&mut self, now: f64) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(server) = session.remaining.pop_front() else {
            let pending = session.pending;
            self.teardown(pending);
            return;
        };

        debug!(from = %session.server, to = %server, "trying next server");
        session.server = server;
        session.phase = Phase::SendingRequest;
        session.last_send = f64::NEG_INFINITY;
        session.last_receive = now;
        session.replay.reset();
        self.endpoint_generation += 1;
        self.inbound.clear();
    }

    fn teardown(&mut self, state: ClientState) {
        if let Some(session) = self.session.take() {
            info!(server = %session.server, state = %state, "client stopped");
        }
        self.idle_state = state;
    }

    fn report_state(&mut self) {
        let state = self.state();
        if state != self.reported {
            self.reported = state;
            self.events.push(ClientEvent::StateChanged(state));
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("server", &self.server_addr())
            .field("time", &self.time)
            .finish_non_exhaustive()
    }
}
