//! Handshake runs over the simulated network: perfect and lossy links,
//! denial, endpoint fallback, timeouts, disconnects and keep-alive liveness.

mod common;

use common::{server_addr, token, unreachable_addr, World, START};
use netlane::{ClientLinkEvent, ClientState, DisconnectReason, ServerLinkEvent, SimulatorConfig};

fn disconnect_reasons(world: &World) -> Vec<DisconnectReason> {
    world
        .server_events
        .iter()
        .filter_map(|event| match event {
            ServerLinkEvent::ClientDisconnected { reason, .. } => Some(*reason),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Connecting
// ---------------------------------------------------------------------------

#[test]
fn test_handshake_perfect_network() {
    let mut world = World::new(4, SimulatorConfig::new());
    let client = world.add_client();
    world.connect(client, &token(42, &[server_addr()], 5));
    assert_eq!(world.client_state(client), ClientState::SendingConnectionRequest);

    assert!(world.run_until(1.0, |w| w.fully_connected(client)));
    assert!(world.now - START < 0.5, "handshake took {:.3}s", world.now - START);

    let states: Vec<_> = world.clients[client]
        .events
        .iter()
        .filter_map(|event| match event {
            ClientLinkEvent::StateChanged(state) => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ClientState::SendingConnectionRequest,
            ClientState::SendingChallengeResponse,
            ClientState::Connected
        ]
    );
    assert!(world.clients[client]
        .events
        .contains(&ClientLinkEvent::Connected { client_index: 0 }));
    assert_eq!(
        world.server_events,
        vec![ServerLinkEvent::ClientConnected {
            client_index: 0,
            client_id: 42,
            address: world.clients[client].addr,
        }]
    );
    assert_eq!(world.clients[client].link.client().max_slots(), Some(4));
}

#[test]
fn test_handshake_lossy_network() {
    let network = SimulatorConfig::new()
        .latency_ms(40.0)
        .jitter_ms(20.0)
        .packet_loss(0.3)
        .duplicate(0.1);
    let mut world = World::new(8, network);
    assert!(world.connect_clients(4));

    let mut slots: Vec<_> = (0..4).map(|c| world.server_slot(c).unwrap()).collect();
    slots.sort_unstable();
    assert_eq!(slots, vec![0, 1, 2, 3]);
    assert_eq!(world.server.server().num_connected_clients(), 4);
}

#[test]
fn test_distinct_slots_match_client_index() {
    let mut world = World::new(4, SimulatorConfig::new());
    assert!(world.connect_clients(3));
    for client in 0..3 {
        let index = world.clients[client].link.client().client_index().unwrap();
        assert_eq!(world.server_slot(client), Some(index as usize));
    }
}

#[test]
fn test_full_server_denies() {
    let mut world = World::new(1, SimulatorConfig::new());
    assert!(world.connect_clients(1));

    let late = world.add_client();
    world.connect(late, &token(99, &[server_addr()], 5));
    assert!(world.run_until(2.0, |w| w.client_state(late).is_error()));
    assert_eq!(world.client_state(late), ClientState::ConnectionDenied);
    assert!(world.fully_connected(0));
}

#[test]
fn test_falls_back_to_next_server() {
    let mut world = World::new(4, SimulatorConfig::new());
    let client = world.add_client();
    world.connect(client, &token(1, &[unreachable_addr(), server_addr()], 1));

    world.run_for(0.5);
    assert_eq!(world.clients[client].link.client().server_addr(), Some(unreachable_addr()));

    assert!(world.run_until(3.0, |w| w.fully_connected(client)));
    assert_eq!(world.clients[client].link.client().server_addr(), Some(server_addr()));
}

// ---------------------------------------------------------------------------
// Failures and timeouts
// ---------------------------------------------------------------------------

#[test]
fn test_request_times_out_without_server() {
    let mut world = World::new(4, SimulatorConfig::new());
    let client = world.add_client();
    world.connect(client, &token(1, &[unreachable_addr()], 1));

    world.run_for(0.9);
    assert_eq!(world.client_state(client), ClientState::SendingConnectionRequest);
    world.run_for(0.2);
    assert_eq!(world.client_state(client), ClientState::ConnectionRequestTimedOut);
}

#[test]
fn test_token_expires_while_connecting() {
    let mut world = World::new(4, SimulatorConfig::new());
    let client = world.add_client();
    let data = common::token_factory()
        .generate_at(
            START as u64,
            &netlane::TokenRequest {
                client_id: 1,
                server_addresses: &[unreachable_addr()],
                expire_seconds: 2,
                timeout_seconds: -1,
                sequence: 1,
                user_data: &[],
            },
        )
        .unwrap();
    world.connect(client, &data);

    world.run_for(1.5);
    assert_eq!(world.client_state(client), ClientState::SendingConnectionRequest);
    world.run_for(1.0);
    assert_eq!(world.client_state(client), ClientState::ConnectTokenExpired);
}

#[test]
fn test_client_times_out_when_server_goes_silent() {
    let mut world = World::new(4, SimulatorConfig::new());
    assert!(world.connect_clients(1));

    world.server_paused = true;
    world.run_for(4.5);
    assert_eq!(world.client_state(0), ClientState::Connected);
    world.run_for(1.0);
    assert_eq!(world.client_state(0), ClientState::ConnectionTimedOut);
    assert!(world.clients[0]
        .events
        .contains(&ClientLinkEvent::Disconnected(ClientState::ConnectionTimedOut)));
}

#[test]
fn test_server_times_out_silent_client() {
    let mut world = World::new(4, SimulatorConfig::new());
    assert!(world.connect_clients(1));

    world.clients[0].paused = true;
    assert!(world.run_until(6.0, |w| w.server.connected_clients().is_empty()));
    assert_eq!(disconnect_reasons(&world), vec![DisconnectReason::TimedOut]);
    assert_eq!(world.server.server().num_connected_clients(), 0);
}

// ---------------------------------------------------------------------------
// Disconnects and liveness
// ---------------------------------------------------------------------------

#[test]
fn test_client_disconnect_reaches_server() {
    let mut world = World::new(4, SimulatorConfig::new());
    assert!(world.connect_clients(1));

    world.clients[0].link.disconnect();
    assert_eq!(world.client_state(0), ClientState::Disconnected);
    assert!(world.run_until(1.0, |w| w.server.connected_clients().is_empty()));
    assert_eq!(disconnect_reasons(&world), vec![DisconnectReason::ClientDisconnected]);
}

#[test]
fn test_kick_reaches_client() {
    let mut world = World::new(4, SimulatorConfig::new());
    assert!(world.connect_clients(1));
    let slot = world.server_slot(0).unwrap();

    world.server.disconnect_client(slot).unwrap();
    world.server_events.extend(world.server.drain_events());
    assert_eq!(disconnect_reasons(&world), vec![DisconnectReason::Kicked]);

    assert!(world.run_until(1.0, |w| w.client_state(0) == ClientState::Disconnected));
    assert!(world.clients[0]
        .events
        .contains(&ClientLinkEvent::Disconnected(ClientState::Disconnected)));
    assert!(world.server.disconnect_client(slot).is_err());
}

#[test]
fn test_keep_alives_hold_idle_connection() {
    let mut world = World::new(4, SimulatorConfig::new().latency_ms(50.0).packet_loss(0.1));
    assert!(world.connect_clients(2));

    world.run_for(20.0);
    assert!(world.fully_connected(0));
    assert!(world.fully_connected(1));
    assert!(disconnect_reasons(&world).is_empty());
}

#[test]
fn test_reconnect_after_disconnect() {
    let mut world = World::new(4, SimulatorConfig::new());
    assert!(world.connect_clients(1));

    world.clients[0].link.disconnect();
    assert!(world.run_until(1.0, |w| w.server.connected_clients().is_empty()));

    world.connect(0, &token(7, &[server_addr()], 5));
    assert!(world.run_until(2.0, |w| w.fully_connected(0)));
}
