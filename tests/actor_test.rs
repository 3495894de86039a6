//! Actors end to end on the tokio runtime, over the in-memory network and
//! loopback UDP.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use netlane::{
    spawn_client, spawn_server, ClientConfig, ClientHandle, ClientLinkEvent, ClientState, DisconnectReason,
    MemoryNetwork, QosType, ServerConfig, ServerHandle, ServerLinkEvent, SimulatorConfig, TokenFactory, TokenRequest,
    TransportFactory, UdpFactory,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const PROTOCOL_ID: u64 = 0xfeed_0001;
const KEY: [u8; 32] = [3u8; 32];

fn token(client_id: u64, server: SocketAddr) -> Bytes {
    TokenFactory::new(PROTOCOL_ID, KEY)
        .generate(&TokenRequest {
            client_id,
            server_addresses: &[server],
            expire_seconds: 30,
            timeout_seconds: 5,
            sequence: client_id,
            user_data: &[],
        })
        .unwrap()
}

/// Wait up to five seconds for an event matching `want`
async fn wait_for<T>(events: &mut mpsc::Receiver<T>, mut want: impl FnMut(&T) -> bool) -> T {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if want(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn start<F: TransportFactory + Clone>(
    factory: F,
    bind: SocketAddr,
) -> (
    ServerHandle,
    mpsc::Receiver<ServerLinkEvent>,
    ClientHandle,
    mpsc::Receiver<ClientLinkEvent>,
) {
    let config = ServerConfig::new(PROTOCOL_ID, KEY, bind).tickrate(100);
    let (server, server_events) = spawn_server(config, factory.clone()).await.unwrap();
    let client_config = ClientConfig::new(PROTOCOL_ID)
        .bind_address("127.0.0.1:0".parse().unwrap())
        .tickrate(100);
    let (client, client_events) = spawn_client(client_config, factory).unwrap();
    (server, server_events, client, client_events)
}

/// Connect, then exchange one reliable message each way
async fn ping_pong(
    server: &ServerHandle,
    server_events: &mut mpsc::Receiver<ServerLinkEvent>,
    client: &ClientHandle,
    client_events: &mut mpsc::Receiver<ClientLinkEvent>,
) -> usize {
    client.connect(token(11, server.local_addr())).await.unwrap();
    wait_for(client_events, |e| matches!(e, ClientLinkEvent::Connected { .. })).await;
    assert_eq!(client.state().await.unwrap(), ClientState::Connected);

    let ServerLinkEvent::ClientConnected { client_index, client_id, .. } =
        wait_for(server_events, |e| matches!(e, ServerLinkEvent::ClientConnected { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(client_id, 11);

    client.send(QosType::Reliable, &b"ping"[..]).await.unwrap();
    let ServerLinkEvent::Message { message, .. } =
        wait_for(server_events, |e| matches!(e, ServerLinkEvent::Message { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(message.payload, Bytes::from_static(b"ping"));

    server.send(client_index, QosType::Reliable, &b"pong"[..]).await.unwrap();
    let ClientLinkEvent::Message(message) =
        wait_for(client_events, |e| matches!(e, ClientLinkEvent::Message(_))).await
    else {
        unreachable!()
    };
    assert_eq!(message.payload, Bytes::from_static(b"pong"));
    client_index
}

#[tokio::test]
async fn test_actors_over_memory_network() {
    let network = MemoryNetwork::new();
    let (server, mut server_events, client, mut client_events) =
        start(network.clone(), "127.0.0.1:40000".parse().unwrap()).await;

    let client_index = ping_pong(&server, &mut server_events, &client, &mut client_events).await;
    assert_eq!(server.connected_clients().await.unwrap(), vec![client_index]);
    assert!(server.telemetry(client_index).await.unwrap().is_some());
    assert!(client.metrics().messages_received >= 1);

    client.disconnect().await.unwrap();
    let event = wait_for(&mut server_events, |e| matches!(e, ServerLinkEvent::ClientDisconnected { .. })).await;
    assert_eq!(
        event,
        ServerLinkEvent::ClientDisconnected {
            client_index,
            client_id: 11,
            reason: DisconnectReason::ClientDisconnected,
        }
    );
    assert_eq!(client.state().await.unwrap(), ClientState::Disconnected);

    server.close();
    client.close();
}

#[tokio::test]
async fn test_actors_over_lossy_memory_network() {
    let network = MemoryNetwork::with_impairment(SimulatorConfig::new().latency_ms(10.0).packet_loss(0.2));
    let (server, mut server_events, client, mut client_events) =
        start(network, "127.0.0.1:40001".parse().unwrap()).await;
    ping_pong(&server, &mut server_events, &client, &mut client_events).await;
}

#[tokio::test]
async fn test_actors_over_udp_loopback() {
    let (server, mut server_events, client, mut client_events) =
        start(UdpFactory, "127.0.0.1:0".parse().unwrap()).await;
    assert_ne!(server.local_addr().port(), 0);

    let client_index = ping_pong(&server, &mut server_events, &client, &mut client_events).await;
    server.disconnect_client(client_index).await.unwrap();
    wait_for(&mut client_events, |e| {
        *e == ClientLinkEvent::Disconnected(ClientState::Disconnected)
    })
    .await;
    assert!(server.metrics().packets_sent > 0);
}

#[tokio::test]
async fn test_invalid_token_reported_as_state() {
    let network = MemoryNetwork::new();
    let (client, mut events) = spawn_client(ClientConfig::new(PROTOCOL_ID), network).unwrap();
    client.connect(vec![0u8; 16]).await.unwrap();
    let event = wait_for(&mut events, |e| matches!(e, ClientLinkEvent::StateChanged(_))).await;
    assert_eq!(event, ClientLinkEvent::StateChanged(ClientState::InvalidConnectToken));
    assert!(client.send(QosType::Reliable, &b"x"[..]).await.is_err());
}

#[tokio::test]
async fn test_closed_handle_reports_closed() {
    let network = MemoryNetwork::new();
    let (client, _events) = spawn_client(ClientConfig::new(PROTOCOL_ID), network).unwrap();
    client.close();
    let err = client.state().await.unwrap_err();
    assert!(err.is_closed());
}
