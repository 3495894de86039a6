//! Abstract transport layer for netlane
//!
//! The [`Transport`] trait lets the actors run over any async datagram
//! transport addressed by `SocketAddr` (connect tokens carry IP endpoints).
//! With the `tokio` feature (on by default) two implementations ship:
//! [`UdpTransport`] over `tokio::net::UdpSocket`, and [`MemoryTransport`]
//! on an in-process [`MemoryNetwork`] that can add simulated latency, jitter,
//! loss and duplication.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

/// Async datagram transport.
pub trait Transport: Send + Sync + 'static {
    /// Send `buf` to `target`, returning the number of bytes written.
    fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr)
        -> impl Future<Output = io::Result<usize>> + Send + 'a;

    /// Receive a datagram into `buf`, returning `(bytes_read, source_address)`.
    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send + 'a;

    /// Return the local address this transport is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Creates transports; the client actor binds a fresh one for every server
/// endpoint it tries.
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: Transport;

    fn bind(&self, addr: SocketAddr) -> impl Future<Output = io::Result<Self::Transport>> + Send + '_;
}

// ---------------------------------------------------------------------------
// UdpTransport: tokio::net::UdpSocket
// ---------------------------------------------------------------------------

#[cfg(feature = "tokio")]
mod udp {
    use super::*;
    use tokio::net::UdpSocket;

    /// [`Transport`] wrapping a `tokio::net::UdpSocket`.
    pub struct UdpTransport {
        socket: UdpSocket,
    }

    impl UdpTransport {
        /// Bind a new UDP socket to `addr`.
        pub async fn bind(addr: impl tokio::net::ToSocketAddrs) -> io::Result<Self> {
            let socket = UdpSocket::bind(addr).await?;
            Ok(Self { socket })
        }

        /// Wrap an existing `UdpSocket`.
        pub fn new(socket: UdpSocket) -> Self {
            Self { socket }
        }
    }

    impl Transport for UdpTransport {
        async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
            self.socket.send_to(buf, target).await
        }

        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            self.socket.recv_from(buf).await
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.socket.local_addr()
        }
    }

    /// Binds [`UdpTransport`]s
    #[derive(Debug, Clone, Copy, Default)]
    pub struct UdpFactory;

    impl TransportFactory for UdpFactory {
        type Transport = UdpTransport;

        async fn bind(&self, addr: SocketAddr) -> io::Result<UdpTransport> {
            UdpTransport::bind(addr).await
        }
    }
}

#[cfg(feature = "tokio")]
pub use udp::{UdpFactory, UdpTransport};

// ---------------------------------------------------------------------------
// MemoryNetwork: in-process datagrams keyed by address
// ---------------------------------------------------------------------------

#[cfg(feature = "tokio")]
mod memory {
    use super::*;
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use dashmap::mapref::entry::Entry;
    use dashmap::DashMap;
    use tokio::sync::{mpsc, Mutex};
    use tracing::trace;

    use crate::sim::SimulatorConfig;

    type Inbox = mpsc::UnboundedSender<(SocketAddr, Bytes)>;

    const FIRST_EPHEMERAL_PORT: u16 = 49152;

    struct NetworkInner {
        endpoints: DashMap<SocketAddr, Inbox>,
        next_port: AtomicU16,
        impairment: SimulatorConfig,
    }

    /// Shared in-process network; clones refer to the same network.
    #[derive(Clone)]
    pub struct MemoryNetwork {
        inner: Arc<NetworkInner>,
    }

    impl Default for MemoryNetwork {
        fn default() -> Self {
            Self::with_impairment(SimulatorConfig::default())
        }
    }

    impl MemoryNetwork {
        pub fn new() -> Self {
            Self::default()
        }

        /// Every datagram goes through `impairment`; delayed copies are
        /// delivered by spawned timers.
        pub fn with_impairment(impairment: SimulatorConfig) -> Self {
            Self {
                inner: Arc::new(NetworkInner {
                    endpoints: DashMap::new(),
                    next_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
                    impairment,
                }),
            }
        }

        /// Number of bound transports
        pub fn len(&self) -> usize {
            self.inner.endpoints.len()
        }

        pub fn is_empty(&self) -> bool {
            self.inner.endpoints.is_empty()
        }

        /// Bind `addr`; port 0 picks a free ephemeral port.
        pub fn open(&self, addr: SocketAddr) -> io::Result<MemoryTransport> {
            let (tx, rx) = mpsc::unbounded_channel();
            let addr = if addr.port() == 0 {
                self.allocate(addr, tx)?
            } else {
                match self.inner.endpoints.entry(addr) {
                    Entry::Occupied(_) => {
                        return Err(io::Error::new(io::ErrorKind::AddrInUse, format!("{addr} already bound")))
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(tx);
                        addr
                    }
                }
            };
            Ok(MemoryTransport {
                addr,
                network: self.clone(),
                rx: Mutex::new(rx),
            })
        }

        fn allocate(&self, addr: SocketAddr, tx: Inbox) -> io::Result<SocketAddr> {
            for _ in 0..(u16::MAX - FIRST_EPHEMERAL_PORT) {
                let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
                let port = if port < FIRST_EPHEMERAL_PORT {
                    self.inner.next_port.store(FIRST_EPHEMERAL_PORT + 1, Ordering::Relaxed);
                    FIRST_EPHEMERAL_PORT
                } else {
                    port
                };
                let candidate = SocketAddr::new(addr.ip(), port);
                if let Entry::Vacant(slot) = self.inner.endpoints.entry(candidate) {
                    slot.insert(tx);
                    return Ok(candidate);
                }
            }
            Err(io::Error::new(io::ErrorKind::AddrInUse, "no free ports"))
        }

        fn deliver(&self, from: SocketAddr, to: SocketAddr, data: Bytes) {
            let Some(inbox) = self.inner.endpoints.get(&to).map(|entry| entry.value().clone()) else {
                trace!(from = %from, to = %to, "no transport bound, datagram lost");
                return;
            };
            if self.inner.impairment.is_perfect() {
                let _ = inbox.send((from, data));
                return;
            }

            let delays = self.inner.impairment.sample(&mut rand::thread_rng());
            for delay in delays {
                if delay <= 0.0 {
                    let _ = inbox.send((from, data.clone()));
                    continue;
                }
                let inbox = inbox.clone();
                let data = data.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                    let _ = inbox.send((from, data));
                });
            }
        }
    }

    impl TransportFactory for MemoryNetwork {
        type Transport = MemoryTransport;

        async fn bind(&self, addr: SocketAddr) -> io::Result<MemoryTransport> {
            self.open(addr)
        }
    }

    /// One bound address on a [`MemoryNetwork`]; unbinds on drop.
    pub struct MemoryTransport {
        addr: SocketAddr,
        network: MemoryNetwork,
        rx: Mutex<mpsc::UnboundedReceiver<(SocketAddr, Bytes)>>,
    }

    impl Transport for MemoryTransport {
        async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
            self.network.deliver(self.addr, target, Bytes::copy_from_slice(buf));
            Ok(buf.len())
        }

        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            let mut rx = self.rx.lock().await;
            match rx.recv().await {
                Some((from, data)) => {
                    let len = data.len().min(buf.len());
                    buf[..len].copy_from_slice(&data[..len]);
                    Ok((len, from))
                }
                None => Err(io::Error::new(io::ErrorKind::ConnectionAborted, "memory network closed")),
            }
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(self.addr)
        }
    }

    impl Drop for MemoryTransport {
        fn drop(&mut self) {
            self.network.inner.endpoints.remove(&self.addr);
        }
    }
}

#[cfg(feature = "tokio")]
pub use memory::{MemoryNetwork, MemoryTransport};
