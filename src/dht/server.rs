use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use super::config::DhtConfig;
use super::dispatch::PacketDispatcher;
use super::engine::{DhtEngine, SendFlags, Transport};
use super::error::DhtError;
use super::Tick;
use crate::constants::{OUTBOUND_QUEUE_SIZE, TICK_MILLIS};

type Datagram = (Vec<u8>, SocketAddr);

/// Queues datagrams for the server loop; a full queue drops them.
struct UdpTransport {
    outbound: mpsc::Sender<Datagram>,
}

impl Transport for UdpTransport {
    fn send(&self, buf: &[u8], dest: SocketAddr, flags: SendFlags) -> bool {
        match self.outbound.try_send((buf.to_vec(), dest)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if !flags.contains(SendFlags::DROPPABLE) {
                    debug!("Outbound queue full, dropping datagram to {}", dest);
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Runs a [`DhtEngine`] over a UDP socket.
///
/// One task owns the receive loop and the tick timer; everything else goes
/// through the shared engine.
///
/// # Examples
///
/// ```no_run
/// use swarmdht::dht::{DhtConfig, DhtServer, NodeAddress, SwarmConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let server = DhtServer::bind("0.0.0.0:6881".parse()?, DhtConfig::default()).await?;
/// let engine = server.engine().clone();
/// engine.join_swarm(NodeAddress::from_content(b"chat"), SwarmConfig::default(), 0)?;
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct DhtServer {
    socket: UdpSocket,
    engine: Arc<DhtEngine>,
    dispatcher: PacketDispatcher,
    outbound: Mutex<mpsc::Receiver<Datagram>>,
    clock: AtomicU64,
}

impl DhtServer {
    /// Binds `addr` and builds an engine from `config`. A zero `udp_port`
    /// is replaced with the bound port.
    pub async fn bind(addr: SocketAddr, mut config: DhtConfig) -> Result<Self, DhtError> {
        let socket = UdpSocket::bind(addr).await?;
        if config.udp_port == 0 {
            config.udp_port = socket.local_addr()?.port();
        }
        Self::from_socket(socket, |transport| DhtEngine::new(config, transport))
    }

    /// Binds `addr` and lets `build` construct the engine around the socket's
    /// transport, for callers that want events or a bootstrap store.
    pub async fn bind_with(
        addr: SocketAddr,
        build: impl FnOnce(Arc<dyn Transport>) -> DhtEngine,
    ) -> Result<Self, DhtError> {
        let socket = UdpSocket::bind(addr).await?;
        Self::from_socket(socket, build)
    }

    fn from_socket(
        socket: UdpSocket,
        build: impl FnOnce(Arc<dyn Transport>) -> DhtEngine,
    ) -> Result<Self, DhtError> {
        let local_addr = socket.local_addr()?;
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let transport = Arc::new(UdpTransport { outbound: tx });
        let engine = Arc::new(build(transport));
        let dispatcher = PacketDispatcher::for_engine(Arc::clone(&engine));

        info!("DHT server bound to {} with id {}", local_addr, engine.own_address());

        Ok(Self {
            socket,
            engine,
            dispatcher,
            outbound: Mutex::new(rx),
            clock: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DhtError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn engine(&self) -> &Arc<DhtEngine> {
        &self.engine
    }

    /// Ticks elapsed since [`run`](Self::run) started.
    pub fn now(&self) -> Tick {
        self.clock.load(Ordering::Relaxed)
    }

    /// Receives, sends and ticks until the socket fails.
    ///
    /// Datagrams the engine queued before this call go out once the loop starts.
    pub async fn run(&self) -> Result<(), DhtError> {
        let mut outbound = self.outbound.lock().await;
        let mut buf = vec![0u8; 65535];
        let mut ticker = tokio::time::interval(Duration::from_millis(TICK_MILLIS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    let (n, addr) = result?;
                    if !self.dispatcher.dispatch(&buf[..n], addr, self.now()) {
                        trace!("Unhandled datagram of {} bytes from {}", n, addr);
                    }
                }
                Some((data, dest)) = outbound.recv() => {
                    if let Err(e) = self.socket.send_to(&data, dest).await {
                        debug!("UDP send to {} failed: {}", dest, e);
                    }
                }
                _ = ticker.tick() => {
                    let now = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
                    self.engine.tick(now);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::network::{AddressFamily, NetworkAddress};

    fn loopback() -> DhtConfig {
        DhtConfig {
            families: vec![AddressFamily::V4],
            ..DhtConfig::default()
        }
    }

    #[tokio::test]
    async fn test_two_servers_find_each_other() {
        let a = Arc::new(DhtServer::bind("127.0.0.1:0".parse().unwrap(), loopback()).await.unwrap());
        let b = Arc::new(DhtServer::bind("127.0.0.1:0".parse().unwrap(), loopback()).await.unwrap());
        assert_eq!(b.engine().config().udp_port, b.local_addr().unwrap().port());

        // Queued before either loop runs.
        let b_addr = NetworkAddress::from(b.local_addr().unwrap());
        assert!(a.engine().add_node(b_addr, a.now()).unwrap());

        let run_a = tokio::spawn({
            let a = Arc::clone(&a);
            async move { a.run().await }
        });
        let run_b = tokio::spawn({
            let b = Arc::clone(&b);
            async move { b.run().await }
        });

        let mut found = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let table = a.engine().routing_table(AddressFamily::V4).unwrap();
            if table.node_count() >= 1 {
                found = true;
                break;
            }
        }
        assert!(found, "server A never learned about server B");
        assert!(a.engine().stats().snapshot().packets_in >= 1);

        run_a.abort();
        run_b.abort();
    }
}
