use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::trace;

use super::engine::DhtEngine;
use super::Tick;

/// Consumer of inbound datagrams for one protocol.
pub trait PacketHandler: Send + Sync {
    /// Returns false when the datagram turned out not to be for this handler.
    fn handle(&self, data: &[u8], from: SocketAddr, now: Tick) -> bool;
}

/// Routes datagrams sharing one socket by their first byte.
///
/// Datagrams whose tag nobody registered go to the fallback handler, which is
/// how obfuscated DHT packets (random first byte) find the engine.
#[derive(Default)]
pub struct PacketDispatcher {
    handlers: HashMap<u8, Arc<dyn PacketHandler>>,
    fallback: Option<Arc<dyn PacketHandler>>,
}

impl PacketDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dispatcher with `engine` claiming `d`, or every unclaimed tag when
    /// the engine expects obfuscated headers.
    pub fn for_engine(engine: Arc<DhtEngine>) -> Self {
        let mut dispatcher = Self::new();
        if engine.config().obfuscate {
            dispatcher.set_fallback(engine);
        } else {
            dispatcher.register(b'd', engine);
        }
        dispatcher
    }

    /// Registers `handler` for `tag`, returning the handler it replaced.
    pub fn register(&mut self, tag: u8, handler: Arc<dyn PacketHandler>) -> Option<Arc<dyn PacketHandler>> {
        self.handlers.insert(tag, handler)
    }

    pub fn set_fallback(&mut self, handler: Arc<dyn PacketHandler>) {
        self.fallback = Some(handler);
    }

    pub fn dispatch(&self, data: &[u8], from: SocketAddr, now: Tick) -> bool {
        let Some(tag) = data.first() else {
            return false;
        };
        let handled = match self.handlers.get(tag) {
            Some(handler) => handler.handle(data, from, now),
            None => false,
        };
        if handled {
            return true;
        }
        match &self.fallback {
            Some(fallback) => fallback.handle(data, from, now),
            None => {
                trace!("No handler for datagram tag {:#04x} from {}", tag, from);
                false
            }
        }
    }
}

impl PacketHandler for DhtEngine {
    fn handle(&self, data: &[u8], from: SocketAddr, now: Tick) -> bool {
        self.handle_packet(data, from, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        hits: AtomicUsize,
        accept: bool,
    }

    impl PacketHandler for Counter {
        fn handle(&self, _data: &[u8], _from: SocketAddr, _now: Tick) -> bool {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.accept
        }
    }

    fn counter(accept: bool) -> Arc<Counter> {
        Arc::new(Counter {
            hits: AtomicUsize::new(0),
            accept,
        })
    }

    #[test]
    fn test_dispatch_by_tag_then_fallback() {
        let from: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let tagged = counter(false);
        let fallback = counter(true);
        let mut dispatcher = PacketDispatcher::new();
        dispatcher.register(b'x', tagged.clone());

        assert!(!dispatcher.dispatch(b"", from, 0));
        assert!(!dispatcher.dispatch(b"y", from, 0));

        dispatcher.set_fallback(fallback.clone());
        assert!(dispatcher.dispatch(b"x1", from, 0));
        assert!(dispatcher.dispatch(b"z1", from, 0));
        assert_eq!(tagged.hits.load(Ordering::Relaxed), 1);
        assert_eq!(fallback.hits.load(Ordering::Relaxed), 2);
    }
}
