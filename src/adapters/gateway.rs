//! Engine-side client registry.
//!
//! Maps each registered [`ClientKey`] to the connection currently holding it
//! and that connection's outbound queue. Only the engine task touches it.

use super::{ClientKey, Envelope};
use crate::net::tcp::ConnectionId;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

struct Route {
    conn: ConnectionId,
    outbound: mpsc::UnboundedSender<Envelope>,
}

/// Registered clients and their outbound queues.
#[derive(Default)]
pub struct Gateway {
    routes: BTreeMap<ClientKey, Route>,
}

impl Gateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection to `key`. Returns the connection that previously
    /// held the key, which is evicted by dropping its queue.
    pub fn attach(
        &mut self,
        key: ClientKey,
        conn: ConnectionId,
        outbound: mpsc::UnboundedSender<Envelope>,
    ) -> Option<ConnectionId> {
        let previous = self.routes.insert(key.clone(), Route { conn, outbound });
        match previous {
            Some(old) if old.conn != conn => {
                tracing::info!(client = %key, old = %old.conn, new = %conn, "evicting previous connection");
                Some(old.conn)
            }
            _ => None,
        }
    }

    /// Detach `key` if `conn` still holds it. Returns false for a stale
    /// connection that was already replaced.
    pub fn detach(&mut self, key: &ClientKey, conn: ConnectionId) -> bool {
        match self.routes.get(key) {
            Some(route) if route.conn == conn => {
                self.routes.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Whether `conn` is the live connection for `key`.
    pub fn is_current(&self, key: &ClientKey, conn: ConnectionId) -> bool {
        self.routes.get(key).is_some_and(|route| route.conn == conn)
    }

    pub fn is_connected(&self, key: &ClientKey) -> bool {
        self.routes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Queue an envelope for one client. Unknown clients are logged and
    /// skipped.
    pub fn send(&self, key: &ClientKey, envelope: Envelope) -> bool {
        let Some(route) = self.routes.get(key) else {
            tracing::debug!(client = %key, channel = envelope.channel, "dropping message for unknown client");
            return false;
        };
        if route.outbound.send(envelope).is_err() {
            tracing::debug!(client = %key, "outbound queue closed");
            return false;
        }
        true
    }

    /// Queue an envelope for every client accepted by `filter`.
    pub fn broadcast<F>(&self, envelope: &Envelope, mut filter: F) -> usize
    where
        F: FnMut(&ClientKey) -> bool,
    {
        let mut sent = 0;
        for (key, route) in &self.routes {
            if !filter(key) {
                continue;
            }
            if route.outbound.send(envelope.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Drop every queue, closing all connections.
    pub fn clear(&mut self) {
        self.routes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{Channel, Command};
    use crate::store::ClientKind;
    use serde_json::json;

    fn env() -> Envelope {
        Envelope::new(Channel::Plot, Command::Request, json!([]))
    }

    #[test]
    fn test_attach_evicts_previous() {
        let mut gateway = Gateway::new();
        let key = ClientKey::new("tab", ClientKind::Web);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        assert_eq!(gateway.attach(key.clone(), ConnectionId(1), tx1), None);
        assert_eq!(gateway.attach(key.clone(), ConnectionId(2), tx2), Some(ConnectionId(1)));

        // The first queue is closed; the second receives.
        assert!(rx1.try_recv().is_err());
        assert!(gateway.send(&key, env()));
        assert_eq!(rx2.try_recv().unwrap(), env());
        assert!(matches!(
            rx1.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_stale_detach_ignored() {
        let mut gateway = Gateway::new();
        let key = ClientKey::new("hl2", ClientKind::Ar);
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        gateway.attach(key.clone(), ConnectionId(1), tx1);
        gateway.attach(key.clone(), ConnectionId(2), tx2);

        assert!(!gateway.detach(&key, ConnectionId(1)));
        assert!(gateway.is_current(&key, ConnectionId(2)));
        assert!(gateway.detach(&key, ConnectionId(2)));
        assert!(gateway.is_empty());
    }

    #[test]
    fn test_broadcast_filter() {
        let mut gateway = Gateway::new();
        let a = ClientKey::new("a", ClientKind::Ar);
        let b = ClientKey::new("b", ClientKind::Web);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        gateway.attach(a.clone(), ConnectionId(1), tx_a);
        gateway.attach(b.clone(), ConnectionId(2), tx_b);

        assert_eq!(gateway.broadcast(&env(), |key| key != &a), 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), env());
        assert!(!gateway.send(&ClientKey::new("c", ClientKind::Web), env()));
    }
}
