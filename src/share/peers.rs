use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::scheduler::ConnectionId;

/// Listening endpoints of the peers sharing one transfer.
///
/// Every upload peer is told about every other peer with a known endpoint,
/// once, through `peer` messages.
#[derive(Debug, Default)]
pub(super) struct PeerBook {
    endpoints: BTreeMap<ConnectionId, (SocketAddr, usize)>,
    pending: BTreeMap<ConnectionId, VecDeque<SocketAddr>>,
}

impl PeerBook {
    /// Records the endpoint of a registering peer and queues it for every
    /// upload peer other than itself.
    fn add_endpoint(&mut self, connection: ConnectionId, endpoint: SocketAddr) {
        let known = self
            .endpoints
            .entry(connection)
            .or_insert((endpoint, 0));
        known.1 += 1;
        if known.1 > 1 {
            return;
        }
        for (&other, queue) in self.pending.iter_mut() {
            if other != connection {
                queue.push_back(endpoint);
            }
        }
    }

    fn remove_endpoint(&mut self, connection: ConnectionId) {
        if let Some(known) = self.endpoints.get_mut(&connection) {
            known.1 -= 1;
            if known.1 == 0 {
                self.endpoints.remove(&connection);
            }
        }
    }

    fn add_listener(&mut self, connection: ConnectionId) {
        let queue = self
            .endpoints
            .iter()
            .filter(|(&other, _)| other != connection)
            .map(|(_, &(endpoint, _))| endpoint)
            .collect();
        self.pending.insert(connection, queue);
    }

    pub(super) fn next_peer(&mut self, connection: ConnectionId) -> Option<SocketAddr> {
        self.pending.get_mut(&connection)?.pop_front()
    }
}

/// Keeps a connection's entries in a [`PeerBook`] alive.
#[derive(Debug)]
pub(super) struct PeerEntry {
    book: Arc<Mutex<PeerBook>>,
    connection: ConnectionId,
    endpoint: bool,
    listener: bool,
}

impl PeerEntry {
    pub(super) fn register(
        book: &Arc<Mutex<PeerBook>>,
        connection: ConnectionId,
        endpoint: Option<SocketAddr>,
        listener: bool,
    ) -> Self {
        let mut guard = book.lock();
        if listener {
            guard.add_listener(connection);
        }
        if let Some(endpoint) = endpoint {
            guard.add_endpoint(connection, endpoint);
        }
        drop(guard);

        Self {
            book: Arc::clone(book),
            connection,
            endpoint: endpoint.is_some(),
            listener,
        }
    }
}

impl Drop for PeerEntry {
    fn drop(&mut self) {
        let mut book = self.book.lock();
        if self.endpoint {
            book.remove_endpoint(self.connection);
        }
        if self.listener {
            book.pending.remove(&self.connection);
        }
    }
}
