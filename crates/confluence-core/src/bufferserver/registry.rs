//! Connection bookkeeping: identifier registries and the live connection group.
//!
//! [`ConnectionRegistry`] maps a logical identifier (publisher or subscriber
//! name) to the connection currently speaking for it. It exists only to spot
//! a stale duplicate when the same identifier reconnects; the previous
//! connection is handed back to the caller, which closes it.
//!
//! Two indices keep both directions O(1):
//! - `by_identifier`: identifier → connection
//! - `by_connection`: connection id → identifier (disconnect cleanup)

use fxhash::FxHashMap;
use parking_lot::Mutex;

use super::{ConnectionId, ConnectionRef};

#[derive(Default)]
struct RegistryIndex {
    by_identifier: FxHashMap<String, ConnectionRef>,
    by_connection: FxHashMap<ConnectionId, String>,
}

/// Identifier → live connection map with a reverse index.
#[derive(Default)]
pub struct ConnectionRegistry {
    index: Mutex<RegistryIndex>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `connection` as the live connection for `identifier`.
    ///
    /// Returns the previously recorded connection if it is a different one;
    /// the caller is expected to close it.
    pub fn register(&self, identifier: &str, connection: ConnectionRef) -> Option<ConnectionRef> {
        let mut index = self.index.lock();
        let id = connection.id();

        // A connection speaks for a single identifier.
        if let Some(old_identifier) = index.by_connection.insert(id, identifier.to_string()) {
            if old_identifier != identifier {
                index.by_identifier.remove(&old_identifier);
            }
        }

        let previous = index.by_identifier.insert(identifier.to_string(), connection)?;
        if previous.id() == id {
            return None;
        }
        index.by_connection.remove(&previous.id());
        Some(previous)
    }

    /// Removes whatever identifier `connection_id` is recorded under.
    ///
    /// Returns the identifier, or `None` if the connection was not (or no
    /// longer) the live one for any identifier.
    pub fn remove_connection(&self, connection_id: ConnectionId) -> Option<String> {
        let mut index = self.index.lock();
        let identifier = index.by_connection.remove(&connection_id)?;
        index.by_identifier.remove(&identifier);
        Some(identifier)
    }

    /// Returns the live connection for `identifier`.
    #[must_use]
    pub fn get(&self, identifier: &str) -> Option<ConnectionRef> {
        self.index.lock().by_identifier.get(identifier).cloned()
    }

    /// Returns the number of registered identifiers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.lock().by_identifier.len()
    }

    /// Returns true if no identifier is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("len", &self.len())
            .finish()
    }
}

/// Every connection currently open on the server, used for bulk shutdown.
#[derive(Default)]
pub struct ConnectionGroup {
    connections: Mutex<FxHashMap<ConnectionId, ConnectionRef>>,
}

impl ConnectionGroup {
    /// Creates an empty group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection.
    pub fn add(&self, connection: ConnectionRef) {
        self.connections.lock().insert(connection.id(), connection);
    }

    /// Removes a connection; returns true if it was present.
    pub fn remove(&self, connection_id: ConnectionId) -> bool {
        self.connections.lock().remove(&connection_id).is_some()
    }

    /// Closes every connection in the group and returns how many were closed.
    pub fn close_all(&self) -> usize {
        let connections: Vec<ConnectionRef> =
            self.connections.lock().drain().map(|(_, c)| c).collect();
        for connection in &connections {
            connection.close();
        }
        connections.len()
    }

    /// Returns the number of connections in the group.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    /// Returns true if the group is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ConnectionGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGroup")
            .field("len", &self.len())
            .finish()
    }
}
