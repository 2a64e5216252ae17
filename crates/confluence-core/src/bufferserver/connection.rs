//! The transport seam between the buffer server and its connections.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::BufferServerError;
use crate::protocol::Data;

/// Process-unique connection identity.
pub type ConnectionId = u64;

/// Shared handle to a live connection.
pub type ConnectionRef = Arc<dyn Connection>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a fresh [`ConnectionId`].
#[must_use]
pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// A physical connection as seen by the buffer server.
///
/// Implementations must not block in [`send`](Connection::send): the call is
/// made while a subscriber group holds its cursor. The TCP transport queues
/// the frame for a per-connection writer task and returns immediately.
///
/// [`close`](Connection::close) is forceful and idempotent. The transport is
/// expected to report the closed connection back through
/// [`ServerHandler::channel_disconnected`](super::ServerHandler::channel_disconnected).
pub trait Connection: Send + Sync + fmt::Debug {
    /// Returns the connection identity.
    fn id(&self) -> ConnectionId;

    /// Queues a data item for delivery (best effort).
    ///
    /// # Errors
    ///
    /// Returns [`BufferServerError::ConnectionClosed`] if the connection can no
    /// longer deliver.
    fn send(&self, data: &Arc<Data>) -> Result<(), BufferServerError>;

    /// Number of queued items not yet written to the peer.
    fn backlog(&self) -> usize;

    /// Closes the connection without draining queued items.
    fn close(&self);

    /// Returns true once [`close`](Connection::close) was called or the peer went away.
    fn is_closed(&self) -> bool;
}
