//! In-memory connection for exercising the buffer server without sockets.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{next_connection_id, BufferServerError, Connection, ConnectionId};
use crate::protocol::{Data, DataKind, WindowId};

/// A [`Connection`] that records everything sent to it.
#[derive(Debug)]
pub struct RecordingConnection {
    id: ConnectionId,
    sent: Mutex<Vec<Arc<Data>>>,
    closed: AtomicBool,
    fail_sends: AtomicBool,
    backlog: AtomicUsize,
}

impl RecordingConnection {
    /// Creates a new open connection with a fresh id.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: next_connection_id(),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            backlog: AtomicUsize::new(0),
        })
    }

    /// Returns a copy of every item sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<Arc<Data>> {
        self.sent.lock().clone()
    }

    /// Returns the number of items sent so far.
    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Returns the window ids of the items sent so far.
    #[must_use]
    pub fn sent_windows(&self) -> Vec<WindowId> {
        self.sent.lock().iter().map(|d| d.window_id).collect()
    }

    /// Returns the payload bytes of the payload tuples sent so far.
    #[must_use]
    pub fn sent_payloads(&self) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .iter()
            .filter_map(|d| match &d.kind {
                DataKind::Payload { bytes, .. } => Some(bytes.to_vec()),
                _ => None,
            })
            .collect()
    }

    /// Makes subsequent sends fail as if the peer had gone away.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Release);
    }

    /// Overrides the reported backlog.
    pub fn set_backlog(&self, backlog: usize) {
        self.backlog.store(backlog, Ordering::Release);
    }
}

impl Connection for RecordingConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, data: &Arc<Data>) -> Result<(), BufferServerError> {
        if self.is_closed() || self.fail_sends.load(Ordering::Acquire) {
            return Err(BufferServerError::ConnectionClosed(self.id));
        }
        self.sent.lock().push(Arc::clone(data));
        Ok(())
    }

    fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
