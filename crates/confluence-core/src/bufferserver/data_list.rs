//! Per-publisher append-only buffer with independent read cursors.
//!
//! A [`DataList`] holds every tuple a publisher has appended, in append order,
//! until it is purged. Each subscriber group reads it through its own
//! [`DataListIterator`]; listeners registered with
//! [`add_data_listener`](DataList::add_data_listener) are woken after every
//! append, synchronously and in registration order.
//!
//! Positions are absolute: the first tuple ever appended is position 0 and
//! positions survive purging. Purging never drops a tuple that some cursor has
//! not yet read.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::protocol::{Data, WindowId};

/// Receives a callback after each append to a [`DataList`].
pub trait DataListener: Send + Sync {
    /// Called after `data` became visible to every cursor.
    ///
    /// Invoked without the list's lock held.
    fn data_added(&self, data: &Arc<Data>);
}

/// Extracts window and partition information from a buffered tuple.
pub trait DataInspector: Send + Sync {
    /// Window the tuple belongs to.
    fn window_id(&self, data: &Data) -> WindowId;

    /// Partition key of a payload tuple; `None` for control tuples.
    fn partition<'a>(&self, data: &'a Data) -> Option<&'a [u8]>;
}

/// Reads window and partition straight from the decoded tuple.
#[derive(Debug, Default, Clone, Copy)]
pub struct TupleInspector;

impl DataInspector for TupleInspector {
    fn window_id(&self, data: &Data) -> WindowId {
        data.window_id
    }

    fn partition<'a>(&self, data: &'a Data) -> Option<&'a [u8]> {
        data.partition()
    }
}

type CursorId = u64;

#[derive(Debug)]
struct Cursor {
    consumer: String,
    position: u64,
}

struct ListState {
    /// Absolute position of `items[0]`.
    base: u64,
    items: VecDeque<Arc<Data>>,
    cursors: FxHashMap<CursorId, Cursor>,
    next_cursor: CursorId,
    listeners: Arc<Vec<Arc<dyn DataListener>>>,
}

impl ListState {
    fn tail(&self) -> u64 {
        self.base + self.items.len() as u64
    }

    fn min_cursor(&self) -> Option<u64> {
        self.cursors.values().map(|c| c.position).min()
    }
}

/// Append-only tuple buffer for one publisher identifier.
pub struct DataList {
    identifier: String,
    stream_type: String,
    state: Mutex<ListState>,
}

impl DataList {
    /// Creates an empty list.
    #[must_use]
    pub fn new(identifier: impl Into<String>, stream_type: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            stream_type: stream_type.into(),
            state: Mutex::new(ListState {
                base: 0,
                items: VecDeque::new(),
                cursors: FxHashMap::default(),
                next_cursor: 0,
                listeners: Arc::new(Vec::new()),
            }),
        }
    }

    /// Publisher identifier this list buffers.
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Stream type recorded when the list was created.
    #[must_use]
    pub fn stream_type(&self) -> &str {
        &self.stream_type
    }

    /// Appends a tuple and notifies every listener.
    ///
    /// Returns the tuple's absolute position.
    pub fn append(&self, data: Data) -> u64 {
        let data = Arc::new(data);
        let (position, listeners) = {
            let mut state = self.state.lock();
            let position = state.tail();
            state.items.push_back(Arc::clone(&data));
            (position, Arc::clone(&state.listeners))
        };

        for listener in listeners.iter() {
            listener.data_added(&data);
        }
        position
    }

    /// Creates a cursor positioned at the current tail.
    ///
    /// The cursor sees every tuple appended after this call. Use
    /// [`DataListIterator::seek_window`] to move it back over buffered history.
    #[must_use]
    pub fn new_iterator(
        self: &Arc<Self>,
        consumer: impl Into<String>,
        inspector: Arc<dyn DataInspector>,
    ) -> DataListIterator {
        let mut state = self.state.lock();
        let id = state.next_cursor;
        state.next_cursor += 1;
        let position = state.tail();
        state.cursors.insert(
            id,
            Cursor {
                consumer: consumer.into(),
                position,
            },
        );
        DataListIterator {
            list: Arc::clone(self),
            id,
            inspector,
        }
    }

    /// Removes a cursor. Dropping the iterator has the same effect.
    pub fn del_iterator(&self, iterator: DataListIterator) {
        drop(iterator);
    }

    /// Registers a listener. Listeners are notified in registration order.
    pub fn add_data_listener(&self, listener: Arc<dyn DataListener>) {
        let mut state = self.state.lock();
        let mut listeners = Vec::clone(&state.listeners);
        listeners.push(listener);
        state.listeners = Arc::new(listeners);
    }

    /// Unregisters a listener by identity; returns true if it was registered.
    pub fn remove_data_listener(&self, listener: &Arc<dyn DataListener>) -> bool {
        let target = Arc::as_ptr(listener).cast::<()>();
        let mut state = self.state.lock();
        let before = state.listeners.len();
        let listeners: Vec<Arc<dyn DataListener>> = state
            .listeners
            .iter()
            .filter(|l| Arc::as_ptr(*l).cast::<()>() != target)
            .cloned()
            .collect();
        let removed = listeners.len() != before;
        state.listeners = Arc::new(listeners);
        removed
    }

    /// Drops buffered tuples of windows before `before_window`.
    ///
    /// Stops at the first tuple of a later window and at the slowest cursor.
    /// Returns the number of tuples dropped.
    pub fn purge(&self, before_window: WindowId) -> usize {
        let mut state = self.state.lock();
        let limit = state.min_cursor().unwrap_or_else(|| state.tail());
        let mut purged = 0;
        while state.base < limit {
            match state.items.front() {
                Some(front) if front.window_id < before_window => {
                    state.items.pop_front();
                    state.base += 1;
                    purged += 1;
                }
                _ => break,
            }
        }
        if purged > 0 {
            debug!(
                publisher = %self.identifier,
                purged,
                before_window,
                "purged buffered tuples"
            );
        }
        purged
    }

    /// Number of buffered tuples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Returns true if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Absolute position of the oldest buffered tuple.
    #[must_use]
    pub fn head_position(&self) -> u64 {
        self.state.lock().base
    }

    /// Absolute position the next appended tuple will get.
    #[must_use]
    pub fn tail_position(&self) -> u64 {
        self.state.lock().tail()
    }

    /// Number of live cursors.
    #[must_use]
    pub fn iterator_count(&self) -> usize {
        self.state.lock().cursors.len()
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Consumer names of the live cursors.
    #[must_use]
    pub fn consumers(&self) -> Vec<String> {
        self.state
            .lock()
            .cursors
            .values()
            .map(|c| c.consumer.clone())
            .collect()
    }
}

impl fmt::Debug for DataList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DataList")
            .field("identifier", &self.identifier)
            .field("stream_type", &self.stream_type)
            .field("base", &state.base)
            .field("len", &state.items.len())
            .field("cursors", &state.cursors.len())
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

/// A read cursor over a [`DataList`].
///
/// Yields buffered tuples in append order; returns `None` when caught up and
/// resumes once more tuples are appended.
pub struct DataListIterator {
    list: Arc<DataList>,
    id: CursorId,
    inspector: Arc<dyn DataInspector>,
}

impl DataListIterator {
    /// The list this cursor reads.
    #[must_use]
    pub fn list(&self) -> &Arc<DataList> {
        &self.list
    }

    /// The inspector supplied at creation.
    #[must_use]
    pub fn inspector(&self) -> &dyn DataInspector {
        self.inspector.as_ref()
    }

    /// Absolute position of the next tuple this cursor will yield.
    #[must_use]
    pub fn position(&self) -> u64 {
        let state = self.list.state.lock();
        state.cursors.get(&self.id).map_or(state.tail(), |c| c.position)
    }

    /// Number of tuples between the cursor and the tail.
    #[must_use]
    pub fn remaining(&self) -> usize {
        let state = self.list.state.lock();
        let position = state.cursors.get(&self.id).map_or(state.tail(), |c| c.position);
        usize::try_from(state.tail() - position).unwrap_or(usize::MAX)
    }

    /// Moves the cursor to the first buffered tuple of a window at or after
    /// `window_id`, or to the tail if there is none.
    ///
    /// Returns the new position.
    pub fn seek_window(&mut self, window_id: WindowId) -> u64 {
        let mut state = self.list.state.lock();
        let offset = state
            .items
            .iter()
            .position(|d| self.inspector.window_id(d) >= window_id)
            .unwrap_or(state.items.len());
        let position = state.base + offset as u64;
        if let Some(cursor) = state.cursors.get_mut(&self.id) {
            cursor.position = position;
        }
        position
    }
}

impl Iterator for DataListIterator {
    type Item = Arc<Data>;

    fn next(&mut self) -> Option<Arc<Data>> {
        let mut state = self.list.state.lock();
        let base = state.base;
        let position = state.cursors.get(&self.id)?.position;
        let offset = usize::try_from(position.checked_sub(base)?).ok()?;
        let data = state.items.get(offset).cloned()?;
        if let Some(cursor) = state.cursors.get_mut(&self.id) {
            cursor.position += 1;
        }
        Some(data)
    }
}

impl Drop for DataListIterator {
    fn drop(&mut self) {
        self.list.state.lock().cursors.remove(&self.id);
    }
}

impl fmt::Debug for DataListIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataListIterator")
            .field("list", &self.list.identifier)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
