//! Stream items flowing into and out of merge reservoirs.

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::protocol::WindowId;

/// Control tuple marking a window boundary or the end of a stream.
///
/// Tuples order by window; within a window `BeginWindow` precedes
/// `EndWindow`, and `EndStream` sorts after every window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tuple {
    /// First tuple of a window.
    BeginWindow(WindowId),
    /// Last tuple of a window.
    EndWindow(WindowId),
    /// No more tuples will follow on this input.
    EndStream,
}

impl Tuple {
    /// Window of a boundary tuple; `None` for `EndStream`.
    #[must_use]
    pub fn window_id(&self) -> Option<WindowId> {
        match self {
            Self::BeginWindow(w) | Self::EndWindow(w) => Some(*w),
            Self::EndStream => None,
        }
    }

    fn order_key(self) -> (WindowId, u8) {
        match self {
            Self::BeginWindow(w) => (w, 0),
            Self::EndWindow(w) => (w, 1),
            Self::EndStream => (WindowId::MAX, 2),
        }
    }
}

impl PartialOrd for Tuple {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tuple {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

/// An item on an input port: a payload or a control tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem<T> {
    /// Payload to be merged.
    Data(T),
    /// Window boundary or end of stream.
    Control(Tuple),
}

impl<T> StreamItem<T> {
    /// Returns the control tuple, if this is one.
    #[must_use]
    pub fn as_control(&self) -> Option<Tuple> {
        match self {
            Self::Control(tuple) => Some(*tuple),
            Self::Data(_) => None,
        }
    }
}

/// Downstream consumer of a node's output.
pub trait Sink<T>: Send {
    /// Accepts one item.
    fn process(&mut self, item: StreamItem<T>);
}

impl<T: Send> Sink<T> for Vec<StreamItem<T>> {
    fn process(&mut self, item: StreamItem<T>) {
        self.push(item);
    }
}

impl<T: Send> Sink<T> for tokio::sync::mpsc::UnboundedSender<StreamItem<T>> {
    fn process(&mut self, item: StreamItem<T>) {
        if let Err(e) = self.send(item) {
            let kind = match e.0 {
                StreamItem::Data(_) => "payload",
                StreamItem::Control(_) => "control",
            };
            debug!(kind, "downstream receiver dropped, discarding item");
        }
    }
}

/// A [`Sink`] collecting into a shared vector, readable from another handle.
#[derive(Debug)]
pub struct CollectSink<T> {
    items: Arc<Mutex<Vec<StreamItem<T>>>>,
}

impl<T> CollectSink<T> {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of collected items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns everything collected so far.
    #[must_use]
    pub fn take(&self) -> Vec<StreamItem<T>> {
        std::mem::take(&mut *self.items.lock())
    }
}

impl<T: Clone> CollectSink<T> {
    /// Returns a copy of everything collected so far.
    #[must_use]
    pub fn items(&self) -> Vec<StreamItem<T>> {
        self.items.lock().clone()
    }
}

impl<T> Clone for CollectSink<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<T> Default for CollectSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Sink<T> for CollectSink<T> {
    fn process(&mut self, item: StreamItem<T>) {
        self.items.lock().push(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple_ordering() {
        assert!(Tuple::BeginWindow(1) < Tuple::EndWindow(1));
        assert!(Tuple::EndWindow(1) < Tuple::BeginWindow(2));
        assert!(Tuple::EndWindow(u64::MAX) < Tuple::EndStream);
        assert_eq!(
            [Tuple::EndWindow(3), Tuple::BeginWindow(3), Tuple::EndStream]
                .into_iter()
                .min(),
            Some(Tuple::BeginWindow(3))
        );
    }

    #[test]
    fn test_tuple_window_id() {
        assert_eq!(Tuple::BeginWindow(4).window_id(), Some(4));
        assert_eq!(Tuple::EndWindow(4).window_id(), Some(4));
        assert_eq!(Tuple::EndStream.window_id(), None);
    }

    #[test]
    fn test_collect_sink_shares_items() {
        let sink = CollectSink::new();
        let mut writer = sink.clone();
        writer.process(StreamItem::Data(1));
        writer.process(StreamItem::Control(Tuple::EndStream));

        assert_eq!(sink.len(), 2);
        assert_eq!(
            sink.items(),
            vec![StreamItem::Data(1), StreamItem::Control(Tuple::EndStream)]
        );
        assert_eq!(sink.take().len(), 2);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_channel_sink_after_receiver_dropped() {
        let (mut tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tx.process(StreamItem::Data(1u8));
        assert_eq!(rx.try_recv().unwrap(), StreamItem::Data(1));

        drop(rx);
        tx.process(StreamItem::Data(2u8));
        tx.process(StreamItem::Control(Tuple::EndStream));
        assert!(tx.is_closed());
    }

    #[test]
    fn test_stream_item_as_control() {
        assert_eq!(StreamItem::<u8>::Control(Tuple::EndWindow(2)).as_control(), Some(Tuple::EndWindow(2)));
        assert_eq!(StreamItem::Data(1u8).as_control(), None);
    }
}
