//! Merge reservoirs: input queues that feed a shared unifier.
//!
//! Every input port of a fan-in node owns a [`MergeReservoir`]. All of them
//! share one [`Merger`], which serializes calls into the node's [`Unifier`]
//! and the downstream [`Sink`]. A sweep drains payloads up to the next
//! control tuple and leaves that tuple at the head, so no input can run
//! ahead of a window boundary the others have not reached.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Reservoir, ReservoirError, Sink, StreamItem, Tuple};
use crate::config::ReservoirConfig;
use crate::protocol::WindowId;

/// How payloads reach the merge function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    /// Payloads are queued and merged by the consumer's sweep.
    #[default]
    Queued,
    /// Payloads are merged on the producer's thread while the queue is
    /// empty. Control tuples are always queued, and a payload arriving
    /// behind an unforwarded boundary waits in the queue with it.
    Direct,
}

/// Combines payloads from several inputs into one output stream.
pub trait Unifier<T>: Send {
    /// Called before a window's `BeginWindow` is forwarded downstream.
    fn begin_window(&mut self, _window_id: WindowId, _output: &mut dyn Sink<T>) {}

    /// Merges one payload.
    fn merge(&mut self, payload: T, output: &mut dyn Sink<T>);

    /// Called before a window's `EndWindow` is forwarded downstream.
    fn end_window(&mut self, _window_id: WindowId, _output: &mut dyn Sink<T>) {}
}

/// Forwards every payload unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughUnifier;

impl<T: Send> Unifier<T> for PassThroughUnifier {
    fn merge(&mut self, payload: T, output: &mut dyn Sink<T>) {
        output.process(StreamItem::Data(payload));
    }
}

struct MergerState<T> {
    unifier: Box<dyn Unifier<T>>,
    output: Box<dyn Sink<T>>,
}

/// A unifier and its downstream sink, shared by every input of one node.
pub struct Merger<T> {
    state: Mutex<MergerState<T>>,
}

impl<T: Send> Merger<T> {
    /// Creates a shared merger.
    pub fn new(unifier: impl Unifier<T> + 'static, output: impl Sink<T> + 'static) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MergerState {
                unifier: Box::new(unifier),
                output: Box::new(output),
            }),
        })
    }

    /// Runs one payload through the unifier.
    pub fn merge(&self, payload: T) {
        let mut state = self.state.lock();
        let MergerState { unifier, output } = &mut *state;
        unifier.merge(payload, output.as_mut());
    }

    /// Forwards a control tuple downstream, notifying the unifier of window boundaries.
    pub fn forward(&self, tuple: Tuple) {
        let mut state = self.state.lock();
        let MergerState { unifier, output } = &mut *state;
        match tuple {
            Tuple::BeginWindow(w) => unifier.begin_window(w, output.as_mut()),
            Tuple::EndWindow(w) => unifier.end_window(w, output.as_mut()),
            Tuple::EndStream => {}
        }
        output.process(StreamItem::Control(tuple));
    }
}

impl<T> fmt::Debug for Merger<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Merger").finish_non_exhaustive()
    }
}

/// The reservoir of one input port, feeding a shared [`Merger`].
pub struct MergeReservoir<T> {
    reservoir: Reservoir<StreamItem<T>>,
    merger: Arc<Merger<T>>,
    mode: InputMode,
    consumed: AtomicU64,
}

impl<T: Send> MergeReservoir<T> {
    /// Creates a queued-mode reservoir for `port`.
    #[must_use]
    pub fn new(port: impl Into<String>, config: ReservoirConfig, merger: Arc<Merger<T>>) -> Self {
        Self {
            reservoir: Reservoir::new(port, config),
            merger,
            mode: InputMode::Queued,
            consumed: AtomicU64::new(0),
        }
    }

    /// Sets the input mode.
    #[must_use]
    pub fn with_mode(mut self, mode: InputMode) -> Self {
        self.mode = mode;
        self
    }

    /// The input mode.
    #[must_use]
    pub fn mode(&self) -> InputMode {
        self.mode
    }

    /// The underlying queue.
    #[must_use]
    pub fn reservoir(&self) -> &Reservoir<StreamItem<T>> {
        &self.reservoir
    }

    /// Current port name.
    #[must_use]
    pub fn name(&self) -> String {
        self.reservoir.name()
    }

    /// Payloads merged so far, through sweeps or [`consume`](Self::consume).
    #[must_use]
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    /// Accepts an item from the producer according to the input mode.
    ///
    /// Blocks while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`ReservoirError::Cancelled`] if the reservoir is cancelled.
    pub fn process(&self, item: StreamItem<T>) -> Result<(), ReservoirError> {
        match self.try_direct(item) {
            Some(item) => self.reservoir.add(item),
            None => Ok(()),
        }
    }

    /// Async counterpart of [`process`](Self::process).
    ///
    /// # Errors
    ///
    /// Returns [`ReservoirError::Cancelled`] if the reservoir is cancelled.
    pub async fn process_async(&self, item: StreamItem<T>) -> Result<(), ReservoirError> {
        match self.try_direct(item) {
            Some(item) => self.reservoir.add_async(item).await,
            None => Ok(()),
        }
    }

    /// Merges a direct-mode payload in place, or hands the item back for queueing.
    ///
    /// The node dequeues a boundary only after forwarding it, so an empty
    /// queue means the payload belongs to the window already open downstream.
    fn try_direct(&self, item: StreamItem<T>) -> Option<StreamItem<T>> {
        match (self.mode, item) {
            (InputMode::Direct, StreamItem::Data(payload)) if self.reservoir.is_empty() => {
                self.consume(payload);
                None
            }
            (_, item) => Some(item),
        }
    }

    /// Merges a payload immediately, bypassing the queue.
    pub fn consume(&self, payload: T) {
        self.merger.merge(payload);
        self.consumed.fetch_add(1, Ordering::Relaxed);
    }

    /// Merges every queued payload up to the next control tuple.
    ///
    /// Returns that control tuple, still queued, or `None` once the queue is
    /// drained without reaching one.
    pub fn sweep(&self) -> Option<Tuple> {
        loop {
            match self.reservoir.peek_with(StreamItem::as_control)? {
                Some(tuple) => return Some(tuple),
                None => {
                    if let Some(StreamItem::Data(payload)) = self.reservoir.poll() {
                        self.consume(payload);
                    }
                }
            }
        }
    }

    /// Dequeues the control tuple at the head.
    ///
    /// Returns `None` and leaves the queue untouched if the head is a payload.
    pub fn take_control(&self) -> Option<Tuple> {
        self.reservoir.peek_with(StreamItem::as_control)??;
        self.reservoir.poll().and_then(|item| item.as_control())
    }

    /// Cancels the queue, waking a blocked producer.
    pub fn cancel(&self) {
        self.reservoir.cancel();
    }
}

impl<T> fmt::Debug for MergeReservoir<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeReservoir")
            .field("reservoir", &self.reservoir)
            .field("mode", &self.mode)
            .field("consumed", &self.consumed.load(Ordering::Relaxed))
            .finish()
    }
}
