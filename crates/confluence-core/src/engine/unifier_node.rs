//! Fan-in node merging N input ports into one window-aligned output.
//!
//! Each call to [`UnifierNode::process`] sweeps every input once. Payloads
//! are merged as they come; a window boundary is forwarded only after every
//! live input has reached it, and then exactly once. An input that reaches
//! `EndStream` is retired. When the last input retires, `EndStream` is
//! forwarded and the node is finished.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, info};

use super::{InputMode, MergeReservoir, Merger, ReservoirError, Sink, StreamItem, Tuple, Unifier};
use crate::config::ReservoirConfig;

/// Fan-in node over a set of [`MergeReservoir`] inputs.
pub struct UnifierNode<T> {
    name: String,
    config: ReservoirConfig,
    merger: Arc<Merger<T>>,
    inputs: Mutex<Vec<Arc<MergeReservoir<T>>>>,
    deletion_id: AtomicU64,
    finished: AtomicBool,
    cancelled: AtomicBool,
}

impl<T: Send + 'static> UnifierNode<T> {
    /// Creates a node with default port attributes.
    pub fn new(
        name: impl Into<String>,
        unifier: impl Unifier<T> + 'static,
        output: impl Sink<T> + 'static,
    ) -> Self {
        Self::with_config(name, ReservoirConfig::default(), unifier, output)
    }

    /// Creates a node whose ports default to `config`.
    pub fn with_config(
        name: impl Into<String>,
        config: ReservoirConfig,
        unifier: impl Unifier<T> + 'static,
        output: impl Sink<T> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            merger: Merger::new(unifier, output),
            inputs: Mutex::new(Vec::new()),
            deletion_id: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates the reservoir for input `port` and returns it to the producer.
    ///
    /// `attributes` overrides the node's default capacity and spin interval.
    /// Connecting a port that is already connected returns the existing reservoir.
    pub fn connect_input_port(
        &self,
        port: &str,
        attributes: Option<ReservoirConfig>,
        mode: InputMode,
    ) -> Arc<MergeReservoir<T>> {
        let mut inputs = self.inputs.lock();
        if let Some(existing) = inputs.iter().find(|r| r.name() == port) {
            return Arc::clone(existing);
        }
        let config = attributes.unwrap_or_else(|| self.config.clone());
        debug!(
            node = %self.name,
            port,
            capacity = config.buffer_capacity,
            ?mode,
            "input port connected"
        );
        let reservoir = Arc::new(
            MergeReservoir::new(port, config, Arc::clone(&self.merger)).with_mode(mode),
        );
        inputs.push(Arc::clone(&reservoir));
        self.finished.store(false, Ordering::Release);
        reservoir
    }

    /// Disconnects input `port`.
    ///
    /// The reservoir is renamed `port.N` so the port can be reconnected, and
    /// `EndStream` is queued behind whatever it still holds. Returns false if
    /// no such port is connected.
    ///
    /// # Errors
    ///
    /// Returns [`ReservoirError::Cancelled`] if the reservoir was cancelled
    /// while waiting for room for `EndStream`.
    pub fn disconnect_input_port(&self, port: &str) -> Result<bool, ReservoirError> {
        let reservoir = {
            let inputs = self.inputs.lock();
            let Some(reservoir) = inputs.iter().find(|r| r.name() == port) else {
                return Ok(false);
            };
            let n = self.deletion_id.fetch_add(1, Ordering::Relaxed);
            reservoir.reservoir().rename(format!("{port}.{n}"));
            Arc::clone(reservoir)
        };
        info!(node = %self.name, port, renamed = %reservoir.name(), "input port disconnected");
        reservoir
            .reservoir()
            .add(StreamItem::Control(Tuple::EndStream))?;
        Ok(true)
    }

    /// Names of the inputs still connected or draining.
    #[must_use]
    pub fn input_names(&self) -> Vec<String> {
        self.inputs.lock().iter().map(|r| r.name()).collect()
    }

    /// Number of inputs still connected or draining.
    #[must_use]
    pub fn input_count(&self) -> usize {
        self.inputs.lock().len()
    }

    /// Returns true once `EndStream` was forwarded.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Stops [`run`](Self::run) and wakes every blocked producer.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        for input in self.inputs.lock().iter() {
            input.cancel();
        }
    }

    /// Sweeps every input once.
    ///
    /// Returns the number of payloads merged plus control tuples consumed.
    pub fn process(&self) -> usize {
        if self.is_finished() {
            return 0;
        }
        let inputs: Vec<Arc<MergeReservoir<T>>> = self.inputs.lock().clone();
        if inputs.is_empty() {
            return 0;
        }

        let mut work = 0;
        let mut heads: SmallVec<[(usize, Tuple); 8]> = SmallVec::new();
        let mut retired: SmallVec<[usize; 4]> = SmallVec::new();
        let mut aligned = true;

        for (index, input) in inputs.iter().enumerate() {
            let before = input.consumed();
            let head = input.sweep();
            work += usize::try_from(input.consumed() - before).unwrap_or(usize::MAX);
            match head {
                Some(Tuple::EndStream) => {
                    input.take_control();
                    retired.push(index);
                    work += 1;
                }
                Some(tuple) => heads.push((index, tuple)),
                None => aligned = false,
            }
        }

        if !retired.is_empty() && self.retire(&inputs, &retired) {
            return work;
        }

        if !aligned {
            return work;
        }
        let Some(lowest) = heads.iter().map(|(_, t)| *t).min() else {
            return work;
        };
        // Forward before dequeuing: a direct-mode producer only bypasses
        // its queue once the queue is empty.
        self.merger.forward(lowest);
        for (index, tuple) in &heads {
            if *tuple == lowest {
                inputs[*index].take_control();
                work += 1;
            }
        }
        work
    }

    /// Blocks the calling thread processing inputs until the stream ends
    /// or the node is cancelled.
    ///
    /// Returns the total work done.
    pub fn run(&self) -> usize {
        let mut total = 0;
        while !self.cancelled.load(Ordering::Acquire) && !self.is_finished() {
            let work = self.process();
            total += work;
            if work == 0 {
                thread::sleep(self.config.spin_interval);
            }
        }
        debug!(node = %self.name, total, finished = self.is_finished(), "unifier node stopped");
        total
    }

    /// Drops retired inputs; forwards `EndStream` if none remain.
    ///
    /// Returns true if the node finished.
    fn retire(&self, snapshot: &[Arc<MergeReservoir<T>>], retired: &[usize]) -> bool {
        let mut inputs = self.inputs.lock();
        for &index in retired {
            let gone = &snapshot[index];
            inputs.retain(|r| !Arc::ptr_eq(r, gone));
            debug!(node = %self.name, port = %gone.name(), "input retired");
        }
        if !inputs.is_empty() {
            return false;
        }
        drop(inputs);
        self.finished.store(true, Ordering::Release);
        self.merger.forward(Tuple::EndStream);
        info!(node = %self.name, "all inputs ended, end of stream forwarded");
        true
    }
}

impl<T> fmt::Debug for UnifierNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnifierNode")
            .field("name", &self.name)
            .field("inputs", &self.inputs.lock().len())
            .field("finished", &self.finished.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CollectSink, PassThroughUnifier};
    use std::time::Duration;

    fn config() -> ReservoirConfig {
        ReservoirConfig::builder().buffer_capacity(64).spin_millis(1).build()
    }

    fn node(sink: &CollectSink<u32>) -> UnifierNode<u32> {
        UnifierNode::with_config("unifier", config(), PassThroughUnifier, sink.clone())
    }

    fn window(port: &MergeReservoir<u32>, w: u64, payloads: &[u32]) {
        port.process(StreamItem::Control(Tuple::BeginWindow(w))).unwrap();
        for &p in payloads {
            port.process(StreamItem::Data(p)).unwrap();
        }
        port.process(StreamItem::Control(Tuple::EndWindow(w))).unwrap();
    }

    fn controls(items: &[StreamItem<u32>]) -> Vec<Tuple> {
        items.iter().filter_map(StreamItem::as_control).collect()
    }

    #[test]
    fn test_boundaries_forwarded_once() {
        let sink = CollectSink::new();
        let node = node(&sink);
        let a = node.connect_input_port("a", None, InputMode::Queued);
        let b = node.connect_input_port("b", None, InputMode::Queued);

        window(&a, 1, &[1, 2]);
        window(&b, 1, &[3]);
        while node.process() > 0 {}

        let items = sink.items();
        assert_eq!(controls(&items), vec![Tuple::BeginWindow(1), Tuple::EndWindow(1)]);
        let mut payloads: Vec<u32> = items
            .iter()
            .filter_map(|i| match i {
                StreamItem::Data(p) => Some(*p),
                StreamItem::Control(_) => None,
            })
            .collect();
        payloads.sort_unstable();
        assert_eq!(payloads, vec![1, 2, 3]);
        // Payloads sit between the boundaries.
        assert_eq!(items.first(), Some(&StreamItem::Control(Tuple::BeginWindow(1))));
        assert_eq!(items.last(), Some(&StreamItem::Control(Tuple::EndWindow(1))));
    }

    #[test]
    fn test_waits_for_slow_input() {
        let sink = CollectSink::new();
        let node = node(&sink);
        let a = node.connect_input_port("a", None, InputMode::Queued);
        let b = node.connect_input_port("b", None, InputMode::Queued);

        window(&a, 1, &[1]);
        while node.process() > 0 {}
        assert!(sink.is_empty());

        b.process(StreamItem::Control(Tuple::BeginWindow(1))).unwrap();
        while node.process() > 0 {}
        assert_eq!(
            controls(&sink.items()),
            vec![Tuple::BeginWindow(1)]
        );

        // a's payload merged; its EndWindow waits for b.
        assert_eq!(sink.len(), 2);
        b.process(StreamItem::Control(Tuple::EndWindow(1))).unwrap();
        while node.process() > 0 {}
        assert_eq!(
            controls(&sink.items()),
            vec![Tuple::BeginWindow(1), Tuple::EndWindow(1)]
        );
    }

    #[test]
    fn test_direct_payload_stays_inside_its_window() {
        let sink = CollectSink::new();
        let node = node(&sink);
        let a = node.connect_input_port("a", None, InputMode::Direct);
        let b = node.connect_input_port("b", None, InputMode::Direct);

        a.process(StreamItem::Control(Tuple::BeginWindow(1))).unwrap();
        b.process(StreamItem::Control(Tuple::BeginWindow(1))).unwrap();
        b.process(StreamItem::Control(Tuple::EndWindow(1))).unwrap();
        b.process(StreamItem::Control(Tuple::BeginWindow(2))).unwrap();
        b.process(StreamItem::Data(22)).unwrap();
        while node.process() > 0 {}
        assert_eq!(sink.items(), vec![StreamItem::Control(Tuple::BeginWindow(1))]);

        a.process(StreamItem::Data(11)).unwrap();
        a.process(StreamItem::Control(Tuple::EndWindow(1))).unwrap();
        a.process(StreamItem::Control(Tuple::BeginWindow(2))).unwrap();
        while node.process() > 0 {}
        assert_eq!(
            sink.items(),
            vec![
                StreamItem::Control(Tuple::BeginWindow(1)),
                StreamItem::Data(11),
                StreamItem::Control(Tuple::EndWindow(1)),
                StreamItem::Control(Tuple::BeginWindow(2)),
                StreamItem::Data(22),
            ]
        );

        // Both queues drained: window 2 is open downstream.
        a.process(StreamItem::Data(23)).unwrap();
        assert_eq!(sink.items().last(), Some(&StreamItem::Data(23)));
    }

    #[test]
    fn test_disconnect_retires_input() {
        let sink = CollectSink::new();
        let node = node(&sink);
        let a = node.connect_input_port("a", None, InputMode::Queued);
        let b = node.connect_input_port("b", None, InputMode::Queued);

        window(&a, 1, &[1]);
        window(&b, 1, &[2]);
        assert!(node.disconnect_input_port("b").unwrap());
        assert!(!node.disconnect_input_port("missing").unwrap());
        assert_eq!(b.name(), "b.0");

        while node.process() > 0 {}
        assert_eq!(node.input_names(), vec!["a".to_string()]);
        assert!(!node.is_finished());

        window(&a, 2, &[3]);
        while node.process() > 0 {}
        assert_eq!(
            controls(&sink.items()),
            vec![
                Tuple::BeginWindow(1),
                Tuple::EndWindow(1),
                Tuple::BeginWindow(2),
                Tuple::EndWindow(2),
            ]
        );

        node.disconnect_input_port("a").unwrap();
        while node.process() > 0 {}
        assert!(node.is_finished());
        assert_eq!(sink.items().last(), Some(&StreamItem::Control(Tuple::EndStream)));
        assert_eq!(
            controls(&sink.items())
                .iter()
                .filter(|t| **t == Tuple::EndStream)
                .count(),
            1
        );
    }

    #[test]
    fn test_reconnect_after_disconnect() {
        let sink = CollectSink::new();
        let node = node(&sink);
        let first = node.connect_input_port("a", None, InputMode::Queued);
        node.connect_input_port("b", None, InputMode::Queued);
        node.disconnect_input_port("a").unwrap();

        let second = node.connect_input_port("a", None, InputMode::Queued);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(node.input_count(), 3);

        let same = node.connect_input_port("a", None, InputMode::Queued);
        assert!(Arc::ptr_eq(&second, &same));
    }

    #[test]
    fn test_port_attributes() {
        let sink = CollectSink::new();
        let node = node(&sink);
        let attributes = ReservoirConfig::builder().buffer_capacity(2).build();
        let port = node.connect_input_port("a", Some(attributes), InputMode::Queued);
        assert_eq!(port.reservoir().capacity(), 2);

        let default = node.connect_input_port("b", None, InputMode::Direct);
        assert_eq!(default.reservoir().capacity(), 64);
        assert_eq!(default.mode(), InputMode::Direct);
    }

    #[test]
    fn test_run_until_end_of_stream() {
        let sink = CollectSink::new();
        let node = Arc::new(node(&sink));
        let a = node.connect_input_port("a", None, InputMode::Queued);

        let runner = {
            let node = Arc::clone(&node);
            thread::spawn(move || node.run())
        };
        window(&a, 1, &[1, 2, 3]);
        node.disconnect_input_port("a").unwrap();

        let total = runner.join().unwrap();
        assert!(node.is_finished());
        // 3 payloads, 2 boundaries and the end of stream.
        assert_eq!(total, 6);
        assert_eq!(sink.len(), 6);
    }

    #[test]
    fn test_cancel_stops_run() {
        let sink = CollectSink::new();
        let node = Arc::new(node(&sink));
        node.connect_input_port("a", None, InputMode::Queued);

        let runner = {
            let node = Arc::clone(&node);
            thread::spawn(move || node.run())
        };
        thread::sleep(Duration::from_millis(10));
        node.cancel();
        assert_eq!(runner.join().unwrap(), 0);
        assert!(!node.is_finished());
    }
}
