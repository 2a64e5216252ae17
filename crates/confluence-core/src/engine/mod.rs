//! # Merge Engine
//!
//! Input side of a fan-in stream node.
//!
//! Each upstream stream lands in a bounded [`MergeReservoir`] owned by one
//! input port. The [`UnifierNode`] sweeps its reservoirs, merges payloads
//! through a [`Unifier`] and forwards every window boundary exactly once,
//! after all inputs have reached it.
//!
//! ```text
//! upstream A ──▶ MergeReservoir(a) ──┐
//!                                    ├──▶ Merger(Unifier + Sink) ──▶ downstream
//! upstream B ──▶ MergeReservoir(b) ──┘
//! ```

mod error;
mod merge;
mod reservoir;
mod tuple;
mod unifier_node;

pub use error::{ReservoirError, TryAddError};
pub use merge::{InputMode, MergeReservoir, Merger, PassThroughUnifier, Unifier};
pub use reservoir::Reservoir;
pub use tuple::{CollectSink, Sink, StreamItem, Tuple};
pub use unifier_node::UnifierNode;
