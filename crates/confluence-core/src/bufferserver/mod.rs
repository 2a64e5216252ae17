//! # Buffer Server
//!
//! Publishers append windowed tuples to per-identifier buffers; subscriber
//! groups read those buffers through independent cursors and fan the tuples
//! out to their member connections.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────────────────────────────────┐
//!                    │              ServerHandler               │
//!                    │  publisher id ─▶ DataList                │
//!                    │  group type   ─▶ LogicalNode             │
//!                    │  identifier   ─▶ live Connection (x2)    │
//!                    └──────────────────────────────────────────┘
//!
//! Publisher ──append──▶ DataList ──data_added──▶ LogicalNode ──Policy──▶ member connections
//!                         │  cursor per node ▲
//!                         └──────────────────┘
//! ```
//!
//! ## Components
//!
//! - [`DataList`]: append-only buffer with cursors and listener notification
//! - [`LogicalNode`]: one subscriber group (cursor, policy, partition filters, members)
//! - [`Policy`]: member selection (give-all, least-busy, random-one, round-robin, custom)
//! - [`ServerHandler`]: protocol entry point shared by every connection
//! - [`Connection`]: the transport seam implemented by the TCP layer and by tests
//!
//! ## Locking
//!
//! There is no global lock. The publisher map and the group map each have a
//! coarse mutex held only for lookup/creation; every `DataList` and every
//! `LogicalNode` serializes its own state.

mod connection;
mod data_list;
mod error;
mod handler;
mod logical_node;
mod partition;
mod policy;
mod registry;
pub mod testing;

pub use connection::{next_connection_id, Connection, ConnectionId, ConnectionRef};
pub use data_list::{DataInspector, DataList, DataListIterator, DataListener, TupleInspector};
pub use error::BufferServerError;
pub use handler::{Attachment, ConnectionContext, ServerHandler};
pub use logical_node::{LogicalNode, LogicalNodeStats};
pub use partition::{PartitionFilter, PartitionSet};
pub use policy::{
    GiveAll, LeastBusy, Policy, PolicyFactory, PolicyRegistry, RandomOne, RoundRobin, Selection,
};
pub use registry::{ConnectionGroup, ConnectionRegistry};
