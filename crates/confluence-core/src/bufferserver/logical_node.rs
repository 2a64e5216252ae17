//! A subscriber group: one cursor, one policy, many member connections.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tracing::{debug, warn};

use super::{
    ConnectionId, ConnectionRef, DataInspector, DataList, DataListIterator, DataListener,
    PartitionFilter, PartitionSet, Policy,
};
use crate::protocol::{Data, WindowId};

/// Delivery counters for a [`LogicalNode`].
#[derive(Debug, Default)]
pub struct LogicalNodeStats {
    tuples_read: AtomicU64,
    deliveries: AtomicU64,
    filtered: AtomicU64,
    failed_sends: AtomicU64,
}

impl LogicalNodeStats {
    /// Tuples read from the cursor.
    #[must_use]
    pub fn tuples_read(&self) -> u64 {
        self.tuples_read.load(Ordering::Relaxed)
    }

    /// Successful per-member sends.
    #[must_use]
    pub fn deliveries(&self) -> u64 {
        self.deliveries.load(Ordering::Relaxed)
    }

    /// Payload tuples rejected by the partition filter.
    #[must_use]
    pub fn filtered(&self) -> u64 {
        self.filtered.load(Ordering::Relaxed)
    }

    /// Sends that failed and closed the member connection.
    #[must_use]
    pub fn failed_sends(&self) -> u64 {
        self.failed_sends.load(Ordering::Relaxed)
    }
}

/// One subscriber group over one publisher's [`DataList`].
///
/// The group owns a single cursor; each tuple is read once and then handed
/// to members. Window boundaries go to every member. Payloads pass the
/// partition filter and are then routed by the group's [`Policy`].
///
/// Delivery only starts after [`catch_up`](Self::catch_up). Until then
/// appends are left on the cursor and replayed by the catch-up itself.
pub struct LogicalNode {
    upstream: String,
    group: String,
    data_list: Arc<DataList>,
    cursor: Mutex<Option<DataListIterator>>,
    live: AtomicBool,
    policy: Box<dyn Policy>,
    partitions: RwLock<PartitionSet>,
    members: RwLock<Vec<ConnectionRef>>,
    stats: LogicalNodeStats,
}

impl LogicalNode {
    /// Creates a group reading `iterator` and routing payloads with `policy`.
    #[must_use]
    pub fn new(
        upstream: impl Into<String>,
        group: impl Into<String>,
        iterator: DataListIterator,
        policy: Box<dyn Policy>,
    ) -> Self {
        Self {
            upstream: upstream.into(),
            group: group.into(),
            data_list: Arc::clone(iterator.list()),
            cursor: Mutex::new(Some(iterator)),
            live: AtomicBool::new(false),
            policy,
            partitions: RwLock::new(PartitionSet::new()),
            members: RwLock::new(Vec::new()),
            stats: LogicalNodeStats::default(),
        }
    }

    /// Publisher identifier the group reads from.
    #[must_use]
    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    /// Group type (the key subscribers join by).
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// The list the group's cursor reads.
    #[must_use]
    pub fn data_list(&self) -> &Arc<DataList> {
        &self.data_list
    }

    /// The group's routing policy.
    #[must_use]
    pub fn policy(&self) -> &dyn Policy {
        self.policy.as_ref()
    }

    /// Delivery counters.
    #[must_use]
    pub fn stats(&self) -> &LogicalNodeStats {
        &self.stats
    }

    /// Adds a member connection. Adding the same connection twice is a no-op.
    pub fn add_channel(&self, connection: ConnectionRef) {
        let mut members = self.members.write();
        if members.iter().all(|m| m.id() != connection.id()) {
            members.push(connection);
        }
    }

    /// Removes a member connection; returns the number of members left.
    pub fn remove_channel(&self, connection_id: ConnectionId) -> usize {
        let mut members = self.members.write();
        members.retain(|m| m.id() != connection_id);
        members.len()
    }

    /// Number of member connections.
    #[must_use]
    pub fn physical_node_count(&self) -> usize {
        self.members.read().len()
    }

    /// Largest outbound backlog among open members, or 0 without any.
    #[must_use]
    pub fn max_backlog(&self) -> usize {
        self.members
            .read()
            .iter()
            .filter(|m| !m.is_closed())
            .map(|m| m.backlog())
            .max()
            .unwrap_or(0)
    }

    /// Adds a partition filter.
    pub fn add_partition(&self, filter: PartitionFilter) {
        self.partitions.write().add(filter);
    }

    /// Number of partition filters.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partitions.read().len()
    }

    /// Returns true once catch-up finished and appends are delivered as they arrive.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Replays buffered tuples from `window_id` on and switches to live delivery.
    ///
    /// Returns the number of tuples replayed. Has no effect after
    /// [`release`](Self::release).
    pub fn catch_up(&self, window_id: WindowId) -> usize {
        let mut guard = self.cursor.lock();
        let Some(cursor) = guard.as_mut() else {
            return 0;
        };
        cursor.seek_window(window_id);
        let replayed = self.drain(cursor);
        self.live.store(true, Ordering::Release);
        debug!(
            group = %self.group,
            upstream = %self.upstream,
            window_id,
            replayed,
            "subscriber group caught up"
        );
        replayed
    }

    /// Stops delivery and removes the group's cursor from its list.
    ///
    /// Returns false if the group was already released.
    pub fn release(&self) -> bool {
        self.live.store(false, Ordering::Release);
        let iterator = self.cursor.lock().take();
        let released = iterator.is_some();
        drop(iterator);
        released
    }

    fn drain(&self, cursor: &mut DataListIterator) -> usize {
        let mut count = 0;
        while let Some(data) = cursor.next() {
            self.stats.tuples_read.fetch_add(1, Ordering::Relaxed);
            self.deliver(&data, cursor.inspector());
            count += 1;
        }
        count
    }

    fn deliver(&self, data: &Arc<Data>, inspector: &dyn DataInspector) {
        // Closed members stay listed until the transport reports the
        // disconnect; they must not be offered to the policy.
        let members: SmallVec<[ConnectionRef; 8]> = self
            .members
            .read()
            .iter()
            .filter(|m| !m.is_closed())
            .cloned()
            .collect();
        if members.is_empty() {
            return;
        }

        match inspector.partition(data) {
            None => {
                for member in members.iter() {
                    self.send_to(member, data);
                }
            }
            Some(key) => {
                if !self.partitions.read().accepts(key) {
                    self.stats.filtered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                for index in self.policy.select(&members, data) {
                    if let Some(member) = members.get(index) {
                        self.send_to(member, data);
                    }
                }
            }
        }
    }

    fn send_to(&self, member: &ConnectionRef, data: &Arc<Data>) {
        match member.send(data) {
            Ok(()) => {
                self.stats.deliveries.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.failed_sends.fetch_add(1, Ordering::Relaxed);
                warn!(
                    group = %self.group,
                    connection = member.id(),
                    error = %e,
                    "send to subscriber failed, closing connection"
                );
                member.close();
            }
        }
    }
}

impl DataListener for LogicalNode {
    fn data_added(&self, _data: &Arc<Data>) {
        let mut guard = self.cursor.lock();
        if !self.is_live() {
            return;
        }
        if let Some(cursor) = guard.as_mut() {
            self.drain(cursor);
        }
    }
}

impl fmt::Debug for LogicalNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalNode")
            .field("upstream", &self.upstream)
            .field("group", &self.group)
            .field("policy", &self.policy.name())
            .field("members", &self.physical_node_count())
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}
