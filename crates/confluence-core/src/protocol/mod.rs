//! # Buffer Server Protocol
//!
//! Typed messages exchanged between publishers, subscribers and the buffer
//! server.
//!
//! ## Message Kinds
//!
//! | Message | Sender | Effect |
//! |---------|--------|--------|
//! | [`PublisherRequest`] | publisher | binds the connection to a [`DataList`](crate::bufferserver::DataList) |
//! | [`SubscriberRequest`] | subscriber | joins (or creates) a subscriber group |
//! | [`PurgeRequest`] | publisher/engine | evicts committed windows from a buffer |
//! | [`Data`] | publisher | appended to the bound buffer, fanned out to groups |
//!
//! Every [`Data`] item carries the identifier of its enclosing window. Window
//! identifiers are a monotonically increasing 64-bit logical clock; they are
//! the only notion of time in the protocol.
//!
//! The binary framing lives in [`codec`].

pub mod codec;

use std::fmt;

use bytes::Bytes;

pub use codec::{decode_frame, encode_frame, encoded_len, CodecError, DEFAULT_MAX_FRAME_LEN};

/// Logical clock value delimiting windows.
pub type WindowId = u64;

/// Distribution policy requested by a subscriber for its group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum PolicyType {
    /// Every member receives every tuple.
    #[default]
    GiveAll,
    /// The member with the smallest outbound backlog receives the tuple.
    LeastBusy,
    /// A uniformly random member receives the tuple.
    RandomOne,
    /// Members receive tuples in a fixed cyclic order.
    RoundRobin,
    /// A policy registered by name in the [`PolicyRegistry`](crate::bufferserver::PolicyRegistry).
    Custom(String),
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GiveAll => write!(f, "give_all"),
            Self::LeastBusy => write!(f, "least_busy"),
            Self::RandomOne => write!(f, "random_one"),
            Self::RoundRobin => write!(f, "round_robin"),
            Self::Custom(name) => write!(f, "custom({name})"),
        }
    }
}

/// Registration of a publisher connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherRequest {
    /// Unique identifier of the publisher (stable across restarts).
    pub identifier: String,
    /// Declared stream type.
    pub stream_type: String,
}

impl PublisherRequest {
    /// Creates a new publisher request.
    #[must_use]
    pub fn new(identifier: impl Into<String>, stream_type: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            stream_type: stream_type.into(),
        }
    }
}

/// Registration of a subscriber connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberRequest {
    /// Unique identifier of this physical subscriber.
    pub identifier: String,
    /// Subscriber group the connection joins.
    pub group_type: String,
    /// Identifier of the publisher whose buffer the group reads.
    pub upstream_identifier: String,
    /// Window to catch up from when the group is created.
    pub window_id: WindowId,
    /// Distribution policy for the group.
    pub policy: PolicyType,
    /// Partition filters; empty means "all partitions".
    pub partitions: Vec<Bytes>,
}

impl SubscriberRequest {
    /// Creates a subscriber request with the give-all policy, no partitions and
    /// catch-up from window zero.
    #[must_use]
    pub fn new(
        identifier: impl Into<String>,
        group_type: impl Into<String>,
        upstream_identifier: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            group_type: group_type.into(),
            upstream_identifier: upstream_identifier.into(),
            window_id: 0,
            policy: PolicyType::GiveAll,
            partitions: Vec::new(),
        }
    }

    /// Sets the catch-up window.
    #[must_use]
    pub fn from_window(mut self, window_id: WindowId) -> Self {
        self.window_id = window_id;
        self
    }

    /// Sets the distribution policy.
    #[must_use]
    pub fn with_policy(mut self, policy: PolicyType) -> Self {
        self.policy = policy;
        self
    }

    /// Adds a partition filter.
    #[must_use]
    pub fn with_partition(mut self, partition: impl Into<Bytes>) -> Self {
        self.partitions.push(partition.into());
        self
    }
}

/// Request to evict buffered windows that every consumer has committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeRequest {
    /// Publisher identifier of the buffer to purge.
    pub identifier: String,
    /// Items whose window precedes this one become evictable.
    pub window_id: WindowId,
}

impl PurgeRequest {
    /// Creates a purge request.
    #[must_use]
    pub fn new(identifier: impl Into<String>, window_id: WindowId) -> Self {
        Self {
            identifier: identifier.into(),
            window_id,
        }
    }
}

/// Kind of a buffered data item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataKind {
    /// Control tuple opening a window.
    BeginWindow,
    /// Control tuple closing a window.
    EndWindow,
    /// Opaque payload produced by the given partition.
    Payload {
        /// Partition key of the producing partition.
        partition: Bytes,
        /// Serialized tuple.
        bytes: Bytes,
    },
}

/// A data item in a publisher's stream.
///
/// Immutable once appended to a [`DataList`](crate::bufferserver::DataList);
/// shared between cursors as `Arc<Data>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    /// Enclosing window.
    pub window_id: WindowId,
    /// Item kind.
    pub kind: DataKind,
}

impl Data {
    /// Creates a begin-window control tuple.
    #[must_use]
    pub fn begin_window(window_id: WindowId) -> Self {
        Self {
            window_id,
            kind: DataKind::BeginWindow,
        }
    }

    /// Creates an end-window control tuple.
    #[must_use]
    pub fn end_window(window_id: WindowId) -> Self {
        Self {
            window_id,
            kind: DataKind::EndWindow,
        }
    }

    /// Creates a payload tuple.
    #[must_use]
    pub fn payload(window_id: WindowId, partition: impl Into<Bytes>, bytes: impl Into<Bytes>) -> Self {
        Self {
            window_id,
            kind: DataKind::Payload {
                partition: partition.into(),
                bytes: bytes.into(),
            },
        }
    }

    /// Returns true for window-boundary control tuples.
    #[inline]
    #[must_use]
    pub fn is_control(&self) -> bool {
        matches!(self.kind, DataKind::BeginWindow | DataKind::EndWindow)
    }

    /// Returns the partition key of a payload tuple.
    #[inline]
    #[must_use]
    pub fn partition(&self) -> Option<&[u8]> {
        match &self.kind {
            DataKind::Payload { partition, .. } => Some(&partition[..]),
            _ => None,
        }
    }
}

/// A protocol message as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Publisher registration.
    PublisherRequest(PublisherRequest),
    /// Subscriber registration.
    SubscriberRequest(SubscriberRequest),
    /// Buffer eviction.
    PurgeRequest(PurgeRequest),
    /// Raw stream data.
    Data(Data),
}

impl From<Data> for Message {
    fn from(data: Data) -> Self {
        Self::Data(data)
    }
}

impl From<PublisherRequest> for Message {
    fn from(request: PublisherRequest) -> Self {
        Self::PublisherRequest(request)
    }
}

impl From<SubscriberRequest> for Message {
    fn from(request: SubscriberRequest) -> Self {
        Self::SubscriberRequest(request)
    }
}

impl From<PurgeRequest> for Message {
    fn from(request: PurgeRequest) -> Self {
        Self::PurgeRequest(request)
    }
}
