//! Protocol entry point shared by every broker connection.

use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{
    BufferServerError, ConnectionGroup, ConnectionId, ConnectionRef, ConnectionRegistry, DataList,
    DataListener, LogicalNode, PartitionFilter, PolicyRegistry, TupleInspector,
};
use crate::config::BrokerConfig;
use crate::protocol::{Data, Message, PublisherRequest, PurgeRequest, SubscriberRequest};

/// What a connection has registered as.
#[derive(Debug, Clone, Default)]
pub enum Attachment {
    /// Nothing yet; data is dropped.
    #[default]
    None,
    /// A publisher appending to this list.
    Publisher(Arc<DataList>),
    /// A member of this subscriber group.
    Subscriber(Arc<LogicalNode>),
}

/// Per-connection state owned by the connection's reader.
#[derive(Debug)]
pub struct ConnectionContext {
    connection: ConnectionRef,
    attachment: Attachment,
}

impl ConnectionContext {
    /// The physical connection.
    #[must_use]
    pub fn connection(&self) -> &ConnectionRef {
        &self.connection
    }

    /// The connection identity.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// The current attachment.
    #[must_use]
    pub fn attachment(&self) -> &Attachment {
        &self.attachment
    }
}

/// The broker: publisher buffers, subscriber groups and connection registries.
///
/// One instance is shared by every connection. Each connection drives it
/// from a single reader through its [`ConnectionContext`], so calls for one
/// connection arrive in order while different connections run concurrently.
///
/// Lock order is groups before publisher buffers. Neither map lock is held
/// while tuples are delivered.
pub struct ServerHandler {
    config: BrokerConfig,
    policies: PolicyRegistry,
    connected: ConnectionGroup,
    publisher_buffers: Mutex<FxHashMap<String, Arc<DataList>>>,
    groups: Mutex<FxHashMap<String, Arc<LogicalNode>>>,
    publisher_channels: ConnectionRegistry,
    subscriber_channels: ConnectionRegistry,
}

impl ServerHandler {
    /// Creates a handler with only the built-in policies.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_policies(config, PolicyRegistry::new())
    }

    /// Creates a handler resolving custom policies through `policies`.
    #[must_use]
    pub fn with_policies(config: BrokerConfig, policies: PolicyRegistry) -> Self {
        Self {
            config,
            policies,
            connected: ConnectionGroup::new(),
            publisher_buffers: Mutex::new(FxHashMap::default()),
            groups: Mutex::new(FxHashMap::default()),
            publisher_channels: ConnectionRegistry::new(),
            subscriber_channels: ConnectionRegistry::new(),
        }
    }

    /// Broker configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Custom policy registry.
    #[must_use]
    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    /// Registers a new connection and returns its context.
    pub fn channel_connected(&self, connection: ConnectionRef) -> ConnectionContext {
        debug!(connection = connection.id(), "connection opened");
        self.connected.add(Arc::clone(&connection));
        ConnectionContext {
            connection,
            attachment: Attachment::None,
        }
    }

    /// Dispatches one decoded message.
    ///
    /// # Errors
    ///
    /// Returns [`BufferServerError::UnknownPolicy`] if a subscriber asked for
    /// an unregistered custom policy. The caller should close the connection.
    pub fn message_received(
        &self,
        ctx: &mut ConnectionContext,
        message: Message,
    ) -> Result<(), BufferServerError> {
        match message {
            Message::PublisherRequest(request) => {
                self.handle_publisher_request(ctx, &request);
                Ok(())
            }
            Message::SubscriberRequest(request) => self.handle_subscriber_request(ctx, &request),
            Message::PurgeRequest(request) => {
                self.handle_purge_request(&request);
                Ok(())
            }
            Message::Data(data) => {
                self.append(ctx, data);
                Ok(())
            }
        }
    }

    /// Attaches the connection as publisher of `request.identifier`.
    ///
    /// An existing buffer is reused, so a restarted publisher continues where
    /// the previous connection stopped. A different connection still recorded
    /// for the identifier is closed.
    pub fn handle_publisher_request(&self, ctx: &mut ConnectionContext, request: &PublisherRequest) {
        self.detach(ctx);

        let data_list = self.data_list_or_create(&request.identifier, &request.stream_type);
        if let Some(previous) = self
            .publisher_channels
            .register(&request.identifier, Arc::clone(&ctx.connection))
        {
            warn!(
                publisher = %request.identifier,
                previous = previous.id(),
                connection = ctx.id(),
                "publisher reconnected, closing stale connection"
            );
            previous.close();
        }

        info!(
            publisher = %request.identifier,
            stream_type = %request.stream_type,
            connection = ctx.id(),
            buffered = data_list.len(),
            "publisher registered"
        );
        ctx.attachment = Attachment::Publisher(data_list);
    }

    /// Attaches the connection to the subscriber group `request.group_type`,
    /// creating the group on first use.
    ///
    /// A new group starts with a cursor on the upstream buffer, replays
    /// everything buffered from `request.window_id` and then delivers live.
    /// Joining an existing group ignores the request's window, policy and
    /// partitions.
    ///
    /// # Errors
    ///
    /// Returns [`BufferServerError::UnknownPolicy`] if the group would be
    /// created with an unregistered custom policy. Nothing is attached then.
    pub fn handle_subscriber_request(
        &self,
        ctx: &mut ConnectionContext,
        request: &SubscriberRequest,
    ) -> Result<(), BufferServerError> {
        self.detach(ctx);

        let mut groups = self.groups.lock();
        if let Some(node) = groups.get(&request.group_type).cloned() {
            node.add_channel(Arc::clone(&ctx.connection));
            drop(groups);

            if node.upstream() != request.upstream_identifier {
                warn!(
                    group = %request.group_type,
                    upstream = %node.upstream(),
                    requested = %request.upstream_identifier,
                    "subscriber joined group with a different upstream"
                );
            }
            self.record_subscriber(ctx, request);
            info!(
                subscriber = %request.identifier,
                group = %request.group_type,
                members = node.physical_node_count(),
                "subscriber joined existing group"
            );
            ctx.attachment = Attachment::Subscriber(node);
            return Ok(());
        }

        let policy = self.policies.resolve(&request.policy)?;
        let data_list = self.data_list_or_create(&request.upstream_identifier, &request.group_type);
        let iterator = data_list.new_iterator(request.identifier.as_str(), Arc::new(TupleInspector));
        let node = Arc::new(LogicalNode::new(
            request.upstream_identifier.as_str(),
            request.group_type.as_str(),
            iterator,
            policy,
        ));
        for partition in &request.partitions {
            node.add_partition(PartitionFilter::new(partition.clone()));
        }
        groups.insert(request.group_type.clone(), Arc::clone(&node));
        node.add_channel(Arc::clone(&ctx.connection));
        data_list.add_data_listener(Arc::clone(&node) as Arc<dyn DataListener>);
        drop(groups);

        self.record_subscriber(ctx, request);
        let replayed = node.catch_up(request.window_id);
        info!(
            subscriber = %request.identifier,
            group = %request.group_type,
            upstream = %request.upstream_identifier,
            policy = %request.policy,
            window_id = request.window_id,
            replayed,
            "subscriber group created"
        );
        ctx.attachment = Attachment::Subscriber(node);
        Ok(())
    }

    /// Drops buffered tuples of `request.identifier` older than `request.window_id`.
    ///
    /// Returns the number of tuples dropped.
    pub fn handle_purge_request(&self, request: &PurgeRequest) -> usize {
        let Some(data_list) = self.data_list(&request.identifier) else {
            info!(publisher = %request.identifier, "purge for unknown publisher ignored");
            return 0;
        };
        let purged = data_list.purge(request.window_id);
        info!(
            publisher = %request.identifier,
            window_id = request.window_id,
            purged,
            "purge request handled"
        );
        purged
    }

    /// Appends a tuple from a publisher connection.
    ///
    /// Data on a connection that is not a registered publisher is logged and dropped.
    pub fn append(&self, ctx: &ConnectionContext, data: Data) {
        if let Attachment::Publisher(data_list) = &ctx.attachment {
            data_list.append(data);
        } else {
            info!(
                connection = ctx.id(),
                window_id = data.window_id,
                "data received before publisher registration, dropped"
            );
        }
    }

    /// Cleans up after a closed connection.
    ///
    /// A publisher's buffer survives its connection. A subscriber leaves its
    /// group; the last member leaving tears the group down.
    pub fn channel_disconnected(&self, ctx: &mut ConnectionContext) {
        self.detach(ctx);
        self.connected.remove(ctx.id());
        debug!(connection = ctx.id(), "connection closed");
    }

    /// Logs a transport fault and closes the connection.
    pub fn exception_caught(&self, ctx: &ConnectionContext, error: &dyn std::error::Error) {
        warn!(connection = ctx.id(), error = %error, "connection fault, closing");
        ctx.connection.close();
    }

    /// Closes every open connection and returns how many were closed.
    pub fn shutdown(&self) -> usize {
        let closed = self.connected.close_all();
        info!(closed, "buffer server shutting down");
        closed
    }

    /// Largest outbound backlog among the subscribers reading the buffer a
    /// publisher connection appends to. Zero for any other connection.
    #[must_use]
    pub fn downstream_backlog(&self, ctx: &ConnectionContext) -> usize {
        let Attachment::Publisher(data_list) = &ctx.attachment else {
            return 0;
        };
        let readers: Vec<Arc<LogicalNode>> = self
            .groups
            .lock()
            .values()
            .filter(|node| Arc::ptr_eq(node.data_list(), data_list))
            .cloned()
            .collect();
        readers.iter().map(|node| node.max_backlog()).max().unwrap_or(0)
    }

    /// Returns true while a publisher connection should not be read.
    #[must_use]
    pub fn should_pause(&self, ctx: &ConnectionContext) -> bool {
        self.downstream_backlog(ctx) >= self.config.max_backlog
    }

    /// Returns the buffer of publisher `identifier`.
    #[must_use]
    pub fn data_list(&self, identifier: &str) -> Option<Arc<DataList>> {
        self.publisher_buffers.lock().get(identifier).cloned()
    }

    /// Returns the subscriber group `group_type`.
    #[must_use]
    pub fn logical_node(&self, group_type: &str) -> Option<Arc<LogicalNode>> {
        self.groups.lock().get(group_type).cloned()
    }

    /// Number of publisher buffers.
    #[must_use]
    pub fn publisher_buffer_count(&self) -> usize {
        self.publisher_buffers.lock().len()
    }

    /// Number of subscriber groups.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.lock().len()
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connected.len()
    }

    /// Live connection recorded for publisher `identifier`.
    #[must_use]
    pub fn publisher_connection(&self, identifier: &str) -> Option<ConnectionRef> {
        self.publisher_channels.get(identifier)
    }

    /// Live connection recorded for subscriber `identifier`.
    #[must_use]
    pub fn subscriber_connection(&self, identifier: &str) -> Option<ConnectionRef> {
        self.subscriber_channels.get(identifier)
    }

    fn data_list_or_create(&self, identifier: &str, stream_type: &str) -> Arc<DataList> {
        let mut buffers = self.publisher_buffers.lock();
        if let Some(data_list) = buffers.get(identifier) {
            return Arc::clone(data_list);
        }
        let data_list = Arc::new(DataList::new(identifier, stream_type));
        buffers.insert(identifier.to_string(), Arc::clone(&data_list));
        debug!(publisher = %identifier, stream_type = %stream_type, "publisher buffer created");
        data_list
    }

    fn record_subscriber(&self, ctx: &ConnectionContext, request: &SubscriberRequest) {
        if let Some(previous) = self
            .subscriber_channels
            .register(&request.identifier, Arc::clone(&ctx.connection))
        {
            warn!(
                subscriber = %request.identifier,
                previous = previous.id(),
                connection = ctx.id(),
                "subscriber reconnected, closing stale connection"
            );
            previous.close();
        }
    }

    fn detach(&self, ctx: &mut ConnectionContext) {
        match std::mem::take(&mut ctx.attachment) {
            Attachment::None => {}
            Attachment::Publisher(data_list) => {
                if let Some(identifier) = self.publisher_channels.remove_connection(ctx.id()) {
                    info!(
                        publisher = %identifier,
                        buffered = data_list.len(),
                        "publisher disconnected"
                    );
                }
            }
            Attachment::Subscriber(node) => {
                self.subscriber_channels.remove_connection(ctx.id());
                let torn_down = {
                    let mut groups = self.groups.lock();
                    let remaining = node.remove_channel(ctx.id());
                    let current = groups
                        .get(node.group())
                        .is_some_and(|g| Arc::ptr_eq(g, &node));
                    if remaining == 0 && current {
                        groups.remove(node.group());
                    }
                    remaining == 0
                };
                if torn_down {
                    let listener: Arc<dyn DataListener> = Arc::clone(&node) as Arc<dyn DataListener>;
                    node.data_list().remove_data_listener(&listener);
                    node.release();
                    info!(
                        group = %node.group(),
                        upstream = %node.upstream(),
                        "last subscriber left, group removed"
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for ServerHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandler")
            .field("publishers", &self.publisher_buffer_count())
            .field("groups", &self.group_count())
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bufferserver::testing::RecordingConnection;
    use crate::bufferserver::Connection;
    use crate::protocol::{PolicyType, WindowId};

    fn handler() -> ServerHandler {
        ServerHandler::new(BrokerConfig::default())
    }

    fn publisher(handler: &ServerHandler, identifier: &str) -> (Arc<RecordingConnection>, ConnectionContext) {
        let conn = RecordingConnection::new();
        let mut ctx = handler.channel_connected(conn.clone());
        handler.handle_publisher_request(&mut ctx, &PublisherRequest::new(identifier, "events"));
        (conn, ctx)
    }

    fn subscriber(
        handler: &ServerHandler,
        request: &SubscriberRequest,
    ) -> (Arc<RecordingConnection>, ConnectionContext) {
        let conn = RecordingConnection::new();
        let mut ctx = handler.channel_connected(conn.clone());
        handler.handle_subscriber_request(&mut ctx, request).unwrap();
        (conn, ctx)
    }

    fn send_window(handler: &ServerHandler, ctx: &ConnectionContext, window: WindowId, payloads: &[&str]) {
        handler.append(ctx, Data::begin_window(window));
        for payload in payloads {
            handler.append(ctx, Data::payload(window, Vec::new(), payload.as_bytes().to_vec()));
        }
        handler.append(ctx, Data::end_window(window));
    }

    #[test]
    fn test_publisher_request_creates_buffer() {
        let handler = handler();
        let (conn, ctx) = publisher(&handler, "pub-1");
        assert!(matches!(ctx.attachment(), Attachment::Publisher(_)));
        assert_eq!(handler.publisher_buffer_count(), 1);
        assert_eq!(handler.publisher_connection("pub-1").unwrap().id(), conn.id());
    }

    #[test]
    fn test_data_before_registration_dropped() {
        let handler = handler();
        let conn = RecordingConnection::new();
        let mut ctx = handler.channel_connected(conn.clone());
        handler
            .message_received(&mut ctx, Message::Data(Data::begin_window(1)))
            .unwrap();
        assert_eq!(handler.publisher_buffer_count(), 0);
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_subscriber_receives_live_data() {
        let handler = handler();
        let (_pconn, pctx) = publisher(&handler, "pub-1");
        let (sconn, _sctx) = subscriber(&handler, &SubscriberRequest::new("sub-1", "g", "pub-1"));

        send_window(&handler, &pctx, 1, &["a", "b"]);
        assert_eq!(sconn.sent_payloads(), vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(sconn.sent_count(), 4);
    }

    #[test]
    fn test_subscriber_catches_up_from_window() {
        let handler = handler();
        let (_pconn, pctx) = publisher(&handler, "pub-1");
        send_window(&handler, &pctx, 1, &["a"]);
        send_window(&handler, &pctx, 2, &["b"]);

        let request = SubscriberRequest::new("sub-1", "g", "pub-1").from_window(2);
        let (sconn, _sctx) = subscriber(&handler, &request);
        send_window(&handler, &pctx, 3, &["c"]);

        assert_eq!(sconn.sent_windows(), vec![2, 2, 2, 3, 3, 3]);
    }

    #[test]
    fn test_subscriber_before_publisher() {
        let handler = handler();
        let (sconn, _sctx) = subscriber(&handler, &SubscriberRequest::new("sub-1", "g", "pub-1"));
        assert_eq!(handler.publisher_buffer_count(), 1);

        let (_pconn, pctx) = publisher(&handler, "pub-1");
        send_window(&handler, &pctx, 1, &["a"]);
        assert_eq!(sconn.sent_payloads(), vec![b"a".to_vec()]);
    }

    #[test]
    fn test_second_subscriber_joins_group() {
        let handler = handler();
        let (_pconn, pctx) = publisher(&handler, "pub-1");
        let request = SubscriberRequest::new("sub-1", "g", "pub-1").with_policy(PolicyType::RoundRobin);
        let (a, actx) = subscriber(&handler, &request);
        let (b, _bctx) = subscriber(&handler, &SubscriberRequest::new("sub-2", "g", "pub-1"));

        assert_eq!(handler.group_count(), 1);
        let node = handler.logical_node("g").unwrap();
        assert_eq!(node.physical_node_count(), 2);
        assert!(matches!(actx.attachment(), Attachment::Subscriber(n) if Arc::ptr_eq(n, &node)));

        send_window(&handler, &pctx, 1, &["1", "2", "3", "4"]);
        assert_eq!(a.sent_payloads(), vec![b"1".to_vec(), b"3".to_vec()]);
        assert_eq!(b.sent_payloads(), vec![b"2".to_vec(), b"4".to_vec()]);
    }

    #[test]
    fn test_unknown_custom_policy_rejected() {
        let handler = handler();
        let conn = RecordingConnection::new();
        let mut ctx = handler.channel_connected(conn.clone());
        let request = SubscriberRequest::new("sub-1", "g", "pub-1")
            .with_policy(PolicyType::Custom("sticky".into()));

        let err = handler.handle_subscriber_request(&mut ctx, &request).unwrap_err();
        assert!(matches!(err, BufferServerError::UnknownPolicy(_)));
        assert_eq!(handler.group_count(), 0);
        assert!(matches!(ctx.attachment(), Attachment::None));
        assert!(handler.subscriber_connection("sub-1").is_none());
    }

    #[test]
    fn test_duplicate_subscriber_closes_previous() {
        let handler = handler();
        let (old, _old_ctx) = subscriber(&handler, &SubscriberRequest::new("sub-1", "g", "pub-1"));
        let (new, _new_ctx) = subscriber(&handler, &SubscriberRequest::new("sub-1", "g", "pub-1"));

        assert!(old.is_closed());
        assert!(!new.is_closed());
        assert_eq!(handler.subscriber_connection("sub-1").unwrap().id(), new.id());
    }

    #[test]
    fn test_publisher_reconnect_keeps_buffer() {
        let handler = handler();
        let (old, mut old_ctx) = publisher(&handler, "pub-1");
        let (sub, _sctx) = subscriber(&handler, &SubscriberRequest::new("sub-1", "g", "pub-1"));
        send_window(&handler, &old_ctx, 1, &["a"]);

        let (new, new_ctx) = publisher(&handler, "pub-1");
        assert!(old.is_closed());
        handler.channel_disconnected(&mut old_ctx);
        assert_eq!(handler.publisher_connection("pub-1").unwrap().id(), new.id());

        send_window(&handler, &new_ctx, 2, &["b"]);
        let data_list = handler.data_list("pub-1").unwrap();
        assert_eq!(data_list.len(), 6);

        // The attached subscriber keeps reading the same sequence.
        assert!(!sub.is_closed());
        assert_eq!(sub.sent_windows(), vec![1, 1, 1, 2, 2, 2]);
        assert_eq!(sub.sent_payloads(), vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(handler.group_count(), 1);
    }

    #[test]
    fn test_round_robin_reconnect_loses_nothing() {
        let handler = handler();
        let (_pconn, pctx) = publisher(&handler, "pub-1");
        let request = SubscriberRequest::new("sub-1", "g", "pub-1").with_policy(PolicyType::RoundRobin);
        let (old, _old_ctx) = subscriber(&handler, &request);
        let (other, _other_ctx) = subscriber(&handler, &SubscriberRequest::new("sub-2", "g", "pub-1"));

        // sub-1 reconnects before the old socket's disconnect is handled.
        let (new, _new_ctx) = subscriber(&handler, &request);
        assert!(old.is_closed());

        send_window(&handler, &pctx, 1, &["1", "2", "3", "4", "5", "6"]);
        let received = new.sent_payloads().len() + other.sent_payloads().len();
        assert_eq!(received, 6);
        assert!(old.sent_payloads().is_empty());
    }

    #[test]
    fn test_slow_subscriber_pauses_publisher() {
        let config = BrokerConfig {
            max_backlog: 8,
            ..BrokerConfig::default()
        };
        let handler = ServerHandler::new(config);
        let (_pconn, pctx) = publisher(&handler, "pub-1");
        let (_other, octx) = publisher(&handler, "pub-2");
        let (fast, fctx) = subscriber(&handler, &SubscriberRequest::new("sub-1", "g1", "pub-1"));
        let (slow, _sctx) = subscriber(&handler, &SubscriberRequest::new("sub-2", "g2", "pub-1"));
        assert!(!handler.should_pause(&pctx));

        fast.set_backlog(2);
        slow.set_backlog(8);
        assert_eq!(handler.downstream_backlog(&pctx), 8);
        assert!(handler.should_pause(&pctx));

        // Other publishers and subscriber connections are never paused.
        assert!(!handler.should_pause(&octx));
        assert!(!handler.should_pause(&fctx));

        slow.set_backlog(7);
        assert!(!handler.should_pause(&pctx));
    }

    #[test]
    fn test_last_subscriber_leaving_tears_down_group() {
        let handler = handler();
        let (_pconn, pctx) = publisher(&handler, "pub-1");
        let (_a, mut actx) = subscriber(&handler, &SubscriberRequest::new("sub-1", "g", "pub-1"));
        let (_b, mut bctx) = subscriber(&handler, &SubscriberRequest::new("sub-2", "g", "pub-1"));
        let data_list = handler.data_list("pub-1").unwrap();
        assert_eq!(data_list.listener_count(), 1);
        assert_eq!(data_list.iterator_count(), 1);

        handler.channel_disconnected(&mut actx);
        assert_eq!(handler.group_count(), 1);

        handler.channel_disconnected(&mut bctx);
        assert_eq!(handler.group_count(), 0);
        assert_eq!(data_list.listener_count(), 0);
        assert_eq!(data_list.iterator_count(), 0);

        // Buffer survives and a fresh group starts from the requested window.
        send_window(&handler, &pctx, 5, &["x"]);
        let request = SubscriberRequest::new("sub-3", "g", "pub-1").from_window(5);
        let (c, _cctx) = subscriber(&handler, &request);
        assert_eq!(c.sent_payloads(), vec![b"x".to_vec()]);
        assert_eq!(handler.group_count(), 1);
    }

    #[test]
    fn test_purge_request() {
        let handler = handler();
        let (_pconn, pctx) = publisher(&handler, "pub-1");
        send_window(&handler, &pctx, 1, &["a"]);
        send_window(&handler, &pctx, 2, &["b"]);

        assert_eq!(handler.handle_purge_request(&PurgeRequest::new("pub-1", 2)), 3);
        assert_eq!(handler.handle_purge_request(&PurgeRequest::new("missing", 2)), 0);
        assert_eq!(handler.data_list("pub-1").unwrap().len(), 3);
    }

    #[test]
    fn test_failed_subscriber_send_closes_connection() {
        let handler = handler();
        let (_pconn, pctx) = publisher(&handler, "pub-1");
        let (a, _actx) = subscriber(&handler, &SubscriberRequest::new("sub-1", "g", "pub-1"));
        let (b, _bctx) = subscriber(&handler, &SubscriberRequest::new("sub-2", "g", "pub-1"));
        a.fail_sends(true);

        send_window(&handler, &pctx, 1, &["a"]);
        assert!(a.is_closed());
        assert_eq!(b.sent_count(), 3);
    }

    #[test]
    fn test_exception_closes_connection() {
        let handler = handler();
        let (conn, ctx) = publisher(&handler, "pub-1");
        let err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        handler.exception_caught(&ctx, &err);
        assert!(conn.is_closed());
    }

    #[test]
    fn test_shutdown_closes_all() {
        let handler = handler();
        let (p, _pctx) = publisher(&handler, "pub-1");
        let (s, mut sctx) = subscriber(&handler, &SubscriberRequest::new("sub-1", "g", "pub-1"));
        assert_eq!(handler.connection_count(), 2);

        handler.channel_disconnected(&mut sctx);
        assert_eq!(handler.connection_count(), 1);
        assert_eq!(handler.shutdown(), 1);
        assert!(p.is_closed());
        assert!(!s.is_closed());
    }
}
