//! TCP front end of the buffer server.
//!
//! Every accepted socket gets a reader loop, which decodes frames and drives
//! the shared [`ServerHandler`], and a writer task, which owns the write half
//! and drains the connection's outbound queue.
//!
//! Outbound queues accept every tuple the broker hands them. Backpressure is
//! applied on the inbound side instead: while any subscriber of a publisher's
//! buffer holds [`BrokerConfig::max_backlog`](crate::BrokerConfig) pending
//! frames or more, that publisher's socket is not read, and TCP flow control
//! stalls the remote publisher.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::bufferserver::{
    next_connection_id, BufferServerError, Connection, ConnectionContext, ConnectionId,
    ServerHandler,
};
use crate::protocol::{decode_frame, encode_frame, Data, Message};

const READ_BUFFER_SIZE: usize = 64 * 1024;
const WRITE_BATCH_BYTES: usize = 64 * 1024;

/// A broker connection backed by a TCP socket.
#[derive(Debug)]
pub struct TcpConnection {
    id: ConnectionId,
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Arc<Data>>,
    backlog: Arc<AtomicUsize>,
    backlog_warning_threshold: usize,
    closed: watch::Sender<bool>,
}

impl TcpConnection {
    /// Remote address.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Connection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, data: &Arc<Data>) -> Result<(), BufferServerError> {
        if self.is_closed() {
            return Err(BufferServerError::ConnectionClosed(self.id));
        }
        let backlog = self.backlog.fetch_add(1, Ordering::AcqRel) + 1;
        if self.outbound.send(Arc::clone(data)).is_err() {
            self.backlog.fetch_sub(1, Ordering::AcqRel);
            return Err(BufferServerError::ConnectionClosed(self.id));
        }
        if backlog == self.backlog_warning_threshold {
            warn!(
                connection = self.id,
                peer = %self.peer,
                backlog,
                "subscriber is falling behind"
            );
        }
        Ok(())
    }

    fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.send_if_modified(|closed| !std::mem::replace(closed, true));
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// The listening broker.
pub struct BufferServer {
    handler: Arc<ServerHandler>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BufferServer {
    /// Binds the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`BufferServerError::Io`] if the address cannot be bound.
    pub async fn bind(handler: Arc<ServerHandler>, addr: SocketAddr) -> Result<Self, BufferServerError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            handler,
            listener,
            local_addr,
        })
    }

    /// Address actually bound (useful with port 0).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The shared protocol handler.
    #[must_use]
    pub fn handler(&self) -> &Arc<ServerHandler> {
        &self.handler
    }

    /// Accepts connections until `shutdown` turns true (or its sender is
    /// dropped), then closes every open connection.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(addr = %self.local_addr, "buffer server listening");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handler = Arc::clone(&self.handler);
                        tokio::spawn(serve_connection(handler, stream, peer));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.handler.shutdown();
        info!(addr = %self.local_addr, "buffer server stopped");
    }
}

async fn serve_connection(handler: Arc<ServerHandler>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "set_nodelay failed");
    }
    let (mut reader, writer) = stream.into_split();
    let (outbound, queue) = mpsc::unbounded_channel();
    let (closed, mut closed_rx) = watch::channel(false);
    let backlog = Arc::new(AtomicUsize::new(0));
    let connection = Arc::new(TcpConnection {
        id: next_connection_id(),
        peer,
        outbound,
        backlog: Arc::clone(&backlog),
        backlog_warning_threshold: handler.config().backlog_warning_threshold,
        closed,
    });
    let writer_task = tokio::spawn(write_loop(
        writer,
        queue,
        backlog,
        closed_rx.clone(),
        Arc::downgrade(&connection),
    ));

    let max_frame_len = handler.config().max_frame_len;
    let mut ctx = handler.channel_connected(Arc::clone(&connection) as Arc<dyn Connection>);
    info!(connection = connection.id, peer = %peer, "connection accepted");

    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    'session: loop {
        loop {
            match decode_frame(&mut buf, max_frame_len) {
                Ok(Some(message)) => {
                    if let Err(e) = handler.message_received(&mut ctx, message) {
                        handler.exception_caught(&ctx, &e);
                        break 'session;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    handler.exception_caught(&ctx, &e);
                    break 'session;
                }
            }
        }

        if connection.is_closed() {
            break;
        }
        if !wait_for_subscribers(&handler, &ctx, &mut closed_rx).await {
            break;
        }
        tokio::select! {
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    handler.exception_caught(&ctx, &e);
                    break;
                }
            },
            _ = closed_rx.changed() => break,
        }
    }

    connection.close();
    handler.channel_disconnected(&mut ctx);
    if let Err(e) = writer_task.await {
        warn!(connection = connection.id, error = %e, "writer task failed");
    }
    info!(connection = connection.id, peer = %peer, "connection closed");
}

/// Waits while the publisher on `ctx` is ahead of its slowest subscriber.
///
/// Returns false if the connection closed meanwhile.
async fn wait_for_subscribers(
    handler: &ServerHandler,
    ctx: &ConnectionContext,
    closed: &mut watch::Receiver<bool>,
) -> bool {
    if !handler.should_pause(ctx) {
        return true;
    }
    debug!(
        connection = ctx.id(),
        backlog = handler.downstream_backlog(ctx),
        "subscribers behind, pausing publisher"
    );
    let interval = handler.config().stall_interval;
    while handler.should_pause(ctx) {
        if *closed.borrow() {
            return false;
        }
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            changed = closed.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
    debug!(connection = ctx.id(), "publisher resumed");
    true
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Arc<Data>>,
    backlog: Arc<AtomicUsize>,
    mut closed: watch::Receiver<bool>,
    connection: Weak<TcpConnection>,
) {
    let mut buf = BytesMut::with_capacity(WRITE_BATCH_BYTES);
    loop {
        if *closed.borrow() {
            break;
        }
        let first = tokio::select! {
            item = queue.recv() => match item {
                Some(data) => data,
                None => break,
            },
            _ = closed.changed() => break,
        };

        buf.clear();
        encode_frame(&Message::Data(Data::clone(&first)), &mut buf);
        let mut batched = 1;
        while buf.len() < WRITE_BATCH_BYTES {
            match queue.try_recv() {
                Ok(data) => {
                    encode_frame(&Message::Data(Data::clone(&data)), &mut buf);
                    batched += 1;
                }
                Err(_) => break,
            }
        }

        let written = writer.write_all(&buf).await;
        backlog.fetch_sub(batched, Ordering::AcqRel);
        if let Err(e) = written {
            debug!(error = %e, "write failed, closing connection");
            if let Some(connection) = connection.upgrade() {
                connection.close();
            }
            break;
        }
    }
    let _ = writer.shutdown().await;
}
