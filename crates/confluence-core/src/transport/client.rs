//! Async client for publishers and subscribers.

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use crate::bufferserver::BufferServerError;
use crate::protocol::{
    decode_frame, encode_frame, Data, Message, PublisherRequest, PurgeRequest, SubscriberRequest,
    WindowId, DEFAULT_MAX_FRAME_LEN,
};

/// One broker connection speaking the frame protocol.
///
/// A publisher calls [`publish`](Self::publish) once and then
/// [`send`](Self::send)s tuples. A subscriber calls
/// [`subscribe`](Self::subscribe) and then [`recv`](Self::recv)s.
#[derive(Debug)]
pub struct BufferClient {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    max_frame_len: usize,
    closed: bool,
}

impl BufferClient {
    /// Connects to a broker.
    ///
    /// # Errors
    ///
    /// Returns [`BufferServerError::Io`] if the connection fails.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, BufferServerError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            read_buf: BytesMut::with_capacity(64 * 1024),
            write_buf: BytesMut::with_capacity(4 * 1024),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            closed: false,
        })
    }

    /// Sets the largest frame [`recv`](Self::recv) accepts.
    #[must_use]
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Registers as publisher `identifier`.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be written.
    pub async fn publish(
        &mut self,
        identifier: impl Into<String>,
        stream_type: impl Into<String>,
    ) -> Result<(), BufferServerError> {
        self.write(&PublisherRequest::new(identifier, stream_type).into())
            .await
    }

    /// Joins a subscriber group.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be written.
    pub async fn subscribe(&mut self, request: SubscriberRequest) -> Result<(), BufferServerError> {
        self.write(&request.into()).await
    }

    /// Sends one tuple.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be written.
    pub async fn send(&mut self, data: Data) -> Result<(), BufferServerError> {
        self.write(&data.into()).await
    }

    /// Asks the broker to drop buffered windows of `identifier` before `window_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be written.
    pub async fn purge(
        &mut self,
        identifier: impl Into<String>,
        window_id: WindowId,
    ) -> Result<(), BufferServerError> {
        self.write(&PurgeRequest::new(identifier, window_id).into())
            .await
    }

    /// Receives the next tuple.
    ///
    /// Returns `Ok(None)` once the broker closed the connection, or once
    /// [`close`](Self::close) was called and buffered frames are used up.
    ///
    /// # Errors
    ///
    /// Returns an error on socket failure or a malformed frame.
    pub async fn recv(&mut self) -> Result<Option<Data>, BufferServerError> {
        loop {
            while let Some(message) = decode_frame(&mut self.read_buf, self.max_frame_len)? {
                match message {
                    Message::Data(data) => return Ok(Some(data)),
                    other => debug!(?other, "ignoring non-data message from broker"),
                }
            }
            if self.closed {
                return Ok(None);
            }
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Ok(None);
            }
        }
    }

    /// Shuts down the write side. Calling it again has no effect.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown itself fails.
    pub async fn close(&mut self) -> Result<(), BufferServerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Returns true once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    async fn write(&mut self, message: &Message) -> Result<(), BufferServerError> {
        if self.closed {
            return Err(std::io::Error::from(std::io::ErrorKind::NotConnected).into());
        }
        self.write_buf.clear();
        encode_frame(message, &mut self.write_buf);
        self.stream.write_all(&self.write_buf).await?;
        Ok(())
    }
}
