//! # `Confluence` Core
//!
//! Data-distribution backbone of a windowed stream-processing engine.
//!
//! This crate provides:
//! - **Buffer server**: publishers append to per-identifier buffers
//!   ([`DataList`](bufferserver::DataList)), subscriber groups
//!   ([`LogicalNode`](bufferserver::LogicalNode)) read them through cursors and
//!   fan out to their member connections under a distribution policy.
//! - **Merge reservoirs**: bounded, backpressured input queues that let a
//!   fan-in node combine several upstream streams without crossing window
//!   boundaries.
//! - **Protocol and transport**: the typed protocol messages, a binary frame
//!   codec and a tokio TCP server/client.
//!
//! ## Data Flow
//!
//! ```text
//! Publisher ──▶ DataList ──notify──▶ LogicalNode ──Policy──▶ Subscriber(s)
//!                                                               │
//!                                                               ▼
//!                          UnifierNode ◀── MergeReservoir ◀── Reservoir
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use confluence_core::bufferserver::ServerHandler;
//! use confluence_core::transport::BufferServer;
//!
//! let handler = Arc::new(ServerHandler::new(BrokerConfig::default()));
//! let server = BufferServer::bind(handler, "127.0.0.1:9080".parse()?).await?;
//! server.run(shutdown_rx).await;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bufferserver;
pub mod config;
pub mod engine;
pub mod protocol;
pub mod transport;

pub use config::{BrokerConfig, ReservoirConfig};

/// Result type for confluence-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for confluence-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Buffer server errors
    #[error("Buffer server error: {0}")]
    BufferServer(#[from] bufferserver::BufferServerError),

    /// Frame encoding/decoding errors
    #[error("Codec error: {0}")]
    Codec(#[from] protocol::CodecError),

    /// Reservoir errors
    #[error("Reservoir error: {0}")]
    Reservoir(#[from] engine::ReservoirError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
