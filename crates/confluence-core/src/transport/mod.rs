//! # Transport
//!
//! Tokio TCP plumbing around the buffer server: the listening
//! [`BufferServer`], the [`BufferClient`] used by publishers and subscribers,
//! and [`BufferSubscriber`], which pumps a subscription into a merge reservoir.

mod client;
mod server;
mod subscriber;

pub use client::BufferClient;
pub use server::{BufferServer, TcpConnection};
pub use subscriber::{stream_item, BufferSubscriber};
