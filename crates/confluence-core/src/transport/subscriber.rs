//! Bridge from a broker subscription into a merge reservoir.

use std::sync::Arc;

use bytes::Bytes;
use tokio::net::ToSocketAddrs;
use tokio::sync::watch;
use tracing::{debug, info};

use super::BufferClient;
use crate::engine::{MergeReservoir, StreamItem, Tuple};
use crate::protocol::{Data, DataKind, SubscriberRequest};

/// Converts a broker tuple into an input-port item.
#[must_use]
pub fn stream_item(data: Data) -> StreamItem<Bytes> {
    match data.kind {
        DataKind::BeginWindow => StreamItem::Control(Tuple::BeginWindow(data.window_id)),
        DataKind::EndWindow => StreamItem::Control(Tuple::EndWindow(data.window_id)),
        DataKind::Payload { bytes, .. } => StreamItem::Data(bytes),
    }
}

/// Feeds one broker subscription into the reservoir of one input port.
#[derive(Debug)]
pub struct BufferSubscriber {
    client: BufferClient,
    reservoir: Arc<MergeReservoir<Bytes>>,
}

impl BufferSubscriber {
    /// Connects to the broker and joins the group described by `request`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the subscribe frame fails.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        request: SubscriberRequest,
        reservoir: Arc<MergeReservoir<Bytes>>,
    ) -> crate::Result<Self> {
        let mut client = BufferClient::connect(addr).await?;
        info!(
            subscriber = %request.identifier,
            group = %request.group_type,
            upstream = %request.upstream_identifier,
            port = %reservoir.name(),
            "subscribing"
        );
        client.subscribe(request).await?;
        Ok(Self { client, reservoir })
    }

    /// Pumps tuples into the reservoir until the broker closes the
    /// connection or `shutdown` turns true.
    ///
    /// On broker close, `EndStream` is queued so the port drains and retires.
    /// Returns the number of tuples forwarded.
    ///
    /// # Errors
    ///
    /// Returns an error on socket failure, a malformed frame, or a cancelled
    /// reservoir.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> crate::Result<u64> {
        let mut forwarded = 0u64;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let received = tokio::select! {
                received = self.client.recv() => received?,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };
            let Some(data) = received else {
                self.reservoir
                    .process_async(StreamItem::Control(Tuple::EndStream))
                    .await?;
                debug!(port = %self.reservoir.name(), forwarded, "broker closed subscription");
                break;
            };
            self.reservoir.process_async(stream_item(data)).await?;
            forwarded += 1;
        }
        self.client.close().await?;
        Ok(forwarded)
    }
}
