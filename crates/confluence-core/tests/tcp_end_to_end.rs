//! End-to-end: TCP publisher → broker → subscribers → unifier node.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::timeout;

use confluence_core::bufferserver::ServerHandler;
use confluence_core::config::ReservoirConfig;
use confluence_core::engine::{
    CollectSink, InputMode, PassThroughUnifier, StreamItem, Tuple, UnifierNode,
};
use confluence_core::protocol::{Data, PolicyType, SubscriberRequest};
use confluence_core::transport::{BufferClient, BufferServer, BufferSubscriber};
use confluence_core::BrokerConfig;

const DEADLINE: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("confluence_core=debug")
        .with_test_writer()
        .try_init();
}

async fn start_server() -> (SocketAddr, Arc<ServerHandler>, watch::Sender<bool>) {
    init_tracing();
    let handler = Arc::new(ServerHandler::new(BrokerConfig::default()));
    let server = BufferServer::bind(Arc::clone(&handler), "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = server.local_addr();
    let (tx, rx) = watch::channel(false);
    tokio::spawn(server.run(rx));
    (addr, handler, tx)
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    timeout(DEADLINE, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn publish_windows(client: &mut BufferClient, windows: std::ops::RangeInclusive<u64>) {
    for w in windows {
        client.send(Data::begin_window(w)).await.unwrap();
        for i in 0..2u8 {
            client
                .send(Data::payload(w, &b""[..], vec![u8::try_from(w).unwrap(), i]))
                .await
                .unwrap();
        }
        client.send(Data::end_window(w)).await.unwrap();
    }
}

#[tokio::test]
async fn test_publish_subscribe_roundtrip() {
    let (addr, handler, _shutdown) = start_server().await;

    let mut subscriber = BufferClient::connect(addr).await.unwrap();
    subscriber
        .subscribe(SubscriberRequest::new("sub-1", "g", "pub-1"))
        .await
        .unwrap();
    wait_until(|| handler.group_count() == 1).await;

    let mut publisher = BufferClient::connect(addr).await.unwrap();
    publisher.publish("pub-1", "events").await.unwrap();
    publish_windows(&mut publisher, 1..=2).await;

    let mut windows = Vec::new();
    for _ in 0..8 {
        let data = timeout(DEADLINE, subscriber.recv())
            .await
            .unwrap()
            .unwrap()
            .expect("stream ended early");
        windows.push(data.window_id);
    }
    assert_eq!(windows, vec![1, 1, 1, 1, 2, 2, 2, 2]);

    publisher.close().await.unwrap();
    publisher.close().await.unwrap();
    assert!(publisher.send(Data::end_window(3)).await.is_err());
}

#[tokio::test]
async fn test_late_subscriber_catches_up_and_purge() {
    let (addr, handler, _shutdown) = start_server().await;

    let mut publisher = BufferClient::connect(addr).await.unwrap();
    publisher.publish("pub-1", "events").await.unwrap();
    publish_windows(&mut publisher, 1..=3).await;
    wait_until(|| handler.data_list("pub-1").is_some_and(|l| l.len() == 12)).await;

    publisher.purge("pub-1", 2).await.unwrap();
    wait_until(|| handler.data_list("pub-1").is_some_and(|l| l.len() == 8)).await;

    let mut subscriber = BufferClient::connect(addr).await.unwrap();
    subscriber
        .subscribe(SubscriberRequest::new("sub-1", "g", "pub-1").from_window(0))
        .await
        .unwrap();
    let first = timeout(DEADLINE, subscriber.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(first, Data::begin_window(2));
}

#[tokio::test]
async fn test_unknown_policy_closes_connection() {
    let (addr, handler, _shutdown) = start_server().await;

    let mut subscriber = BufferClient::connect(addr).await.unwrap();
    subscriber
        .subscribe(
            SubscriberRequest::new("sub-1", "g", "pub-1")
                .with_policy(PolicyType::Custom("missing".into())),
        )
        .await
        .unwrap();

    let result = timeout(DEADLINE, subscriber.recv()).await.unwrap();
    assert!(matches!(result, Ok(None) | Err(_)));
    assert_eq!(handler.group_count(), 0);
}

#[tokio::test]
async fn test_duplicate_publisher_closes_previous() {
    let (addr, handler, _shutdown) = start_server().await;

    let mut first = BufferClient::connect(addr).await.unwrap();
    first.publish("pub-1", "events").await.unwrap();
    wait_until(|| handler.publisher_connection("pub-1").is_some()).await;

    let mut second = BufferClient::connect(addr).await.unwrap();
    second.publish("pub-1", "events").await.unwrap();

    let result = timeout(DEADLINE, first.recv()).await.unwrap();
    assert!(matches!(result, Ok(None) | Err(_)));

    publish_windows(&mut second, 1..=1).await;
    wait_until(|| handler.data_list("pub-1").is_some_and(|l| l.len() == 4)).await;
}

#[tokio::test]
async fn test_two_groups_merge_into_unifier() {
    let (addr, handler, shutdown) = start_server().await;

    let sink = CollectSink::<Bytes>::new();
    let config = ReservoirConfig::builder().spin_millis(1).build();
    let node = Arc::new(UnifierNode::with_config(
        "merge",
        config,
        PassThroughUnifier,
        sink.clone(),
    ));
    let port_a = node.connect_input_port("a", None, InputMode::Queued);
    let port_b = node.connect_input_port("b", None, InputMode::Queued);

    let (sub_shutdown_tx, sub_shutdown_rx) = watch::channel(false);
    let sub_a = BufferSubscriber::connect(addr, SubscriberRequest::new("sa", "ga", "pub-1"), port_a)
        .await
        .unwrap();
    let sub_a = tokio::spawn(sub_a.run(sub_shutdown_rx.clone()));
    wait_until(|| handler.group_count() == 1).await;

    let mut publisher = BufferClient::connect(addr).await.unwrap();
    publisher.publish("pub-1", "events").await.unwrap();
    publish_windows(&mut publisher, 1..=3).await;
    wait_until(|| handler.data_list("pub-1").is_some_and(|l| l.len() == 12)).await;

    // The second group joins late and replays from window 1.
    let request = SubscriberRequest::new("sb", "gb", "pub-1").from_window(1);
    let sub_b = BufferSubscriber::connect(addr, request, port_b).await.unwrap();
    let sub_b = tokio::spawn(sub_b.run(sub_shutdown_rx));

    let runner = {
        let node = Arc::clone(&node);
        tokio::task::spawn_blocking(move || node.run())
    };

    let end_of_window_3 = StreamItem::Control(Tuple::EndWindow(3));
    wait_until(|| sink.items().contains(&end_of_window_3)).await;

    // Closing the broker ends both subscriptions, which retires both ports.
    shutdown.send(true).unwrap();
    assert_eq!(timeout(DEADLINE, sub_a).await.unwrap().unwrap().unwrap(), 12);
    assert_eq!(timeout(DEADLINE, sub_b).await.unwrap().unwrap().unwrap(), 12);
    timeout(DEADLINE, runner).await.unwrap().unwrap();
    assert!(node.is_finished());
    drop(sub_shutdown_tx);

    let items = sink.items();
    let controls: Vec<Tuple> = items.iter().filter_map(StreamItem::as_control).collect();
    assert_eq!(
        controls,
        vec![
            Tuple::BeginWindow(1),
            Tuple::EndWindow(1),
            Tuple::BeginWindow(2),
            Tuple::EndWindow(2),
            Tuple::BeginWindow(3),
            Tuple::EndWindow(3),
            Tuple::EndStream,
        ]
    );
    let payloads = items.len() - controls.len();
    assert_eq!(payloads, 12);

    // Each payload carries its window id in the first byte and must arrive
    // between that window's boundaries.
    let mut open = None;
    for item in &items {
        match item {
            StreamItem::Control(Tuple::BeginWindow(w)) => open = Some(*w),
            StreamItem::Control(Tuple::EndWindow(w)) => {
                assert_eq!(open.take(), Some(*w));
            }
            StreamItem::Control(Tuple::EndStream) => assert_eq!(open, None),
            StreamItem::Data(bytes) => {
                assert_eq!(open, Some(u64::from(bytes[0])), "payload outside its window");
            }
        }
    }
}
