//! Integration tests for topic sync and topic-addressed routing.
//!
//! Three nodes on the in-memory network form a triangle. A client behind
//! one of them subscribes to a topic and the others route to it once their
//! topic caches converge.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use meshgate::{
    ClientDelivery, Keypair, MemoryNetwork, NetworkError, Node, NodeConfig, PeerEndpoint,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const TOPIC: &str = "chain.block";

fn fast_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.registry.heartbeat_interval = Duration::from_millis(50);
    config.amop.topic_sync_period = Duration::from_millis(50);
    config.reconnect_interval = Duration::from_millis(100);
    config
}

fn memory_node(network: &MemoryNetwork, name: &str) -> Node {
    let keypair = Keypair::generate();
    let transport = network
        .bind(PeerEndpoint::new(name, 1), keypair.node_id())
        .expect("bind memory endpoint");
    Node::with_transport(keypair, Arc::new(transport), fast_config())
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Build nodes a, b and c with every pair connected.
async fn triangle(network: &MemoryNetwork) -> (Node, Node, Node) {
    let a = memory_node(network, "a");
    let b = memory_node(network, "b");
    let c = memory_node(network, "c");
    a.connect(b.local_endpoint()).await.expect("a -> b");
    a.connect(c.local_endpoint()).await.expect("a -> c");
    b.connect(c.local_endpoint()).await.expect("b -> c");
    for node in [&a, &b, &c] {
        assert!(eventually(|| node.peers().len() == 2).await);
    }
    (a, b, c)
}

/// Answer every request with `prefix` followed by the request payload and
/// forward broadcast payloads to the returned channel.
fn serve(
    mut deliveries: mpsc::Receiver<ClientDelivery>,
    prefix: &'static [u8],
) -> mpsc::UnboundedReceiver<Vec<u8>> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            match delivery {
                ClientDelivery::Request { data, reply, .. } => {
                    let mut answer = prefix.to_vec();
                    answer.extend_from_slice(&data);
                    let _ = reply.send(answer);
                }
                ClientDelivery::Broadcast { data, .. } => {
                    let _ = tx.send(data);
                }
            }
        }
    });
    rx
}

#[tokio::test]
async fn subscription_propagates_and_routes_requests() {
    let network = MemoryNetwork::new();
    let (a, b, c) = triangle(&network).await;

    let _broadcasts = serve(c.register_client("sdk-1", "10.0.0.9:20200"), b"c:");
    c.subscribe_topic("sdk-1", r#"{"topics":["chain.block"]}"#)
        .expect("subscribe");

    let c_id = c.node_id();
    assert!(eventually(|| a.nodes_by_topic(TOPIC) == vec![c_id]).await);
    assert!(eventually(|| b.nodes_by_topic(TOPIC) == vec![c_id]).await);
    assert_eq!(a.topics_by_node(&c_id), vec![TOPIC.to_string()]);

    let answer = timeout(TEST_TIMEOUT, a.send_by_topic(TOPIC, b"height=42".to_vec()))
        .await
        .expect("answer in time")
        .expect("routed request");
    assert_eq!(answer, b"c:height=42");
}

#[tokio::test]
async fn broadcast_reaches_every_subscribing_node() {
    let network = MemoryNetwork::new();
    let (a, b, c) = triangle(&network).await;

    let mut on_b = serve(b.register_client("sdk-b", "local"), b"b:");
    let mut on_c = serve(c.register_client("sdk-c", "local"), b"c:");
    b.subscribe_topics("sdk-b", &[TOPIC]).unwrap();
    c.subscribe_topics("sdk-c", &[TOPIC]).unwrap();

    assert!(eventually(|| a.nodes_by_topic(TOPIC).len() == 2).await);

    let reached = a.broadcast_by_topic(TOPIC, b"block#7".to_vec()).await.unwrap();
    assert_eq!(reached, 2);
    assert_eq!(
        timeout(TEST_TIMEOUT, on_b.recv()).await.unwrap().unwrap(),
        b"block#7"
    );
    assert_eq!(
        timeout(TEST_TIMEOUT, on_c.recv()).await.unwrap().unwrap(),
        b"block#7"
    );
}

#[tokio::test]
async fn local_subscriber_is_served_without_the_network() {
    let network = MemoryNetwork::new();
    let a = memory_node(&network, "solo");

    let mut broadcasts = serve(a.register_client("sdk", "local"), b"self:");
    a.subscribe_topics("sdk", &[TOPIC]).unwrap();
    assert_eq!(a.nodes_by_topic(TOPIC), vec![a.node_id()]);

    let answer = a.send_by_topic(TOPIC, b"ping".to_vec()).await.unwrap();
    assert_eq!(answer, b"self:ping");

    assert_eq!(a.broadcast_by_topic(TOPIC, b"tick".to_vec()).await.unwrap(), 1);
    assert_eq!(
        timeout(TEST_TIMEOUT, broadcasts.recv()).await.unwrap().unwrap(),
        b"tick"
    );
}

#[tokio::test]
async fn unsubscribe_leaves_no_route() {
    let network = MemoryNetwork::new();
    let (a, _b, c) = triangle(&network).await;

    let _served = serve(c.register_client("sdk-1", "local"), b"c:");
    c.subscribe_topics("sdk-1", &[TOPIC]).unwrap();
    let seq_with_topic = c.topic_seq();
    let c_id = c.node_id();
    assert!(eventually(|| a.nodes_by_topic(TOPIC) == vec![c_id]).await);

    c.unsubscribe_topic("sdk-1", &[TOPIC]).unwrap();
    assert!(c.topic_seq() > seq_with_topic);
    assert!(eventually(|| a.nodes_by_topic(TOPIC).is_empty()).await);

    let err = a.send_by_topic(TOPIC, b"x".to_vec()).await.unwrap_err();
    assert_eq!(err, NetworkError::NoSubscriber(TOPIC.to_string()));
    let err = a.broadcast_by_topic(TOPIC, b"x".to_vec()).await.unwrap_err();
    assert_eq!(err, NetworkError::NoSubscriber(TOPIC.to_string()));
}

#[tokio::test]
async fn async_send_delivers_result_to_callback() {
    let network = MemoryNetwork::new();
    let (a, _b, c) = triangle(&network).await;

    let _served = serve(c.register_client("sdk-1", "local"), b"ok:");
    c.subscribe_topics("sdk-1", &[TOPIC]).unwrap();
    let c_id = c.node_id();
    assert!(eventually(|| a.nodes_by_topic(TOPIC) == vec![c_id]).await);

    let (tx, rx) = oneshot::channel();
    a.async_send_by_topic(TOPIC, b"tx".to_vec(), move |result| {
        let _ = tx.send(result);
    });
    let result = timeout(TEST_TIMEOUT, rx).await.unwrap().unwrap();
    assert_eq!(result.unwrap(), b"ok:tx");

    let (tx, rx) = oneshot::channel();
    a.async_send_by_topic("chain.unknown", Vec::new(), move |result| {
        let _ = tx.send(result);
    });
    let result = timeout(TEST_TIMEOUT, rx).await.unwrap().unwrap();
    assert_eq!(
        result.unwrap_err(),
        NetworkError::NoSubscriber("chain.unknown".to_string())
    );
}

/// Answer every request with `name:` followed by the payload and record
/// the payload on the returned channel.
fn record_requests(
    mut deliveries: mpsc::Receiver<ClientDelivery>,
    name: &'static str,
) -> mpsc::UnboundedReceiver<Vec<u8>> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            if let ClientDelivery::Request { data, reply, .. } = delivery {
                let mut answer = format!("{}:", name).into_bytes();
                answer.extend_from_slice(&data);
                let _ = tx.send(data);
                let _ = reply.send(answer);
            }
        }
    });
    rx
}

fn drain(received: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<Vec<u8>> {
    let mut payloads = Vec::new();
    while let Ok(payload) = received.try_recv() {
        payloads.push(payload);
    }
    payloads
}

#[tokio::test]
async fn repeated_async_sends_spread_over_subscribers_exactly_once() {
    let network = MemoryNetwork::new();
    let (a, b, c) = triangle(&network).await;

    let mut on_b = record_requests(b.register_client("sdk-b", "local"), "b");
    let mut on_c = record_requests(c.register_client("sdk-c", "local"), "c");
    b.subscribe_topics("sdk-b", &[TOPIC]).unwrap();
    c.subscribe_topics("sdk-c", &[TOPIC]).unwrap();
    assert!(eventually(|| a.nodes_by_topic(TOPIC).len() == 2).await);

    const SENDS: usize = 64;
    let (tx, mut answers) = mpsc::unbounded_channel();
    for i in 0..SENDS {
        let payload = format!("tx-{}", i).into_bytes();
        let tx = tx.clone();
        let sent = payload.clone();
        a.async_send_by_topic(TOPIC, payload, move |result| {
            let _ = tx.send((sent, result));
        });
    }
    drop(tx);

    for _ in 0..SENDS {
        let (sent, result) = timeout(TEST_TIMEOUT, answers.recv())
            .await
            .expect("callback in time")
            .expect("callback ran");
        let answer = result.expect("routed request");
        let (name, echoed) = answer.split_at(2);
        assert!(name == b"b:" || name == b"c:", "unexpected answer {:?}", answer);
        assert_eq!(echoed, sent.as_slice());
    }

    let at_b = drain(&mut on_b);
    let at_c = drain(&mut on_c);
    assert!(!at_b.is_empty(), "b never picked");
    assert!(!at_c.is_empty(), "c never picked");
    assert_eq!(at_b.len() + at_c.len(), SENDS);

    let seen: HashSet<Vec<u8>> = at_b.into_iter().chain(at_c).collect();
    let expected: HashSet<Vec<u8>> = (0..SENDS).map(|i| format!("tx-{}", i).into_bytes()).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn disconnected_peer_topics_are_forgotten() {
    let network = MemoryNetwork::new();
    let (a, _b, c) = triangle(&network).await;

    let _served = serve(c.register_client("sdk-1", "local"), b"c:");
    c.subscribe_topics("sdk-1", &[TOPIC]).unwrap();
    let c_id = c.node_id();
    assert!(eventually(|| a.nodes_by_topic(TOPIC) == vec![c_id]).await);

    c.shutdown().await;
    assert!(eventually(|| a.nodes_by_topic(TOPIC).is_empty()).await);
    assert!(a.topics_by_node(&c_id).is_empty());
}

#[tokio::test]
async fn topic_routing_over_quic() {
    let a = Node::bind_with_config("127.0.0.1:0", Keypair::generate(), fast_config())
        .await
        .expect("bind a");
    let b = Node::bind_with_config("127.0.0.1:0", Keypair::generate(), fast_config())
        .await
        .expect("bind b");

    let _served = serve(b.register_client("sdk", "local"), b"quic:");
    b.subscribe_topics("sdk", &[TOPIC]).unwrap();
    a.connect(b.local_endpoint()).await.expect("connect");

    let b_id = b.node_id();
    assert!(eventually(|| a.nodes_by_topic(TOPIC) == vec![b_id]).await);
    let answer = timeout(TEST_TIMEOUT, a.send_by_topic(TOPIC, b"hi".to_vec()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(answer, b"quic:hi");

    a.shutdown().await;
    b.shutdown().await;
}
