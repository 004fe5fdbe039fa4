use super::*;
use std::time::Duration;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

fn started(buffer: usize) -> Broker<&'static str, u32> {
    let broker = Broker::new(BrokerConfig::default().with_subscriber_buffer(buffer));
    broker.start(CancellationToken::new()).unwrap();
    broker
}

#[tokio::test]
async fn test_publish_subscribe() {
    let broker = started(16);
    let (mut rx, _unsub) = broker.subscribe("exec-1");

    assert_eq!(broker.publish(&"exec-1", 7).unwrap(), 1);
    assert_eq!(rx.recv().await, Some(7));
}

#[tokio::test]
async fn test_multiple_subscribers_same_order() {
    let broker = started(16);
    let (mut rx1, _u1) = broker.subscribe("exec-1");
    let (mut rx2, _u2) = broker.subscribe("exec-1");
    assert_eq!(broker.subscriber_count(&"exec-1"), 2);

    for n in 1..=5 {
        assert_eq!(broker.publish(&"exec-1", n).unwrap(), 2);
    }

    for n in 1..=5 {
        assert_eq!(rx1.recv().await, Some(n));
        assert_eq!(rx2.recv().await, Some(n));
    }
}

#[tokio::test]
async fn test_topics_are_isolated() {
    let broker = started(16);
    let (mut rx_a, _ua) = broker.subscribe("a");
    let (mut rx_b, _ub) = broker.subscribe("b");

    broker.publish(&"a", 1).unwrap();
    broker.publish(&"b", 2).unwrap();
    assert_eq!(broker.publish(&"nobody", 3).unwrap(), 0);

    assert_eq!(rx_a.recv().await, Some(1));
    assert_eq!(rx_b.recv().await, Some(2));
    assert!(rx_a.try_recv().is_err());
    assert_eq!(broker.topic_count(), 2);
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let broker = started(16);
    let (mut rx, unsub) = broker.subscribe("exec-1");
    let (mut other, _keep) = broker.subscribe("exec-1");

    broker.publish(&"exec-1", 1).unwrap();
    unsub.unsubscribe();
    broker.publish(&"exec-1", 2).unwrap();

    // Already-queued events drain, then the channel reports closure.
    assert_eq!(rx.recv().await, Some(1));
    assert_eq!(rx.recv().await, None);

    assert_eq!(other.recv().await, Some(1));
    assert_eq!(other.recv().await, Some(2));
}

#[tokio::test]
async fn test_unsubscribe_is_idempotent() {
    let broker = started(16);
    let (_rx, unsub) = broker.subscribe("exec-1");
    let clone = unsub.clone();

    unsub.unsubscribe();
    unsub.unsubscribe();
    clone.unsubscribe();

    assert_eq!(broker.subscriber_count(&"exec-1"), 0);
    assert_eq!(broker.topic_count(), 0);
    assert_eq!(broker.total_subscribers(), 0);
}

#[tokio::test]
async fn test_slow_subscriber_drops_without_blocking_others() {
    let broker = started(2);
    let (mut slow, _u1) = broker.subscribe("exec-1");
    let (mut fast, _u2) = broker.subscribe("exec-1");

    for n in 1..=2 {
        broker.publish(&"exec-1", n).unwrap();
        assert_eq!(fast.recv().await, Some(n));
    }
    // slow's queue is now full; fast keeps receiving.
    assert_eq!(broker.publish(&"exec-1", 3).unwrap(), 1);
    assert_eq!(fast.recv().await, Some(3));
    assert_eq!(broker.dropped(), 1);

    assert_eq!(slow.recv().await, Some(1));
    assert_eq!(slow.recv().await, Some(2));
    assert!(slow.try_recv().is_err());
}

#[tokio::test]
async fn test_dropped_receiver_is_pruned() {
    let broker = started(4);
    let (rx, _unsub) = broker.subscribe("exec-1");
    drop(rx);

    assert_eq!(broker.publish(&"exec-1", 1).unwrap(), 0);
    assert_eq!(broker.subscriber_count(&"exec-1"), 0);
    assert_eq!(broker.dropped(), 0);
}

#[tokio::test]
async fn test_stop_closes_subscribers() {
    let broker = started(4);
    let (mut rx1, _u1) = broker.subscribe("a");
    let (mut rx2, _u2) = broker.subscribe("b");

    broker.stop();
    broker.stop();

    assert_eq!(rx1.recv().await, None);
    assert_eq!(rx2.recv().await, None);
    assert_eq!(broker.publish(&"a", 1), Err(BrokerError::Stopped));
    assert!(!broker.is_running());

    let (mut late, unsub) = broker.subscribe("a");
    assert_eq!(late.recv().await, None);
    unsub.unsubscribe();
}

#[tokio::test]
async fn test_sequencing_errors() {
    let broker: Broker<&str, u32> = Broker::default();
    assert_eq!(broker.publish(&"a", 1), Err(BrokerError::NotStarted));

    let token = CancellationToken::new();
    assert_ok!(broker.start(token.clone()));
    assert_err!(broker.start(token.clone()));
    assert_eq!(broker.start(token), Err(BrokerError::AlreadyStarted));
    assert!(broker.is_running());
}

#[tokio::test]
async fn test_cancellation_stops_broker() {
    let broker: Broker<&str, u32> = Broker::default();
    let (mut rx, _unsub) = broker.subscribe("a");
    let token = CancellationToken::new();
    broker.start(token.clone()).unwrap();

    token.cancel();

    let closed = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
    assert_eq!(closed, None);
    assert!(!broker.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_unsubscribe_and_publish() {
    let broker = started(1024);
    let mut handles = Vec::new();

    for _ in 0..16 {
        let broker = broker.clone();
        handles.push(tokio::spawn(async move {
            let (mut rx, unsub) = broker.subscribe("exec-1");
            tokio::task::yield_now().await;
            unsub.unsubscribe();
            unsub.unsubscribe();
            let mut last = 0;
            while let Some(n) = rx.recv().await {
                assert!(n > last, "duplicate or reordered delivery");
                last = n;
            }
        }));
    }

    let publisher = {
        let broker = broker.clone();
        tokio::spawn(async move {
            for n in 1..=500u32 {
                broker.publish(&"exec-1", n).unwrap();
                if n % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        })
    };

    publisher.await.unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(broker.subscriber_count(&"exec-1"), 0);
}
