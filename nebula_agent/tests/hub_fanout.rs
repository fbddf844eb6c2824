//! Pub/sub hub delivery and slow-subscriber shedding.
use bytes::Bytes;
use nebula_agent::hub::Hub;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

async fn settle() {
    sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn every_subscriber_gets_each_message_once() {
    let (hub, _task) = Hub::spawn(8, CancellationToken::new());
    let mut a = hub.subscribe("a");
    let mut b = hub.subscribe("b");
    settle().await;
    assert_eq!(hub.client_count(), 2);

    hub.publish_json("metrics", &serde_json::json!({ "cpu": 50 }));
    for sub in [&mut a, &mut b] {
        let msg = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        let v: serde_json::Value = serde_json::from_slice(&msg).unwrap();
        assert_eq!(v, serde_json::json!({ "type": "metrics", "payload": { "cpu": 50 } }));
        assert!(sub.try_recv().is_none());
    }

    hub.unregister(b.id());
    settle().await;
    hub.publish("second");
    assert_eq!(
        timeout(Duration::from_secs(1), a.recv()).await.unwrap(),
        Some(Bytes::from_static(b"second"))
    );
    assert_eq!(timeout(Duration::from_secs(1), b.recv()).await.unwrap(), None);
    assert_eq!(hub.client_count(), 1);
}

#[tokio::test]
async fn slow_subscriber_is_shed_and_others_keep_order() {
    const CAP: usize = 4;
    const N: usize = 32;
    let (hub, _task) = Hub::spawn(CAP, CancellationToken::new());
    let mut slow = hub.subscribe("slow");
    let mut fast = hub.subscribe("fast");
    settle().await;

    let reader = tokio::spawn(async move {
        let mut got = Vec::new();
        while let Some(m) = fast.recv().await {
            got.push(String::from_utf8(m.to_vec()).unwrap());
            if got.len() == N {
                break;
            }
        }
        got
    });

    for i in 0..N {
        hub.publish(format!("m{i}"));
        // let the draining subscriber keep up; the slow one never reads
        sleep(Duration::from_millis(2)).await;
    }

    let got = timeout(Duration::from_secs(5), reader).await.unwrap().unwrap();
    let want: Vec<String> = (0..N).map(|i| format!("m{i}")).collect();
    assert_eq!(got, want);

    let mut buffered = 0;
    while let Some(m) = timeout(Duration::from_secs(1), slow.recv()).await.unwrap() {
        assert_eq!(m, Bytes::from(format!("m{buffered}")));
        buffered += 1;
    }
    assert!(buffered <= CAP, "slow client buffered {buffered} > {CAP}");
    settle().await;
    // only the fast subscriber's task-owned handle remains, and it was dropped by now
    assert_eq!(hub.client_count(), 0);
}

#[tokio::test]
async fn publish_with_no_subscribers_is_a_no_op() {
    let (hub, _task) = Hub::spawn(2, CancellationToken::new());
    for i in 0..10 {
        hub.publish(format!("{i}"));
    }
    let mut late = hub.subscribe("late");
    hub.publish("hello");
    assert_eq!(
        timeout(Duration::from_secs(1), late.recv()).await.unwrap(),
        Some(Bytes::from_static(b"hello"))
    );
}
