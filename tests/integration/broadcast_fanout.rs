//! Integration: broadcast fan-out, back-pressure, and cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use weft_core::branch::broadcast::BroadcastManager;
use weft_core::branch::connection::BranchConnection;
use weft_core::{BranchConfig, Error};
use weft_test_utils::{HARNESS_TIMEOUT, branch_pair, established_pair, test_config};

fn tiny_queue_config(name: &str, tx_queue_size: usize) -> BranchConfig {
    // Below the validated minimum on purpose; the session layer itself
    // accepts any bound, which is what this suite exercises.
    BranchConfig::from_json_str(&format!(
        r#"{{"name": "{name}", "advertising_interval": -1, "tx_queue_size": {tx_queue_size}}}"#
    ))
    .unwrap()
}

#[tokio::test]
async fn blast_without_retry_reports_tx_queue_full_and_survives() {
    let (est_a, info_a, est_b, info_b) =
        established_pair(&tiny_queue_config("blaster", 128), &test_config("sink")).await;

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    let conn_a = Arc::new(BranchConnection::start(est_a, &info_a, |_| {}, |_| {}));
    let _conn_b = BranchConnection::start(
        est_b,
        &info_b,
        move |msg| {
            if let weft::wire::Message::Broadcast { data } = msg {
                let _ = seen_tx.send(data);
            }
        },
        |_| {},
    );

    let bm = Arc::new(BroadcastManager::new());
    let full = Arc::new(AtomicUsize::new(0));
    let ok = Arc::new(AtomicUsize::new(0));
    for oid in 0..1000u64 {
        let full = Arc::clone(&full);
        let ok = Arc::clone(&ok);
        bm.send_async(vec![Arc::clone(&conn_a)], vec![0x01], false, oid, move |res| {
            match res {
                Ok(()) => {
                    ok.fetch_add(1, Ordering::Relaxed);
                }
                Err(Error::TxQueueFull) => {
                    full.fetch_add(1, Ordering::Relaxed);
                }
                Err(other) => panic!("unexpected broadcast result: {other}"),
            }
        });
    }

    assert!(full.load(Ordering::Relaxed) > 0, "a 128-byte queue must overflow");
    assert!(ok.load(Ordering::Relaxed) > 0, "some broadcasts must get through");

    // The connection is alive: a retried broadcast still arrives.
    let sessions = vec![Arc::clone(&conn_a)];
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    bm.send_async(sessions, vec![0xfe], true, 5000, move |res| {
        let _ = done_tx.send(res);
    });
    tokio::time::timeout(HARNESS_TIMEOUT, done_rx).await.unwrap().unwrap().unwrap();
    let last = tokio::time::timeout(HARNESS_TIMEOUT, async {
        loop {
            let data = seen_rx.recv().await.expect("receiver alive");
            if data == vec![0xfe] {
                return data;
            }
        }
    })
    .await
    .expect("retried broadcast must arrive");
    assert_eq!(last, vec![0xfe]);
}

#[tokio::test]
async fn canceling_a_parked_retry_send_reports_cancellation() {
    // A queue large enough for two jumbo frames; the third parks, and the
    // peer never reads, so nothing drains.
    let (est_a, info_a, est_b, _info_b) =
        established_pair(&tiny_queue_config("parker", 250_000), &test_config("mute")).await;
    let conn = Arc::new(BranchConnection::start(est_a, &info_a, |_| {}, |_| {}));
    let _parked_peer = est_b;

    let bm = Arc::new(BroadcastManager::new());
    let payload = vec![0xaa; 100_000];
    let mut handlers = Vec::new();
    for oid in 1..=3u64 {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        bm.send_async(vec![Arc::clone(&conn)], payload.clone(), true, oid, move |res| {
            let _ = done_tx.send(res);
        });
        handlers.push(done_rx);
    }

    // Operation 3 is parked behind a full queue.
    let canceled = bm.cancel_send(&[Arc::clone(&conn)], 3);
    assert!(canceled, "a parked send must be cancellable");
    let res = tokio::time::timeout(HARNESS_TIMEOUT, handlers.pop().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(res, Err(Error::Canceled));

    // Cancelling it again finds nothing.
    assert!(!bm.cancel_send(&[conn], 3));
}

#[tokio::test]
async fn retry_broadcast_completes_once_per_session_sends_drain() {
    let (a, b) = branch_pair("fan-a", "fan-b").await;
    let c = weft_core::Branch::create(test_config("fan-c")).await.unwrap();
    a.connect_to(c.tcp_ep()).await.unwrap();

    let rx_b = b.receive_broadcast();
    let rx_c = c.receive_broadcast();
    a.send_broadcast(b"to-everyone".to_vec(), true).await.unwrap();

    let (_, data_b) = tokio::time::timeout(HARNESS_TIMEOUT, rx_b).await.unwrap().unwrap();
    let (_, data_c) = tokio::time::timeout(HARNESS_TIMEOUT, rx_c).await.unwrap().unwrap();
    assert_eq!(data_b, b"to-everyone");
    assert_eq!(data_c, b"to-everyone");
}

#[tokio::test]
async fn rearming_the_receiver_cancels_the_pending_receive() {
    let (a, b) = branch_pair("swap-a", "swap-b").await;

    let first = b.receive_broadcast();
    let second = b.receive_broadcast();
    assert_eq!(first.await, Err(Error::Canceled));

    a.send_broadcast(vec![9], true).await.unwrap();
    let (from, data) = tokio::time::timeout(HARNESS_TIMEOUT, second).await.unwrap().unwrap();
    assert_eq!((from, data), (a.uuid(), vec![9]));
}

#[tokio::test]
async fn undersized_receive_buffer_reports_buffer_too_small() {
    let (a, b) = branch_pair("big-a", "small-b").await;

    let mut buf = [0u8; 4];
    let armed = b.receive_broadcast_into(&mut buf);
    a.send_broadcast(vec![1, 2, 3, 4, 5, 6], true).await.unwrap();
    let res = tokio::time::timeout(HARNESS_TIMEOUT, armed).await.unwrap();
    assert_eq!(res, Err(Error::BufferTooSmall { needed: 6 }));

    // The message was consumed; a fitting buffer sees only the next one.
    let mut buf = [0u8; 16];
    let armed = b.receive_broadcast_into(&mut buf);
    a.send_broadcast(vec![7, 8], true).await.unwrap();
    let (from, n) = tokio::time::timeout(HARNESS_TIMEOUT, armed).await.unwrap().unwrap();
    assert_eq!(from, a.uuid());
    assert_eq!(&buf[..n], &[7, 8]);
}
